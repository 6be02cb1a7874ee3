//! Inline `CREATE TABLE IF NOT EXISTS` / `CREATE INDEX IF NOT EXISTS`
//! migrations, run once at startup. No external migration-file runner: the
//! schema is three tables and additive changes can be expressed as more
//! `IF NOT EXISTS` statements appended to this list.

pub const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS patients (
        id TEXT PRIMARY KEY,
        analyzer_instance TEXT NOT NULL,
        external_id TEXT NOT NULL,
        internal_id TEXT NOT NULL,
        full_name TEXT NOT NULL,
        dob TEXT,
        sex TEXT,
        physician TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_patients_identity
        ON patients(analyzer_instance, external_id, internal_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS orders (
        id TEXT PRIMARY KEY,
        analyzer_instance TEXT NOT NULL,
        patient_id TEXT NOT NULL REFERENCES patients(id),
        sample_id TEXT NOT NULL,
        ordered_at TEXT,
        universal_service_id TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_orders_identity
        ON orders(analyzer_instance, sample_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS results (
        id TEXT PRIMARY KEY,
        order_id TEXT NOT NULL REFERENCES orders(id),
        test_code TEXT NOT NULL,
        value TEXT NOT NULL,
        units TEXT,
        reference_range TEXT,
        abnormal_flags TEXT NOT NULL,
        observed_at TEXT,
        sync_status TEXT NOT NULL DEFAULT 'local',
        attempt_count INTEGER NOT NULL DEFAULT 0,
        next_attempt_at TEXT NOT NULL,
        synced_at TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_results_identity
        ON results(order_id, test_code, observed_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_results_sync_status
        ON results(sync_status, next_attempt_at)
    "#,
];

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-row outbound sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Local,
    Synced,
    /// Excluded from future sync attempts after a non-retryable 4xx response.
    Poisoned,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Local => "local",
            SyncStatus::Synced => "synced",
            SyncStatus::Poisoned => "poisoned",
        }
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(SyncStatus::Local),
            "synced" => Ok(SyncStatus::Synced),
            "poisoned" => Ok(SyncStatus::Poisoned),
            other => Err(format!("unknown sync_status: {other}")),
        }
    }
}

/// Projected from an `R`/`OBX` record. `test_code` must be non-empty;
/// belongs to exactly one `Order`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_code: String,
    pub value: String,
    pub units: Option<String>,
    pub reference_range: Option<String>,
    pub abnormal_flags: Vec<String>,
    pub observed_at: Option<DateTime<Utc>>,
    pub sample_id: String,
    pub sync_status: SyncStatus,
}

impl TestResult {
    pub fn new(test_code: String, value: String, sample_id: String) -> Self {
        Self {
            test_code,
            value,
            units: None,
            reference_range: None,
            abnormal_flags: Vec::new(),
            observed_at: None,
            sample_id,
            sync_status: SyncStatus::Local,
        }
    }
}

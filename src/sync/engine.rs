use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Semaphore};

use crate::config::ExternalServerConfig;
use crate::events::{Event, EventBus, SyncOutcome};
use crate::persistence::{Store, SyncRow};
use crate::sync::auth::{self, AuthProvider};
use crate::sync::SyncError;

const RETRY_BASE_SECS: f64 = 5.0;
const RETRY_EXPONENT_CAP: u32 = 6;
const RETRY_JITTER_FRACTION: f64 = 0.2;

/// `base * 2^min(attempt, K)` with ±20% jitter: base 5s, K=6, cap ≈ 5 min.
pub fn backoff_for_attempt(attempt_count: u32) -> Duration {
    let exponent = attempt_count.min(RETRY_EXPONENT_CAP);
    let base_secs = RETRY_BASE_SECS * 2f64.powi(exponent as i32);
    let jitter = rand::thread_rng().gen_range(-RETRY_JITTER_FRACTION..=RETRY_JITTER_FRACTION);
    let secs = (base_secs * (1.0 + jitter)).max(0.1);
    Duration::from_secs_f64(secs)
}

fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

#[derive(Debug, Clone, Serialize)]
struct PatientPayload {
    external_id: String,
    internal_id: String,
    full_name: String,
    dob: Option<DateTime<Utc>>,
    sex: Option<String>,
    physician: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct OrderPayload {
    sample_id: String,
    ordered_at: Option<DateTime<Utc>>,
    universal_service_id: String,
}

#[derive(Debug, Clone, Serialize)]
struct ResultPayload {
    test_code: String,
    value: String,
    units: Option<String>,
    reference_range: Option<String>,
    abnormal_flags: Vec<String>,
    observed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
struct BatchEntry {
    patient: PatientPayload,
    order: OrderPayload,
    results: Vec<ResultPayload>,
}

#[derive(Debug, Serialize)]
struct BatchRequest {
    instance_id: String,
    batch: Vec<BatchEntry>,
}

/// Groups a flat, already-sorted `Vec<SyncRow>` into the `{patient, order,
/// results[]}` shape the outbound contract expects, one entry per distinct
/// order.
fn group_into_batch(rows: &[SyncRow]) -> Vec<(Vec<String>, BatchEntry)> {
    let mut entries: Vec<(Vec<String>, BatchEntry)> = Vec::new();
    for row in rows {
        let matches_last = entries.last().is_some_and(|(_, entry): &(Vec<String>, BatchEntry)| {
            entry.order.sample_id == row.order_sample_id
                && entry.patient.external_id == row.patient_external_id
                && entry.patient.internal_id == row.patient_internal_id
        });
        if matches_last {
            let (ids, entry) = entries.last_mut().unwrap();
            ids.push(row.result_id.clone());
            entry.results.push(ResultPayload {
                test_code: row.test_code.clone(),
                value: row.value.clone(),
                units: row.units.clone(),
                reference_range: row.reference_range.clone(),
                abnormal_flags: row.abnormal_flags.clone(),
                observed_at: row.observed_at,
            });
        } else {
            entries.push((
                vec![row.result_id.clone()],
                BatchEntry {
                    patient: PatientPayload {
                        external_id: row.patient_external_id.clone(),
                        internal_id: row.patient_internal_id.clone(),
                        full_name: row.patient_full_name.clone(),
                        dob: row.patient_dob,
                        sex: row.patient_sex.clone(),
                        physician: row.patient_physician.clone(),
                    },
                    order: OrderPayload {
                        sample_id: row.order_sample_id.clone(),
                        ordered_at: row.order_ordered_at,
                        universal_service_id: row.order_universal_service_id.clone(),
                    },
                    results: vec![ResultPayload {
                        test_code: row.test_code.clone(),
                        value: row.value.clone(),
                        units: row.units.clone(),
                        reference_range: row.reference_range.clone(),
                        abnormal_flags: row.abnormal_flags.clone(),
                        observed_at: row.observed_at,
                    }],
                },
            ));
        }
    }
    entries
}

/// Drains unsynced records to the remote endpoint on a configured cadence,
/// applying retry/backoff and poisoning non-retryable rows. One engine is
/// built per process from the `external_server` config block.
pub struct SyncEngine {
    config: ExternalServerConfig,
    instance_id: String,
    store: Arc<Store>,
    events: EventBus,
    http: reqwest::Client,
    auth: Arc<dyn AuthProvider>,
    workers: Arc<Semaphore>,
}

impl SyncEngine {
    pub fn new(
        config: ExternalServerConfig,
        instance_id: String,
        store: Arc<Store>,
        events: EventBus,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client configuration is static and always valid");
        let auth = auth::from_config(&config.auth, http.clone());
        let workers = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));
        Self {
            config,
            instance_id,
            store,
            events,
            http,
            auth,
            workers,
        }
    }

    /// Fetches and sends one due batch. Returns the number of rows
    /// successfully synced.
    pub async fn drain_once(&self) -> Result<usize, SyncError> {
        let mut rows = self.store.fetch_sync_batch(self.config.batch_size as i64).await?;
        if rows.is_empty() {
            return Ok(0);
        }
        rows.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        self.send_rows(rows).await
    }

    async fn send_rows(&self, rows: Vec<SyncRow>) -> Result<usize, SyncError> {
        let entries = group_into_batch(&rows);
        let batch = entries.iter().map(|(_, entry)| entry.clone()).collect();
        let request = BatchRequest {
            instance_id: self.instance_id.clone(),
            batch,
        };

        let _permit = self.workers.acquire().await.expect("semaphore is never closed");
        let builder = self.http.post(&self.config.url).json(&request);
        let builder = self.auth.authorize(builder).await?;

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                for (ids, _) in &entries {
                    self.schedule_retry_for(ids).await?;
                }
                return Err(SyncError::Transport(e));
            }
        };

        let status = response.status();
        if status.is_success() {
            let all_ids: Vec<String> = entries.iter().flat_map(|(ids, _)| ids.clone()).collect();
            self.store.mark_synced(&all_ids).await?;
            for id in &all_ids {
                self.events.publish(Event::SyncAttempt {
                    result_id: id.clone(),
                    attempts: 0,
                    outcome: SyncOutcome::Synced,
                });
            }
            return Ok(all_ids.len());
        }

        if status.as_u16() == 401 {
            self.auth.invalidate().await;
        }

        let retryable = is_retryable_status(status.as_u16());
        for (ids, _) in &entries {
            if retryable {
                self.schedule_retry_for(ids).await?;
            } else {
                for id in ids {
                    self.store.mark_poisoned(id).await?;
                    self.events.publish(Event::Warning {
                        kind: "sync_poisoned".into(),
                        detail: format!("result {id} poisoned by status {status}"),
                    });
                    self.events.publish(Event::SyncAttempt {
                        result_id: id.clone(),
                        attempts: 0,
                        outcome: SyncOutcome::Poisoned {
                            status: status.as_u16(),
                        },
                    });
                }
            }
        }

        Err(SyncError::Http {
            status: status.as_u16(),
            body: String::new(),
        })
    }

    async fn schedule_retry_for(&self, ids: &[String]) -> Result<(), SyncError> {
        for id in ids {
            let row = self.store.fetch_sync_row(id).await?;
            let attempt_count = row.map(|r| r.attempt_count).unwrap_or(0) + 1;
            let backoff = backoff_for_attempt(attempt_count as u32);
            let next_attempt_at = Utc::now() + chrono::Duration::from_std(backoff).unwrap_or_default();
            self.store.schedule_retry(id, attempt_count, next_attempt_at).await?;
            self.events.publish(Event::SyncAttempt {
                result_id: id.clone(),
                attempts: attempt_count as u32,
                outcome: SyncOutcome::WillRetry {
                    next_attempt_secs: backoff.as_secs(),
                },
            });
        }
        Ok(())
    }

    /// Realtime mode: wakes on every new `Result` row rather than polling.
    /// `wake` is fed one unit per persisted result; repeated
    /// wakeups that arrive while a drain is in flight simply cause another
    /// immediate drain, which is always safe since `fetch_sync_batch` only
    /// returns rows that are actually due.
    pub async fn run_realtime(
        self: Arc<Self>,
        mut wake: mpsc::UnboundedReceiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                woken = wake.recv() => {
                    if woken.is_none() {
                        break;
                    }
                    if let Err(e) = self.drain_once().await {
                        log::warn!("realtime sync drain failed: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    pub async fn run_interval(self: Arc<Self>, interval_secs: u64, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.drain_once().await {
                        log::warn!("interval sync drain failed: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    pub async fn run_cron(self: Arc<Self>, schedule: cron::Schedule, mut shutdown: watch::Receiver<bool>) {
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                log::error!("cron schedule has no upcoming fire time, stopping sync engine");
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::from_secs(0));
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    if let Err(e) = self.drain_once().await {
                        log::warn!("cron sync drain failed: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

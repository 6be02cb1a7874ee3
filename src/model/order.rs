use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Projected from an `O`/`OBR` record. Empty `sample_id` is allowed but is
/// logged as unusual by the Field Mapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub sample_id: String,
    pub ordered_at: Option<DateTime<Utc>>,
    pub universal_service_id: String,
    pub patient_identifier: String,
}

impl Order {
    pub fn new(sample_id: String, patient_identifier: String) -> Self {
        Self {
            sample_id,
            ordered_at: None,
            universal_service_id: String::new(),
            patient_identifier,
        }
    }
}

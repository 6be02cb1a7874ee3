use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::error::{ProtocolError, Result};

/// Canonical demographics record, projected from a `P`/`PID` record by the
/// Field Mapper.
///
/// At least one of `external_id`/`internal_id` must be non-empty; the decoder
/// enforces this before a `Patient` is constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub external_id: String,
    pub internal_id: String,
    pub full_name: String,
    pub dob: Option<DateTime<Utc>>,
    pub sex: Option<String>,
    pub physician: Option<String>,
}

impl Patient {
    pub fn new(external_id: String, internal_id: String) -> Result<Self> {
        if external_id.is_empty() && internal_id.is_empty() {
            return Err(ProtocolError::InvalidRecord(
                "patient record has neither external nor internal id".into(),
            ));
        }
        Ok(Self {
            external_id,
            internal_id,
            full_name: String::new(),
            dob: None,
            sex: None,
            physician: None,
        })
    }

    /// The identifier used for upsert keys and outbound payloads: external id
    /// preferred, internal id as fallback.
    pub fn identifier(&self) -> &str {
        if !self.external_id.is_empty() {
            &self.external_id
        } else {
            &self.internal_id
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_ids() {
        assert!(Patient::new(String::new(), String::new()).is_err());
    }

    #[test]
    fn prefers_external_id() {
        let p = Patient::new("322288".into(), "internal-1".into()).unwrap();
        assert_eq!(p.identifier(), "322288");
    }

    #[test]
    fn falls_back_to_internal_id() {
        let p = Patient::new(String::new(), "internal-1".into()).unwrap();
        assert_eq!(p.identifier(), "internal-1");
    }
}

//! Projects a stream of ASTM records onto the canonical [`Message`] using a
//! [`FieldMap`], combining record classification with the per-analyzer field
//! positions it carries.

use chrono::{NaiveDateTime, TimeZone, Utc};

use crate::decode::{Decoded, MappingWarning};
use crate::mapper::FieldMap;
use crate::model::{Order, Patient, TestResult};
use crate::model::Message;
use crate::protocol::astm::{constants, Record};
use crate::protocol::error::{ProtocolError, Result};

pub fn decode_records(
    source_analyzer: &str,
    records: &[Record],
    field_map: &FieldMap,
) -> Result<Decoded> {
    let mut message = Message::new(source_analyzer.to_string());
    let mut warnings = Vec::new();

    for record in records {
        match record.record_type() {
            constants::HEADER_RECORD => {}
            constants::PATIENT_RECORD => match build_patient(record, field_map) {
                Ok(patient) => message.set_patient(patient),
                Err(e) => warnings.push(MappingWarning {
                    record_type: "P".into(),
                    detail: e,
                }),
            },
            constants::ORDER_RECORD => match build_order(record, field_map) {
                Ok(order) => message.push_order(order),
                Err(e) => warnings.push(MappingWarning {
                    record_type: "O".into(),
                    detail: e,
                }),
            },
            constants::RESULT_RECORD => match build_result(record, field_map) {
                Ok(result) => {
                    if let Err(e) = message.push_result(result) {
                        warnings.push(MappingWarning {
                            record_type: "R".into(),
                            detail: e.to_string(),
                        });
                    }
                }
                Err(e) => warnings.push(MappingWarning {
                    record_type: "R".into(),
                    detail: e,
                }),
            },
            constants::COMMENT_RECORD => {
                message.push_comment(record.field(3).to_string());
            }
            constants::REQUEST_RECORD => {
                message.push_query(record.field(2).to_string());
            }
            constants::TERMINATOR_RECORD => {
                message.finalize();
            }
            other => warnings.push(MappingWarning {
                record_type: other.to_string(),
                detail: "unrecognized record type, ignored".into(),
            }),
        }
    }

    if message.patient.is_none() {
        return Err(ProtocolError::InvalidRecord(
            "message has no patient record".into(),
        ));
    }

    Ok(Decoded { message, warnings })
}

fn build_patient(record: &Record, field_map: &FieldMap) -> std::result::Result<Patient, String> {
    let external_id = record.field(field_map.patient_external_id_field).to_string();
    let internal_id = record.field(field_map.patient_internal_id_field).to_string();
    let name = record.field(field_map.patient_name_field).to_string();
    let mut patient = Patient::new(external_id, internal_id).map_err(|e| e.to_string())?;
    patient.full_name = name.replace(
        crate::protocol::astm::constants::COMPONENT_DELIMITER as char,
        " ",
    );
    Ok(patient)
}

fn build_order(record: &Record, field_map: &FieldMap) -> std::result::Result<Order, String> {
    let sample_id = record.field(field_map.order_sample_id_field).to_string();
    if sample_id.is_empty() {
        return Err("order record missing sample id".into());
    }
    let test_requested = record.field(field_map.order_test_field).to_string();
    Ok(Order::new(sample_id, test_requested))
}

fn build_result(record: &Record, field_map: &FieldMap) -> std::result::Result<TestResult, String> {
    let test_code_field = record.field(field_map.result_test_code_field);
    let components = Record::components(test_code_field);
    let test_code = components
        .get(field_map.result_test_code_component)
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
        .ok_or("result record missing test code component")?;

    let value = record.field(field_map.result_value_field).to_string();
    let units = non_empty(record.field(field_map.result_units_field).to_string());
    let reference_range = non_empty(
        record
            .field(field_map.result_reference_range_field)
            .to_string(),
    );
    let abnormal_flags = record
        .field(field_map.result_abnormal_flags_field)
        .split(constants::REPEAT_DELIMITER as char)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();
    let observed_at = parse_astm_datetime(record.field(field_map.result_observed_at_field));

    let mut result = TestResult::new(test_code, value, String::new());
    result.units = units;
    result.reference_range = reference_range;
    result.abnormal_flags = abnormal_flags;
    result.observed_at = observed_at;
    Ok(result)
}

/// Parses the ASTM `YYYYMMDDHHMMSS` timestamp format; absent or malformed
/// timestamps are left as `None` rather than rejecting the record.
fn parse_astm_datetime(raw: &str) -> Option<chrono::DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }
    NaiveDateTime::parse_from_str(raw, "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_records() -> Vec<Record> {
        vec![
            Record::parse("H|\\^&|||host|||||||P|1394-97|20260101120000").unwrap(),
            Record::parse("P|1|98765||12345||Doe^Jane").unwrap(),
            Record::parse("O|1|SAMPLE01||^^^GLU").unwrap(),
            Record::parse("R|1|^^^GLU|5.3|mmol/L|3.9-6.1|N||F|||20260101120500").unwrap(),
            Record::parse("L|1|N").unwrap(),
        ]
    }

    #[test]
    fn decodes_full_message() {
        let field_map = FieldMap::default_astm();
        let decoded = decode_records("SYSMEX-XN", &sample_records(), &field_map).unwrap();
        assert!(decoded.warnings.is_empty());
        let patient = decoded.message.patient.unwrap();
        assert_eq!(patient.external_id, "12345");
        assert_eq!(patient.full_name, "Doe Jane");
        assert_eq!(decoded.message.orders.len(), 1);
        assert_eq!(decoded.message.orders[0].order.sample_id, "SAMPLE01");
        assert_eq!(decoded.message.orders[0].results.len(), 1);
        assert_eq!(decoded.message.orders[0].results[0].test_code, "GLU");
        assert!(decoded.message.finalized);
    }

    #[test]
    fn missing_patient_is_fatal() {
        let field_map = FieldMap::default_astm();
        let records = vec![Record::parse("H|\\^&").unwrap(), Record::parse("L|1|N").unwrap()];
        assert!(decode_records("SYSMEX-XN", &records, &field_map).is_err());
    }

    #[test]
    fn result_before_order_is_a_warning_not_a_crash() {
        let field_map = FieldMap::default_astm();
        let records = vec![
            Record::parse("P|1|98765||12345||Doe^Jane").unwrap(),
            Record::parse("R|1|^^^GLU|5.3|mmol/L").unwrap(),
            Record::parse("L|1|N").unwrap(),
        ];
        let decoded = decode_records("SYSMEX-XN", &records, &field_map).unwrap();
        assert_eq!(decoded.warnings.len(), 1);
        assert_eq!(decoded.warnings[0].record_type, "R");
    }
}

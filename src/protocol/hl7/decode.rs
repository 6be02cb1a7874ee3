//! Projects a stream of HL7 segments onto the canonical [`Message`] using a
//! [`FieldMap`]: MSH identifies delimiters, PID carries demographics, OBR
//! opens an order, OBX attaches a result, NTE is a free-form comment
//! attached to the nearest preceding OBR/OBX.

use chrono::{NaiveDateTime, TimeZone, Utc};

use crate::decode::{Decoded, MappingWarning};
use crate::mapper::FieldMap;
use crate::model::{Message, Order, Patient, TestResult};
use crate::protocol::error::{ProtocolError, Result};
use crate::protocol::hl7::{constants, Delimiters, Segment};

pub fn decode_segments(
    source_analyzer: &str,
    segments: &[Segment],
    delimiters: &Delimiters,
    field_map: &FieldMap,
) -> Result<Decoded> {
    let mut message = Message::new(source_analyzer.to_string());
    let mut warnings = Vec::new();

    for segment in segments {
        match segment.segment_type() {
            constants::HEADER_SEGMENT => {}
            constants::PATIENT_SEGMENT => match build_patient(segment, field_map) {
                Ok(patient) => message.set_patient(patient),
                Err(e) => warnings.push(MappingWarning {
                    record_type: "PID".into(),
                    detail: e,
                }),
            },
            constants::ORDER_SEGMENT => match build_order(segment, field_map) {
                Ok(order) => message.push_order(order),
                Err(e) => warnings.push(MappingWarning {
                    record_type: "OBR".into(),
                    detail: e,
                }),
            },
            constants::RESULT_SEGMENT => match build_result(segment, delimiters, field_map) {
                Ok(result) => {
                    if let Err(e) = message.push_result(result) {
                        warnings.push(MappingWarning {
                            record_type: "OBX".into(),
                            detail: e.to_string(),
                        });
                    }
                }
                Err(e) => warnings.push(MappingWarning {
                    record_type: "OBX".into(),
                    detail: e,
                }),
            },
            constants::COMMENT_SEGMENT => {
                message.push_comment(segment.field(3).to_string());
            }
            constants::QUERY_SEGMENT => {
                message.push_query(segment.field(1).to_string());
            }
            other => warnings.push(MappingWarning {
                record_type: other.to_string(),
                detail: "unrecognized segment type, ignored".into(),
            }),
        }
    }

    if message.patient.is_none() {
        return Err(ProtocolError::InvalidRecord(
            "message has no PID segment".into(),
        ));
    }
    message.finalize();

    Ok(Decoded { message, warnings })
}

fn build_patient(segment: &Segment, field_map: &FieldMap) -> std::result::Result<Patient, String> {
    let external_id = segment.field(field_map.patient_external_id_field).to_string();
    let internal_id = segment.field(field_map.patient_internal_id_field).to_string();
    let name = segment.field(field_map.patient_name_field).to_string();
    let mut patient = Patient::new(external_id, internal_id).map_err(|e| e.to_string())?;
    patient.full_name = name.replace(constants::DEFAULT_COMPONENT_SEPARATOR, " ");
    Ok(patient)
}

fn build_order(segment: &Segment, field_map: &FieldMap) -> std::result::Result<Order, String> {
    let sample_id = segment.field(field_map.order_sample_id_field).to_string();
    if sample_id.is_empty() {
        return Err("OBR segment missing sample id".into());
    }
    let universal_service_id = segment.field(field_map.order_test_field).to_string();
    Ok(Order::new(sample_id, universal_service_id))
}

fn build_result(
    segment: &Segment,
    delimiters: &Delimiters,
    field_map: &FieldMap,
) -> std::result::Result<TestResult, String> {
    let test_code_field = segment.field(field_map.result_test_code_field);
    let components = Segment::components(test_code_field, delimiters.component);
    let test_code = components
        .get(field_map.result_test_code_component)
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
        .ok_or("OBX segment missing test code component")?;

    let value = segment.field(field_map.result_value_field).to_string();
    let units = non_empty(segment.field(field_map.result_units_field).to_string());
    let reference_range = non_empty(
        segment
            .field(field_map.result_reference_range_field)
            .to_string(),
    );
    let abnormal_flags = segment
        .field(field_map.result_abnormal_flags_field)
        .split(delimiters.repetition)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();
    let observed_at = parse_hl7_datetime(segment.field(field_map.result_observed_at_field));

    let mut result = TestResult::new(test_code, value, String::new());
    result.units = units;
    result.reference_range = reference_range;
    result.abnormal_flags = abnormal_flags;
    result.observed_at = observed_at;
    Ok(result)
}

/// Parses the HL7 `YYYYMMDDHHMMSS` timestamp format (and its common
/// shorter forms); absent or malformed timestamps are left as `None`
/// rather than rejecting the record.
fn parse_hl7_datetime(raw: &str) -> Option<chrono::DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }
    for fmt in ["%Y%m%d%H%M%S", "%Y%m%d%H%M", "%Y%m%d"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
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
    use crate::protocol::hl7::split_message_to_segments;

    fn mindray_bs430() -> &'static str {
        "MSH|^~\\&|BS430|LAB|LIS|RECV|20260101120000||ORU^R01|123456|P|2.4\rPID|1|322288|322288||WORLANYO^TIMOTHY||19800101|M\rOBR|1||322288|GLU^Glucose\rOBX|1|NM|GLU||5.3|mmol/L|3.9-6.1|N|||F\rOBX|2|NM|CREA||88|umol/L|62-106|N|||F"
    }

    #[test]
    fn decodes_mindray_hl7_message() {
        let (segments, delimiters) = split_message_to_segments(mindray_bs430()).unwrap();
        let field_map = FieldMap::default_hl7();
        let decoded = decode_segments("MINDRAY-BS430", &segments, &delimiters, &field_map).unwrap();
        assert!(decoded.warnings.is_empty());
        let patient = decoded.message.patient.unwrap();
        assert_eq!(patient.external_id, "322288");
        assert_eq!(patient.full_name, "WORLANYO TIMOTHY");
        assert_eq!(decoded.message.orders.len(), 1);
        assert_eq!(decoded.message.orders[0].order.sample_id, "322288");
        assert_eq!(decoded.message.orders[0].results.len(), 2);
        assert_eq!(decoded.message.orders[0].results[0].test_code, "GLU");
        assert_eq!(decoded.message.orders[0].results[1].test_code, "CREA");
    }

    #[test]
    fn missing_pid_is_fatal() {
        let message = "MSH|^~\\&|BS430|LAB|LIS|RECV|20260101120000||ORU^R01|1|P|2.4";
        let (segments, delimiters) = split_message_to_segments(message).unwrap();
        let field_map = FieldMap::default_hl7();
        assert!(decode_segments("MINDRAY-BS430", &segments, &delimiters, &field_map).is_err());
    }
}

//! Field Mapper: per-analyzer field positions used to project decoded
//! records onto the canonical model. Positions are table-driven rather than
//! hardcoded per analyzer, so a new analyzer with a nonstandard field layout
//! is an entry in [`FieldMapRegistry`] instead of a new parser
//! implementation.

use std::collections::HashMap;

/// Field (and, where relevant, component) positions a decoder reads to
/// build canonical entities out of a record. Defaults match the ASTM/HL7
/// layouts described for the `P`/`O`/`R` and `PID`/`OBR`/`OBX` records;
/// an analyzer that deviates gets its own `FieldMap` in the registry.
#[derive(Debug, Clone)]
pub struct FieldMap {
    pub patient_external_id_field: usize,
    pub patient_internal_id_field: usize,
    pub patient_name_field: usize,
    pub order_sample_id_field: usize,
    pub order_test_field: usize,
    pub result_test_code_field: usize,
    pub result_test_code_component: usize,
    pub result_value_field: usize,
    pub result_units_field: usize,
    pub result_reference_range_field: usize,
    pub result_abnormal_flags_field: usize,
    pub result_observed_at_field: usize,
}

impl FieldMap {
    /// Default ASTM layout (the record-type letter itself occupies ASTM
    /// field 1, so `record.field(i)` is ASTM field `i + 1`): `P-3` external
    /// id, `P-4` internal id, `P-7` name;
    /// `O-3` sample id, `O-6` requested test; `R-3` test code (4th
    /// component), `R-4` value, `R-5` units, `R-6` reference range, `R-7`
    /// abnormal flags, `R-13` observation datetime.
    pub fn default_astm() -> Self {
        Self {
            patient_external_id_field: 2,
            patient_internal_id_field: 3,
            patient_name_field: 6,
            order_sample_id_field: 2,
            order_test_field: 5,
            result_test_code_field: 2,
            result_test_code_component: 3,
            result_value_field: 3,
            result_units_field: 4,
            result_reference_range_field: 5,
            result_abnormal_flags_field: 6,
            result_observed_at_field: 12,
        }
    }

    /// Default HL7 layout (the segment name is unnumbered, so
    /// `segment.field(i)` is HL7 field `i`): `PID-2`
    /// external id, `PID-3` internal id, `PID-5` name; `OBR-3` sample id
    /// (Filler Order Number), `OBR-4` requested test; `OBX-3` test code (1st
    /// component), `OBX-5` value, `OBX-6` units, `OBX-7` reference range,
    /// `OBX-8` abnormal flags, `OBX-14` observation datetime.
    pub fn default_hl7() -> Self {
        Self {
            patient_external_id_field: 2,
            patient_internal_id_field: 3,
            patient_name_field: 5,
            order_sample_id_field: 3,
            order_test_field: 4,
            result_test_code_field: 3,
            result_test_code_component: 0,
            result_value_field: 5,
            result_units_field: 6,
            result_reference_range_field: 7,
            result_abnormal_flags_field: 8,
            result_observed_at_field: 14,
        }
    }
}

/// Holds per-`analyzer_type` overrides on top of the protocol default, keyed
/// by the `analyzer_type` string from a listener's `ListenerSpec`.
#[derive(Debug, Default)]
pub struct FieldMapRegistry {
    astm_overrides: HashMap<String, FieldMap>,
    hl7_overrides: HashMap<String, FieldMap>,
}

impl FieldMapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_astm(&mut self, analyzer_type: impl Into<String>, map: FieldMap) {
        self.astm_overrides.insert(analyzer_type.into(), map);
    }

    pub fn register_hl7(&mut self, analyzer_type: impl Into<String>, map: FieldMap) {
        self.hl7_overrides.insert(analyzer_type.into(), map);
    }

    pub fn astm_for(&self, analyzer_type: &str) -> FieldMap {
        self.astm_overrides
            .get(analyzer_type)
            .cloned()
            .unwrap_or_else(FieldMap::default_astm)
    }

    pub fn hl7_for(&self, analyzer_type: &str) -> FieldMap {
        self.hl7_overrides
            .get(analyzer_type)
            .cloned()
            .unwrap_or_else(FieldMap::default_hl7)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_analyzer_gets_default_map() {
        let registry = FieldMapRegistry::new();
        let map = registry.astm_for("unknown-analyzer");
        assert_eq!(map.patient_external_id_field, 2);
    }

    #[test]
    fn override_replaces_default() {
        let mut registry = FieldMapRegistry::new();
        let mut map = FieldMap::default_astm();
        map.patient_external_id_field = 4;
        registry.register_astm("sysmex-xn", map);
        assert_eq!(registry.astm_for("sysmex-xn").patient_external_id_field, 4);
        assert_eq!(registry.astm_for("other").patient_external_id_field, 2);
    }
}

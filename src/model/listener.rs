use serde::{Deserialize, Serialize};

/// Wire protocol a listener speaks. `Poct1a` is recognized but never
/// decoded; a listener bound to it reports a clean `UnsupportedProtocol`
/// rather than silently accepting bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Astm,
    Hl7,
    Poct1a,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Astm => "astm",
            Protocol::Hl7 => "hl7",
            Protocol::Poct1a => "poct1a",
        }
    }
}

/// One configured front-end port. Deserialized directly from the
/// `listeners[]` table in the config file; the Supervisor diffs a
/// `Vec<ListenerSpec>` by `port` on reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSpec {
    pub port: u16,
    pub analyzer_type: String,
    pub protocol: Protocol,
    #[serde(default)]
    pub field_map_id: Option<String>,
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

impl ListenerSpec {
    /// The key used to look up this listener's `FieldMap` override: an
    /// explicit `field_map_id` if configured, otherwise the analyzer type
    /// itself.
    pub fn field_map_key(&self) -> &str {
        self.field_map_id.as_deref().unwrap_or(&self.analyzer_type)
    }

    pub fn idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.idle_timeout_secs.unwrap_or(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_map_key_falls_back_to_analyzer_type() {
        let spec = ListenerSpec {
            port: 5000,
            analyzer_type: "SYSMEX-XN".into(),
            protocol: Protocol::Astm,
            field_map_id: None,
            idle_timeout_secs: None,
        };
        assert_eq!(spec.field_map_key(), "SYSMEX-XN");
    }

    #[test]
    fn default_idle_timeout_is_60s() {
        let spec = ListenerSpec {
            port: 5000,
            analyzer_type: "SYSMEX-XN".into(),
            protocol: Protocol::Astm,
            field_map_id: None,
            idle_timeout_secs: None,
        };
        assert_eq!(spec.idle_timeout().as_secs(), 60);
    }
}

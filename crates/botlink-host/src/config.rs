use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use botlink_frame::{ChecksumKind, FrameConfig, Framing, TypeRange, MAX_PAYLOAD};
use serde::{Deserialize, Serialize};

use crate::error::{HostError, Result};

/// Host server configuration.
///
/// Every field has a default, so a JSON file only needs the keys it changes:
///
/// ```json
/// { "bind": "0.0.0.0:5760", "max_clients": 4, "framing": "delimited" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Listen address.
    pub bind: String,
    /// Maximum simultaneously connected robots.
    pub max_clients: usize,
    /// Framing strategy for every link of this host.
    #[serde(with = "as_str")]
    pub framing: Framing,
    /// Trailer algorithm.
    #[serde(with = "as_str")]
    pub checksum: ChecksumKind,
    /// Largest payload accepted or sent.
    pub max_payload_size: usize,
    /// Sleep between idle multiplexer ticks, in milliseconds.
    pub poll_interval_ms: u64,
    /// Default timeout for `await_message`, in milliseconds.
    pub await_timeout_ms: u64,
    /// Lowest type id accepted from robots.
    pub first_type_id: u8,
    /// Highest type id accepted from robots.
    pub last_type_id: u8,
    /// Sub channel stamped on inbound messages.
    pub sub_channel: u8,
}

impl Default for HostConfig {
    fn default() -> Self {
        let types = TypeRange::default();
        Self {
            bind: "0.0.0.0:5760".to_string(),
            max_clients: 8,
            framing: Framing::default(),
            checksum: ChecksumKind::default(),
            max_payload_size: botlink_frame::DEFAULT_MAX_PAYLOAD,
            poll_interval_ms: 1,
            await_timeout_ms: 1_000,
            first_type_id: types.first(),
            last_type_id: types.last(),
            sub_channel: 0,
        }
    }
}

impl HostConfig {
    /// Load a configuration from a JSON file and validate it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: HostConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no link can run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_clients == 0 {
            return Err(HostError::Config("max_clients must be at least 1".into()));
        }
        if self.first_type_id > self.last_type_id {
            return Err(HostError::Config(format!(
                "first_type_id {:#04x} is above last_type_id {:#04x}",
                self.first_type_id, self.last_type_id
            )));
        }
        if self.max_payload_size > MAX_PAYLOAD {
            return Err(HostError::Config(format!(
                "max_payload_size {} exceeds frame limit {MAX_PAYLOAD}",
                self.max_payload_size
            )));
        }
        Ok(())
    }

    /// Codec settings shared by every link.
    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_payload_size: self.max_payload_size,
            checksum: self.checksum,
            framing: self.framing,
            ..FrameConfig::default()
        }
    }

    /// Type ids accepted from robots.
    pub fn type_range(&self) -> TypeRange {
        TypeRange::new(self.first_type_id, self.last_type_id)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn await_timeout(&self) -> Duration {
        Duration::from_millis(self.await_timeout_ms)
    }
}

/// (De)serialize through `Display`/`FromStr`.
mod as_str {
    use super::*;

    pub fn serialize<T: Display, S: serde::Serializer>(
        value: &T,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> std::result::Result<T, D::Error>
    where
        T: FromStr<Err = String>,
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = HostConfig::default();
        config.validate().unwrap();
        assert_eq!(config.frame_config().framing, Framing::LengthPrefixed);
        assert!(config.type_range().contains(0x10));
        assert!(!config.type_range().contains(botlink_frame::MESSAGE_BLOCKED));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: HostConfig =
            serde_json::from_str(r#"{ "max_clients": 2, "framing": "delimited", "checksum": "xor" }"#)
                .unwrap();
        assert_eq!(config.max_clients, 2);
        assert_eq!(config.framing, Framing::Delimited);
        assert_eq!(config.checksum, ChecksumKind::Xor);
        assert_eq!(config.bind, HostConfig::default().bind);
    }

    #[test]
    fn unknown_keys_and_values_rejected() {
        assert!(serde_json::from_str::<HostConfig>(r#"{ "maxclients": 2 }"#).is_err());
        assert!(serde_json::from_str::<HostConfig>(r#"{ "framing": "morse" }"#).is_err());
    }

    #[test]
    fn serializes_strategies_as_strings() {
        let json = serde_json::to_value(HostConfig::default()).unwrap();
        assert_eq!(json["framing"], "length-prefixed");
        assert_eq!(json["checksum"], "crc8");
    }

    #[test]
    fn validate_catches_bad_ranges() {
        let mut config = HostConfig {
            max_clients: 0,
            ..HostConfig::default()
        };
        assert!(matches!(config.validate(), Err(HostError::Config(_))));

        config.max_clients = 1;
        config.first_type_id = 0x20;
        config.last_type_id = 0x10;
        assert!(matches!(config.validate(), Err(HostError::Config(_))));

        config.last_type_id = 0x30;
        config.max_payload_size = MAX_PAYLOAD + 1;
        assert!(matches!(config.validate(), Err(HostError::Config(_))));
    }

    #[test]
    fn loads_from_file() {
        let dir = std::env::temp_dir().join(format!("botlink-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("host.json");
        std::fs::write(&path, r#"{ "bind": "127.0.0.1:0", "await_timeout_ms": 250 }"#).unwrap();

        let config = HostConfig::from_json_file(&path).unwrap();
        assert_eq!(config.bind, "127.0.0.1:0");
        assert_eq!(config.await_timeout(), Duration::from_millis(250));

        let _ = std::fs::remove_dir_all(&dir);
    }
}

use crate::command::TimeoutClass;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("At least one group must be configured")]
    NoGroups,

    #[error("Empty group name")]
    EmptyGroupName,

    #[error("Duplicate group name: {0}")]
    DuplicateGroup(String),

    #[error("{0} must be greater than 0")]
    Zero(&'static str),
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "0.0.0.0".into(),
            port: 9090,
        }
    }
}

/// Reply timeouts per [`TimeoutClass`], in milliseconds.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Timeouts {
    pub standard_ms: u64,
    pub bulk_ms: u64,
    pub transfer_ms: u64,
}

impl Timeouts {
    pub fn for_class(&self, class: TimeoutClass) -> Duration {
        let ms = match class {
            TimeoutClass::Standard => self.standard_ms,
            TimeoutClass::Bulk => self.bulk_ms,
            TimeoutClass::Transfer => self.transfer_ms,
        };
        Duration::from_millis(ms)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.standard_ms == 0 {
            return Err(ValidationError::Zero("timeouts.standard_ms"));
        }
        if self.bulk_ms == 0 {
            return Err(ValidationError::Zero("timeouts.bulk_ms"));
        }
        if self.transfer_ms == 0 {
            return Err(ValidationError::Zero("timeouts.transfer_ms"));
        }
        Ok(())
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            standard_ms: 12_000,
            bulk_ms: 60_000,
            transfer_ms: 600_000,
        }
    }
}

/// Multiplexer configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Where worker nodes dial in
    pub listener: Listener,
    /// Groups the gateway expects workers for. Readiness requires a member in each.
    pub groups: Vec<String>,
    /// Capacity of each node's outbound queue
    pub queue_capacity: usize,
    pub heartbeat_interval_ms: u64,
    /// How long a new stream may take to send its first frame
    pub handshake_timeout_ms: u64,
    pub max_frame_bytes: usize,
    /// High bits of every correlation id issued by this process. Random when unset.
    pub instance_id: Option<u16>,
    pub timeouts: Timeouts,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;

        if self.groups.is_empty() {
            return Err(ValidationError::NoGroups);
        }
        let mut seen = HashSet::new();
        for group in &self.groups {
            if group.is_empty() {
                return Err(ValidationError::EmptyGroupName);
            }
            if !seen.insert(group) {
                return Err(ValidationError::DuplicateGroup(group.clone()));
            }
        }

        if self.queue_capacity == 0 {
            return Err(ValidationError::Zero("queue_capacity"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ValidationError::Zero("heartbeat_interval_ms"));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ValidationError::Zero("handshake_timeout_ms"));
        }
        if self.max_frame_bytes == 0 {
            return Err(ValidationError::Zero("max_frame_bytes"));
        }

        self.timeouts.validate()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listener: Listener::default(),
            groups: vec!["general".into(), "index".into(), "storage".into()],
            queue_capacity: 20_000,
            heartbeat_interval_ms: 5_000,
            handshake_timeout_ms: 10_000,
            max_frame_bytes: 64 * 1024 * 1024,
            instance_id: None,
            timeouts: Timeouts::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_config() {
        let yaml = r#"
listener:
    host: "0.0.0.0"
    port: 7000
groups:
    - general
    - index
queue_capacity: 128
instance_id: 7
timeouts:
    bulk_ms: 30000
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());

        assert_eq!(config.listener.port, 7000);
        assert_eq!(config.groups, vec!["general", "index"]);
        assert_eq!(config.queue_capacity, 128);
        assert_eq!(config.instance_id, Some(7));
        // Unset fields keep their defaults
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(
            config.timeouts.for_class(TimeoutClass::Standard),
            Duration::from_secs(12)
        );
        assert_eq!(
            config.timeouts.for_class(TimeoutClass::Bulk),
            Duration::from_secs(30)
        );
        assert_eq!(
            config.timeouts.for_class(TimeoutClass::Transfer),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let base_config = Config::default();

        let mut config = base_config.clone();
        config.listener.port = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidPort));

        let mut config = base_config.clone();
        config.groups = vec![];
        assert_eq!(config.validate(), Err(ValidationError::NoGroups));

        let mut config = base_config.clone();
        config.groups.push("".into());
        assert_eq!(config.validate(), Err(ValidationError::EmptyGroupName));

        let mut config = base_config.clone();
        config.groups.push("index".into());
        assert_eq!(
            config.validate(),
            Err(ValidationError::DuplicateGroup("index".into()))
        );

        let mut config = base_config.clone();
        config.queue_capacity = 0;
        assert_eq!(
            config.validate(),
            Err(ValidationError::Zero("queue_capacity"))
        );

        let mut config = base_config.clone();
        config.heartbeat_interval_ms = 0;
        assert_eq!(
            config.validate(),
            Err(ValidationError::Zero("heartbeat_interval_ms"))
        );

        let mut config = base_config.clone();
        config.timeouts.transfer_ms = 0;
        assert_eq!(
            config.validate(),
            Err(ValidationError::Zero("timeouts.transfer_ms"))
        );
    }
}

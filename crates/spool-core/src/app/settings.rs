//! ServiceBusSettings - broker 接続設定と接続文字列
//!
//! 設定キーは `ServiceBus`, `QueueName`, `MaxSessions`, `PreFetchCount`。
//! `validate()` で起動時に検証し、不正なら SettingsError を返す（Fail-fast）。

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;

use crate::domain::{QueueName, ValidationError};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("ServiceBusSettings.{0} is required")]
    Missing(&'static str),

    #[error("invalid ServiceBus connection string: {0}")]
    InvalidConnectionString(String),

    #[error("invalid ServiceBusSettings.QueueName: {0}")]
    InvalidQueueName(#[source] ValidationError),
}

/// Keys are PascalCase; all-lowercase spellings are accepted too.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ServiceBusSettings {
    /// Connection string.
    #[serde(default, alias = "servicebus")]
    pub service_bus: Option<SecretString>,

    #[serde(default, alias = "queuename")]
    pub queue_name: String,

    /// Concurrent sessions; 0 means the broker default.
    #[serde(default, alias = "maxsessions")]
    pub max_sessions: u32,

    /// Messages fetched ahead per session; 0 disables prefetch.
    #[serde(default, rename = "PreFetchCount", alias = "prefetchcount")]
    pub prefetch_count: u32,
}

/// Settings after validation.
#[derive(Debug, Clone)]
pub struct ServiceBusConfig {
    pub connection: ConnectionString,
    pub queue: QueueName,
    pub max_concurrent_sessions: usize,
    pub prefetch_count: u32,
}

impl ServiceBusSettings {
    pub fn validate(&self) -> Result<ServiceBusConfig, SettingsError> {
        let raw = self
            .service_bus
            .as_ref()
            .map(|s| s.expose_secret().trim())
            .filter(|s| !s.is_empty())
            .ok_or(SettingsError::Missing("ServiceBus"))?;
        if self.queue_name.trim().is_empty() {
            return Err(SettingsError::Missing("QueueName"));
        }

        let connection = ConnectionString::parse(raw)?;
        let queue = QueueName::new(self.queue_name.trim()).map_err(SettingsError::InvalidQueueName)?;

        Ok(ServiceBusConfig {
            connection,
            queue,
            max_concurrent_sessions: self.max_sessions as usize,
            prefetch_count: self.prefetch_count,
        })
    }
}

/// Parsed `Key=Value;...` connection string.
///
/// Either `Endpoint=sb://...;SharedAccessKeyName=...;SharedAccessKey=...`
/// or `UseDevelopmentEmulator=true`.
#[derive(Debug, Clone)]
pub struct ConnectionString {
    endpoint: String,
    shared_access_key_name: Option<String>,
    shared_access_key: Option<SecretString>,
    entity_path: Option<String>,
    development_emulator: bool,
}

const EMULATOR_ENDPOINT: &str = "sb://localhost";

impl ConnectionString {
    pub fn parse(raw: &str) -> Result<Self, SettingsError> {
        let invalid = |reason: String| SettingsError::InvalidConnectionString(reason);

        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;
        let mut entity_path = None;
        let mut development_emulator = false;

        for (index, part) in raw
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .enumerate()
        {
            // the segment may hold the key, so only its position is reported
            let Some((name, value)) = part.split_once('=') else {
                return Err(invalid(format!("segment {} is not a Key=Value pair", index + 1)));
            };
            let value = value.trim().to_string();
            match name.trim().to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(value),
                "sharedaccesskeyname" => key_name = Some(value),
                "sharedaccesskey" => key = Some(value),
                "entitypath" => entity_path = Some(value),
                "usedevelopmentemulator" => {
                    development_emulator = value.parse::<bool>().map_err(|_| {
                        invalid(format!("UseDevelopmentEmulator must be true or false, got '{value}'"))
                    })?;
                }
                other => return Err(invalid(format!("unknown key '{other}'"))),
            }
        }

        if development_emulator {
            return Ok(Self {
                endpoint: endpoint.unwrap_or_else(|| EMULATOR_ENDPOINT.to_string()),
                shared_access_key_name: key_name,
                shared_access_key: key.map(SecretString::new),
                entity_path,
                development_emulator,
            });
        }

        let endpoint = endpoint.ok_or_else(|| invalid("Endpoint is required".into()))?;
        if !endpoint.starts_with("sb://") || endpoint.len() <= "sb://".len() {
            return Err(invalid(format!("Endpoint must be an sb:// URI, got '{endpoint}'")));
        }
        let key_name = key_name
            .filter(|v| !v.is_empty())
            .ok_or_else(|| invalid("SharedAccessKeyName is required".into()))?;
        let key = key
            .filter(|v| !v.is_empty())
            .ok_or_else(|| invalid("SharedAccessKey is required".into()))?;

        Ok(Self {
            endpoint,
            shared_access_key_name: Some(key_name),
            shared_access_key: Some(SecretString::new(key)),
            entity_path,
            development_emulator,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn shared_access_key_name(&self) -> Option<&str> {
        self.shared_access_key_name.as_deref()
    }

    pub fn shared_access_key(&self) -> Option<&SecretString> {
        self.shared_access_key.as_ref()
    }

    pub fn entity_path(&self) -> Option<&str> {
        self.entity_path.as_deref()
    }

    pub fn is_development_emulator(&self) -> bool {
        self.development_emulator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const CONN: &str = "Endpoint=sb://demo.servicebus.windows.net/;SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=c2VjcmV0PQ==";

    fn settings(conn: &str, queue: &str) -> ServiceBusSettings {
        ServiceBusSettings {
            service_bus: Some(SecretString::new(conn.to_string())),
            queue_name: queue.to_string(),
            max_sessions: 4,
            prefetch_count: 10,
        }
    }

    #[test]
    fn deserializes_pascal_case_keys() {
        let json = r#"{"ServiceBus":"UseDevelopmentEmulator=true","QueueName":"q","MaxSessions":3,"PreFetchCount":5}"#;
        let s: ServiceBusSettings = serde_json::from_str(json).unwrap();
        assert_eq!(s.queue_name, "q");
        assert_eq!(s.max_sessions, 3);
        assert_eq!(s.prefetch_count, 5);
    }

    #[test]
    fn lowercase_keys_are_accepted() {
        let json = r#"{"servicebus":"UseDevelopmentEmulator=true","queuename":"q","maxsessions":2,"prefetchcount":1}"#;
        let s: ServiceBusSettings = serde_json::from_str(json).unwrap();
        assert_eq!(s.queue_name, "q");
        assert_eq!(s.max_sessions, 2);
        assert_eq!(s.prefetch_count, 1);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(serde_json::from_str::<ServiceBusSettings>(r#"{"Colour":"blue"}"#).is_err());
    }

    #[test]
    fn counts_default_to_zero() {
        let s: ServiceBusSettings = serde_json::from_str(r#"{"ServiceBus":"x","QueueName":"q"}"#).unwrap();
        assert_eq!(s.max_sessions, 0);
        assert_eq!(s.prefetch_count, 0);
    }

    #[test]
    fn valid_settings_pass_through_unmodified() {
        let config = settings(CONN, "orders").validate().unwrap();
        assert_eq!(config.queue.as_str(), "orders");
        assert_eq!(config.max_concurrent_sessions, 4);
        assert_eq!(config.prefetch_count, 10);
        assert_eq!(config.connection.endpoint(), "sb://demo.servicebus.windows.net/");
        assert_eq!(
            config.connection.shared_access_key().map(|k| k.expose_secret().as_str()),
            Some("c2VjcmV0PQ==")
        );
    }

    #[rstest]
    #[case::no_connection("", "q", "ServiceBus")]
    #[case::no_queue(CONN, " ", "QueueName")]
    fn missing_values_are_named(#[case] conn: &str, #[case] queue: &str, #[case] field: &str) {
        match settings(conn, queue).validate() {
            Err(SettingsError::Missing(name)) => assert_eq!(name, field),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn bad_queue_name_is_rejected() {
        assert!(matches!(
            settings(CONN, "has space").validate(),
            Err(SettingsError::InvalidQueueName(_))
        ));
    }

    #[rstest]
    #[case::no_endpoint("SharedAccessKeyName=a;SharedAccessKey=b")]
    #[case::http_endpoint("Endpoint=https://x/;SharedAccessKeyName=a;SharedAccessKey=b")]
    #[case::no_key("Endpoint=sb://x/;SharedAccessKeyName=a")]
    #[case::no_key_name("Endpoint=sb://x/;SharedAccessKey=b")]
    #[case::not_a_pair("Endpoint")]
    #[case::unknown_key("Endpoint=sb://x/;SharedAccessKeyName=a;SharedAccessKey=b;Colour=blue")]
    #[case::bad_emulator_flag("UseDevelopmentEmulator=yes")]
    fn invalid_connection_strings(#[case] raw: &str) {
        assert!(matches!(
            ConnectionString::parse(raw),
            Err(SettingsError::InvalidConnectionString(_))
        ));
    }

    #[test]
    fn development_emulator_needs_no_key() {
        let conn = ConnectionString::parse("UseDevelopmentEmulator=true;").unwrap();
        assert!(conn.is_development_emulator());
        assert_eq!(conn.endpoint(), "sb://localhost");
    }

    #[test]
    fn malformed_segment_does_not_echo_its_text() {
        match ConnectionString::parse("Endpoint=sb://x/;SharedAccessKeyc2VjcmV0") {
            Err(SettingsError::InvalidConnectionString(reason)) => {
                assert!(!reason.contains("c2VjcmV0"));
                assert!(reason.contains("segment 2"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn debug_output_redacts_the_key() {
        let conn = ConnectionString::parse(CONN).unwrap();
        let debug = format!("{conn:?}");
        assert!(!debug.contains("c2VjcmV0PQ=="));
        assert!(debug.contains("REDACTED"));

        let debug = format!("{:?}", settings(CONN, "q"));
        assert!(!debug.contains("c2VjcmV0PQ=="));
    }
}

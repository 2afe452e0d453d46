//! Client configuration.
//!
//! Holds this client's own identity as announced to devices, the protocol
//! timing constants, and the session policy. Every field has a default, so
//! a configuration file only needs to list what it changes:
//!
//! ```toml
//! source_name = "booth-pc"
//! debounce_window_ms = 250
//! download_databases = true
//! database_dir = "/var/cache/stagelinq"
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{error::Result, token::Token};

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Token announced to and presented to devices.
    pub token: Token,

    /// `source` field of our discovery announcements. Discovery messages
    /// carrying this source are our own, looped back, and are ignored.
    pub source_name: String,
    pub software_name: String,
    pub software_version: String,

    pub discovery_port: u16,
    /// Software names whose announcements are dropped. An entry ending in
    /// `*` matches as a prefix.
    pub ignored_software: Vec<String>,

    #[serde(rename = "announce_interval_ms", with = "millis")]
    pub announce_interval: Duration,
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    #[serde(rename = "listen_timeout_ms", with = "millis")]
    pub listen_timeout: Duration,
    #[serde(rename = "message_timeout_ms", with = "millis")]
    pub message_timeout: Duration,
    #[serde(rename = "download_timeout_ms", with = "millis")]
    pub download_timeout: Duration,
    #[serde(rename = "debounce_window_ms", with = "millis")]
    pub debounce_window: Duration,

    /// Number of service announcements after which service discovery is
    /// complete. `None` keeps the legacy rule: more than three.
    pub expected_service_count: Option<usize>,

    pub max_connection_attempts: u32,
    #[serde(rename = "min_connection_backoff_ms", with = "millis")]
    pub min_connection_backoff: Duration,
    #[serde(rename = "max_connection_backoff_ms", with = "millis")]
    pub max_connection_backoff: Duration,

    #[serde(rename = "heartbeat_interval_ms", with = "millis")]
    pub heartbeat_interval: Duration,
    #[serde(rename = "stale_timeout_ms", with = "millis")]
    pub stale_timeout: Duration,
    pub max_reconnect_attempts: u32,
    #[serde(rename = "reconnect_delay_ms", with = "millis")]
    pub reconnect_delay: Duration,

    pub download_databases: bool,
    pub database_dir: PathBuf,

    /// Emit beat information only every this many beats.
    pub beat_every_n: u32,
}

impl Default for Config {
    fn default() -> Self {
        let token = match machine_uid::get() {
            Ok(machine_id) => Token::from_machine_id(&machine_id),
            Err(e) => {
                warn!("could not get machine id, using random token: {e}");
                Token::fast_v4()
            }
        };
        trace!("client token: {token}");

        Self {
            token,

            source_name: String::from("testing"),
            software_name: env!("CARGO_PKG_NAME").to_owned(),
            software_version: env!("CARGO_PKG_VERSION").to_owned(),

            discovery_port: 51337,
            ignored_software: vec![
                String::from("OfflineAnalyzer"),
                String::from("SoundSwitch*"),
                String::from("Resolume"),
                String::from("JM08"),
                String::from("SSS0"),
            ],

            announce_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            listen_timeout: Duration::from_secs(5),
            message_timeout: Duration::from_secs(3),
            download_timeout: Duration::from_secs(60),
            debounce_window: Duration::from_millis(1500),

            expected_service_count: None,

            max_connection_attempts: 3,
            min_connection_backoff: Duration::from_secs(1),
            max_connection_backoff: Duration::from_secs(10),

            heartbeat_interval: Duration::from_secs(5),
            stale_timeout: Duration::from_secs(15),
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(2),

            download_databases: false,
            database_dir: std::env::temp_dir().join("stagelinq"),

            beat_every_n: 1,
        }
    }
}

impl Config {
    /// Loads a TOML configuration file on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or does not parse.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parses a TOML document on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::invalid_argument`](crate::error::Error::invalid_argument)
    /// for malformed documents or unknown keys.
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(Into::into)
    }

    /// Whether announcements from `software` should be dropped.
    #[must_use]
    pub fn is_ignored_software(&self, software: &str) -> bool {
        self.ignored_software
            .iter()
            .any(|pattern| match pattern.strip_suffix('*') {
                Some(prefix) => software.starts_with(prefix),
                None => software == pattern,
            })
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.discovery_port, 51337);
        assert_eq!(config.message_timeout, Duration::from_secs(3));
        assert_eq!(config.expected_service_count, None);
        assert!(config.is_ignored_software("OfflineAnalyzer"));
        assert!(config.is_ignored_software("SoundSwitch Embedded"));
        assert!(!config.is_ignored_software("Offline"));
        assert!(!config.is_ignored_software("Prime 4"));
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let config = Config::from_toml(
            r#"
            token = "52fdfc07-2182-654f-163f-5f0f9a621d72"
            debounce_window_ms = 250
            expected_service_count = 5
            ignored_software = []
            "#,
        )
        .unwrap();

        assert_eq!(config.token.to_string(), "52fdfc07-2182-654f-163f-5f0f9a621d72");
        assert_eq!(config.debounce_window, Duration::from_millis(250));
        assert_eq!(config.expected_service_count, Some(5));
        assert!(!config.is_ignored_software("OfflineAnalyzer"));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::from_toml("debounce_window = 1").is_err());
        assert!(Config::from_toml("token = \"not-a-token\"").is_err());
    }
}

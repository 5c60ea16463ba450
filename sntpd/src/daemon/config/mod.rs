use std::fmt::Display;
use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use sntp_proto::{PollInterval, Precision, ReferenceId};
use tracing::warn;

use super::tracing::LogLevel;

const DEFAULT_NTP_PORT: u16 = 123;

/// Configuration of the synchronizing client.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ClientConfig {
    /// Host name or literal IP address of the server to synchronize against.
    pub server: String,
    #[serde(default = "default_ntp_port")]
    pub port: u16,
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    /// How often a failed attempt is retried before settling into failure.
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Whether a successful synchronization also steps the OS clock.
    #[serde(default)]
    pub update_os_clock: bool,
}

impl ClientConfig {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            port: default_ntp_port(),
            receive_timeout_ms: default_receive_timeout_ms(),
            max_retries: 0,
            retry_delay_ms: default_retry_delay_ms(),
            update_os_clock: false,
        }
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Configuration of the server loop and the constants it stamps into
/// replies.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_ntp_port")]
    pub port: u16,
    /// 1 for a directly referenced time source.
    #[serde(default = "default_stratum")]
    pub stratum: u8,
    /// Four-character ASCII code of the reference source.
    #[serde(
        default = "default_reference_id",
        deserialize_with = "deserialize_reference_id"
    )]
    pub reference_id: ReferenceId,
    #[serde(default = "default_precision")]
    pub precision: Precision,
    /// Advertised maximum message interval, as a log2 exponent of seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: PollInterval,
    /// Backstop timeout on the listening socket; the loop re-checks its
    /// shutdown and gate flags whenever it expires.
    #[serde(default = "default_server_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// How long to sleep between polls of the okay-to-run gate.
    #[serde(default = "default_gate_poll_ms")]
    pub gate_poll_ms: u64,
}

impl ServerConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn gate_poll(&self) -> Duration {
        Duration::from_millis(self.gate_poll_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_ntp_port(),
            stratum: default_stratum(),
            reference_id: default_reference_id(),
            precision: default_precision(),
            poll_interval: default_poll_interval(),
            receive_timeout_ms: default_server_receive_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            gate_poll_ms: default_gate_poll_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub log_level: Option<LogLevel>,
    #[serde(default = "default_ansi_colors")]
    pub ansi_colors: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: Default::default(),
            ansi_colors: default_ansi_colors(),
        }
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub client: Option<ClientConfig>,
    #[serde(default)]
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    pub fn from_file(file: impl AsRef<Path>) -> Result<Config, ConfigError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let perm = std::fs::metadata(&file)?.permissions();
            if perm.mode() as libc::mode_t & libc::S_IWOTH != 0 {
                warn!("Unrestricted config file permissions: Others can write.");
            }
        }

        let contents = std::fs::read_to_string(file)?;
        Ok(toml::de::from_str(&contents)?)
    }
}

const fn default_ntp_port() -> u16 {
    DEFAULT_NTP_PORT
}

const fn default_receive_timeout_ms() -> u64 {
    30_000
}

const fn default_retry_delay_ms() -> u64 {
    15_000
}

const fn default_stratum() -> u8 {
    1
}

fn default_reference_id() -> ReferenceId {
    ReferenceId::LOCL
}

const fn default_precision() -> Precision {
    Precision::from_log(-6)
}

const fn default_poll_interval() -> PollInterval {
    PollInterval::MIN
}

const fn default_server_receive_timeout_ms() -> u64 {
    100_000
}

const fn default_send_timeout_ms() -> u64 {
    10_000
}

const fn default_gate_poll_ms() -> u64 {
    1_000
}

const fn default_ansi_colors() -> bool {
    true
}

fn deserialize_reference_id<'de, D>(deserializer: D) -> Result<ReferenceId, D::Error>
where
    D: Deserializer<'de>,
{
    let code = String::deserialize(deserializer)?;
    ReferenceId::from_code(&code).ok_or_else(|| {
        serde::de::Error::custom(format!("invalid reference identifier `{code}`"))
    })
}

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Toml(toml::de::Error),
}

impl std::error::Error for ConfigError {}

impl Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error while reading config: {e}"),
            Self::Toml(e) => write!(f, "config toml parsing error: {e}"),
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(value: toml::de::Error) -> Self {
        Self::Toml(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_minimal() {
        let config: Config = toml::from_str(
            r#"
            [client]
            server = "ntp.example.org"
            "#,
        )
        .unwrap();

        let client = config.client.unwrap();
        assert_eq!(client.server, "ntp.example.org");
        assert_eq!(client.port, 123);
        assert_eq!(client.receive_timeout(), Duration::from_secs(30));
        assert_eq!(client.max_retries, 0);
        assert_eq!(client.retry_delay(), Duration::from_secs(15));
        assert!(!client.update_os_clock);
        assert!(config.server.is_none());
    }

    #[test]
    fn full_config() {
        let config: Config = toml::from_str(
            r#"
            [client]
            server = "10.0.0.7"
            port = 1123
            receive-timeout-ms = 500
            max-retries = 2
            retry-delay-ms = 100
            update-os-clock = true

            [server]
            port = 1123
            stratum = 2
            reference-id = "GPS"
            precision = -10
            poll-interval = 6

            [observability]
            log-level = "debug"
            ansi-colors = false
            "#,
        )
        .unwrap();

        let client = config.client.unwrap();
        assert_eq!(client.port, 1123);
        assert_eq!(client.max_retries, 2);
        assert!(client.update_os_clock);

        let server = config.server.unwrap();
        assert_eq!(server.stratum, 2);
        assert_eq!(server.reference_id, ReferenceId::GPS);
        assert_eq!(server.precision.as_log(), -10);
        assert_eq!(server.poll_interval.as_log(), 6);

        assert_eq!(config.observability.log_level, Some(LogLevel::Debug));
        assert!(!config.observability.ansi_colors);
    }

    #[test]
    fn server_config_defaults() {
        let config: Config = toml::from_str("[server]\n").unwrap();
        let server = config.server.unwrap();
        assert_eq!(server.port, 123);
        assert_eq!(server.stratum, 1);
        assert_eq!(server.reference_id, ReferenceId::LOCL);
        assert_eq!(server.precision.as_log(), -6);
        assert_eq!(server.poll_interval, PollInterval::MIN);
        assert_eq!(server.receive_timeout(), Duration::from_secs(100));
        assert_eq!(server.gate_poll(), Duration::from_secs(1));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let parsed: Result<Config, _> = toml::from_str(
            r#"
            [client]
            server = "ntp.example.org"
            receive-timeout = 500
            "#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn invalid_reference_id_is_rejected() {
        let parsed: Result<Config, _> = toml::from_str(
            r#"
            [server]
            reference-id = "TOOLONG"
            "#,
        );
        assert!(parsed.is_err());
    }
}

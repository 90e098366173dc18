use crate::net::Address;
use crate::net::reactor::DEFAULT_SEND_QUEUE_CAPACITY;
use crate::probe::remote::SshConnection;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unknown signal name '{0}' (expected SIG* or NONE)")]
    UnknownSignal(String),
    #[error("Probe '{0}' has an empty command")]
    EmptyCommand(String),
    #[error("Probe name '{name}' is used more than once in {section}")]
    DuplicateName { section: String, name: String },
}

/// Signal sent to a subprocess when it is finished; `NONE` in the file.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(try_from = "String", into = "String")]
pub struct FinishSignal(pub Option<Signal>);

impl TryFrom<String> for FinishSignal {
    type Error = ConfigError;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        if name == "NONE" {
            return Ok(Self(None));
        }
        name.parse::<Signal>()
            .map(|signal| Self(Some(signal)))
            .map_err(|_| ConfigError::UnknownSignal(name))
    }
}

impl From<FinishSignal> for String {
    fn from(signal: FinishSignal) -> Self {
        match signal.0 {
            Some(signal) => signal.as_str().to_string(),
            None => "NONE".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FinishSettings {
    #[serde(default = "default_finish_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub signal: FinishSignal,
}

fn default_finish_timeout_ms() -> u64 {
    5000
}

impl Default for FinishSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_finish_timeout_ms(),
            signal: FinishSignal::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SubprocessSettings {
    pub name: String,
    pub cmd: Vec<String>,
    #[serde(default)]
    pub shell: bool,
    #[serde(default)]
    pub finish: FinishSettings,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct PingStableSettings {
    pub name: String,
    pub host: String,
    #[serde(default = "default_ping_count")]
    pub count: u32,
    #[serde(default = "default_ping_interval_s")]
    pub interval_s: u32,
}

fn default_ping_count() -> u32 {
    3
}

fn default_ping_interval_s() -> u32 {
    1
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct PingAliveSettings {
    pub name: String,
    pub host: String,
    #[serde(default = "default_ping_interval_s")]
    pub interval_s: u32,
    pub timeout_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RemoteSettings {
    pub name: String,
    pub command: String,
    pub start_key: String,
    pub connection: SshConnection,
    pub start_timeout_ms: u64,
    pub finish_timeout_ms: u64,
}

/// One configured probe, selected by its `type` key.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProbeConfig {
    Subprocess(SubprocessSettings),
    PingStable(PingStableSettings),
    PingAlive(PingAliveSettings),
    Remote(RemoteSettings),
}

impl ProbeConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::Subprocess(s) => &s.name,
            Self::PingStable(s) => &s.name,
            Self::PingAlive(s) => &s.name,
            Self::Remote(s) => &s.name,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct NetworkSettings {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

fn default_send_queue_capacity() -> usize {
    DEFAULT_SEND_QUEUE_CAPACITY
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            send_queue_capacity: default_send_queue_capacity(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ValidatorSettings {
    #[serde(default = "default_validator_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_validator_timeout_ms() -> u64 {
    1000
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_validator_timeout_ms(),
        }
    }
}

impl ValidatorSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DelaySettings {
    #[serde(default)]
    pub before_sending_ms: u64,
    #[serde(default)]
    pub between_cases_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CaseSettings {
    #[serde(default)]
    pub delays: DelaySettings,
    #[serde(default)]
    pub setups: Vec<ProbeConfig>,
    #[serde(default)]
    pub monitoring: Vec<ProbeConfig>,
    #[serde(default)]
    pub checks: Vec<ProbeConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerConfig {
    pub target: Address,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub validator: ValidatorSettings,
    #[serde(default)]
    pub case: CaseSettings,
    /// File the configuration was read from; recorded in the report only.
    #[serde(default, skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
}

impl FuzzerConfig {
    /// Reads TOML, or JSON when the file name ends in `.json`.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let mut config = if is_json {
            Self::from_json_str(&content)?
        } else {
            Self::from_toml_str(&content)?
        };
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: FuzzerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: FuzzerConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let sections = [
            ("case.setups", &self.case.setups),
            ("case.monitoring", &self.case.monitoring),
            ("case.checks", &self.case.checks),
        ];
        for (section, probes) in sections {
            let mut seen = HashSet::new();
            for probe in probes {
                if !seen.insert(probe.name()) {
                    return Err(ConfigError::DuplicateName {
                        section: section.to_string(),
                        name: probe.name().to_string(),
                    });
                }
                if let ProbeConfig::Subprocess(s) = probe {
                    if s.cmd.is_empty() {
                        return Err(ConfigError::EmptyCommand(probe.name().to_string()));
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for FuzzerConfig {
    fn default() -> Self {
        Self {
            target: Address::new("127.0.0.1", 5683),
            network: NetworkSettings::default(),
            validator: ValidatorSettings::default(),
            case: CaseSettings::default(),
            source: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FULL: &str = r#"
[target]
host = "192.168.1.20"
port = 5683

[network]
bind = "0.0.0.0:40000"
send-queue-capacity = 8

[validator]
timeout-ms = 2500

[case.delays]
before-sending-ms = 100
between-cases-ms = 500

[[case.setups]]
type = "subprocess"
name = "reset"
cmd = ["./reset-board.sh", "--hard"]
finish = { timeout-ms = 10000, signal = "NONE" }

[[case.monitoring]]
type = "ping-alive"
name = "alive"
host = "192.168.1.20"
timeout-ms = 3000

[[case.monitoring]]
type = "remote"
name = "trace"
command = "monitor --trace"
start-key = "tracing started"
start-timeout-ms = 5000
finish-timeout-ms = 5000
connection = { host = "192.168.1.20", username = "root" }

[[case.checks]]
type = "ping-stable"
name = "ping"
host = "192.168.1.20"
count = 5
interval-s = 1

[[case.checks]]
type = "subprocess"
name = "logcheck"
cmd = ["grep -q PANIC /var/log/board.log && exit 1 || exit 0"]
shell = true
finish = { timeout-ms = 2000, signal = "SIGINT" }
"#;

    #[test]
    fn full_toml_config_parses() {
        let config = FuzzerConfig::from_toml_str(FULL).unwrap();
        assert_eq!(config.target, Address::new("192.168.1.20", 5683));
        assert_eq!(config.network.bind.port(), 40000);
        assert_eq!(config.network.send_queue_capacity, 8);
        assert_eq!(config.validator.timeout(), Duration::from_millis(2500));
        assert_eq!(config.case.delays.before_sending_ms, 100);

        assert_eq!(config.case.setups.len(), 1);
        let ProbeConfig::Subprocess(reset) = &config.case.setups[0] else {
            panic!("expected subprocess, got {:?}", config.case.setups[0]);
        };
        assert_eq!(reset.cmd, ["./reset-board.sh", "--hard"]);
        assert!(!reset.shell);
        assert_eq!(reset.finish.signal, FinishSignal(None));

        let names: Vec<_> = config.case.monitoring.iter().map(|p| p.name()).collect();
        assert_eq!(names, ["alive", "trace"]);
        let ProbeConfig::Remote(trace) = &config.case.monitoring[1] else {
            panic!("expected remote");
        };
        assert_eq!(trace.connection.port, 22);
        assert_eq!(trace.connection.identity_file, None);

        let ProbeConfig::Subprocess(logcheck) = &config.case.checks[1] else {
            panic!("expected subprocess");
        };
        assert_eq!(logcheck.finish.signal, FinishSignal(Some(Signal::SIGINT)));
        assert!(logcheck.shell);
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = FuzzerConfig::from_toml_str("target = { host = \"127.0.0.1\", port = 5683 }")
            .unwrap();
        assert_eq!(config.network, NetworkSettings::default());
        assert_eq!(config.network.send_queue_capacity, 64);
        assert_eq!(config.validator.timeout_ms, 1000);
        assert!(config.case.setups.is_empty());
        assert_eq!(config.case.delays, DelaySettings::default());
    }

    #[test]
    fn unknown_signal_is_rejected() {
        let toml = r#"
target = { host = "127.0.0.1", port = 5683 }
[[case.checks]]
type = "subprocess"
name = "x"
cmd = ["true"]
finish = { signal = "SIGBOGUS" }
"#;
        let err = FuzzerConfig::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("SIGBOGUS"), "{err}");
    }

    #[test]
    fn unknown_probe_type_and_fields_are_rejected() {
        let unknown_type = r#"
target = { host = "127.0.0.1", port = 5683 }
[[case.checks]]
type = "telnet"
name = "x"
"#;
        assert!(matches!(
            FuzzerConfig::from_toml_str(unknown_type),
            Err(ConfigError::Toml(_))
        ));

        let unknown_field = r#"
target = { host = "127.0.0.1", port = 5683, proto = "udp" }
"#;
        assert!(FuzzerConfig::from_toml_str(unknown_field).is_err());
    }

    #[test]
    fn duplicate_names_and_empty_commands_are_rejected() {
        let duplicate = r#"
target = { host = "127.0.0.1", port = 5683 }
[[case.checks]]
type = "subprocess"
name = "x"
cmd = ["true"]
[[case.checks]]
type = "ping-stable"
name = "x"
host = "127.0.0.1"
"#;
        assert!(matches!(
            FuzzerConfig::from_toml_str(duplicate),
            Err(ConfigError::DuplicateName { .. })
        ));

        let empty = r#"
target = { host = "127.0.0.1", port = 5683 }
[[case.setups]]
type = "subprocess"
name = "x"
cmd = []
"#;
        assert!(matches!(
            FuzzerConfig::from_toml_str(empty),
            Err(ConfigError::EmptyCommand(_))
        ));
    }

    #[test]
    fn json_file_is_detected_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{
  "target": {{ "host": "10.0.0.1", "port": 1234 }},
  "case": {{
    "checks": [
      {{ "type": "ping-alive", "name": "alive", "host": "10.0.0.1", "timeout-ms": 100 }}
    ]
  }}
}}"#
        )
        .unwrap();

        let config = FuzzerConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.target.port, 1234);
        assert_eq!(config.source.as_deref(), Some(file.path()));
        assert!(matches!(config.case.checks[0], ProbeConfig::PingAlive(_)));
    }

    #[test]
    fn snapshot_round_trips_signal_names() {
        let config = FuzzerConfig::from_toml_str(FULL).unwrap();
        let snapshot = serde_json::to_value(&config).unwrap();
        assert_eq!(snapshot["case"]["checks"][1]["type"], "subprocess");
        assert_eq!(snapshot["case"]["checks"][1]["finish"]["signal"], "SIGINT");
        assert_eq!(snapshot["case"]["setups"][0]["finish"]["signal"], "NONE");
        assert!(snapshot.get("source").is_none());
    }

    #[test]
    fn shipped_default_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../default-config.toml");
        let config = FuzzerConfig::load_from_file(&path).unwrap();
        assert_eq!(config.target, Address::new("127.0.0.1", 5683));
        assert!(config.case.setups.is_empty());
        assert!(matches!(config.case.checks[0], ProbeConfig::PingStable(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(
            FuzzerConfig::load_from_file(Path::new("/nonexistent/emfuzzer.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}

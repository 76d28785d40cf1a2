use dotenvy::dotenv;
use log::warn;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Properties file checked in the working directory, mirroring the
/// `config.properties` convention used by the device provisioning tooling.
pub const PROPERTIES_FILE: &str = "config.properties";

pub const DEFAULT_BROKER_HOST: &str = "localhost";
pub const DEFAULT_BROKER_PORT: u16 = 8883;
pub const DEFAULT_ROOT_CA_PATH: &str = "certs/AmazonRootCA1.pem";
pub const DEFAULT_CERT_PATH: &str = "certs/certificate.pem.crt";
pub const DEFAULT_PRIVATE_KEY_PATH: &str = "certs/private.pem.key";
pub const DEFAULT_MACHINE_ID: &str = "NC_Machine_AC";
pub const DEFAULT_TELEMETRY_TOPIC: &str = "factory/telemetry";

#[derive(Debug, Clone)]
pub struct Config {
    pub broker_host: String,
    pub broker_port: u16,

    pub root_ca_path: String,
    pub cert_path: String,
    pub private_key_path: String,

    pub machine_id: String,
    pub telemetry_topic: String,
    pub publish_interval_secs: u64,
    pub anomaly_probability: f64,
    pub qos: u8,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid broker URL '{0}': expected ssl://host[:port] or host[:port]")]
    InvalidBrokerUrl(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Config {
    /// Loads the configuration with documented precedence:
    /// `config.properties` in the working directory, then environment
    /// variables (a `.env` file is honored first), then built-in defaults.
    pub fn load() -> Result<Self, ConfigError> {
        dotenv().ok();

        let props = read_properties(Path::new(PROPERTIES_FILE));
        let env_vars: HashMap<String, String> = env::vars().collect();
        Self::resolve(&props, &env_vars)
    }

    /// Pure resolution over the two key/value sources. Properties keys win
    /// over environment variables; anything unset falls back to a default.
    pub fn resolve(
        props: &HashMap<String, String>,
        env_vars: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let prop = |key: &str| non_empty(props.get(key));
        let env_var = |key: &str| non_empty(env_vars.get(key));

        // `iot.endpoint` is a bare ATS hostname; the MQTT port for X.509
        // clients is fixed at 8883. The env override carries a full URL.
        let (broker_host, broker_port) = if let Some(endpoint) = prop("iot.endpoint") {
            (endpoint, DEFAULT_BROKER_PORT)
        } else if let Some(url) = env_var("AWS_IOT_BROKER") {
            parse_broker_url(&url)?
        } else {
            (DEFAULT_BROKER_HOST.to_string(), DEFAULT_BROKER_PORT)
        };

        let config = Self {
            broker_host,
            broker_port,
            root_ca_path: prop("iot.rootCaPath")
                .or_else(|| env_var("AWS_IOT_ROOT_CA"))
                .unwrap_or_else(|| DEFAULT_ROOT_CA_PATH.to_string()),
            cert_path: prop("iot.certPath")
                .or_else(|| env_var("AWS_IOT_CERT"))
                .unwrap_or_else(|| DEFAULT_CERT_PATH.to_string()),
            private_key_path: prop("iot.privateKeyPath")
                .or_else(|| env_var("AWS_IOT_PRIVATE_KEY"))
                .unwrap_or_else(|| DEFAULT_PRIVATE_KEY_PATH.to_string()),

            machine_id: prop("iot.machineId")
                .or_else(|| env_var("MACHINE_ID"))
                .unwrap_or_else(|| DEFAULT_MACHINE_ID.to_string()),
            telemetry_topic: env_var("TELEMETRY_TOPIC")
                .unwrap_or_else(|| DEFAULT_TELEMETRY_TOPIC.to_string()),
            publish_interval_secs: env_var("PUBLISH_INTERVAL_SECS")
                .unwrap_or_else(|| "1".to_string())
                .parse::<u64>()
                .map_err(|_| {
                    ConfigError::ParsingError(
                        "PUBLISH_INTERVAL_SECS must be a valid number of seconds".to_string(),
                    )
                })?,
            anomaly_probability: env_var("ANOMALY_PROBABILITY")
                .unwrap_or_else(|| "0.10".to_string())
                .parse::<f64>()
                .map_err(|_| {
                    ConfigError::ParsingError(
                        "ANOMALY_PROBABILITY must be a valid number".to_string(),
                    )
                })?,
            qos: env_var("MQTT_QOS")
                .unwrap_or_else(|| "1".to_string())
                .parse::<u8>()
                .map_err(|_| {
                    ConfigError::ParsingError("MQTT_QOS must be 0, 1 or 2".to_string())
                })?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        const MIN_INTERVAL: u64 = 1;
        const MAX_INTERVAL: u64 = 3_600;

        if !(MIN_INTERVAL..=MAX_INTERVAL).contains(&self.publish_interval_secs) {
            return Err(ConfigError::ParsingError(format!(
                "PUBLISH_INTERVAL_SECS must be between {} and {} seconds",
                MIN_INTERVAL, MAX_INTERVAL
            )));
        }

        if !(0.0..=1.0).contains(&self.anomaly_probability) {
            return Err(ConfigError::ParsingError(
                "ANOMALY_PROBABILITY must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.qos > 2 {
            return Err(ConfigError::ParsingError(
                "MQTT_QOS must be 0, 1 or 2".to_string(),
            ));
        }

        Ok(())
    }
}

/// Splits `ssl://host:port` (or a bare `host[:port]`) into host and port.
fn parse_broker_url(raw: &str) -> Result<(String, u16), ConfigError> {
    let rest = raw
        .strip_prefix("ssl://")
        .or_else(|| raw.strip_prefix("mqtts://"))
        .unwrap_or(raw);

    if rest.is_empty() {
        return Err(ConfigError::InvalidBrokerUrl(raw.to_string()));
    }

    match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidBrokerUrl(raw.to_string()))?;
            if host.is_empty() {
                return Err(ConfigError::InvalidBrokerUrl(raw.to_string()));
            }
            Ok((host.to_string(), port))
        }
        None => Ok((rest.to_string(), DEFAULT_BROKER_PORT)),
    }
}

/// Reads a `key=value` properties file into a map. A missing or unreadable
/// file is not fatal for the simulator, so this only warns and returns an
/// empty map in that case.
fn read_properties(path: &Path) -> HashMap<String, String> {
    let mut props = HashMap::new();
    if !path.is_file() {
        return props;
    }

    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!("Could not load {}: {}", path.display(), e);
            return props;
        }
    };

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            props.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    props
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

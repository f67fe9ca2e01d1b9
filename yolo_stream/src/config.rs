use serde::Deserialize;
use std::path::PathBuf;
use yolo_inference::config::{LabelsConfig, ModelConfig, Validatable};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub model: ModelConfig,
    pub labels: LabelsConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    pub storage: StorageConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct CaptureConfig {
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_open_timeout_ms() -> u64 {
    5000
}

fn default_read_timeout_ms() -> u64 {
    5000
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            open_timeout_ms: default_open_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct StorageConfig {
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_max_upload_bytes() -> usize {
    256 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("No current directory: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("YS")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;

    for validation in [config.model.validate(), config.labels.validate()] {
        if let Err(e) = validation {
            tracing::error!("Configuration validation failed: {}", e);
            return Err(config::ConfigError::Message(e));
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert!(matches!(
            LogLevel::try_from("DEBUG".to_string()),
            Ok(LogLevel::Debug)
        ));
        assert!(LogLevel::try_from("trace".to_string()).is_err());
    }

    #[test]
    fn test_environment_parsing() {
        assert_eq!(
            Environment::try_from("Production".to_string()).unwrap().as_str(),
            "production"
        );
        assert!(Environment::try_from("staging".to_string()).is_err());
    }

    #[test]
    fn test_deserialize_from_yaml() {
        let yaml = r#"
server:
  host: 127.0.0.1
  port: 8000
log_level: info
model:
  model_dir: ./models
  onnx_file: yolov8n.onnx
  num_instances: 2
labels:
  labels_dir: ./configuration
  labels_file: labels.txt
storage:
  upload_dir: static/uploads
  output_dir: static/outputs
"#;
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.server.get_address(), "127.0.0.1:8000");
        assert_eq!(config.model.num_instances, 2);
        assert_eq!(config.model.input_size, 640);
        assert_eq!(config.capture.open_timeout_ms, 5000);
        assert_eq!(config.storage.max_upload_bytes, 256 * 1024 * 1024);
    }
}

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_PATH: &str = "config/plum.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upload: UploadConfig,
    pub model: ModelConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    #[serde(skip_serializing)]
    pub jwt_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub max_upload_bytes: usize,
    pub allowed_extensions: Vec<String>,
    pub allowed_mime_types: Vec<String>,
    pub max_image_dimension: u32,
    pub max_batch_images: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub model_dir: PathBuf,
    pub model_file: Option<PathBuf>,
    pub image_size: u32,
    pub confidence_threshold: f32,
    pub max_concurrent_inference: usize,
    pub preload: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    Local { media_root: PathBuf },
    S3 { bucket: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum DatabaseConfig {
    Memory,
    Dynamodb {
        results_table: String,
        batches_table: String,
    },
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upload: UploadConfig::default(),
            model: ModelConfig::default(),
            storage: StorageConfig::default(),
            database: DatabaseConfig::default(),
            jwt_secret: String::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
            allowed_origins: Vec::new(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: 5 * 1024 * 1024,
            allowed_extensions: ["jpg", "jpeg", "png", "webp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            allowed_mime_types: ["image/jpeg", "image/png", "image/webp", "image/gif"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_image_dimension: 8192,
            max_batch_images: 100,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("model"),
            model_file: None,
            image_size: 320,
            confidence_threshold: 0.7,
            max_concurrent_inference: 4,
            preload: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Local {
            media_root: PathBuf::from("media"),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig::Memory
    }
}

impl AppConfig {
    /// Loads the YAML file named by `PLUM_CONFIG` (if present), then applies
    /// environment overrides. Call `dotenv` before this.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var("PLUM_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = if Path::new(&path).exists() {
            log::info!("Loading configuration from {}", path);
            Self::from_file(&path)?
        } else {
            log::info!("No configuration file at {}, using defaults", path);
            Self::default()
        };
        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::from_yaml(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(contents)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.server.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                key: "PORT",
                value: port.clone(),
            })?;
        }
        if let Some(secret) = lookup("JWT_SECRET") {
            self.jwt_secret = secret;
        }
        if let Some(max) = lookup("MAX_UPLOAD_BYTES") {
            self.upload.max_upload_bytes = max.parse().map_err(|_| ConfigError::InvalidValue {
                key: "MAX_UPLOAD_BYTES",
                value: max.clone(),
            })?;
        }
        if let Some(dir) = lookup("MODEL_DIR") {
            self.model.model_dir = PathBuf::from(dir);
        }
        if let Some(file) = lookup("MODEL_PATH") {
            self.model.model_file = Some(PathBuf::from(file));
        }
        if let Some(media_root) = lookup("MEDIA_ROOT") {
            self.storage = StorageConfig::Local {
                media_root: PathBuf::from(media_root),
            };
        }
        if let Some(bucket) = lookup("S3_BUCKET_NAME") {
            self.storage = StorageConfig::S3 { bucket };
        }
        if let Some(results_table) = lookup("DYNAMODB_RESULTS_TABLE") {
            let batches_table = lookup("DYNAMODB_BATCHES_TABLE")
                .ok_or(ConfigError::Missing("DYNAMODB_BATCHES_TABLE"))?;
            self.database = DatabaseConfig::Dynamodb {
                results_table,
                batches_table,
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt_secret.is_empty() {
            return Err(ConfigError::Missing("JWT_SECRET"));
        }
        if !(0.0..=1.0).contains(&self.model.confidence_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "model.confidence_threshold",
                value: self.model.confidence_threshold.to_string(),
            });
        }
        if self.model.image_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "model.image_size",
                value: "0".to_string(),
            });
        }
        if self.model.max_concurrent_inference == 0 {
            return Err(ConfigError::InvalidValue {
                key: "model.max_concurrent_inference",
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_model_contract() {
        let config = AppConfig::default();
        assert_eq!(config.upload.max_upload_bytes, 5 * 1024 * 1024);
        assert_eq!(config.model.image_size, 320);
        assert!((config.model.confidence_threshold - 0.7).abs() < f32::EPSILON);
        assert!(matches!(config.database, DatabaseConfig::Memory));
    }

    #[test]
    fn yaml_sections_are_partial() {
        let yaml = r#"
server:
  port: 9000
model:
  image_size: 256
storage:
  backend: s3
  bucket: plums
database:
  backend: dynamodb
  results_table: results
  batches_table: batches
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.model.image_size, 256);
        assert!((config.model.confidence_threshold - 0.7).abs() < f32::EPSILON);
        assert!(matches!(config.storage, StorageConfig::S3 { ref bucket } if bucket == "plums"));
        assert!(matches!(config.database, DatabaseConfig::Dynamodb { .. }));
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = AppConfig::default();
        config
            .apply_env(lookup_from(&[
                ("PORT", "9090"),
                ("JWT_SECRET", "secret"),
                ("MODEL_PATH", "/models/plum.pt"),
                ("MAX_UPLOAD_BYTES", "1024"),
            ]))
            .unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.jwt_secret, "secret");
        assert_eq!(config.model.model_file, Some(PathBuf::from("/models/plum.pt")));
        assert_eq!(config.upload.max_upload_bytes, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_secret_is_rejected() {
        let config = AppConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("JWT_SECRET"))
        ));
    }

    #[test]
    fn dynamodb_requires_both_tables() {
        let mut config = AppConfig::default();
        let result = config.apply_env(lookup_from(&[("DYNAMODB_RESULTS_TABLE", "results")]));
        assert!(matches!(
            result,
            Err(ConfigError::Missing("DYNAMODB_BATCHES_TABLE"))
        ));
    }

    #[test]
    fn bad_port_is_reported() {
        let mut config = AppConfig::default();
        let result = config.apply_env(lookup_from(&[("PORT", "eighty")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { key: "PORT", .. })));
    }
}

use likeness_core::{ImageKind, ARCFACE_SIGNATURE_DIM, DEFAULT_MATCH_THRESHOLD};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const CONFIG_FILE_ENV: &str = "LIKENESS_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Daemon configuration.
///
/// Built once at startup from defaults, an optional TOML file named by
/// `LIKENESS_CONFIG`, then `LIKENESS_*` environment variables, and passed
/// by value to everything that needs it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Root directory for archived enrollment images.
    pub storage_dir: PathBuf,
    /// Euclidean distance below which a candidate is accepted.
    pub match_threshold: f32,
    /// Signature dimensionality shared by the extractor and the store.
    pub signature_dim: usize,
    /// Image types accepted from callers, as MIME types.
    pub allowed_types: Vec<ImageKind>,
    /// Upper bound on a single request, in seconds.
    pub request_timeout_secs: u64,
    /// Delete a freshly created identity whose first enrollment was rejected.
    pub discard_incomplete: bool,
    /// Serve on the system bus instead of the session bus.
    pub system_bus: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("likeness");

        Self {
            model_dir: likeness_core::default_model_dir(),
            db_path: data_dir.join("likeness.db"),
            storage_dir: data_dir.join("storage"),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            signature_dim: ARCFACE_SIGNATURE_DIM,
            allowed_types: vec![ImageKind::Png, ImageKind::Jpeg],
            request_timeout_secs: 10,
            discard_incomplete: true,
            system_bus: false,
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_FILE_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from `LIKENESS_*` variables resolved through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("LIKENESS_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("LIKENESS_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("LIKENESS_STORAGE_DIR") {
            self.storage_dir = PathBuf::from(v);
        }
        if let Some(v) = env_parse(&lookup, "LIKENESS_MATCH_THRESHOLD")? {
            self.match_threshold = v;
        }
        if let Some(v) = env_parse(&lookup, "LIKENESS_SIGNATURE_DIM")? {
            self.signature_dim = v;
        }
        if let Some(v) = env_parse(&lookup, "LIKENESS_REQUEST_TIMEOUT_SECS")? {
            self.request_timeout_secs = v;
        }
        if let Some(v) = lookup("LIKENESS_DISCARD_INCOMPLETE") {
            self.discard_incomplete = v != "0";
        }
        if let Some(v) = lookup("LIKENESS_SYSTEM_BUS") {
            self.system_bus = v != "0";
        }
        if let Some(v) = lookup("LIKENESS_ALLOWED_TYPES") {
            self.allowed_types = v
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|mime| {
                    ImageKind::from_mime(mime).ok_or_else(|| ConfigError::InvalidValue {
                        key: "LIKENESS_ALLOWED_TYPES",
                        value: mime.to_string(),
                    })
                })
                .collect::<Result<_, _>>()?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.match_threshold.is_finite() && self.match_threshold > 0.0) {
            return Err(ConfigError::InvalidValue {
                key: "match_threshold",
                value: self.match_threshold.to_string(),
            });
        }
        if self.signature_dim == 0 {
            return Err(ConfigError::InvalidValue {
                key: "signature_dim",
                value: "0".into(),
            });
        }
        if self.allowed_types.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "allowed_types",
                value: "[]".into(),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn env_parse<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
    }
}

use anyhow::{Context, Result};
use presence_core::PipelineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// CLI configuration: optional TOML file, then `PRESENCE_*` environment
/// overrides, then built-in defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// ONNX embedding model.
    pub model_path: PathBuf,
    /// SQLite roster database.
    pub db_path: PathBuf,
    /// Engine worker threads analysing frames concurrently.
    pub workers: usize,
    pub pipeline: PipelineConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            model_path: data_dir.join("models/mobilefacenet.onnx"),
            db_path: data_dir.join("roster.db"),
            workers: 2,
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Config {
    /// Load from `path` if given, else from the default config file when it
    /// exists, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let default_path = config_dir().join("presence.toml");
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if default_path.exists() => Self::from_file(&default_path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Override fields from `PRESENCE_*` variables looked up through `var`.
    /// Unparseable values are ignored.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("PRESENCE_MODEL_PATH") {
            self.model_path = PathBuf::from(v);
        }
        if let Some(v) = var("PRESENCE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        self.workers = parsed(&var, "PRESENCE_WORKERS", self.workers);

        let p = &mut self.pipeline;
        p.input_size = parsed(&var, "PRESENCE_INPUT_SIZE", p.input_size);
        p.embedding_len = parsed(&var, "PRESENCE_EMBEDDING_LEN", p.embedding_len);
        p.similarity_threshold =
            parsed(&var, "PRESENCE_SIMILARITY_THRESHOLD", p.similarity_threshold);
        p.enrollment_samples = parsed(&var, "PRESENCE_ENROLLMENT_SAMPLES", p.enrollment_samples);
        p.enrollment_timeout_secs =
            parsed(&var, "PRESENCE_ENROLLMENT_TIMEOUT_SECS", p.enrollment_timeout_secs);
    }

    pub fn model_path_str(&self) -> String {
        self.model_path.to_string_lossy().into_owned()
    }
}

fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn home() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".local/share"))
        .join("presence")
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".config"))
        .join("presence")
}

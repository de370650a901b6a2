//! Configuration management using the prefer crate.
//!
//! `Config` mirrors the config file; `Settings` is the resolved runtime view
//! after file values, command-line flags, and environment overrides.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::repository::DbContext;
use crate::validation::Thresholds;

/// Default database filename.
pub const DEFAULT_DATABASE_FILENAME: &str = "drawmeta.db";

/// Local object storage lives under the data directory.
const STORAGE_SUBDIR: &str = "storage";

/// Textract region when nothing else is configured.
pub const DEFAULT_REGION: &str = "ap-southeast-2";

/// Where drawings, previews, and crops are stored.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageBackend {
    Local(PathBuf),
    S3 {
        bucket: String,
        region: String,
        endpoint: Option<String>,
        prefix: Option<String>,
    },
}

/// Connection settings for the OCR service.
#[derive(Debug, Clone, PartialEq)]
pub struct TextractSettings {
    pub region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub endpoint: Option<String>,
}

impl Default for TextractSettings {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            access_key: None,
            secret_key: None,
            endpoint: None,
        }
    }
}

/// Application settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base data directory.
    pub data_dir: PathBuf,
    pub database_filename: String,
    /// Overrides data_dir/database_filename when set (DATABASE_URL).
    pub database_url: Option<String>,
    pub storage: StorageBackend,
    pub textract: TextractSettings,
    pub thresholds: Thresholds,
    /// Explicit pdftoppm binary; otherwise PATH is searched.
    pub pdftoppm_path: Option<PathBuf>,
    /// Concurrent jobs per worker process.
    pub workers: usize,
    /// Seconds between queue polls in daemon mode.
    pub poll_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        // Documents dir -> Home dir -> Current dir
        let data_dir = dirs::document_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("drawmeta");

        Self::with_data_dir(data_dir)
    }
}

impl Settings {
    /// Default settings rooted at a custom data directory.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            storage: StorageBackend::Local(data_dir.join(STORAGE_SUBDIR)),
            data_dir,
            database_filename: DEFAULT_DATABASE_FILENAME.to_string(),
            database_url: None,
            textract: TextractSettings::default(),
            thresholds: Thresholds::default(),
            pdftoppm_path: None,
            workers: 1,
            poll_interval_secs: 5,
        }
    }

    /// Database URL, built from the data directory unless set explicitly.
    pub fn database_url(&self) -> String {
        if let Some(ref url) = self.database_url {
            url.clone()
        } else {
            format!("sqlite:{}", self.database_path().display())
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_filename)
    }

    /// Whether `init` has been run for this data directory.
    pub fn database_exists(&self) -> bool {
        self.database_url.is_some() || self.database_path().exists()
    }

    /// Create the data directory and the local storage root.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.data_dir).map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to create data directory '{}': {}",
                    self.data_dir.display(),
                    e
                ),
            )
        })?;
        if let StorageBackend::Local(ref root) = self.storage {
            fs::create_dir_all(root).map_err(|e| {
                std::io::Error::new(
                    e.kind(),
                    format!("Failed to create storage directory '{}': {}", root.display(), e),
                )
            })?;
        }
        Ok(())
    }

    pub fn create_db_context(&self) -> DbContext {
        DbContext::from_url(&self.database_url())
    }
}

/// `[storage]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, prefer::FromValue)]
pub struct StorageConfig {
    /// "local" (default) or "s3".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    /// Local storage root; defaults to `<data_dir>/storage`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Key prefix inside the bucket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

impl StorageConfig {
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// `[textract]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, prefer::FromValue)]
pub struct TextractConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_number: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_title: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_revision: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdftoppm_path: Option<String>,
}

impl TextractConfig {
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// `[worker]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, prefer::FromValue)]
pub struct WorkerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_secs: Option<u64>,
}

impl WorkerConfig {
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// Configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, prefer::FromValue)]
pub struct Config {
    /// Data directory path.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "target")]
    pub data_dir: Option<String>,
    /// Database filename.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "StorageConfig::is_default")]
    #[prefer(default)]
    pub storage: StorageConfig,
    #[serde(default, skip_serializing_if = "TextractConfig::is_default")]
    #[prefer(default)]
    pub textract: TextractConfig,
    #[serde(default, skip_serializing_if = "WorkerConfig::is_default")]
    #[prefer(default)]
    pub worker: WorkerConfig,
    /// Path to the config file this was loaded from (not serialized).
    #[serde(skip)]
    #[prefer(skip)]
    pub source_path: Option<PathBuf>,
}

impl Config {
    /// Discover a `drawmeta` config file in the standard locations.
    pub async fn load() -> Self {
        match prefer::load("drawmeta").await {
            Ok(pref_config) => match pref_config.source_path() {
                Some(path) => Self::load_from_path(path).await.unwrap_or_else(|e| {
                    tracing::warn!("{}", e);
                    Self::default()
                }),
                None => Self::default(),
            },
            Err(_) => Self::default(),
        }
    }

    /// Load from a file, choosing the format by extension (JSON by default).
    pub async fn load_from_path(path: &Path) -> Result<Self, String> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");

        let mut config: Config = match ext {
            "toml" => toml::from_str(&contents)
                .map_err(|e| format!("Failed to parse TOML config: {}", e))?,
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .map_err(|e| format!("Failed to parse YAML config: {}", e))?,
            _ => serde_json::from_str(&contents)
                .map_err(|e| format!("Failed to parse JSON config: {}", e))?,
        };

        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Directory of the config file, if loaded from one.
    pub fn base_dir(&self) -> Option<PathBuf> {
        self.source_path
            .as_ref()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
    }

    /// Resolve a possibly relative, possibly `~`-prefixed path against `base_dir`.
    pub fn resolve_path(&self, path_str: &str, base_dir: &Path) -> PathBuf {
        let expanded = shellexpand::tilde(path_str);
        let path = Path::new(expanded.as_ref());

        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    }

    /// Apply file values to settings. Relative paths resolve against `base_dir`.
    pub fn apply_to_settings(&self, settings: &mut Settings, base_dir: &Path) {
        if let Some(ref data_dir) = self.data_dir {
            settings.data_dir = self.resolve_path(data_dir, base_dir);
            settings.storage = StorageBackend::Local(settings.data_dir.join(STORAGE_SUBDIR));
        }
        if let Some(ref database) = self.database {
            settings.database_filename = database.clone();
        }

        let s = &self.storage;
        match s.backend.as_deref() {
            Some("s3") => match s.bucket {
                Some(ref bucket) => {
                    settings.storage = StorageBackend::S3 {
                        bucket: bucket.clone(),
                        region: s
                            .region
                            .clone()
                            .unwrap_or_else(|| DEFAULT_REGION.to_string()),
                        endpoint: s.endpoint.clone(),
                        prefix: s.prefix.clone(),
                    };
                }
                None => tracing::warn!("storage.backend is s3 but no bucket is set; using local"),
            },
            Some("local") | None => {
                if let Some(ref root) = s.root {
                    settings.storage = StorageBackend::Local(self.resolve_path(root, base_dir));
                }
            }
            Some(other) => tracing::warn!("Unknown storage backend '{}'; using local", other),
        }

        let t = &self.textract;
        // Textract shares the bucket region unless configured separately
        if let Some(region) = t.region.clone().or_else(|| s.region.clone()) {
            settings.textract.region = region;
        }
        if let Some(ref key) = t.key {
            settings.textract.access_key = Some(key.clone());
        }
        if let Some(ref secret) = t.secret {
            settings.textract.secret_key = Some(secret.clone());
        }
        if let Some(ref endpoint) = t.endpoint {
            settings.textract.endpoint = Some(endpoint.clone());
        }
        if let Some(v) = t.confidence_number {
            settings.thresholds.number = v;
        }
        if let Some(v) = t.confidence_title {
            settings.thresholds.title = v;
        }
        if let Some(v) = t.confidence_revision {
            settings.thresholds.revision = v;
        }
        if let Some(ref path) = t.pdftoppm_path {
            settings.pdftoppm_path = Some(self.resolve_path(path, base_dir));
        }

        if let Some(workers) = self.worker.workers {
            settings.workers = workers.max(1) as usize;
        }
        if let Some(interval) = self.worker.poll_interval_secs {
            settings.poll_interval_secs = interval.max(1);
        }
    }
}

/// Options for loading settings.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Explicit config file path (overrides auto-discovery).
    pub config_path: Option<PathBuf>,
    /// Resolve relative paths against CWD instead of the config file directory.
    pub use_cwd: bool,
    /// Data directory override (--target).
    pub target: Option<PathBuf>,
}

/// Apply environment overrides. `var` looks a variable up; empty values are
/// ignored.
pub fn apply_env_overrides(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    let var = |name: &str| var(name).filter(|s| !s.is_empty());

    if let Some(url) = var("DATABASE_URL") {
        tracing::debug!("Using DATABASE_URL from environment");
        settings.database_url = Some(url);
    }
    if let Some(region) = var("AWS_REGION") {
        if let StorageBackend::S3 { region: ref mut r, .. } = settings.storage {
            *r = region.clone();
        }
        settings.textract.region = region;
    }
    if let Some(region) = var("TEXTRACT_REGION") {
        settings.textract.region = region;
    }
    if let Some(key) = var("TEXTRACT_KEY") {
        settings.textract.access_key = Some(key);
    }
    if let Some(secret) = var("TEXTRACT_SECRET") {
        settings.textract.secret_key = Some(secret);
    }
    if let Some(path) = var("PDFTOPPM_PATH") {
        settings.pdftoppm_path = Some(PathBuf::from(path));
    }
}

/// Look for a config file inside a data directory.
fn find_config_in_dir(dir: &Path) -> Option<PathBuf> {
    let extensions = ["json", "yaml", "yml", "toml"];
    let basenames = ["drawmeta", "config"];

    for basename in basenames {
        for ext in extensions {
            let path = dir.join(format!("{}.{}", basename, ext));
            if path.exists() {
                return Some(path);
            }
        }
    }
    None
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    }
}

/// Config file by priority: --config, a file inside --target, discovery.
async fn load_file_config(options: &LoadOptions, target: Option<&Path>) -> Config {
    if let Some(ref config_path) = options.config_path {
        return Config::load_from_path(config_path)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("{}", e);
                Config::default()
            });
    }

    if let Some(dir) = target {
        if let Some(config_path) = find_config_in_dir(dir) {
            tracing::debug!("Found config in target dir: {}", config_path.display());
            return Config::load_from_path(&config_path)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!("{}", e);
                    Config::default()
                });
        }
    }

    Config::load().await
}

/// Resolve settings from options, config file, and environment.
pub async fn load_settings_with_options(options: LoadOptions) -> (Settings, Config) {
    let target = options.target.as_deref().map(absolute);
    let config = load_file_config(&options, target.as_deref()).await;

    let mut settings = Settings::default();

    let base_dir = if options.use_cwd {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    } else {
        config
            .base_dir()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    };

    config.apply_to_settings(&mut settings, &base_dir);

    // --target beats the config file's data_dir
    if let Some(dir) = target {
        if let StorageBackend::Local(ref root) = settings.storage {
            if root == &settings.data_dir.join(STORAGE_SUBDIR) {
                settings.storage = StorageBackend::Local(dir.join(STORAGE_SUBDIR));
            }
        }
        settings.data_dir = dir;
    }

    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());

    (settings, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::with_data_dir(PathBuf::from("/data/dm"));
        assert_eq!(settings.database_url(), "sqlite:/data/dm/drawmeta.db");
        assert_eq!(
            settings.storage,
            StorageBackend::Local(PathBuf::from("/data/dm/storage"))
        );
        assert_eq!(settings.textract.region, DEFAULT_REGION);
        assert_eq!(settings.thresholds, Thresholds::default());
        assert_eq!(settings.workers, 1);
    }

    #[tokio::test]
    async fn test_load_toml_and_apply() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("drawmeta.toml");
        std::fs::write(
            &path,
            r#"
data_dir = "./data"

[storage]
backend = "s3"
bucket = "drawings"
region = "us-east-1"
prefix = "prod"

[textract]
confidence_title = 0.55
pdftoppm_path = "bin/pdftoppm"

[worker]
workers = 4
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path).await.unwrap();
        assert_eq!(config.base_dir().as_deref(), Some(dir.path()));

        let mut settings = Settings::with_data_dir(PathBuf::from("/unused"));
        config.apply_to_settings(&mut settings, dir.path());

        assert_eq!(settings.data_dir, dir.path().join("./data"));
        assert_eq!(
            settings.storage,
            StorageBackend::S3 {
                bucket: "drawings".into(),
                region: "us-east-1".into(),
                endpoint: None,
                prefix: Some("prod".into()),
            }
        );
        // falls back to the bucket region
        assert_eq!(settings.textract.region, "us-east-1");
        assert_eq!(settings.thresholds.title, 0.55);
        assert_eq!(settings.thresholds.number, 0.50);
        assert_eq!(
            settings.pdftoppm_path,
            Some(dir.path().join("bin/pdftoppm"))
        );
        assert_eq!(settings.workers, 4);
    }

    #[tokio::test]
    async fn test_load_yaml_and_json() {
        let dir = tempdir().unwrap();

        let yaml = dir.path().join("config.yaml");
        std::fs::write(&yaml, "target: /srv/drawings\ndatabase: other.db\n").unwrap();
        let config = Config::load_from_path(&yaml).await.unwrap();
        assert_eq!(config.data_dir.as_deref(), Some("/srv/drawings"));
        assert_eq!(config.database.as_deref(), Some("other.db"));

        let json = dir.path().join("config.json");
        std::fs::write(&json, r#"{"worker": {"poll_interval_secs": 0}}"#).unwrap();
        let config = Config::load_from_path(&json).await.unwrap();
        let mut settings = Settings::with_data_dir(PathBuf::from("/d"));
        config.apply_to_settings(&mut settings, dir.path());
        assert_eq!(settings.poll_interval_secs, 1);

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "data_dir = [").unwrap();
        assert!(Config::load_from_path(&broken).await.is_err());
    }

    #[test]
    fn test_s3_without_bucket_stays_local() {
        let config = Config {
            storage: StorageConfig {
                backend: Some("s3".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut settings = Settings::with_data_dir(PathBuf::from("/d"));
        config.apply_to_settings(&mut settings, Path::new("/"));
        assert_eq!(settings.storage, StorageBackend::Local(PathBuf::from("/d/storage")));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("DATABASE_URL", "sqlite:/tmp/x.db"),
            ("AWS_REGION", "eu-west-1"),
            ("TEXTRACT_REGION", "us-west-2"),
            ("TEXTRACT_KEY", "AKIA"),
            ("TEXTRACT_SECRET", ""),
            ("PDFTOPPM_PATH", "/opt/bin/pdftoppm"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::with_data_dir(PathBuf::from("/d"));
        settings.storage = StorageBackend::S3 {
            bucket: "b".into(),
            region: "ap-southeast-2".into(),
            endpoint: None,
            prefix: None,
        };
        apply_env_overrides(&mut settings, |k| env.get(k).map(|v| v.to_string()));

        assert_eq!(settings.database_url(), "sqlite:/tmp/x.db");
        assert!(matches!(
            settings.storage,
            StorageBackend::S3 { ref region, .. } if region == "eu-west-1"
        ));
        assert_eq!(settings.textract.region, "us-west-2");
        assert_eq!(settings.textract.access_key.as_deref(), Some("AKIA"));
        assert!(settings.textract.secret_key.is_none());
        assert_eq!(
            settings.pdftoppm_path,
            Some(PathBuf::from("/opt/bin/pdftoppm"))
        );
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempdir().unwrap();
        let settings = Settings::with_data_dir(dir.path().join("nested"));
        settings.ensure_directories().unwrap();
        assert!(dir.path().join("nested/storage").is_dir());
    }
}

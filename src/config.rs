//! Configuration file handling.
//!
//! The configuration file is stored at `$RECONCILE_HOME/config.json` and holds the ledger
//! currency, the merge heuristic's generic descriptions, transaction filters, expenses account
//! rules, the archive settings and the external transform command.

use crate::error::{ErrorType, IntoResult, Res};
use crate::merge::{MergeOptions, DEFAULT_GENERIC_DESCRIPTIONS};
use crate::rules::{AccountRules, Filters};
use crate::store::RunStore;
use crate::{utils, Result};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_NAME: &str = "reconcile";
const CONFIG_VERSION: u8 = 1;
const ARCHIVE_COPIES: u32 = 5;
const DEFAULT_CURRENCY: &str = "CNY";
const DEFAULT_TIMEOUT_SECS: u64 = 300;
const MASKS: &str = ".masks";
const RUNS: &str = ".runs";
const ARCHIVE: &str = ".archive";
const CONFIG_JSON: &str = "config.json";

/// The `Config` object represents the configuration of the app. You instantiate it by providing
/// the path to `$RECONCILE_HOME` and from there it loads `$RECONCILE_HOME/config.json`. It
/// provides the paths of the run directories inside the home directory.
#[derive(Debug, Clone)]
pub struct Config {
    root: PathBuf,
    masks: PathBuf,
    runs: PathBuf,
    archive: PathBuf,
    config_path: PathBuf,
    config_file: ConfigFile,
}

impl Config {
    /// Creates the home directory, its subdirectories and an initial `config.json` with default
    /// settings. An existing `config.json` is left untouched and loaded instead.
    ///
    /// # Errors
    /// - Returns an error if any file operations fail.
    pub async fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::create_inner(dir.into())
            .await
            .pub_result(ErrorType::Config)
    }

    async fn create_inner(maybe_relative: PathBuf) -> Res<Self> {
        utils::make_dir(&maybe_relative)
            .await
            .context("Unable to create the reconcile home directory")?;
        let root = utils::canonicalize(&maybe_relative).await?;

        for sub in [MASKS, RUNS, ARCHIVE] {
            utils::make_dir(&root.join(sub)).await?;
        }

        let config_path = root.join(CONFIG_JSON);
        let config_file = if config_path.is_file() {
            ConfigFile::load(&config_path).await?
        } else {
            let config_file = ConfigFile::default();
            config_file.save(&config_path).await?;
            config_file
        };

        Ok(Self::from_parts(root, config_path, config_file))
    }

    /// This will
    /// - validate that `reconcile_home` exists and that the config file exists
    /// - load the config file
    /// - validate that the run directories exist
    /// - return the loaded configuration object
    pub async fn load(reconcile_home: impl Into<PathBuf>) -> Result<Self> {
        Self::load_inner(reconcile_home.into())
            .await
            .pub_result(ErrorType::Config)
    }

    async fn load_inner(maybe_relative: PathBuf) -> Res<Self> {
        let root = utils::canonicalize(&maybe_relative)
            .await
            .context("The reconcile home is missing, run 'reconcile init' first")?;

        let config_path = root.join(CONFIG_JSON);
        if !config_path.is_file() {
            bail!("The config file is missing '{}'", config_path.display())
        }
        let config_file = ConfigFile::load(&config_path).await?;
        let config = Self::from_parts(root, config_path, config_file);

        for dir in [&config.masks, &config.runs, &config.archive] {
            if !dir.is_dir() {
                bail!("The directory '{}' is missing", dir.display())
            }
        }
        Ok(config)
    }

    fn from_parts(root: PathBuf, config_path: PathBuf, config_file: ConfigFile) -> Self {
        Self {
            masks: root.join(MASKS),
            runs: root.join(RUNS),
            archive: root.join(ARCHIVE),
            root,
            config_path,
            config_file,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Where mask maps of unfinished runs live.
    pub fn masks(&self) -> &Path {
        &self.masks
    }

    /// Where masked and transformed checkpoints of unfinished runs live.
    pub fn runs(&self) -> &Path {
        &self.runs
    }

    pub fn archive(&self) -> &Path {
        &self.archive
    }

    pub fn archive_copies(&self) -> u32 {
        self.config_file.archive_copies
    }

    pub fn currency(&self) -> &str {
        &self.config_file.currency
    }

    pub fn merge_options(&self) -> MergeOptions {
        MergeOptions::new(&self.config_file.generic_descriptions)
    }

    pub fn filters(&self) -> &Filters {
        &self.config_file.filters
    }

    pub fn account_rules(&self) -> &AccountRules {
        &self.config_file.account_rules
    }

    pub fn transform(&self) -> Option<&TransformConfig> {
        self.config_file.transform.as_ref()
    }

    /// How long a transform may run, from the configured command or the default.
    pub fn transform_timeout(&self) -> Duration {
        Duration::from_secs(
            self.transform()
                .map(|t| t.timeout_secs)
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
        )
    }

    /// Creates a new `RunStore` for the files of individual runs.
    pub fn store(&self) -> RunStore {
        RunStore::new(self)
    }
}

/// The external command that transforms masked documents. It reads the document on stdin and
/// writes the result to stdout.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct TransformConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Represents the serialization and deserialization format of the configuration file.
///
/// Example configuration:
/// ```json
/// {
///   "app_name": "reconcile",
///   "config_version": 1,
///   "currency": "CNY",
///   "archive_copies": 5,
///   "generic_descriptions": ["unionpay", "支付宝"],
///   "filters": {
///     "skip_keywords": ["还款"],
///     "amount_ranges": [{ "min": "-0.10", "max": "0" }]
///   },
///   "account_rules": [{ "keywords": ["coffee"], "account": "Expenses:Food:Coffee" }],
///   "transform": { "program": "llm-edit", "args": ["--model", "small"], "timeout_secs": 120 }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
struct ConfigFile {
    /// Application name, should always be "reconcile"
    app_name: String,

    /// Configuration file version
    config_version: u8,

    /// Currency written on ledger postings, three upper-case letters
    #[serde(default = "default_currency")]
    currency: String,

    /// Number of archived mask maps to keep
    #[serde(default = "default_archive_copies")]
    archive_copies: u32,

    /// Lower-case substrings that mark a description as a generic payment processor name
    #[serde(default = "default_generic_descriptions")]
    generic_descriptions: Vec<String>,

    #[serde(default)]
    filters: Filters,

    #[serde(default)]
    account_rules: AccountRules,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    transform: Option<TransformConfig>,
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_archive_copies() -> u32 {
    ARCHIVE_COPIES
}

fn default_generic_descriptions() -> Vec<String> {
    DEFAULT_GENERIC_DESCRIPTIONS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            app_name: APP_NAME.to_string(),
            config_version: CONFIG_VERSION,
            currency: default_currency(),
            archive_copies: ARCHIVE_COPIES,
            generic_descriptions: default_generic_descriptions(),
            filters: Filters::default(),
            account_rules: AccountRules::default(),
            transform: None,
        }
    }
}

/// Amounts are only masked when their currency is a three letter upper-case code.
fn is_currency_code(s: &str) -> bool {
    s.len() == 3 && s.chars().all(|c| c.is_ascii_uppercase())
}

impl ConfigFile {
    /// Loads a ConfigFile asynchronously from the specified path.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    async fn load(path: impl AsRef<Path>) -> Res<Self> {
        let path = path.as_ref();
        let content = utils::read(path).await?;

        let config: ConfigFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file at {}", path.display()))?;

        anyhow::ensure!(
            config.app_name == APP_NAME,
            "Invalid app_name in config file: expected '{}', got '{}'",
            APP_NAME,
            config.app_name
        );
        anyhow::ensure!(
            is_currency_code(&config.currency),
            "Invalid currency in config file: expected three upper-case letters, got '{}'",
            config.currency
        );
        anyhow::ensure!(
            config.archive_copies >= 1,
            "Invalid archive_copies in config file: at least 1 archived map must be kept"
        );

        Ok(config)
    }

    /// Saves the ConfigFile to the specified path.
    async fn save(&self, path: impl AsRef<Path>) -> Res<()> {
        let p = path.as_ref();
        let data = serde_json::to_string_pretty(self).context("Unable to serialize config")?;
        utils::write(p, data)
            .await
            .context("Unable to write config file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_config_create() {
        let dir = TempDir::new().unwrap();
        let home_dir = dir.path().join("reconcile_home");

        let config = Config::create(&home_dir).await.unwrap();

        assert!(config.masks().is_dir());
        assert!(config.runs().is_dir());
        assert!(config.archive().is_dir());
        assert!(config.config_path().is_file());
        assert_eq!(config.currency(), "CNY");
        assert_eq!(config.archive_copies(), 5);
        assert!(config.merge_options().is_generic("UnionPay Merchant"));
        assert!(config.transform().is_none());
        assert_eq!(config.transform_timeout(), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_config_create_then_load() {
        let dir = TempDir::new().unwrap();
        let created = Config::create(dir.path()).await.unwrap();
        let loaded = Config::load(dir.path()).await.unwrap();
        assert_eq!(created.root(), loaded.root());
        assert_eq!(created.config_file, loaded.config_file);
    }

    #[tokio::test]
    async fn test_config_create_keeps_existing_file() {
        let dir = TempDir::new().unwrap();
        let json = r#"{ "app_name": "reconcile", "config_version": 1, "currency": "USD" }"#;
        utils::write(dir.path().join(CONFIG_JSON), json).await.unwrap();
        let config = Config::create(dir.path()).await.unwrap();
        assert_eq!(config.currency(), "USD");
    }

    #[tokio::test]
    async fn test_config_load_missing_home() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(dir.path().join("nope")).await.unwrap_err();
        assert_eq!(err.error_type(), ErrorType::Config);
    }

    #[tokio::test]
    async fn test_config_load_missing_subdirectory() {
        let dir = TempDir::new().unwrap();
        let config = Config::create(dir.path()).await.unwrap();
        tokio::fs::remove_dir(config.archive()).await.unwrap();
        assert!(Config::load(dir.path()).await.is_err());
    }

    #[test]
    fn test_config_file_default() {
        let config = ConfigFile::default();
        assert_eq!(config.app_name, "reconcile");
        assert_eq!(config.archive_copies, 5);
        assert_eq!(config.filters, Filters::default());
        assert!(config.generic_descriptions.contains(&"unionpay".to_string()));
    }

    #[tokio::test]
    async fn test_config_file_load_with_minimal_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        let json = r#"{ "app_name": "reconcile", "config_version": 1 }"#;
        utils::write(&config_path, json).await.unwrap();

        let config = ConfigFile::load(&config_path).await.unwrap();
        assert_eq!(config, ConfigFile::default());
    }

    #[tokio::test]
    async fn test_config_file_load_full() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        let json = r#"{
            "app_name": "reconcile",
            "config_version": 1,
            "currency": "CNY",
            "archive_copies": 2,
            "generic_descriptions": ["gateway"],
            "filters": {
                "skip_keywords": ["还款"],
                "amount_ranges": [{ "min": "-0.10", "max": "0" }]
            },
            "account_rules": [{ "keywords": ["coffee"], "account": "Expenses:Food:Coffee" }],
            "transform": { "program": "cat" }
        }"#;
        utils::write(&config_path, json).await.unwrap();

        let config = ConfigFile::load(&config_path).await.unwrap();
        assert_eq!(config.archive_copies, 2);
        assert_eq!(config.filters.skip_keywords, vec!["还款".to_string()]);
        assert_eq!(config.filters.amount_ranges[0].max, Decimal::ZERO);
        assert_eq!(
            config.account_rules.account_for("Coffee Shop"),
            Some("Expenses:Food:Coffee")
        );
        let transform = config.transform.unwrap();
        assert_eq!(transform.program, "cat");
        assert_eq!(transform.timeout_secs, DEFAULT_TIMEOUT_SECS);
    }

    #[tokio::test]
    async fn test_config_file_load_invalid_app_name() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        let json = r#"{ "app_name": "tiller", "config_version": 1 }"#;
        utils::write(&config_path, json).await.unwrap();

        let result = ConfigFile::load(&config_path).await;
        assert!(result.unwrap_err().to_string().contains("Invalid app_name"));
    }

    #[tokio::test]
    async fn test_config_file_load_invalid_currency() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        for currency in ["USDT", "cny", ""] {
            let json = format!(
                r#"{{ "app_name": "reconcile", "config_version": 1, "currency": "{currency}" }}"#
            );
            utils::write(&config_path, json).await.unwrap();
            let err = ConfigFile::load(&config_path).await.unwrap_err();
            assert!(err.to_string().contains("Invalid currency"), "{currency}");
        }
    }

    #[tokio::test]
    async fn test_config_file_load_zero_archive_copies() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        let json = r#"{ "app_name": "reconcile", "config_version": 1, "archive_copies": 0 }"#;
        utils::write(&config_path, json).await.unwrap();
        let err = ConfigFile::load(&config_path).await.unwrap_err();
        assert!(err.to_string().contains("archive_copies"));
    }

    #[tokio::test]
    async fn test_config_file_save_and_load() {
        let t = TempDir::new().unwrap();
        let path = t.path().join("file.json");
        let original = ConfigFile {
            transform: Some(TransformConfig {
                program: "llm-edit".into(),
                args: vec!["--fast".into()],
                timeout_secs: 10,
            }),
            ..ConfigFile::default()
        };
        original.save(&path).await.unwrap();
        assert_eq!(original, ConfigFile::load(&path).await.unwrap());
    }

    #[test]
    fn test_config_file_serialization_omits_none_transform() {
        let json = serde_json::to_string(&ConfigFile::default()).unwrap();
        assert!(!json.contains("transform"));
    }
}

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const VIGIL_DIR_NAME: &str = ".vigil";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STORE_FILE_NAME: &str = "graph.sqlite";
pub const DEFAULT_GEMINI_API_KEY_ENV: &str = "GEMINI_API_KEY";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_OLLAMA_ENDPOINT: &str = "http://127.0.0.1:11434";
pub const DEFAULT_OLLAMA_MODEL: &str = "qwen2.5-coder:7b-instruct";
pub const MAX_INVESTIGATION_HOPS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InferenceProviderKind {
    #[default]
    Auto,
    Mock,
    Gemini,
    Ollama,
    None,
}

impl InferenceProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Mock => "mock",
            Self::Gemini => "gemini",
            Self::Ollama => "ollama",
            Self::None => "none",
        }
    }
}

impl std::str::FromStr for InferenceProviderKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "auto" => Ok(Self::Auto),
            "mock" => Ok(Self::Mock),
            "gemini" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            "none" => Ok(Self::None),
            other => Err(format!(
                "invalid provider '{other}', expected one of: auto, mock, gemini, ollama, none"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct VigilConfig {
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub baseline: BaselineConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub coupling: CouplingConfig,
    #[serde(default)]
    pub ownership: OwnershipConfig,
    #[serde(default)]
    pub incidents: IncidentsConfig,
    #[serde(default)]
    pub investigation: InvestigationConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default)]
    pub provider: InferenceProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            provider: InferenceProviderKind::Auto,
            model: None,
            endpoint: None,
            api_key_env: default_api_key_env(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineConfig {
    #[serde(default = "default_coupling_threshold")]
    pub coupling_threshold: u32,
    #[serde(default = "default_co_change_threshold")]
    pub co_change_threshold: f64,
    #[serde(default = "default_test_ratio_threshold")]
    pub test_ratio_threshold: f64,
    #[serde(default = "default_signal_timeout_ms")]
    pub signal_timeout_ms: u64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            coupling_threshold: default_coupling_threshold(),
            co_change_threshold: default_co_change_threshold(),
            test_ratio_threshold: default_test_ratio_threshold(),
            signal_timeout_ms: default_signal_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_signal_ttl_secs")]
    pub signal_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            signal_ttl_secs: default_signal_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouplingConfig {
    #[serde(default = "default_window_days")]
    pub window_days: u32,
    #[serde(default = "default_min_frequency")]
    pub min_frequency: f64,
    #[serde(default = "default_bulk_commit_threshold")]
    pub bulk_commit_threshold: usize,
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
}

impl Default for CouplingConfig {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            min_frequency: default_min_frequency(),
            bulk_commit_threshold: default_bulk_commit_threshold(),
            exclude_patterns: default_exclude_patterns(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipConfig {
    #[serde(default = "default_window_days")]
    pub window_days: u32,
    #[serde(default = "default_current_owner_days")]
    pub current_owner_days: u32,
}

impl Default for OwnershipConfig {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            current_owner_days: default_current_owner_days(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentsConfig {
    #[serde(default = "default_commit_message_limit")]
    pub commit_message_limit: usize,
}

impl Default for IncidentsConfig {
    fn default() -> Self {
        Self {
            commit_message_limit: default_commit_message_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvestigationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_budget_ms")]
    pub budget_ms: u64,
}

impl Default for InvestigationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_hops: default_max_hops(),
            call_timeout_ms: default_call_timeout_ms(),
            budget_ms: default_budget_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorConfig {
    #[serde(default = "default_min_uses")]
    pub min_uses: u64,
    #[serde(default = "default_max_fp_rate")]
    pub max_fp_rate: f64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_uses: default_min_uses(),
            max_fp_rate: default_max_fp_rate(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("failed to serialize config TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("invalid config value for {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

pub fn vigil_dir(workspace_root: impl AsRef<Path>) -> PathBuf {
    workspace_root.as_ref().join(VIGIL_DIR_NAME)
}

pub fn config_path(workspace_root: impl AsRef<Path>) -> PathBuf {
    vigil_dir(workspace_root).join(CONFIG_FILE_NAME)
}

pub fn store_path(workspace_root: impl AsRef<Path>) -> PathBuf {
    vigil_dir(workspace_root).join(STORE_FILE_NAME)
}

pub fn load_workspace_config(workspace_root: impl AsRef<Path>) -> Result<VigilConfig, ConfigError> {
    let path = config_path(workspace_root);
    if !path.exists() {
        return Ok(VigilConfig::default());
    }

    let raw = fs::read_to_string(path)?;
    let parsed: VigilConfig = toml::from_str(&raw)?;
    let config = normalize_config(parsed);
    validate_config(&config)?;
    Ok(config)
}

pub fn ensure_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<VigilConfig, ConfigError> {
    let workspace_root = workspace_root.as_ref();
    fs::create_dir_all(vigil_dir(workspace_root))?;

    let path = config_path(workspace_root);
    if path.exists() {
        return load_workspace_config(workspace_root);
    }

    let config = VigilConfig::default();
    let content = toml::to_string_pretty(&config)?;
    fs::write(path, content)?;

    Ok(config)
}

pub fn validate_config(config: &VigilConfig) -> Result<(), ConfigError> {
    if config.investigation.max_hops == 0 || config.investigation.max_hops > MAX_INVESTIGATION_HOPS
    {
        return Err(ConfigError::Invalid {
            field: "investigation.max_hops",
            message: format!(
                "must be between 1 and {MAX_INVESTIGATION_HOPS}, got {}",
                config.investigation.max_hops
            ),
        });
    }
    if !(0.0..=1.0).contains(&config.baseline.co_change_threshold) {
        return Err(ConfigError::Invalid {
            field: "baseline.co_change_threshold",
            message: "must be within [0, 1]".to_owned(),
        });
    }
    if !(0.0..=1.0).contains(&config.baseline.test_ratio_threshold) {
        return Err(ConfigError::Invalid {
            field: "baseline.test_ratio_threshold",
            message: "must be within [0, 1]".to_owned(),
        });
    }
    if !(0.0..=1.0).contains(&config.coupling.min_frequency) {
        return Err(ConfigError::Invalid {
            field: "coupling.min_frequency",
            message: "must be within [0, 1]".to_owned(),
        });
    }
    if !(0.0..=1.0).contains(&config.validator.max_fp_rate) {
        return Err(ConfigError::Invalid {
            field: "validator.max_fp_rate",
            message: "must be within [0, 1]".to_owned(),
        });
    }
    if config.ownership.current_owner_days > config.ownership.window_days {
        return Err(ConfigError::Invalid {
            field: "ownership.current_owner_days",
            message: "must not exceed ownership.window_days".to_owned(),
        });
    }
    Ok(())
}

fn default_api_key_env() -> String {
    DEFAULT_GEMINI_API_KEY_ENV.to_owned()
}

fn default_true() -> bool {
    true
}

fn default_coupling_threshold() -> u32 {
    10
}

fn default_co_change_threshold() -> f64 {
    0.7
}

fn default_test_ratio_threshold() -> f64 {
    0.3
}

fn default_signal_timeout_ms() -> u64 {
    50
}

fn default_signal_ttl_secs() -> u64 {
    900
}

fn default_window_days() -> u32 {
    90
}

fn default_min_frequency() -> f64 {
    0.3
}

fn default_bulk_commit_threshold() -> usize {
    50
}

fn default_exclude_patterns() -> Vec<String> {
    vec!["*.lock".to_owned()]
}

fn default_current_owner_days() -> u32 {
    30
}

fn default_commit_message_limit() -> usize {
    20
}

fn default_max_hops() -> u32 {
    MAX_INVESTIGATION_HOPS
}

fn default_call_timeout_ms() -> u64 {
    2_000
}

fn default_budget_ms() -> u64 {
    8_000
}

fn default_min_uses() -> u64 {
    20
}

fn default_max_fp_rate() -> f64 {
    0.03
}

fn normalize_optional(input: Option<String>) -> Option<String> {
    input
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn normalize_config(mut config: VigilConfig) -> VigilConfig {
    config.inference.model = normalize_optional(config.inference.model.take());
    config.inference.endpoint = normalize_optional(config.inference.endpoint.take());

    let api_key_env = config.inference.api_key_env.trim();
    if api_key_env.is_empty() {
        config.inference.api_key_env = default_api_key_env();
    } else {
        config.inference.api_key_env = api_key_env.to_owned();
    }

    config.coupling.exclude_patterns = config
        .coupling
        .exclude_patterns
        .iter()
        .map(|pattern| pattern.trim().to_owned())
        .filter(|pattern| !pattern.is_empty())
        .collect();

    if config.cache.signal_ttl_secs == 0 {
        config.cache.enabled = false;
    }

    config
}

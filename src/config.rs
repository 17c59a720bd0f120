use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::runner::RunnerConfig;
use crate::signer::SignatureType;

const MIN_CONTENTS_RESERVE: usize = 1024;
const MAX_CONTENTS_RESERVE: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: String },
    #[error("can not read config file")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuiteConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub assets: AssetsConfig,
    #[serde(default)]
    pub signing: SigningConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub viewer: ViewerConfig,
}

impl SuiteConfig {
    /// Reads `path`, applies environment overrides and validates the result.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides, for runs without a config file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Reads `path` without environment overrides.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| ConfigError::ParseFailed {
            reason: e.to_string(),
        })
    }

    pub fn apply_env_overrides(&mut self) {
        override_string(
            &mut self.general.log_level,
            "STAMP_SIGN_SUITE_GENERAL_LOG_LEVEL",
        );
        override_string(
            &mut self.general.log_format,
            "STAMP_SIGN_SUITE_GENERAL_LOG_FORMAT",
        );

        override_string(&mut self.assets.base_dir, "STAMP_SIGN_SUITE_ASSETS_BASE_DIR");
        override_string(&mut self.assets.folder, "STAMP_SIGN_SUITE_ASSETS_FOLDER");
        override_csv(
            &mut self.assets.extensions,
            "STAMP_SIGN_SUITE_ASSETS_EXTENSIONS",
        );
        override_bool(&mut self.assets.recurse, "STAMP_SIGN_SUITE_ASSETS_RECURSE");

        override_string(
            &mut self.signing.document,
            "STAMP_SIGN_SUITE_SIGNING_DOCUMENT",
        );
        override_string(
            &mut self.signing.keystore,
            "STAMP_SIGN_SUITE_SIGNING_KEYSTORE",
        );
        override_string(
            &mut self.signing.passphrase,
            "STAMP_SIGN_SUITE_SIGNING_PASSPHRASE",
        );
        override_signature_type(
            &mut self.signing.signature_type,
            "STAMP_SIGN_SUITE_SIGNING_SIGNATURE_TYPE",
        );
        override_string(&mut self.signing.output, "STAMP_SIGN_SUITE_SIGNING_OUTPUT");
        override_usize(
            &mut self.signing.contents_reserve,
            "STAMP_SIGN_SUITE_SIGNING_CONTENTS_RESERVE",
        );

        override_u64(
            &mut self.timing.show_document_ms,
            "STAMP_SIGN_SUITE_TIMING_SHOW_DOCUMENT_MS",
        );
        override_u64(
            &mut self.timing.show_results_ms,
            "STAMP_SIGN_SUITE_TIMING_SHOW_RESULTS_MS",
        );

        override_string(
            &mut self.viewer.trusted_ca_dir,
            "STAMP_SIGN_SUITE_VIEWER_TRUSTED_CA_DIR",
        );
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        if self.assets.extensions.is_empty() {
            return Err(invalid("assets.extensions", "must not be empty".to_owned()));
        }
        if self.assets.extensions.iter().any(|e| e.is_empty()) {
            return Err(invalid(
                "assets.extensions",
                "extensions must not be empty strings".to_owned(),
            ));
        }

        if self.signing.document.is_empty() {
            return Err(invalid("signing.document", "must not be empty".to_owned()));
        }
        if self.signing.output.is_empty() {
            return Err(invalid("signing.output", "must not be empty".to_owned()));
        }
        if !(MIN_CONTENTS_RESERVE..=MAX_CONTENTS_RESERVE).contains(&self.signing.contents_reserve)
        {
            return Err(invalid(
                "signing.contents_reserve",
                format!("must be between {MIN_CONTENTS_RESERVE} and {MAX_CONTENTS_RESERVE} bytes"),
            ));
        }

        Ok(())
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            show_document_for: Duration::from_millis(self.timing.show_document_ms),
            show_results_for: Duration::from_millis(self.timing.show_results_ms),
        }
    }
}

fn invalid(field: &str, reason: String) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// trace, debug, info, warn or error
    pub log_level: String,
    /// pretty or json
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "pretty".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    /// Root of the asset tree. Stamp paths are relative to it.
    pub base_dir: String,
    /// Folder below `base_dir` holding the stamp images.
    pub folder: String,
    /// Case-insensitive file name suffixes of stamp images.
    pub extensions: Vec<String>,
    pub recurse: bool,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            base_dir: "assets".to_owned(),
            folder: "signature-testimages".to_owned(),
            extensions: vec![".png".to_owned(), ".jpg".to_owned(), ".jpeg".to_owned()],
            recurse: true,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    /// The unsigned sample document, with at least one empty signature field.
    pub document: String,
    /// PKCS #12 key store.
    pub keystore: String,
    pub passphrase: String,
    pub signature_type: SignatureType,
    /// Fixed output path, cleared before every attempt.
    pub output: String,
    /// Bytes reserved for the signature in `/Contents`.
    pub contents_reserve: usize,
}

impl fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningConfig")
            .field("document", &self.document)
            .field("keystore", &self.keystore)
            .field("passphrase", &"***")
            .field("signature_type", &self.signature_type)
            .field("output", &self.output)
            .field("contents_reserve", &self.contents_reserve)
            .finish()
    }
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            document: "assets/Form_example.pdf".to_owned(),
            keystore: "assets/digital-signatures/ExampleSigner.p12".to_owned(),
            passphrase: "test".to_owned(),
            signature_type: SignatureType::default(),
            output: "signedDocument.pdf".to_owned(),
            contents_reserve: 16 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub show_document_ms: u64,
    pub show_results_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            show_document_ms: 1000,
            show_results_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Directory of PEM CA certificates. Empty: only check signature
    /// integrity, accept any signer.
    pub trusted_ca_dir: String,
}

impl ViewerConfig {
    pub fn trusted_ca_dir(&self) -> Option<PathBuf> {
        (!self.trusted_ca_dir.is_empty()).then(|| PathBuf::from(&self.trusted_ca_dir))
    }
}

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<bool>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse bool from env var, ignoring"
            ),
        }
    }
}

fn override_usize(target: &mut usize, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<usize>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse usize from env var, ignoring"
            ),
        }
    }
}

fn override_u64(target: &mut u64, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u64>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u64 from env var, ignoring"
            ),
        }
    }
}

fn override_csv(target: &mut Vec<String>, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val.split(',').map(|s| s.trim().to_owned()).collect();
    }
}

fn override_signature_type(target: &mut SignatureType, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.to_ascii_lowercase().as_str() {
            "cades" => *target = SignatureType::Cades,
            "pkcs7" => *target = SignatureType::Pkcs7,
            _ => warn!(
                env_key,
                value = val.as_str(),
                "unknown signature type in env var, ignoring"
            ),
        }
    }
}

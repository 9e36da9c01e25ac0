//! Process-wide configuration: a TOML document with `${NAME}` environment
//! substitution.
//!
//! Sections mirror the concerns of the engine: `[local_ai]` (provider URLs,
//! model ids, context sizes), `[api]` (endpoint URLs and secrets), `[settings]`
//! (feature flags), `[concurrency]` (fetch limits and cool-downs), `[parsing]`
//! (size and page limits), and `[rate_limits]` (requests-per-minute,
//! operation wait, fallback model). A `.env` file is honoured before
//! substitution, the way the runtime config resolves its database name.
//!
//! Configuration errors are fatal at startup; embedding binaries should map
//! them to [`exit_codes::CONFIG_ERROR`].

use std::path::{Path, PathBuf};

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::settings::Settings;

/// Process exit codes for embedding binaries.
pub mod exit_codes {
    /// Normal shutdown.
    pub const SUCCESS: i32 = 0;
    /// Unrecoverable configuration error.
    pub const CONFIG_ERROR: i32 = 1;
    /// Datastore connection failure at startup.
    pub const DATASTORE_UNAVAILABLE: i32 = 2;
}

/// Errors raised while loading or resolving configuration.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    #[diagnostic(code(delver::config::read))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse TOML config: {source}")]
    #[diagnostic(
        code(delver::config::parse),
        help("Check the section and key names against the documented schema.")
    )]
    Parse { source: toml::de::Error },

    #[error("unresolvable environment reference ${{{name}}}")]
    #[diagnostic(
        code(delver::config::unresolved_env),
        help("Export {name} or add it to the process .env file.")
    )]
    UnresolvedEnv { name: String },

    #[error("missing mandatory key {section}.{key}")]
    #[diagnostic(code(delver::config::missing_key))]
    MissingKey {
        section: &'static str,
        key: &'static str,
    },
}

/// Local model-server endpoints and model ids.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalAiConfig {
    /// `openai` for an OpenAI-compatible server, `ollama` for the native
    /// Ollama chat contract.
    pub provider: String,
    pub base_url: String,
    pub model: String,
    /// Context window; negative means "use provider default".
    pub model_ctx: i64,
    pub reason_model: String,
    /// Context window; negative means "use provider default".
    pub reason_model_ctx: i64,
}

impl Default for LocalAiConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            base_url: "http://127.0.0.1:8080".to_string(),
            model: "qwen2.5-7b-instruct".to_string(),
            model_ctx: -1,
            reason_model: "qwen2.5-32b-instruct".to_string(),
            reason_model_ctx: -1,
        }
    }
}

/// Hosted endpoint URLs and secrets.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Hosted OpenAI-compatible chat-completions base URL.
    pub openai_base_url: String,
    pub openai_api_key: Option<String>,
    /// Metasearch (SearXNG-style) base URL. Mandatory.
    pub searx_base_url: String,
    /// Hosted page-extraction service endpoint. Mandatory when the hosted
    /// parser flag is enabled.
    pub hosted_parser_url: String,
    pub hosted_parser_api_key: Option<String>,
}

/// Feature flags copied into each new session's [`Settings`] snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlagsConfig {
    pub use_hosted_parser: bool,
    pub use_local_llm: bool,
    pub with_planning: bool,
    pub max_iterations: u32,
    pub max_search_items: usize,
    pub default_model: String,
    pub reason_model: String,
}

impl Default for FlagsConfig {
    fn default() -> Self {
        let defaults = Settings::default();
        Self {
            use_hosted_parser: defaults.use_hosted_parser,
            use_local_llm: defaults.use_local_llm,
            with_planning: defaults.with_planning,
            max_iterations: defaults.max_iterations,
            max_search_items: defaults.max_search_items,
            default_model: defaults.default_model,
            reason_model: defaults.reason_model,
        }
    }
}

/// Fetch-concurrency limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Global bound on concurrent page fetches.
    pub concurrent_fetch_limit: usize,
    /// Concurrent fetches allowed per registered domain.
    pub per_domain_limit: usize,
    /// Cool-down between fetch completions against the same domain.
    pub domain_cooldown_ms: u64,
    /// Per-fetch timeout.
    pub fetch_timeout_secs: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            concurrent_fetch_limit: 8,
            per_domain_limit: 1,
            domain_cooldown_ms: 2_000,
            fetch_timeout_secs: 30,
        }
    }
}

/// Page-parsing size and page limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParsingConfig {
    /// Truncation bound for extracted page text; 0 disables truncation.
    pub max_html_length: usize,
    /// Largest PDF that will be downloaded, in bytes.
    pub pdf_max_filesize: u64,
    /// Largest number of PDF pages rendered for text extraction.
    pub pdf_max_pages: usize,
}

impl Default for ParsingConfig {
    fn default() -> Self {
        Self {
            max_html_length: 20_000,
            pdf_max_filesize: 10 * 1024 * 1024,
            pdf_max_pages: 30,
        }
    }
}

/// Rate limiting of language-model calls.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Per-model request pacing, inverted into a minimum inter-request gap.
    pub requests_per_minute: u32,
    /// Upper bound on a single LLM operation, including queue time.
    pub operation_wait_secs: u64,
    /// Ceiling on concurrently outstanding LLM requests.
    pub max_concurrent_requests: usize,
    /// Consecutive failures of one model before switching to the fallback.
    pub failure_threshold: u32,
    /// Model substituted after the failure threshold trips.
    pub fallback_model: Option<String>,
    /// Retry budget per logical LLM operation.
    pub max_retries: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 30,
            operation_wait_secs: 120,
            max_concurrent_requests: 4,
            failure_threshold: 3,
            fallback_model: None,
            max_retries: 3,
        }
    }
}

/// The full configuration document.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub local_ai: LocalAiConfig,
    pub api: ApiConfig,
    pub settings: FlagsConfig,
    pub concurrency: ConcurrencyConfig,
    pub parsing: ParsingConfig,
    pub rate_limits: RateLimitConfig,
}

impl AppConfig {
    /// Load a configuration file, resolving `${NAME}` references against the
    /// environment (after honouring a `.env` file if present).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        dotenvy::dotenv().ok();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    /// Parse a configuration document from a TOML string.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env(raw)?;
        let config: Self =
            toml::from_str(&substituted).map_err(|source| ConfigError::Parse { source })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.api.searx_base_url.trim().is_empty() {
            return Err(ConfigError::MissingKey {
                section: "api",
                key: "searx_base_url",
            });
        }
        if self.settings.use_hosted_parser && self.api.hosted_parser_url.trim().is_empty() {
            return Err(ConfigError::MissingKey {
                section: "api",
                key: "hosted_parser_url",
            });
        }
        if !self.settings.use_local_llm && self.api.openai_base_url.trim().is_empty() {
            return Err(ConfigError::MissingKey {
                section: "api",
                key: "openai_base_url",
            });
        }
        Ok(())
    }

    /// The [`Settings`] snapshot a new session starts from.
    #[must_use]
    pub fn session_settings(&self) -> Settings {
        let (default_model, reason_model) = if self.settings.use_local_llm {
            (self.local_ai.model.clone(), self.local_ai.reason_model.clone())
        } else {
            (
                self.settings.default_model.clone(),
                self.settings.reason_model.clone(),
            )
        };
        Settings {
            max_iterations: self.settings.max_iterations,
            max_search_items: self.settings.max_search_items,
            default_model,
            reason_model,
            default_model_ctx: Settings::context_window(self.local_ai.model_ctx),
            reason_model_ctx: Settings::context_window(self.local_ai.reason_model_ctx),
            use_hosted_parser: self.settings.use_hosted_parser,
            use_local_llm: self.settings.use_local_llm,
            with_planning: self.settings.with_planning,
        }
    }
}

/// Replace every `${NAME}` occurrence with the value of the environment
/// variable `NAME`. Unset references are an error rather than an empty
/// string, so missing secrets surface at startup.
pub fn substitute_env(raw: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let Some(end) = tail.find('}') else {
            // No closing brace; emit the remainder verbatim.
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let name = &tail[..end];
        let value = std::env::var(name).map_err(|_| ConfigError::UnresolvedEnv {
            name: name.to_string(),
        })?;
        out.push_str(&value);
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

//! Per-session configuration snapshot.
//!
//! A [`Settings`] value is frozen into the session at creation time so that
//! resumed runs behave the way the original run was configured, regardless of
//! later changes to the process-wide configuration.

use serde::{Deserialize, Serialize};

/// Snapshot of the knobs a single research session runs under.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Highest iteration number that is allowed to run (inclusive).
    pub max_iterations: u32,
    /// Cap on results taken from the metasearch backend per query.
    pub max_search_items: usize,
    /// Model id used for query generation, usefulness checks, and extraction.
    pub default_model: String,
    /// Model id used for planning, judging, and report writing.
    pub reason_model: String,
    /// Context window for `default_model`; `None` means provider default.
    pub default_model_ctx: Option<u32>,
    /// Context window for `reason_model`; `None` means provider default.
    pub reason_model_ctx: Option<u32>,
    /// Route page acquisition through the hosted extraction service.
    pub use_hosted_parser: bool,
    /// Route LLM calls to the locally hosted model server.
    pub use_local_llm: bool,
    /// Generate an explicit research plan before the first iteration.
    pub with_planning: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            max_search_items: 4,
            default_model: "gpt-4o-mini".to_string(),
            reason_model: "gpt-4o".to_string(),
            default_model_ctx: None,
            reason_model_ctx: None,
            use_hosted_parser: true,
            use_local_llm: false,
            with_planning: true,
        }
    }
}

impl Settings {
    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    #[must_use]
    pub fn with_max_search_items(mut self, max_search_items: usize) -> Self {
        self.max_search_items = max_search_items;
        self
    }

    #[must_use]
    pub fn with_models(mut self, default_model: &str, reason_model: &str) -> Self {
        self.default_model = default_model.to_string();
        self.reason_model = reason_model.to_string();
        self
    }

    #[must_use]
    pub fn with_planning(mut self, with_planning: bool) -> Self {
        self.with_planning = with_planning;
        self
    }

    /// Map a raw configured context size to the typed boundary form.
    ///
    /// Negative values mean "unset": the provider default applies.
    #[must_use]
    pub fn context_window(raw: i64) -> Option<u32> {
        u32::try_from(raw).ok()
    }

    /// Context window for the given model id, if it is one of the two
    /// configured models and has an explicit window.
    #[must_use]
    pub fn context_for(&self, model: &str) -> Option<u32> {
        if model == self.reason_model {
            self.reason_model_ctx
        } else if model == self.default_model {
            self.default_model_ctx
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_context_window_means_unset() {
        assert_eq!(Settings::context_window(-1), None);
        assert_eq!(Settings::context_window(0), Some(0));
        assert_eq!(Settings::context_window(8192), Some(8192));
    }

    #[test]
    fn context_lookup_by_model() {
        let settings = Settings {
            default_model_ctx: Some(4096),
            reason_model_ctx: None,
            ..Settings::default()
        };
        let default_model = settings.default_model.clone();
        assert_eq!(settings.context_for(&default_model), Some(4096));
        assert_eq!(settings.context_for("unknown-model"), None);
    }

    #[test]
    fn builder_round_trip() {
        let settings = Settings::default()
            .with_max_iterations(2)
            .with_max_search_items(3)
            .with_planning(false);
        assert_eq!(settings.max_iterations, 2);
        assert_eq!(settings.max_search_items, 3);
        assert!(!settings.with_planning);
    }
}

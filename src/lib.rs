//! # Delver: Iterative Web-Research Engine
//!
//! Delver drives a checkpointed research loop: given a natural-language
//! query it plans searches, executes them against a metasearch backend,
//! fetches and condenses the returned pages through a language model, judges
//! sufficiency, and repeats until the plan terminates or the iteration bound
//! is hit; it then streams a cited report. Every iteration is checkpointed,
//! so a session can be interrupted, resumed, or rolled back to an earlier
//! iteration.
//!
//! ## Core Concepts
//!
//! - **Session**: The persistent record of one research run, with dense
//!   iteration history and a derived aggregated projection
//! - **Engine**: The `Init → Planning → Iterating(n) → Writing → Done`
//!   state machine, emitting a lazy sequence of output chunks
//! - **Admission**: Per-domain concurrency bounds and cool-downs for fetches
//! - **Governor**: Pacing and concurrency control for LLM traffic with
//!   fallback-model switching
//! - **Store**: SQLite or in-memory persistence with validation digests,
//!   resume, and rollback
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use delver::acquire::PageAcquirer;
//! use delver::admission::{AdmissionConfig, AdmissionController};
//! use delver::config::AppConfig;
//! use delver::governor::{GovernorConfig, RateGovernor};
//! use delver::llm::LlmCapability;
//! use delver::orchestrator::{ResearchEngine, RunRequest};
//! use delver::search::SearxClient;
//! use delver::store::SqliteSessionStore;
//! use delver::stream::StreamAdapter;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load("delver.toml")?;
//! let governor = Arc::new(RateGovernor::new(GovernorConfig::default()));
//!
//! let engine = ResearchEngine::new(
//!     Arc::new(LlmCapability::from_config(&config, Arc::clone(&governor))?),
//!     Arc::new(SearxClient::new(&config.api.searx_base_url)?),
//!     Arc::new(PageAcquirer::from_config(&config, Arc::clone(&governor))?),
//!     Arc::new(AdmissionController::new(AdmissionConfig::default())),
//!     Arc::new(SqliteSessionStore::connect("sqlite://delver.db?mode=rwc").await?),
//! );
//!
//! let handle = engine
//!     .start(
//!         RunRequest {
//!             user_query: "What changed in the EU AI Act final text?".into(),
//!             system_instruction: None,
//!             settings: config.session_settings(),
//!             user_id: None,
//!         },
//!         CancellationToken::new(),
//!     )
//!     .await?;
//!
//! // The first line carries the session id; the stream ends with [DONE].
//! let mut stream = StreamAdapter::new(handle.chunks);
//! while let Some(chunk) = stream.next_chunk().await {
//!     print!("{chunk}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Guide
//!
//! - [`message`] - Conversation messages and the canonical chat projection
//! - [`settings`] - Per-session configuration snapshots
//! - [`session`] - Session records, iteration history, invariants
//! - [`config`] - TOML configuration with `${NAME}` env substitution
//! - [`governor`] - LLM pacing, concurrency ceiling, fallback switching
//! - [`admission`] - Per-domain fetch admission control
//! - [`acquire`] - Page acquisition (hosted parser / local browser, PDF)
//! - [`llm`] - LLM capability over interchangeable providers
//! - [`search`] - Metasearch backend interface
//! - [`store`] - Session persistence, resume, rollback
//! - [`orchestrator`] - The research engine and its chunk protocol
//! - [`stream`] - Streaming protocol adapter
//! - [`prompts`] - Prompt templates and wire-format helpers

pub mod acquire;
pub mod admission;
pub mod config;
pub mod governor;
pub mod llm;
pub mod message;
pub mod orchestrator;
pub mod prompts;
pub mod search;
pub mod session;
pub mod settings;
pub mod store;
pub mod stream;
pub mod telemetry;

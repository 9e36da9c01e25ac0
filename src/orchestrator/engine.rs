//! The research engine: the iteration state machine and its concurrent
//! link-processing fan-out.
//!
//! A run walks `Init → Planning → Iterating(n) → Writing → Done`, with
//! `Failed` reachable from every state. Within an iteration, URL work fans
//! out into a bounded set of tasks gated by the admission controller; their
//! summaries are collected in completion order. The session is checkpointed
//! at every iteration boundary, and cancellation is observed at every
//! suspension point.
//!
//! Failure policy: per-URL fetch and usefulness/extraction failures are
//! absorbed as skips; query-generation, judge, writing-plan, and
//! final-report failures are fatal once the capability's retries are
//! exhausted, as are checkpoint failures.

use std::sync::Arc;

use chrono::Utc;
use miette::Diagnostic;
use rustc_hash::FxHashSet;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::acquire::PageAcquirer;
use crate::admission::AdmissionController;
use crate::llm::{CompletionOptions, LlmCapability, LlmError};
use crate::message::Message;
use crate::prompts::{self, Prompt};
use crate::search::SearchBackend;
use crate::session::{ContextSummary, InvariantViolation, IterationRecord, Session};
use crate::settings::Settings;
use crate::store::{SessionStore, StoreError};

use super::chunks::{ChunkSender, RunChunk};

/// Fatal run errors. Everything here moves the session to `status=error`,
/// except [`EngineError::Cancelled`], which moves it to `interrupted`.
#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error(transparent)]
    #[diagnostic(code(delver::engine::store))]
    Store(#[from] StoreError),

    #[error("{stage} call failed: {source}")]
    #[diagnostic(code(delver::engine::llm))]
    Llm {
        stage: &'static str,
        #[source]
        source: LlmError,
    },

    #[error(transparent)]
    #[diagnostic(code(delver::engine::invariant))]
    Invariant(#[from] InvariantViolation),

    #[error("run cancelled")]
    #[diagnostic(code(delver::engine::cancelled))]
    Cancelled,
}

/// Inputs for a fresh run.
#[derive(Clone, Debug)]
pub struct RunRequest {
    pub user_query: String,
    pub system_instruction: Option<String>,
    pub settings: Settings,
    pub user_id: Option<String>,
}

/// A started run: the session id (known synchronously, before any chunk is
/// consumed) and the chunk sequence.
pub struct RunHandle {
    pub session_id: String,
    pub chunks: flume::Receiver<RunChunk>,
    join: tokio::task::JoinHandle<()>,
}

impl RunHandle {
    /// Wait for the driver task to finish. Chunks not yet drained remain
    /// readable afterwards.
    pub async fn join(self) -> flume::Receiver<RunChunk> {
        let _ = self.join.await;
        self.chunks
    }
}

/// The orchestration engine. All collaborators are injected once at startup
/// and shared across runs.
#[derive(Clone)]
pub struct ResearchEngine {
    llm: Arc<LlmCapability>,
    search: Arc<dyn SearchBackend>,
    acquirer: Arc<PageAcquirer>,
    admission: Arc<AdmissionController>,
    store: Arc<dyn SessionStore>,
}

impl ResearchEngine {
    #[must_use]
    pub fn new(
        llm: Arc<LlmCapability>,
        search: Arc<dyn SearchBackend>,
        acquirer: Arc<PageAcquirer>,
        admission: Arc<AdmissionController>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            llm,
            search,
            acquirer,
            admission,
            store,
        }
    }

    /// Create a fresh session and start its run.
    #[instrument(skip(self, request, cancel), fields(query = %request.user_query))]
    pub async fn start(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<RunHandle, EngineError> {
        let session = Session::new(
            &request.user_query,
            request.system_instruction.as_deref(),
            request.settings,
            request.user_id.as_deref(),
        );
        self.store.save(&session).await?;
        Ok(self.spawn(session, cancel))
    }

    /// Resume an interrupted or running session from its last completed
    /// iteration.
    #[instrument(skip(self, cancel))]
    pub async fn resume(
        &self,
        session_id: &str,
        cancel: CancellationToken,
    ) -> Result<RunHandle, EngineError> {
        let mut session = self.store.resume(session_id).await?;
        session.status = crate::session::SessionStatus::Running;
        session.ended_at = None;
        self.store.save(&session).await?;
        Ok(self.spawn(session, cancel))
    }

    fn spawn(&self, session: Session, cancel: CancellationToken) -> RunHandle {
        let (sender, chunks) = ChunkSender::channel();
        let session_id = session.id.clone();
        let engine = self.clone();
        let join = tokio::spawn(async move {
            engine.drive(session, sender, cancel).await;
        });
        RunHandle {
            session_id,
            chunks,
            join,
        }
    }

    async fn drive(&self, mut session: Session, chunks: ChunkSender, cancel: CancellationToken) {
        let outcome = self.run_session(&mut session, &chunks, &cancel).await;
        match outcome {
            Ok(()) => {
                chunks.emit(RunChunk::Terminal).await;
            }
            Err(EngineError::Cancelled) => {
                session.interrupt();
                if let Err(err) = self.store.save(&session).await {
                    warn!(session = %session.id, error = %err, "failed to persist interrupted session");
                }
                chunks
                    .emit(RunChunk::Status(format!(
                        "session={} status=interrupted iteration={}",
                        session.id, session.aggregated.last_completed_iteration
                    )))
                    .await;
            }
            Err(err) => {
                warn!(session = %session.id, error = %err, "run failed");
                session.fail(err.to_string());
                if let Err(save_err) = self.store.save(&session).await {
                    warn!(session = %session.id, error = %save_err, "failed to persist errored session");
                }
                chunks.emit(RunChunk::Error(err.to_string())).await;
            }
        }
    }

    async fn run_session(
        &self,
        session: &mut Session,
        chunks: &ChunkSender,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        chunks.emit(RunChunk::SessionId(session.id.clone())).await;
        let settings = session.settings.clone();
        let reason_ctx = settings.context_for(&settings.reason_model);
        let fast_ctx = settings.context_for(&settings.default_model);
        let reason_options = CompletionOptions::deterministic(None);
        let fast_options = CompletionOptions::default();

        // Planning: fresh sessions only; resumed sessions carry their plan.
        if session.iterations.is_empty()
            && session.aggregated.last_plan.is_none()
            && settings.with_planning
        {
            chunks.emit(RunChunk::Status("planning".into())).await;
            let plan = self
                .llm_call(
                    "plan",
                    Prompt::PlanInitial {
                        query: &session.user_query,
                    }
                    .render(),
                    &settings.reason_model,
                    reason_ctx,
                    &reason_options,
                    cancel,
                )
                .await?;
            let plan = plan.trim().to_string();
            chunks.emit(RunChunk::Plan(plan.clone())).await;
            session.aggregated.last_plan = Some(plan);
            self.checkpoint(session, cancel).await?;
        }

        // A resumed session whose last iteration was terminal goes straight
        // to writing.
        let mut terminal = session
            .iterations
            .last()
            .is_some_and(|record| record.next_plan.is_none());

        while !terminal {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let completed = session.aggregated.last_completed_iteration;
            if completed >= settings.max_iterations {
                break;
            }
            let number = completed + 1;
            let started_at = Utc::now();
            let plan_consumed = session.aggregated.last_plan.clone();
            chunks
                .emit(RunChunk::Status(format!("iteration {number} started")))
                .await;

            // 1. Candidate queries from the current plan.
            let reply = self
                .llm_call(
                    "queries",
                    Prompt::QueriesFromPlan {
                        query: &session.user_query,
                        plan: plan_consumed.as_deref(),
                        used_queries: &session.aggregated.queries,
                    }
                    .render(),
                    &settings.default_model,
                    fast_ctx,
                    &fast_options,
                    cancel,
                )
                .await?;
            if prompts::is_done(&reply) {
                // The iteration is skipped entirely; nothing is recorded.
                debug!(session = %session.id, "query generation declared done");
                break;
            }
            let mut queries = prompts::parse_bracketed_list(&reply);
            let used: FxHashSet<&str> =
                session.aggregated.queries.iter().map(String::as_str).collect();
            queries.retain(|query| !used.contains(query.as_str()));
            for query in &queries {
                chunks.emit(RunChunk::QueryLine(query.clone())).await;
            }

            // 2. Search, concatenate, dedup by URL preserving first-seen order.
            let targets = self
                .collect_targets(&queries, settings.max_search_items, chunks, cancel)
                .await?;

            // 3. Fan out one task per URL; admission control bounds them.
            let mut tasks: JoinSet<Option<ContextSummary>> = JoinSet::new();
            for (url, query) in targets {
                tasks.spawn(Self::process_url(
                    Arc::clone(&self.llm),
                    Arc::clone(&self.acquirer),
                    Arc::clone(&self.admission),
                    url,
                    query,
                    session.user_query.clone(),
                    settings.clone(),
                    cancel.child_token(),
                ));
            }

            // 4. Collect outcomes in completion order.
            let mut gathered: Vec<ContextSummary> = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Some(summary)) => {
                        chunks.emit(RunChunk::Context(summary.clone())).await;
                        gathered.push(summary);
                    }
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, "url task panicked"),
                }
            }
            if cancel.is_cancelled() {
                // The partial iteration is discarded, not appended.
                return Err(EngineError::Cancelled);
            }

            // 5. Judge sufficiency and produce the next plan.
            let mut judged_contexts = session.aggregated.contexts.clone();
            judged_contexts.extend(gathered.iter().cloned());
            let judge_reply = self
                .llm_call(
                    "judge",
                    Prompt::PlanJudge {
                        query: &session.user_query,
                        contexts: &judged_contexts,
                        prior_plan: plan_consumed.as_deref(),
                    }
                    .render(),
                    &settings.reason_model,
                    reason_ctx,
                    &reason_options,
                    cancel,
                )
                .await?;
            let next_plan = if prompts::is_done(&judge_reply) {
                None
            } else {
                Some(judge_reply.trim().to_string())
            };

            // 6. Finalise the record, update projections, checkpoint.
            let contexts_count = gathered.len();
            session.append_iteration(IterationRecord {
                number,
                started_at,
                ended_at: Some(Utc::now()),
                plan_consumed,
                queries,
                contexts_gathered: gathered,
                next_plan: next_plan.clone(),
            })?;
            session.check_invariants()?;
            self.checkpoint(session, cancel).await?;
            chunks
                .emit(RunChunk::Status(format!(
                    "iteration {number} complete ({contexts_count} contexts)"
                )))
                .await;

            match next_plan {
                Some(plan) => chunks.emit(RunChunk::Plan(plan)).await,
                None => terminal = true,
            }
        }

        self.write_report(session, chunks, cancel).await
    }

    /// Execute every query against the metasearch backend and return the
    /// deduplicated `(url, originating query)` work list. Search failures
    /// are absorbed per query.
    async fn collect_targets(
        &self,
        queries: &[String],
        max_search_items: usize,
        chunks: &ChunkSender,
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, String)>, EngineError> {
        let mut targets: Vec<(String, String)> = Vec::new();
        let mut seen: FxHashSet<String> = FxHashSet::default();
        for query in queries {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match self.search.search(query, max_search_items).await {
                Ok(hits) => {
                    for hit in hits {
                        if seen.insert(hit.url.clone()) {
                            targets.push((hit.url, query.clone()));
                        }
                    }
                }
                Err(err) => {
                    warn!(query = %query, error = %err, "search failed; skipping query");
                    chunks
                        .emit(RunChunk::Status(format!("search failed for {query:?}")))
                        .await;
                }
            }
        }
        Ok(targets)
    }

    /// One URL task: admission, fetch, usefulness check, extraction.
    /// Every failure is absorbed into a skip.
    #[allow(clippy::too_many_arguments)]
    async fn process_url(
        llm: Arc<LlmCapability>,
        acquirer: Arc<PageAcquirer>,
        admission: Arc<AdmissionController>,
        url: String,
        query: String,
        user_query: String,
        settings: Settings,
        cancel: CancellationToken,
    ) -> Option<ContextSummary> {
        let parsed = match Url::parse(&url) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!(url = %url, error = %err, "unparseable url; skipping");
                return None;
            }
        };

        let ticket = tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            admitted = admission.admit(&parsed) => match admitted {
                Ok(ticket) => ticket,
                Err(err) => {
                    debug!(url = %url, error = %err, "admission refused; skipping");
                    return None;
                }
            },
        };

        let page_text = tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            acquired = acquirer.acquire(&parsed) => match acquired {
                Ok(text) => text,
                Err(err) => {
                    debug!(url = %url, error = %err, "fetch failed; skipping");
                    return None;
                }
            },
        };
        // Fetch finished; release the slots before the LLM round-trips.
        drop(ticket);

        if page_text.trim().is_empty() {
            return None;
        }

        let options = CompletionOptions::default();
        let useful_prompt = Prompt::PageUseful { query: &user_query, page_text: &page_text }.render();
        let useful_reply = tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            reply = llm.complete(
                &useful_prompt,
                &settings.default_model,
                settings.context_for(&settings.default_model),
                &options,
            ) => match reply {
                Ok(reply) => reply,
                Err(err) => {
                    debug!(url = %url, error = %err, "usefulness check failed; treating as not useful");
                    return None;
                }
            },
        };
        if !prompts::is_affirmative(&useful_reply) {
            return None;
        }

        let extract_prompt = Prompt::ExtractContext { query: &user_query, page_text: &page_text }.render();
        let summary = tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            reply = llm.complete(
                &extract_prompt,
                &settings.default_model,
                settings.context_for(&settings.default_model),
                &options,
            ) => match reply {
                Ok(reply) => reply,
                Err(err) => {
                    debug!(url = %url, error = %err, "extraction failed; treating as not useful");
                    return None;
                }
            },
        };

        let summary = summary.trim().to_string();
        if summary.is_empty() {
            return None;
        }
        Some(ContextSummary {
            url,
            query,
            summary,
        })
    }

    /// Writing state: writing plan, then the streamed final report.
    async fn write_report(
        &self,
        session: &mut Session,
        chunks: &ChunkSender,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let settings = session.settings.clone();
        let reason_ctx = settings.context_for(&settings.reason_model);
        let reason_options = CompletionOptions::deterministic(None);
        chunks.emit(RunChunk::Status("writing report".into())).await;

        let contexts = session.aggregated.contexts.clone();
        let writing_plan = self
            .llm_call(
                "writing_plan",
                Prompt::WritingPlan {
                    query: &session.user_query,
                    contexts: &contexts,
                }
                .render(),
                &settings.reason_model,
                reason_ctx,
                &reason_options,
                cancel,
            )
            .await?;

        let final_report_prompt = Prompt::FinalReport {
            query: &session.user_query,
            writing_plan: &writing_plan,
            contexts: &contexts,
        }
        .render();
        let mut report_stream = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(EngineError::Cancelled),
            stream = self.llm.stream(
                &final_report_prompt,
                &settings.reason_model,
                reason_ctx,
                &reason_options,
            ) => stream.map_err(|source| EngineError::Llm {
                stage: "final_report",
                source,
            })?,
        };

        let mut report = String::new();
        loop {
            let fragment = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(EngineError::Cancelled),
                fragment = report_stream.next() => fragment,
            };
            match fragment {
                Some(Ok(text)) => {
                    chunks.emit(RunChunk::ReportFragment(text.clone())).await;
                    report.push_str(&text);
                }
                Some(Err(source)) => {
                    return Err(EngineError::Llm {
                        stage: "final_report",
                        source,
                    });
                }
                None => break,
            }
        }

        session.log.push(Message::assistant(&report).timestamped());
        session.complete(report);
        session.check_invariants()?;
        self.checkpoint(session, cancel).await?;
        Ok(())
    }

    async fn llm_call(
        &self,
        stage: &'static str,
        messages: Vec<Message>,
        model: &str,
        ctx: Option<u32>,
        options: &CompletionOptions,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(EngineError::Cancelled),
            result = self.llm.complete(&messages, model, ctx, options) => {
                result.map_err(|source| EngineError::Llm { stage, source })
            }
        }
    }

    async fn checkpoint(
        &self,
        session: &Session,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(EngineError::Cancelled),
            result = self.store.save(session) => result.map_err(EngineError::from),
        }
    }
}

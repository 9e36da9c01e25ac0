//! Session data model: iteration records, the aggregated projection, and the
//! invariants that hold for every persisted session.
//!
//! A [`Session`] is created by the orchestrator, exclusively mutated by the
//! orchestrator during a run, and persisted wholesale by the session store.
//! [`AggregatedState`] is a derived projection of the iteration list; after a
//! rollback it is recomputed with [`AggregatedState::rebuild`] rather than
//! patched, which keeps the record free of cyclic references.

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::message::{Message, MessageLog};
use crate::settings::Settings;

/// Version stamp written into every persisted session record.
///
/// Loading a record with an unrecognised version is refused.
pub const RECORD_VERSION: u32 = 1;

/// Lifecycle status of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Interrupted,
    Error,
}

impl SessionStatus {
    /// Whether a session in this status may be resumed.
    #[must_use]
    pub fn resumable(self) -> bool {
        matches!(self, Self::Running | Self::Interrupted)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "interrupted" => Ok(Self::Interrupted),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// An LLM-produced condensation of one page relative to one query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSummary {
    /// Source page URL.
    pub url: String,
    /// The search query that surfaced the page.
    pub query: String,
    /// Extracted summary text.
    pub summary: String,
}

/// One completed planning-to-judgement cycle of the research loop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-based iteration number, dense and strictly increasing per session.
    pub number: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// The plan this iteration consumed (absent for unplanned first runs).
    pub plan_consumed: Option<String>,
    /// Search queries executed by this iteration, in generation order.
    pub queries: Vec<String>,
    /// Context summaries gathered, in task-completion order.
    pub contexts_gathered: Vec<ContextSummary>,
    /// The plan produced for the next iteration; `None` when terminal.
    pub next_plan: Option<String>,
}

/// Running union across completed iterations.
///
/// This is a derived projection: [`AggregatedState::rebuild`] recomputes it
/// deterministically from an iteration list and is the single source of truth
/// for what the projection contains.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AggregatedState {
    /// Every query ever executed, deduplicated preserving first-seen order.
    pub queries: Vec<String>,
    /// All gathered context summaries, ordered by iteration then completion.
    pub contexts: Vec<ContextSummary>,
    /// Most recent plan (the one guiding the next iteration).
    pub last_plan: Option<String>,
    /// Highest iteration number that has completed; 0 before the first.
    pub last_completed_iteration: u32,
}

impl AggregatedState {
    /// Recompute the projection from scratch.
    #[must_use]
    pub fn rebuild(iterations: &[IterationRecord]) -> Self {
        let mut state = Self::default();
        for record in iterations {
            state.absorb(record);
        }
        state
    }

    /// Fold one completed iteration into the projection.
    pub fn absorb(&mut self, record: &IterationRecord) {
        let mut seen: FxHashSet<&str> = self.queries.iter().map(String::as_str).collect();
        let mut new_queries = Vec::new();
        for query in &record.queries {
            if seen.insert(query.as_str()) {
                new_queries.push(query.clone());
            }
        }
        self.queries.extend(new_queries);
        self.contexts.extend(record.contexts_gathered.iter().cloned());
        if let Some(plan) = &record.next_plan {
            self.last_plan = Some(plan.clone());
        }
        self.last_completed_iteration = record.number;
    }
}

/// Violation of a session-level invariant.
///
/// These indicate a bug in the orchestration engine rather than bad input;
/// a run that trips one is aborted and the session recorded with
/// `status=error`.
#[derive(Debug, Error, Diagnostic)]
pub enum InvariantViolation {
    #[error("iteration numbering not dense: expected {expected}, found {found}")]
    #[diagnostic(code(delver::session::iteration_gap))]
    IterationGap { expected: u32, found: u32 },

    #[error(
        "aggregated last_completed_iteration {aggregated} disagrees with iteration list tail {actual}"
    )]
    #[diagnostic(code(delver::session::aggregate_drift))]
    AggregateDrift { aggregated: u32, actual: u32 },

    #[error("session is completed but has no final report or end time")]
    #[diagnostic(code(delver::session::completed_without_report))]
    CompletedWithoutReport,

    #[error("session is in error status but carries no error message")]
    #[diagnostic(code(delver::session::error_without_message))]
    ErrorWithoutMessage,

    #[error("active session with completed iterations has no last plan")]
    #[diagnostic(code(delver::session::missing_plan))]
    MissingPlan,

    #[error("context summary originates from query {query:?} which is not in the query set")]
    #[diagnostic(code(delver::session::orphan_query))]
    OrphanQuery { query: String },
}

/// The persistent record of one research run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub record_version: u32,
    /// Opaque 128-bit identifier, rendered as a hyphenated UUID.
    pub id: String,
    pub user_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub user_query: String,
    pub system_instruction: Option<String>,
    pub settings: Settings,
    pub log: MessageLog,
    pub iterations: Vec<IterationRecord>,
    pub aggregated: AggregatedState,
    pub final_report: Option<String>,
    pub error_message: Option<String>,
}

impl Session {
    /// Create a fresh running session for the given query.
    #[must_use]
    pub fn new(
        user_query: &str,
        system_instruction: Option<&str>,
        settings: Settings,
        user_id: Option<&str>,
    ) -> Self {
        let mut log = MessageLog::new();
        if let Some(instruction) = system_instruction {
            log.push(Message::system(instruction).timestamped());
        }
        log.push(Message::user(user_query).timestamped());

        Self {
            record_version: RECORD_VERSION,
            id: Uuid::new_v4().to_string(),
            user_id: user_id.map(str::to_string),
            started_at: Utc::now(),
            ended_at: None,
            status: SessionStatus::Running,
            user_query: user_query.to_string(),
            system_instruction: system_instruction.map(str::to_string),
            settings,
            log,
            iterations: Vec::new(),
            aggregated: AggregatedState::default(),
            final_report: None,
            error_message: None,
        }
    }

    /// Append a completed iteration, keeping the aggregated projection in
    /// step. Rejects non-dense numbering.
    pub fn append_iteration(&mut self, record: IterationRecord) -> Result<(), InvariantViolation> {
        let expected = self.aggregated.last_completed_iteration + 1;
        if record.number != expected {
            return Err(InvariantViolation::IterationGap {
                expected,
                found: record.number,
            });
        }
        self.aggregated.absorb(&record);
        self.iterations.push(record);
        Ok(())
    }

    /// Check every session-level invariant; called before each checkpoint.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        for (idx, record) in self.iterations.iter().enumerate() {
            let expected = idx as u32 + 1;
            if record.number != expected {
                return Err(InvariantViolation::IterationGap {
                    expected,
                    found: record.number,
                });
            }
        }

        let actual_tail = self.iterations.last().map_or(0, |r| r.number);
        if self.aggregated.last_completed_iteration != actual_tail {
            return Err(InvariantViolation::AggregateDrift {
                aggregated: self.aggregated.last_completed_iteration,
                actual: actual_tail,
            });
        }

        match self.status {
            SessionStatus::Completed => {
                if self.final_report.is_none() || self.ended_at.is_none() {
                    return Err(InvariantViolation::CompletedWithoutReport);
                }
            }
            SessionStatus::Error => {
                if self.error_message.is_none() {
                    return Err(InvariantViolation::ErrorWithoutMessage);
                }
            }
            SessionStatus::Running | SessionStatus::Interrupted => {
                // Resume needs a plan to continue from, unless nothing has
                // completed yet or the judge already declared the loop done.
                let needs_plan = self
                    .iterations
                    .last()
                    .is_some_and(|record| record.next_plan.is_some());
                if needs_plan && self.aggregated.last_plan.is_none() {
                    return Err(InvariantViolation::MissingPlan);
                }
            }
        }

        let known: FxHashSet<&str> = self.aggregated.queries.iter().map(String::as_str).collect();
        for context in &self.aggregated.contexts {
            if !known.contains(context.query.as_str()) {
                return Err(InvariantViolation::OrphanQuery {
                    query: context.query.clone(),
                });
            }
        }

        Ok(())
    }

    /// Mark the session completed with the given report.
    pub fn complete(&mut self, report: String) {
        self.final_report = Some(report);
        self.status = SessionStatus::Completed;
        self.ended_at = Some(Utc::now());
    }

    /// Mark the session failed with the given message.
    pub fn fail(&mut self, message: String) {
        self.error_message = Some(message);
        self.status = SessionStatus::Error;
        self.ended_at = Some(Utc::now());
    }

    /// Mark the session cooperatively interrupted.
    pub fn interrupt(&mut self) {
        self.status = SessionStatus::Interrupted;
        self.ended_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(number: u32, queries: &[&str], next_plan: Option<&str>) -> IterationRecord {
        IterationRecord {
            number,
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
            plan_consumed: Some("plan".into()),
            queries: queries.iter().map(|q| (*q).to_string()).collect(),
            contexts_gathered: queries
                .iter()
                .map(|q| ContextSummary {
                    url: format!("https://example.org/{q}"),
                    query: (*q).to_string(),
                    summary: format!("summary for {q}"),
                })
                .collect(),
            next_plan: next_plan.map(str::to_string),
        }
    }

    #[test]
    fn append_keeps_projection_in_step() {
        let mut session = Session::new("q", None, Settings::default(), None);
        session
            .append_iteration(record(1, &["alpha", "beta"], Some("next")))
            .unwrap();
        session
            .append_iteration(record(2, &["beta", "gamma"], None))
            .unwrap();

        assert_eq!(session.aggregated.last_completed_iteration, 2);
        assert_eq!(session.aggregated.queries, vec!["alpha", "beta", "gamma"]);
        assert_eq!(session.aggregated.contexts.len(), 4);
        // Terminal iteration leaves the previous plan standing.
        assert_eq!(session.aggregated.last_plan.as_deref(), Some("next"));
        session.check_invariants().unwrap();
    }

    #[test]
    fn append_rejects_gaps() {
        let mut session = Session::new("q", None, Settings::default(), None);
        let err = session
            .append_iteration(record(3, &["a"], None))
            .unwrap_err();
        assert!(matches!(
            err,
            InvariantViolation::IterationGap {
                expected: 1,
                found: 3
            }
        ));
    }

    #[test]
    fn rebuild_matches_incremental_absorption() {
        let records = vec![
            record(1, &["a", "b"], Some("p1")),
            record(2, &["b", "c"], Some("p2")),
            record(3, &["d"], None),
        ];
        let mut incremental = AggregatedState::default();
        for r in &records {
            incremental.absorb(r);
        }
        assert_eq!(AggregatedState::rebuild(&records), incremental);
        assert_eq!(incremental.queries, vec!["a", "b", "c", "d"]);
        assert_eq!(incremental.last_plan.as_deref(), Some("p2"));
        assert_eq!(incremental.last_completed_iteration, 3);
    }

    #[test]
    fn completed_session_requires_report() {
        let mut session = Session::new("q", None, Settings::default(), None);
        session.status = SessionStatus::Completed;
        assert!(matches!(
            session.check_invariants(),
            Err(InvariantViolation::CompletedWithoutReport)
        ));

        session.complete("report".into());
        session.check_invariants().unwrap();
    }

    #[test]
    fn orphan_query_is_detected() {
        let mut session = Session::new("q", None, Settings::default(), None);
        session
            .append_iteration(record(1, &["a"], Some("p")))
            .unwrap();
        session.aggregated.contexts.push(ContextSummary {
            url: "https://example.org/x".into(),
            query: "never-executed".into(),
            summary: "s".into(),
        });
        assert!(matches!(
            session.check_invariants(),
            Err(InvariantViolation::OrphanQuery { .. })
        ));
    }

    #[test]
    fn session_record_round_trips_through_json() {
        let mut session = Session::new("q", Some("be careful"), Settings::default(), Some("u1"));
        session
            .append_iteration(record(1, &["a"], Some("p")))
            .unwrap();
        let json = serde_json::to_string(&session).expect("serialize");
        let parsed: Session = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(session, parsed);
    }
}

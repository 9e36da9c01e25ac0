//! Prompt library: parameterised templates with explicit variable slots.
//!
//! Each template is pure text; [`Prompt::render`] is the only way to obtain
//! messages from it. The query-generation template asks for a bracketed JSON
//! list and the judge templates may answer with the [`DONE_SENTINEL`], both
//! of which have parsing helpers here so the wire conventions stay in one
//! module.

use crate::message::Message;
use crate::session::ContextSummary;

/// Sentinel a model emits to terminate the research loop.
pub const DONE_SENTINEL: &str = "<done>";

/// A parameterised prompt with its bindings.
#[derive(Clone, Debug)]
pub enum Prompt<'a> {
    /// Produce the initial research plan for a query.
    PlanInitial { query: &'a str },
    /// Judge sufficiency and produce the next plan, or the done sentinel.
    PlanJudge {
        query: &'a str,
        contexts: &'a [ContextSummary],
        prior_plan: Option<&'a str>,
    },
    /// Derive new search queries from the current plan.
    QueriesFromPlan {
        query: &'a str,
        plan: Option<&'a str>,
        used_queries: &'a [String],
    },
    /// Yes/no: is this page useful for the query?
    PageUseful { query: &'a str, page_text: &'a str },
    /// Extract the query-relevant context from a useful page.
    ExtractContext { query: &'a str, page_text: &'a str },
    /// Produce a writing plan from the aggregated contexts.
    WritingPlan {
        query: &'a str,
        contexts: &'a [ContextSummary],
    },
    /// Produce the final cited report.
    FinalReport {
        query: &'a str,
        writing_plan: &'a str,
        contexts: &'a [ContextSummary],
    },
}

impl Prompt<'_> {
    /// Stable template name, used in logs and error messages.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::PlanInitial { .. } => "plan_initial",
            Self::PlanJudge { .. } => "plan_judge",
            Self::QueriesFromPlan { .. } => "queries_from_plan",
            Self::PageUseful { .. } => "page_useful",
            Self::ExtractContext { .. } => "extract_context",
            Self::WritingPlan { .. } => "writing_plan",
            Self::FinalReport { .. } => "final_report",
        }
    }

    /// Render the template with its bindings into chat messages.
    #[must_use]
    pub fn render(&self) -> Vec<Message> {
        match self {
            Self::PlanInitial { query } => vec![
                Message::system(
                    "You are a research planner. Produce a short, concrete plan of the angles \
                     to investigate for the user's question. Plain text, no preamble.",
                ),
                Message::user(&format!("Question: {query}\n\nWrite the research plan.")),
            ],
            Self::PlanJudge {
                query,
                contexts,
                prior_plan,
            } => vec![
                Message::system(&format!(
                    "You are a research judge. Given the evidence gathered so far, decide \
                     whether it suffices to answer the question. If it does, reply with \
                     exactly {DONE_SENTINEL}. Otherwise write a revised plan for the next \
                     round of searching. Plain text, no preamble.",
                )),
                Message::user(&format!(
                    "Question: {query}\n\nPrior plan:\n{}\n\nEvidence gathered:\n{}",
                    prior_plan.unwrap_or("(none)"),
                    render_contexts(contexts),
                )),
            ],
            Self::QueriesFromPlan {
                query,
                plan,
                used_queries,
            } => vec![
                Message::system(&format!(
                    "You generate web search queries. Reply with a JSON list of up to four \
                     short queries, like [\"first query\", \"second query\"]. Do not repeat \
                     queries that were already used. If no further searching is needed, \
                     reply with exactly {DONE_SENTINEL}.",
                )),
                Message::user(&format!(
                    "Question: {query}\n\nCurrent plan:\n{}\n\nAlready used queries:\n{}",
                    plan.unwrap_or("(none; derive queries from the question itself)"),
                    if used_queries.is_empty() {
                        "(none)".to_string()
                    } else {
                        used_queries.join("\n")
                    },
                )),
            ],
            Self::PageUseful { query, page_text } => vec![
                Message::system(
                    "Decide whether the page below contains information useful for answering \
                     the question. Reply with exactly Yes or No.",
                ),
                Message::user(&format!("Question: {query}\n\nPage:\n{page_text}")),
            ],
            Self::ExtractContext { query, page_text } => vec![
                Message::system(
                    "Extract the passages of the page relevant to the question and condense \
                     them into a faithful summary. Keep figures, dates, and names exact. \
                     Plain text, no preamble.",
                ),
                Message::user(&format!("Question: {query}\n\nPage:\n{page_text}")),
            ],
            Self::WritingPlan { query, contexts } => vec![
                Message::system(
                    "You are planning a research report. From the evidence below, outline the \
                     report: section headings with one line each about what the section will \
                     cover. Plain text, no preamble.",
                ),
                Message::user(&format!(
                    "Question: {query}\n\nEvidence:\n{}",
                    render_contexts(contexts),
                )),
            ],
            Self::FinalReport {
                query,
                writing_plan,
                contexts,
            } => vec![
                Message::system(
                    "Write the final research report following the outline. Cite sources \
                     inline by URL. If the evidence is empty, state plainly that no evidence \
                     could be retrieved. Markdown.",
                ),
                Message::user(&format!(
                    "Question: {query}\n\nOutline:\n{writing_plan}\n\nEvidence:\n{}",
                    render_contexts(contexts),
                )),
            ],
        }
    }
}

fn render_contexts(contexts: &[ContextSummary]) -> String {
    if contexts.is_empty() {
        return "(no evidence gathered)".to_string();
    }
    let mut out = String::new();
    for (idx, context) in contexts.iter().enumerate() {
        out.push_str(&format!(
            "[{n}] {url} (query: {query})\n{summary}\n\n",
            n = idx + 1,
            url = context.url,
            query = context.query,
            summary = context.summary,
        ));
    }
    out
}

/// Whether a model reply is the loop-termination sentinel.
#[must_use]
pub fn is_done(raw: &str) -> bool {
    raw.trim().eq_ignore_ascii_case(DONE_SENTINEL)
}

/// Whether a model reply is an affirmative yes.
#[must_use]
pub fn is_affirmative(raw: &str) -> bool {
    let head = raw.trim().trim_start_matches(['"', '\'', '*', '`']);
    head.get(..3).is_some_and(|s| s.eq_ignore_ascii_case("yes"))
}

/// Parse a bracketed query list out of a model reply.
///
/// Accepts a strict JSON list anywhere in the reply; falls back to line
/// splitting for models that ignore the format instruction. Blank entries
/// are dropped.
#[must_use]
pub fn parse_bracketed_list(raw: &str) -> Vec<String> {
    if let (Some(start), Some(end)) = (raw.find('['), raw.rfind(']')) {
        if start < end {
            if let Ok(items) = serde_json::from_str::<Vec<String>>(&raw[start..=end]) {
                return items
                    .into_iter()
                    .map(|q| q.trim().to_string())
                    .filter(|q| !q.is_empty())
                    .collect();
            }
        }
    }
    raw.lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(['-', '*', '"', '\''])
                .trim_end_matches(['"', '\'', ','])
                .trim()
        })
        .filter(|line| !line.is_empty() && !line.starts_with('[') && !line.ends_with(']'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_template_renders_system_then_user() {
        let contexts = vec![ContextSummary {
            url: "https://example.org/a".into(),
            query: "q1".into(),
            summary: "s1".into(),
        }];
        let used = vec!["q1".to_string()];
        let prompts = [
            Prompt::PlanInitial { query: "q" },
            Prompt::PlanJudge {
                query: "q",
                contexts: &contexts,
                prior_plan: Some("p"),
            },
            Prompt::QueriesFromPlan {
                query: "q",
                plan: Some("p"),
                used_queries: &used,
            },
            Prompt::PageUseful {
                query: "q",
                page_text: "text",
            },
            Prompt::ExtractContext {
                query: "q",
                page_text: "text",
            },
            Prompt::WritingPlan {
                query: "q",
                contexts: &contexts,
            },
            Prompt::FinalReport {
                query: "q",
                writing_plan: "outline",
                contexts: &contexts,
            },
        ];
        for prompt in prompts {
            let messages = prompt.render();
            assert_eq!(messages.len(), 2, "template {}", prompt.name());
            assert_eq!(messages[0].role, Message::SYSTEM);
            assert_eq!(messages[1].role, Message::USER);
        }
    }

    #[test]
    fn done_sentinel_detection() {
        assert!(is_done("<done>"));
        assert!(is_done("  <DONE>  "));
        assert!(!is_done("done"));
        assert!(!is_done("<done> but also..."));
    }

    #[test]
    fn affirmative_detection() {
        assert!(is_affirmative("Yes"));
        assert!(is_affirmative("yes, it covers the topic"));
        assert!(is_affirmative("\"Yes\""));
        assert!(!is_affirmative("No"));
        assert!(!is_affirmative("maybe"));
    }

    #[test]
    fn parses_strict_json_list() {
        let queries = parse_bracketed_list(r#"Here you go: ["rust async", "tokio select"]"#);
        assert_eq!(queries, vec!["rust async", "tokio select"]);
    }

    #[test]
    fn falls_back_to_line_splitting() {
        let queries = parse_bracketed_list("- rust async\n- tokio select\n");
        assert_eq!(queries, vec!["rust async", "tokio select"]);
    }

    proptest::proptest! {
        #[test]
        fn json_lists_always_round_trip(queries in proptest::collection::vec("[a-z0-9]{1,16}", 1..6)) {
            let raw = serde_json::to_string(&queries).unwrap();
            proptest::prop_assert_eq!(parse_bracketed_list(&raw), queries);
        }
    }

    #[test]
    fn judge_prompt_mentions_sentinel() {
        let messages = Prompt::PlanJudge {
            query: "q",
            contexts: &[],
            prior_plan: None,
        }
        .render();
        assert!(messages[0].content.contains(DONE_SENTINEL));
        assert!(messages[1].content.contains("(no evidence gathered)"));
    }
}

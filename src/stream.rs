//! Streaming protocol adapter: run chunks to text.
//!
//! Converts the orchestrator's chunk sequence into flushable text chunks.
//! The very first emitted line for a newly created session carries the
//! session id in the well-known prefix form [`SESSION_ID_PREFIX`], so a
//! client can record the id before the run ends. The stream terminates with
//! [`STREAM_END_SENTINEL`] on success; an error line replaces the sentinel
//! on failure.

use futures_util::Stream;

use crate::orchestrator::RunChunk;

/// Prefix of the first line of every newly streamed session.
pub const SESSION_ID_PREFIX: &str = "session-id: ";

/// Sentinel marking successful end-of-stream.
pub const STREAM_END_SENTINEL: &str = "[DONE]";

/// Adapter draining a run's chunk sequence into text chunks, one per flush.
pub struct StreamAdapter {
    rx: flume::Receiver<RunChunk>,
    finished: bool,
}

impl StreamAdapter {
    #[must_use]
    pub fn new(rx: flume::Receiver<RunChunk>) -> Self {
        Self {
            rx,
            finished: false,
        }
    }

    /// Render one chunk in the line protocol.
    #[must_use]
    pub fn render(chunk: &RunChunk) -> String {
        match chunk {
            RunChunk::SessionId(id) => format!("{SESSION_ID_PREFIX}{id}\n"),
            RunChunk::Status(line) => format!("status: {line}\n"),
            RunChunk::Plan(plan) => format!("plan:\n{plan}\n"),
            RunChunk::QueryLine(query) => format!("query: {query}\n"),
            RunChunk::Context(context) => format!(
                "context <{url}> ({query}):\n{summary}\n",
                url = context.url,
                query = context.query,
                summary = context.summary,
            ),
            RunChunk::ReportFragment(fragment) => fragment.clone(),
            RunChunk::Terminal => format!("{STREAM_END_SENTINEL}\n"),
            RunChunk::Error(message) => format!("error: {message}\n"),
        }
    }

    /// Next text chunk, or `None` once the stream has ended. Terminal and
    /// error chunks are final: everything after them is ignored.
    pub async fn next_chunk(&mut self) -> Option<String> {
        if self.finished {
            return None;
        }
        match self.rx.recv_async().await {
            Ok(chunk) => {
                if matches!(chunk, RunChunk::Terminal | RunChunk::Error(_)) {
                    self.finished = true;
                }
                Some(Self::render(&chunk))
            }
            Err(_) => {
                self.finished = true;
                None
            }
        }
    }

    /// Drain the remainder of the stream into one string. Useful for the
    /// non-streaming response shape.
    pub async fn collect(mut self) -> String {
        let mut out = String::new();
        while let Some(chunk) = self.next_chunk().await {
            out.push_str(&chunk);
        }
        out
    }

    /// Adapt into a `futures` stream of text chunks.
    pub fn into_stream(self) -> impl Stream<Item = String> {
        futures_util::stream::unfold(self, |mut adapter| async move {
            adapter.next_chunk().await.map(|chunk| (chunk, adapter))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::ChunkSender;
    use crate::session::ContextSummary;

    #[tokio::test]
    async fn session_id_line_comes_first_with_prefix() {
        let (tx, rx) = ChunkSender::channel();
        tx.emit(RunChunk::SessionId("abc-123".into())).await;
        tx.emit(RunChunk::Terminal).await;
        drop(tx);

        let mut adapter = StreamAdapter::new(rx);
        let first = adapter.next_chunk().await.unwrap();
        assert_eq!(first, "session-id: abc-123\n");
        assert!(first.starts_with(SESSION_ID_PREFIX));
    }

    #[tokio::test]
    async fn terminal_sentinel_ends_the_stream() {
        let (tx, rx) = ChunkSender::channel();
        tx.emit(RunChunk::SessionId("s".into())).await;
        tx.emit(RunChunk::ReportFragment("partial ".into())).await;
        tx.emit(RunChunk::ReportFragment("report".into())).await;
        tx.emit(RunChunk::Terminal).await;
        tx.emit(RunChunk::Status("ignored".into())).await;
        drop(tx);

        let collected = StreamAdapter::new(rx).collect().await;
        assert!(collected.ends_with("[DONE]\n"));
        assert!(collected.contains("partial report"));
        assert!(!collected.contains("ignored"));
    }

    #[tokio::test]
    async fn error_chunk_replaces_the_sentinel() {
        let (tx, rx) = ChunkSender::channel();
        tx.emit(RunChunk::SessionId("s".into())).await;
        tx.emit(RunChunk::Error("judge call failed".into())).await;
        drop(tx);

        let collected = StreamAdapter::new(rx).collect().await;
        assert!(collected.ends_with("error: judge call failed\n"));
        assert!(!collected.contains(STREAM_END_SENTINEL));
    }

    #[tokio::test]
    async fn context_chunks_carry_source_and_query() {
        let chunk = RunChunk::Context(ContextSummary {
            url: "https://a.test/p".into(),
            query: "q1".into(),
            summary: "summary text".into(),
        });
        let rendered = StreamAdapter::render(&chunk);
        assert!(rendered.contains("https://a.test/p"));
        assert!(rendered.contains("(q1)"));
        assert!(rendered.contains("summary text"));
    }
}

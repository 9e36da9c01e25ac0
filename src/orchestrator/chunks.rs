//! Run output chunks.
//!
//! A run is exposed as a lazy, finite sequence of [`RunChunk`] values over a
//! bounded channel: one producer (the driver task), one consumer (usually
//! the protocol adapter). The terminal marker is emitted exactly once at the
//! end of a successful run; on failure an error chunk replaces it.

use crate::session::ContextSummary;

/// Capacity of the chunk channel between driver and consumer.
pub const CHUNK_BUFFER: usize = 64;

/// One element of a run's output sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunChunk {
    /// Always the first chunk of a run; carries the session id.
    SessionId(String),
    /// Progress narration.
    Status(String),
    /// A research plan (initial or judge-produced).
    Plan(String),
    /// One search query about to be executed.
    QueryLine(String),
    /// One gathered context summary.
    Context(ContextSummary),
    /// A fragment of the final report.
    ReportFragment(String),
    /// Successful end of the sequence.
    Terminal,
    /// Failed end of the sequence.
    Error(String),
}

/// Producer half of the chunk channel.
#[derive(Clone)]
pub struct ChunkSender {
    tx: flume::Sender<RunChunk>,
}

impl ChunkSender {
    /// Create a bounded chunk channel.
    #[must_use]
    pub fn channel() -> (Self, flume::Receiver<RunChunk>) {
        let (tx, rx) = flume::bounded(CHUNK_BUFFER);
        (Self { tx }, rx)
    }

    /// Emit a chunk, waiting for channel capacity. A dropped consumer is not
    /// an error; the run continues for the benefit of the checkpoint trail.
    pub async fn emit(&self, chunk: RunChunk) {
        if self.tx.send_async(chunk).await.is_err() {
            tracing::debug!("run chunk consumer dropped; continuing without stream");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitted_chunks_arrive_in_order() {
        let (tx, rx) = ChunkSender::channel();
        tx.emit(RunChunk::SessionId("s".into())).await;
        tx.emit(RunChunk::Status("working".into())).await;
        tx.emit(RunChunk::Terminal).await;
        drop(tx);

        let collected: Vec<RunChunk> = rx.into_iter().collect();
        assert_eq!(
            collected,
            vec![
                RunChunk::SessionId("s".into()),
                RunChunk::Status("working".into()),
                RunChunk::Terminal,
            ]
        );
    }

    #[tokio::test]
    async fn emit_survives_dropped_consumer() {
        let (tx, rx) = ChunkSender::channel();
        drop(rx);
        tx.emit(RunChunk::Terminal).await;
    }
}

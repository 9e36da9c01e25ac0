//! Research orchestration: the iteration state machine, its chunked output
//! protocol, and the run lifecycle.

pub mod chunks;
pub mod engine;

pub use chunks::{CHUNK_BUFFER, ChunkSender, RunChunk};
pub use engine::{EngineError, ResearchEngine, RunHandle, RunRequest};

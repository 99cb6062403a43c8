//! Stream Assembly
//!
//! Builds complete assistant messages out of incremental chunk events.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        StreamAssembler                            │
//! │                                                                   │
//! │   Chunk ──▶ FingerprintSet ──▶ ReasoningScanner ──▶ StreamContext │
//! │             (dedup window)     (split <think>)      visible text  │
//! │                                                     reasoning     │
//! │                                                         │         │
//! │                         RenderSink.update ◀─────────────┤         │
//! │                                                         ▼         │
//! │                                              finalize (once)      │
//! │                                     PersistenceSink.save / link   │
//! │                                     RenderSink.rekey              │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Idempotent chunks**: replays within the dedup window change nothing
//! - **Tag-spanning reasoning**: delimiters split across chunks are recognized
//! - **Single active context**: a new request finalizes the previous one first
//! - **Exactly-once finalization**: concurrent finalizers share one outcome

pub mod assembler;
pub mod context;
pub mod dedup;
pub mod scanner;

pub use assembler::{AssemblerError, Chunk, ChunkOutcome, DropReason, StreamAssembler};
pub use context::{ContextSnapshot, RetiredRequests, StreamContext, StreamPhase};
pub use dedup::{DedupVerdict, Fingerprint, FingerprintSet};
pub use scanner::{ReasoningScanner, ScanOutput};

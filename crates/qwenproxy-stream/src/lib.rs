pub mod chunk;
pub mod error_recovery;
pub mod reshape;
pub mod state_machine;

pub use chunk::{ChunkKind, ParsedChunk, parse_line};
pub use error_recovery::{RecoveryStrategy, StreamErrorKind, strategy_for};
pub use reshape::reshape_completion_response;
pub use state_machine::{StreamEngine, StreamState, StreamingState};

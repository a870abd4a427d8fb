use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use crate::chunk::{ChunkKind, ParsedChunk, parse_line};
use crate::error_recovery::{RecoveryStrategy, StreamErrorKind, strategy_for};
use crate::reshape::{DONE_FRAME, reshape_data_chunk, sse_frame, synthetic_content_chunk};

const STUTTER_FORCE_FLUSH: Duration = Duration::from_secs(10);
const DEDUP_WINDOW: Duration = Duration::from_secs(30);
const DEDUP_EVICT_AFTER: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_ERRORS: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingState {
    Initial,
    Stuttering,
    NormalFlow,
    Recovering,
    Terminating,
}

/// Per-request mutable record tracked by the state machine. Internal
/// bookkeeping (dedup map, buffer age, last metadata template) lives
/// alongside it in `StreamEngine`.
#[derive(Debug, Clone)]
pub struct StreamState {
    pub current: StreamingState,
    pub buffer: String,
    pub chunk_count: u64,
    pub error_count: u32,
    pub last_valid_chunk_time: Option<Instant>,
    pub start_time: Instant,
    pub last_chunk_content: Option<String>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            current: StreamingState::Initial,
            buffer: String::new(),
            chunk_count: 0,
            error_count: 0,
            last_valid_chunk_time: None,
            start_time: Instant::now(),
            last_chunk_content: None,
        }
    }
}

/// Drives the five-state suppression/forwarding FSM for one streaming
/// request. Strictly per-request: owns its state without sharing, spawns no
/// background work, and is safe to drop mid-stream on cancellation.
pub struct StreamEngine {
    state: StreamState,
    buffer_since: Option<Instant>,
    last_metadata: Option<Value>,
    dedup: HashMap<String, Instant>,
    max_errors: u32,
}

impl Default for StreamEngine {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ERRORS)
    }
}

impl StreamEngine {
    pub fn new(max_errors: u32) -> Self {
        Self {
            state: StreamState::new(),
            buffer_since: None,
            last_metadata: None,
            dedup: HashMap::new(),
            max_errors,
        }
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    pub fn is_terminating(&self) -> bool {
        self.state.current == StreamingState::Terminating
    }

    /// Client disconnected: cease reads, perform no further writes.
    pub fn cancel(&mut self) {
        self.state.current = StreamingState::Terminating;
    }

    /// Called by the upstream-read loop after a `NetworkTimeout` retry
    /// succeeds, so the next valid chunk is forwarded via the `Recovering`
    /// row rather than re-entering stutter detection mid-retry.
    pub fn begin_recovery(&mut self) {
        if self.state.current != StreamingState::Terminating {
            self.state.current = StreamingState::Recovering;
        }
    }

    /// Records a transport-level error (one that never produced a line to
    /// parse) and applies the error-recovery policy for it.
    pub fn record_transport_error(&mut self, kind: StreamErrorKind) -> Vec<String> {
        self.apply_error(kind)
    }

    /// Feeds one raw upstream line and returns the SSE frames (zero, one, or
    /// two) to write to the client.
    pub fn feed_line(&mut self, raw_line: &str) -> Vec<String> {
        if self.is_terminating() {
            return vec![];
        }
        let chunk = parse_line(raw_line);
        self.process(chunk)
    }

    fn process(&mut self, chunk: ParsedChunk) -> Vec<String> {
        self.state.chunk_count += 1;

        match chunk.kind {
            ChunkKind::Empty => vec![],
            ChunkKind::Unknown => {
                // Valid but not a content/event line (e.g. an SSE comment).
                // InvalidChunk's strategy is Continue: pass it through as-is
                // without perturbing the state machine.
                self.state.last_valid_chunk_time = Some(Instant::now());
                vec![chunk.content.clone()]
            }
            ChunkKind::Malformed => self.apply_error(StreamErrorKind::MalformedJson),
            ChunkKind::Done => self.process_done(),
            ChunkKind::Data => {
                self.state.last_valid_chunk_time = Some(Instant::now());
                self.last_metadata = chunk.metadata.clone();
                match self.state.current {
                    StreamingState::Initial => self.process_initial_data(chunk),
                    StreamingState::Stuttering => self.process_stuttering_data(chunk),
                    StreamingState::NormalFlow => self.process_normal_flow_data(chunk),
                    StreamingState::Recovering => self.process_recovering_data(chunk),
                    StreamingState::Terminating => vec![],
                }
            }
        }
    }

    fn process_done(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        if self.state.current == StreamingState::Stuttering && !self.state.buffer.is_empty() {
            frames.extend(self.flush_buffer_frame());
        }
        self.state.current = StreamingState::Terminating;
        frames.push(DONE_FRAME.to_string());
        frames
    }

    fn process_initial_data(&mut self, chunk: ParsedChunk) -> Vec<String> {
        if chunk.has_content {
            let content = chunk.content_text.unwrap_or_default();
            self.open_buffer(content);
            self.state.current = StreamingState::Stuttering;
            vec![]
        } else {
            self.state.current = StreamingState::NormalFlow;
            vec![self.forward_reshaped(&chunk)]
        }
    }

    fn process_stuttering_data(&mut self, chunk: ParsedChunk) -> Vec<String> {
        if self.buffer_expired() {
            let mut frames: Vec<String> = self.flush_buffer_frame().into_iter().collect();
            self.state.current = StreamingState::NormalFlow;
            frames.extend(self.process_normal_flow_data(chunk));
            return frames;
        }

        if !chunk.has_content {
            return vec![self.forward_reshaped(&chunk)];
        }

        let content = chunk.content_text.clone().unwrap_or_default();
        if prefix_extends(&self.state.buffer, &content) {
            self.state.buffer = content;
            self.buffer_since = Some(Instant::now());
            vec![]
        } else {
            let mut frames: Vec<String> = self.flush_buffer_frame().into_iter().collect();
            self.state.current = StreamingState::NormalFlow;
            self.state.last_chunk_content = Some(content);
            self.register_dedup_signature(&chunk);
            frames.push(self.forward_reshaped(&chunk));
            frames
        }
    }

    fn process_normal_flow_data(&mut self, chunk: ParsedChunk) -> Vec<String> {
        if !chunk.has_content {
            return vec![self.forward_reshaped(&chunk)];
        }

        let content = chunk.content_text.clone().unwrap_or_default();
        if self.state.last_chunk_content.as_deref() == Some(content.as_str()) {
            // Immediate repeat: absorb into a fresh stutter buffer rather
            // than forwarding the duplicate.
            self.open_buffer(content);
            self.state.current = StreamingState::Stuttering;
            return vec![];
        }

        if self.dedup_hit(&chunk) {
            debug!(chunk_count = self.state.chunk_count, "dropping exact-duplicate chunk");
            return vec![];
        }

        self.register_dedup_signature(&chunk);
        self.state.last_chunk_content = Some(content);
        vec![self.forward_reshaped(&chunk)]
    }

    fn process_recovering_data(&mut self, chunk: ParsedChunk) -> Vec<String> {
        self.state.current = StreamingState::NormalFlow;
        if chunk.has_content {
            self.state.last_chunk_content = chunk.content_text.clone();
        }
        vec![self.forward_reshaped(&chunk)]
    }

    fn apply_error(&mut self, kind: StreamErrorKind) -> Vec<String> {
        self.state.error_count += 1;
        let mut frames = Vec::new();
        let should_terminate = match strategy_for(kind) {
            RecoveryStrategy::Skip | RecoveryStrategy::Continue => false,
            RecoveryStrategy::Retry { .. } => self.state.error_count > 3,
            RecoveryStrategy::Terminate => true,
        };
        if should_terminate || self.state.error_count >= self.max_errors {
            if self.state.current == StreamingState::Stuttering && !self.state.buffer.is_empty() {
                frames.extend(self.flush_buffer_frame());
            }
            self.state.current = StreamingState::Terminating;
            frames.push(DONE_FRAME.to_string());
        }
        frames
    }

    fn open_buffer(&mut self, content: String) {
        self.state.buffer = content;
        self.buffer_since = Some(Instant::now());
    }

    fn buffer_expired(&self) -> bool {
        self.buffer_since
            .is_some_and(|since| since.elapsed() >= STUTTER_FORCE_FLUSH)
    }

    /// Flushes the stutter buffer, if it holds content not already delivered
    /// to the client. A buffer opened by the `NormalFlow -> Stuttering`
    /// duplicate-absorb path (`process_normal_flow_data`) starts out equal
    /// to `last_chunk_content`; if nothing extended it since, flushing it
    /// would re-emit a chunk already forwarded, so it is dropped instead.
    fn flush_buffer_frame(&mut self) -> Option<String> {
        let content = std::mem::take(&mut self.state.buffer);
        self.buffer_since = None;
        if self.state.last_chunk_content.as_deref() == Some(content.as_str()) {
            debug!(chunk_count = self.state.chunk_count, "dropping already-delivered buffer on flush");
            return None;
        }
        let payload = synthetic_content_chunk(self.last_metadata.as_ref(), &content);
        self.state.last_chunk_content = Some(content);
        Some(sse_frame(&payload))
    }

    fn forward_reshaped(&self, chunk: &ParsedChunk) -> String {
        let metadata = chunk.metadata.as_ref().expect("Data chunk always carries metadata");
        sse_frame(&reshape_data_chunk(metadata))
    }

    fn dedup_signature(chunk: &ParsedChunk) -> String {
        let content = chunk.content_text.as_deref().unwrap_or_default();
        match &chunk.message_id {
            Some(id) => format!("{content}\u{0}{id}"),
            None => content.to_string(),
        }
    }

    fn dedup_hit(&mut self, chunk: &ParsedChunk) -> bool {
        self.evict_stale_signatures();
        let signature = Self::dedup_signature(chunk);
        self.dedup
            .get(&signature)
            .is_some_and(|seen_at| seen_at.elapsed() < DEDUP_WINDOW)
    }

    fn register_dedup_signature(&mut self, chunk: &ParsedChunk) {
        let signature = Self::dedup_signature(chunk);
        self.dedup.insert(signature, Instant::now());
    }

    fn evict_stale_signatures(&mut self) {
        self.dedup.retain(|_, seen_at| seen_at.elapsed() < DEDUP_EVICT_AFTER);
    }
}

/// Stutter continues iff one of `buffer` and `current` is a plain-string
/// prefix of the other, in either direction.
fn prefix_extends(buffer: &str, current: &str) -> bool {
    buffer.starts_with(current) || current.starts_with(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_line(id: &str, content: &str) -> String {
        format!(r#"data: {{"id":"{id}","choices":[{{"delta":{{"content":"{content}"}}}}]}}"#)
    }

    #[test]
    fn stutter_collapses_overlapping_prefixes() {
        let mut engine = StreamEngine::default();
        assert!(engine.feed_line(&data_line("1", "Hel")).is_empty());
        assert!(engine.feed_line(&data_line("1", "Hello")).is_empty());
        assert!(engine.feed_line(&data_line("1", "Hello, world")).is_empty());
        let frames = engine.feed_line("data: [DONE]");
        assert_eq!(frames.len(), 2);
        assert!(frames[0].contains("Hello, world"));
        assert!(!frames[0].contains("\"Hel\""));
        assert!(frames[1].contains("[DONE]"));
    }

    #[test]
    fn non_extending_content_flushes_and_forwards() {
        let mut engine = StreamEngine::default();
        assert!(engine.feed_line(&data_line("1", "Hello")).is_empty());
        let frames = engine.feed_line(&data_line("1", "Goodbye"));
        assert_eq!(frames.len(), 2);
        assert!(frames[0].contains("Hello"));
        assert!(frames[1].contains("Goodbye"));
        assert_eq!(engine.state().current, StreamingState::NormalFlow);
    }

    #[test]
    fn exact_duplicate_in_normal_flow_is_absorbed() {
        let mut engine = StreamEngine::default();
        // Enter NormalFlow via a content-less chunk first.
        let role_only = r#"data: {"id":"1","choices":[{"delta":{"role":"assistant"}}]}"#;
        engine.feed_line(role_only);
        assert_eq!(engine.state().current, StreamingState::NormalFlow);

        let frames = engine.feed_line(&data_line("1", "same"));
        assert_eq!(frames.len(), 1);
        assert_eq!(engine.state().current, StreamingState::NormalFlow);

        let frames = engine.feed_line(&data_line("1", "same"));
        assert!(frames.is_empty());
        assert_eq!(engine.state().current, StreamingState::Stuttering);

        // The absorbed duplicate must not resurface when the buffer is later
        // flushed: only [DONE], never a second "same" frame.
        let frames = engine.feed_line("data: [DONE]");
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("[DONE]"));
    }

    #[test]
    fn duplicate_absorbed_then_flushed_by_non_extending_chunk_is_not_reemitted() {
        let mut engine = StreamEngine::default();
        let role_only = r#"data: {"id":"1","choices":[{"delta":{"role":"assistant"}}]}"#;
        engine.feed_line(role_only);
        engine.feed_line(&data_line("1", "Hello"));
        assert!(engine.feed_line(&data_line("1", "Hello")).is_empty());
        assert_eq!(engine.state().current, StreamingState::Stuttering);

        let frames = engine.feed_line(&data_line("1", "Goodbye"));
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("Goodbye"));
        assert!(!frames[0].contains("Hello"));
    }

    #[test]
    fn malformed_chunk_is_skipped_and_counted() {
        let mut engine = StreamEngine::default();
        let frames = engine.feed_line("data: {not json}");
        assert!(frames.is_empty());
        assert_eq!(engine.state().error_count, 1);
        assert_eq!(engine.state().current, StreamingState::Initial);
    }

    #[test]
    fn too_many_errors_terminates_the_stream() {
        let mut engine = StreamEngine::new(2);
        engine.feed_line("data: {bad}");
        let frames = engine.feed_line("data: {also bad}");
        assert!(engine.is_terminating());
        assert!(frames.last().unwrap().contains("[DONE]"));
    }

    #[test]
    fn unknown_lines_pass_through_without_state_change() {
        let mut engine = StreamEngine::default();
        let frames = engine.feed_line(": keep-alive");
        assert_eq!(frames, vec![": keep-alive".to_string()]);
        assert_eq!(engine.state().current, StreamingState::Initial);
    }

    #[test]
    fn cancellation_stops_further_emission() {
        let mut engine = StreamEngine::default();
        engine.cancel();
        assert!(engine.feed_line(&data_line("1", "anything")).is_empty());
    }
}

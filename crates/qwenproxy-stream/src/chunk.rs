const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Data,
    Done,
    Malformed,
    Empty,
    Unknown,
}

/// One parsed upstream SSE line. Pure and allocation-light: one value per
/// input line, no blocking, no logging above debug severity.
#[derive(Debug, Clone)]
pub struct ParsedChunk {
    pub kind: ChunkKind,
    pub raw_line: String,
    pub content: String,
    pub is_valid: bool,
    pub has_content: bool,
    pub content_text: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub error: Option<String>,
    pub message_id: Option<String>,
}

impl ParsedChunk {
    fn base(kind: ChunkKind, raw_line: &str, content: String, is_valid: bool) -> Self {
        Self {
            kind,
            raw_line: raw_line.to_string(),
            content,
            is_valid,
            has_content: false,
            content_text: None,
            metadata: None,
            error: None,
            message_id: None,
        }
    }
}

/// Classifies and parses one LF-terminated upstream line.
pub fn parse_line(raw_line: &str) -> ParsedChunk {
    let trimmed = raw_line.trim_end_matches(['\n', '\r']);

    if trimmed.trim().is_empty() {
        return ParsedChunk::base(ChunkKind::Empty, raw_line, String::new(), false);
    }

    let Some(payload) = trimmed.strip_prefix(DATA_PREFIX) else {
        return ParsedChunk::base(ChunkKind::Unknown, raw_line, trimmed.to_string(), true);
    };

    if payload == DONE_SENTINEL {
        return ParsedChunk::base(ChunkKind::Done, raw_line, payload.to_string(), true);
    }

    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(value) => {
            let mut chunk = ParsedChunk::base(ChunkKind::Data, raw_line, payload.to_string(), true);
            let content_text = value
                .get("choices")
                .and_then(|choices| choices.get(0))
                .and_then(|choice| choice.get("delta"))
                .and_then(|delta| delta.get("content"))
                .and_then(|content| content.as_str())
                .map(|s| s.to_string());
            chunk.has_content = content_text.is_some();
            chunk.content_text = content_text;
            chunk.message_id = value.get("id").and_then(|id| id.as_str()).map(str::to_string);
            chunk.metadata = Some(value);
            chunk
        }
        Err(err) => {
            let mut chunk = ParsedChunk::base(ChunkKind::Malformed, raw_line, payload.to_string(), false);
            chunk.error = Some(err.to_string());
            chunk
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_line_is_empty_and_invalid() {
        let chunk = parse_line("\n");
        assert_eq!(chunk.kind, ChunkKind::Empty);
        assert!(!chunk.is_valid);
    }

    #[test]
    fn non_data_line_passes_through_as_unknown() {
        let chunk = parse_line(": keep-alive\n");
        assert_eq!(chunk.kind, ChunkKind::Unknown);
        assert!(chunk.is_valid);
        assert_eq!(chunk.content, ": keep-alive");
    }

    #[test]
    fn done_sentinel_is_recognized() {
        let chunk = parse_line("data: [DONE]\n");
        assert_eq!(chunk.kind, ChunkKind::Done);
        assert!(chunk.is_valid);
    }

    #[test]
    fn malformed_json_is_flagged_with_error() {
        let chunk = parse_line("data: {not json}\n");
        assert_eq!(chunk.kind, ChunkKind::Malformed);
        assert!(!chunk.is_valid);
        assert!(chunk.error.is_some());
    }

    #[test]
    fn data_chunk_extracts_delta_content() {
        let chunk = parse_line(r#"data: {"id":"1","choices":[{"delta":{"content":"Hi"}}]}"#);
        assert_eq!(chunk.kind, ChunkKind::Data);
        assert!(chunk.has_content);
        assert_eq!(chunk.content_text.as_deref(), Some("Hi"));
        assert_eq!(chunk.message_id.as_deref(), Some("1"));
    }

    #[test]
    fn data_chunk_without_content_has_has_content_false() {
        let chunk = parse_line(r#"data: {"id":"1","choices":[{"delta":{"role":"assistant"}}]}"#);
        assert_eq!(chunk.kind, ChunkKind::Data);
        assert!(!chunk.has_content);
        assert!(chunk.content_text.is_none());
    }
}

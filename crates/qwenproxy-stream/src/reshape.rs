use serde_json::{Value, json};

const DEFAULT_MODEL: &str = "qwen3-coder-plus";

/// Rebuilds an upstream `Data` chunk's decoded JSON into the OpenAI
/// `chat.completion.chunk` shape. `delta` is forwarded as-is except that
/// `tool_calls` entries are normalized to always carry `type` and `index`.
pub fn reshape_data_chunk(metadata: &Value) -> Value {
    let id = metadata.get("id").cloned().unwrap_or(Value::Null);
    let created = metadata.get("created").cloned().unwrap_or(Value::Null);
    let model = metadata
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_MODEL);

    let choice = metadata
        .get("choices")
        .and_then(|choices| choices.get(0))
        .cloned()
        .unwrap_or_else(|| json!({}));

    let mut delta = choice.get("delta").cloned().unwrap_or_else(|| json!({}));
    normalize_tool_calls(&mut delta);

    let finish_reason = choice.get("finish_reason").cloned().unwrap_or(Value::Null);

    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
        "usage": Value::Null,
    })
}

/// Builds a synthetic Data-shaped chunk carrying plain text content, used
/// when the state machine force-flushes a stutter buffer or emits an
/// absorbed duplicate. `template` is the most recent upstream metadata seen,
/// so `id`/`created`/`model` stay consistent with the surrounding stream.
pub fn synthetic_content_chunk(template: Option<&Value>, content: &str) -> Value {
    let id = template.and_then(|v| v.get("id")).cloned().unwrap_or(Value::Null);
    let created = template.and_then(|v| v.get("created")).cloned().unwrap_or(Value::Null);
    let model = template
        .and_then(|v| v.get("model"))
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_MODEL);

    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": { "content": content },
            "finish_reason": Value::Null,
        }],
        "usage": Value::Null,
    })
}

/// Reshapes a non-streaming upstream chat-completion response into the
/// OpenAI `chat.completion` shape, normalizing each choice's tool calls the
/// same way streaming deltas are normalized.
pub fn reshape_completion_response(upstream: &Value) -> Value {
    let id = upstream.get("id").cloned().unwrap_or(Value::Null);
    let created = upstream.get("created").cloned().unwrap_or(Value::Null);
    let model = upstream
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_MODEL);
    let usage = upstream.get("usage").cloned().unwrap_or(Value::Null);

    let choices = upstream
        .get("choices")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let choices: Vec<Value> = choices
        .into_iter()
        .enumerate()
        .map(|(index, choice)| {
            let index = choice.get("index").cloned().unwrap_or(json!(index));
            let mut message = choice.get("message").cloned().unwrap_or_else(|| json!({}));
            normalize_tool_calls(&mut message);
            let finish_reason = choice.get("finish_reason").cloned().unwrap_or(Value::Null);
            json!({
                "index": index,
                "message": message,
                "finish_reason": finish_reason,
            })
        })
        .collect();

    json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": choices,
        "usage": usage,
    })
}

pub fn normalize_tool_calls(delta: &mut Value) {
    let Some(tool_calls) = delta.get_mut("tool_calls").and_then(Value::as_array_mut) else {
        return;
    };
    for (index, entry) in tool_calls.iter_mut().enumerate() {
        let Some(obj) = entry.as_object_mut() else {
            continue;
        };
        obj.entry("type").or_insert_with(|| json!("function"));
        obj.insert("index".to_string(), json!(index));
    }
}

pub fn sse_frame(payload: &Value) -> String {
    format!("data: {}\n\n", payload)
}

pub const DONE_FRAME: &str = "data: [DONE]\n\n";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reshape_defaults_model_when_absent() {
        let upstream = json!({"id": "1", "created": 100, "choices": [{"delta": {"content": "hi"}}]});
        let reshaped = reshape_data_chunk(&upstream);
        assert_eq!(reshaped["model"], json!(DEFAULT_MODEL));
        assert_eq!(reshaped["object"], json!("chat.completion.chunk"));
        assert_eq!(reshaped["usage"], Value::Null);
    }

    #[test]
    fn tool_call_entries_get_type_and_index() {
        let upstream = json!({
            "id": "1",
            "choices": [{"delta": {"tool_calls": [{"function": {"name": "f"}}, {"function": {"name": "g"}}]}}]
        });
        let reshaped = reshape_data_chunk(&upstream);
        let calls = reshaped["choices"][0]["delta"]["tool_calls"].as_array().unwrap();
        assert_eq!(calls[0]["type"], json!("function"));
        assert_eq!(calls[0]["index"], json!(0));
        assert_eq!(calls[1]["index"], json!(1));
    }

    #[test]
    fn non_streaming_response_carries_object_and_choices() {
        let upstream = json!({
            "id": "cmpl-1",
            "created": 100,
            "model": "qwen3-coder-plus",
            "choices": [{"message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
            "usage": {"total_tokens": 3},
        });
        let reshaped = reshape_completion_response(&upstream);
        assert_eq!(reshaped["object"], json!("chat.completion"));
        assert_eq!(reshaped["choices"][0]["index"], json!(0));
        assert_eq!(reshaped["choices"][0]["message"]["content"], json!("hi"));
        assert_eq!(reshaped["usage"]["total_tokens"], json!(3));
    }

    #[test]
    fn existing_tool_call_type_is_preserved() {
        let upstream = json!({
            "choices": [{"delta": {"tool_calls": [{"type": "custom", "function": {"name": "f"}}]}}]
        });
        let reshaped = reshape_data_chunk(&upstream);
        assert_eq!(reshaped["choices"][0]["delta"]["tool_calls"][0]["type"], json!("custom"));
    }
}

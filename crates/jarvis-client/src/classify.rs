//! Mapping of frame payloads to [`StreamEvent`]s.
//!
//! A parsed object runs through two independent rule tables: [`FIELD_RULES`]
//! (field presence, in table order, every matching rule fires) and then
//! [`TYPE_RULES`] (keyed by the object's string `type` field). Both tables can
//! fire for the same object; upstream payloads of both shapes exist.
//!
//! Field presence follows JavaScript truthiness: `null`, `false`, `0` and the
//! empty string count as absent.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::errors::StreamFailure;
use crate::stream::{DoneEvent, StreamEvent, TOTAL_SCOPE};

type Object = Map<String, Value>;

/// Rule fired when any of `keys` is truthy. `emit` receives the first truthy
/// value and the whole object.
pub struct FieldRule {
    pub keys: &'static [&'static str],
    emit: fn(&Value, &Object) -> Vec<StreamEvent>,
}

/// Rule fired when the object's `type` equals one of `types`.
pub struct TypeRule {
    pub types: &'static [&'static str],
    emit: fn(&Object) -> Vec<StreamEvent>,
}

pub static FIELD_RULES: &[FieldRule] = &[
    FieldRule {
        keys: &["interrim_response"],
        emit: |v, obj| {
            vec![StreamEvent::InterimResponse {
                text: text_of(v),
                data: Value::Object(obj.clone()),
            }]
        },
    },
    FieldRule {
        keys: &["interrim_thoughts"],
        emit: |v, obj| {
            vec![StreamEvent::InterimThoughts {
                thoughts: v.clone(),
                data: Value::Object(obj.clone()),
            }]
        },
    },
    FieldRule {
        keys: &["tool_calls"],
        emit: |v, obj| {
            let Some(calls) = v.as_array() else {
                return Vec::new();
            };
            let mut events = Vec::with_capacity(calls.len() + 1);
            events.push(StreamEvent::ToolCalls {
                calls: calls.clone(),
                data: Value::Object(obj.clone()),
            });
            events.extend(
                calls
                    .iter()
                    .map(|call| StreamEvent::ToolCall { call: call.clone() }),
            );
            events
        },
    },
    FieldRule {
        keys: &["mcp_tool_calls"],
        emit: |v, obj| match v.as_array() {
            Some(calls) => vec![StreamEvent::ExternalToolCalls {
                calls: calls.clone(),
                data: Value::Object(obj.clone()),
            }],
            None => Vec::new(),
        },
    },
    FieldRule {
        keys: &["thoughts"],
        emit: |v, obj| {
            vec![StreamEvent::FinalThoughts {
                thoughts: v.clone(),
                data: Value::Object(obj.clone()),
            }]
        },
    },
    FieldRule {
        keys: &["response"],
        emit: |v, obj| {
            vec![StreamEvent::FinalResponse {
                text: text_of(v),
                data: Value::Object(obj.clone()),
            }]
        },
    },
    // NLU observers get the whole object: `{ "nlu": { "result": ... } }`.
    FieldRule {
        keys: &["nlu"],
        emit: |_, obj| {
            let data = Value::Object(obj.clone());
            vec![StreamEvent::NluResult {
                result: data.clone(),
                data,
            }]
        },
    },
    FieldRule {
        keys: &["convo"],
        emit: |v, obj| {
            vec![StreamEvent::ConversationSnapshot {
                conversation: v.clone(),
                data: Value::Object(obj.clone()),
            }]
        },
    },
    FieldRule {
        keys: &["audio_chunk"],
        emit: |v, obj| {
            vec![StreamEvent::AudioChunk {
                chunk: text_of(v),
                data: Value::Object(obj.clone()),
            }]
        },
    },
    FieldRule {
        keys: &["content", "text", "message"],
        emit: |v, obj| {
            vec![StreamEvent::OutputText {
                text: text_of(v),
                data: Some(Value::Object(obj.clone())),
            }]
        },
    },
    FieldRule {
        keys: &["error"],
        emit: |v, _| {
            let message = match v {
                Value::String(s) => s.clone(),
                Value::Object(err) => err
                    .get("message")
                    .filter(|m| is_truthy(m))
                    .map(text_of)
                    .unwrap_or_else(|| "Unknown error".to_string()),
                _ => "Unknown error".to_string(),
            };
            vec![StreamEvent::Error(StreamFailure::application(message))]
        },
    },
    FieldRule {
        keys: &["done", "finished", "complete"],
        emit: |_, obj| {
            let done = match obj.get("done") {
                Some(inner @ Value::Object(_)) => done_event_from(inner),
                _ => DoneEvent::total(),
            };
            vec![StreamEvent::Done(done)]
        },
    },
];

pub static TYPE_RULES: &[TypeRule] = &[
    TypeRule {
        types: &["output", "text", "content"],
        emit: |obj| {
            vec![StreamEvent::OutputText {
                text: first_truthy(obj, &["content", "text"])
                    .map(text_of)
                    .unwrap_or_default(),
                data: Some(Value::Object(obj.clone())),
            }]
        },
    },
    TypeRule {
        types: &["interrim_response"],
        emit: |obj| {
            vec![StreamEvent::InterimResponse {
                text: first_truthy(obj, &["content", "data"])
                    .map(text_of)
                    .unwrap_or_default(),
                data: Value::Object(obj.clone()),
            }]
        },
    },
    TypeRule {
        types: &["interrim_thoughts"],
        emit: |obj| {
            vec![StreamEvent::InterimThoughts {
                thoughts: first_truthy(obj, &["data", "content"])
                    .cloned()
                    .unwrap_or(Value::Null),
                data: Value::Object(obj.clone()),
            }]
        },
    },
    TypeRule {
        types: &["tool_calls"],
        emit: |obj| match obj.get("data").and_then(Value::as_array) {
            Some(calls) => vec![StreamEvent::ToolCalls {
                calls: calls.clone(),
                data: Value::Object(obj.clone()),
            }],
            None => Vec::new(),
        },
    },
    TypeRule {
        types: &["mcp_tool_calls"],
        emit: |obj| match obj.get("data").and_then(Value::as_array) {
            Some(calls) => vec![StreamEvent::ExternalToolCalls {
                calls: calls.clone(),
                data: Value::Object(obj.clone()),
            }],
            None => Vec::new(),
        },
    },
    TypeRule {
        types: &["tool_call"],
        emit: |obj| {
            vec![StreamEvent::ToolCall {
                call: data_or_whole(obj),
            }]
        },
    },
    TypeRule {
        types: &["mcp_call"],
        emit: |obj| {
            vec![StreamEvent::ExternalToolCall {
                call: data_or_whole(obj),
            }]
        },
    },
    TypeRule {
        types: &["thoughts"],
        emit: |obj| {
            vec![StreamEvent::FinalThoughts {
                thoughts: data_or_whole(obj),
                data: Value::Object(obj.clone()),
            }]
        },
    },
    TypeRule {
        types: &["response"],
        emit: |obj| {
            vec![StreamEvent::FinalResponse {
                text: first_truthy(obj, &["content", "data"])
                    .map(text_of)
                    .unwrap_or_default(),
                data: Value::Object(obj.clone()),
            }]
        },
    },
    TypeRule {
        types: &["nlu"],
        emit: |obj| {
            vec![StreamEvent::NluResult {
                result: data_or_whole(obj),
                data: Value::Object(obj.clone()),
            }]
        },
    },
    TypeRule {
        types: &["conversation"],
        emit: |obj| {
            vec![StreamEvent::ConversationSnapshot {
                conversation: first_truthy(obj, &["data", "convo", "conversation"])
                    .cloned()
                    .unwrap_or_else(|| Value::Array(Vec::new())),
                data: Value::Object(obj.clone()),
            }]
        },
    },
    TypeRule {
        types: &["audio_chunk"],
        emit: |obj| {
            vec![StreamEvent::AudioChunk {
                chunk: first_truthy(obj, &["data", "audio_chunk", "content"])
                    .map(text_of)
                    .unwrap_or_default(),
                data: Value::Object(obj.clone()),
            }]
        },
    },
    TypeRule {
        types: &["error"],
        emit: |obj| {
            let message = first_truthy(obj, &["content", "message"])
                .map(text_of)
                .unwrap_or_else(|| "Unknown error".to_string());
            vec![StreamEvent::Error(StreamFailure::application(message))]
        },
    },
    // Without `data` the discriminator itself is the scope, so a bare
    // `{"type":"done"}` is a partial completion with scope "done".
    TypeRule {
        types: &["done", "complete"],
        emit: |obj| {
            let source = first_truthy(obj, &["data"])
                .cloned()
                .unwrap_or_else(|| Value::Object(obj.clone()));
            let done = done_event_from(&source);
            vec![StreamEvent::Done(done)]
        },
    },
];

/// Classifies one frame payload.
///
/// The completion sentinels `[DONE]` / `DONE` map to a total done event
/// without parsing. Non-JSON, non-blank payloads become a single
/// `OutputText` carrying the raw text.
pub fn classify(payload: &str) -> Vec<StreamEvent> {
    if payload == "[DONE]" || payload == "DONE" {
        return vec![StreamEvent::Done(DoneEvent::total())];
    }
    match serde_json::from_str::<Value>(payload) {
        Ok(value) => classify_value(&value),
        Err(err) => {
            if payload.trim().is_empty() {
                return Vec::new();
            }
            warn!(error = %err, payload, "failed to parse stream payload as JSON, treating as text");
            vec![StreamEvent::OutputText {
                text: payload.to_string(),
                data: None,
            }]
        }
    }
}

/// Classifies an already-parsed payload. Only JSON objects produce events.
pub fn classify_value(value: &Value) -> Vec<StreamEvent> {
    let Some(obj) = value.as_object() else {
        debug!(payload = %value, "ignoring non-object stream payload");
        return Vec::new();
    };

    let mut events = Vec::new();
    for rule in FIELD_RULES {
        if let Some(matched) = first_truthy(obj, rule.keys) {
            events.extend((rule.emit)(matched, obj));
        }
    }

    if let Some(kind) = obj.get("type").and_then(Value::as_str)
        && let Some(rule) = TYPE_RULES.iter().find(|rule| rule.types.contains(&kind))
    {
        events.extend((rule.emit)(obj));
    }
    events
}

/// Normalizes a completion object into a [`DoneEvent`].
///
/// The scope comes from `scope`, then from `type`, then from a nested `done`
/// object, and defaults to `"*"`. The key that supplied the scope is dropped
/// from the remaining fields.
fn done_event_from(value: &Value) -> DoneEvent {
    let Value::Object(obj) = value else {
        return DoneEvent::total();
    };
    let named = |key: &str| {
        obj.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned)
    };
    let scope = named("scope")
        .map(|scope| ("scope", scope))
        .or_else(|| named("type").map(|scope| ("type", scope)));
    match scope {
        Some((key, scope)) => {
            let mut fields = obj.clone();
            fields.remove(key);
            DoneEvent { scope, fields }
        }
        None => match obj.get("done") {
            Some(nested @ Value::Object(_)) => done_event_from(nested),
            _ => DoneEvent {
                scope: TOTAL_SCOPE.to_string(),
                fields: obj.clone(),
            },
        },
    }
}

pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn first_truthy<'a>(obj: &'a Object, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| obj.get(*key))
        .find(|value| is_truthy(value))
}

fn data_or_whole(obj: &Object) -> Value {
    first_truthy(obj, &["data"])
        .cloned()
        .unwrap_or_else(|| Value::Object(obj.clone()))
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scopes(events: &[StreamEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Done(done) => Some(done.scope.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn done_sentinels_yield_single_total_done() {
        for payload in ["[DONE]", "DONE"] {
            let events = classify(payload);
            assert_eq!(events, vec![StreamEvent::Done(DoneEvent::total())]);
        }
    }

    #[test]
    fn plain_text_falls_back_to_output() {
        let events = classify("hello world");
        assert_eq!(
            events,
            vec![StreamEvent::OutputText {
                text: "hello world".into(),
                data: None,
            }]
        );
        assert!(classify("   ").is_empty());
    }

    #[test]
    fn tool_calls_fan_out_before_response() {
        let events = classify(r#"{"tool_calls":[{"name":"a"},{"name":"b"}],"response":"x"}"#);
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], StreamEvent::ToolCalls { calls, .. } if calls.len() == 2));
        assert!(matches!(&events[1], StreamEvent::ToolCall { call } if call["name"] == "a"));
        assert!(matches!(&events[2], StreamEvent::ToolCall { call } if call["name"] == "b"));
        assert!(matches!(&events[3], StreamEvent::FinalResponse { text, .. } if text == "x"));
    }

    #[test]
    fn interim_and_final_fields() {
        let events = classify(r#"{"interrim_response":"H","interrim_thoughts":"hmm"}"#);
        assert!(matches!(&events[0], StreamEvent::InterimResponse { text, .. } if text == "H"));
        assert!(
            matches!(&events[1], StreamEvent::InterimThoughts { thoughts, .. } if thoughts == "hmm")
        );

        let events = classify(r#"{"thoughts":{"reasoning":"r"}}"#);
        assert!(
            matches!(&events[0], StreamEvent::FinalThoughts { thoughts, .. } if thoughts["reasoning"] == "r")
        );
    }

    #[test]
    fn falsy_fields_are_ignored() {
        let events = classify(r#"{"response":"","thoughts":null,"done":false,"tool_calls":0}"#);
        assert!(events.is_empty());
    }

    #[test]
    fn tool_calls_must_be_an_array() {
        let events = classify(r#"{"tool_calls":{"name":"a"},"mcp_tool_calls":"x"}"#);
        assert!(events.is_empty());
    }

    #[test]
    fn nlu_receives_whole_object() {
        let value = json!({"nlu": {"result": "yes"}});
        let events = classify_value(&value);
        assert_eq!(
            events,
            vec![StreamEvent::NluResult {
                result: value.clone(),
                data: value,
            }]
        );
    }

    #[test]
    fn output_prefers_content_then_text_then_message() {
        let events = classify(r#"{"text":"t","message":"m"}"#);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::OutputText { text, .. } if text == "t"));
        let events = classify(r#"{"content":"","message":"m"}"#);
        assert!(matches!(&events[0], StreamEvent::OutputText { text, .. } if text == "m"));
    }

    #[test]
    fn error_field_as_string_or_object() {
        let events = classify(r#"{"error":"boom"}"#);
        assert_eq!(
            events,
            vec![StreamEvent::Error(StreamFailure::application("boom"))]
        );
        let events = classify(r#"{"error":{"code":7}}"#);
        assert_eq!(
            events,
            vec![StreamEvent::Error(StreamFailure::application(
                "Unknown error"
            ))]
        );
    }

    #[test]
    fn done_variants_resolve_scope() {
        assert_eq!(scopes(&classify(r#"{"done":true}"#)), vec!["*"]);
        assert_eq!(scopes(&classify(r#"{"finished":1}"#)), vec!["*"]);
        assert_eq!(scopes(&classify(r#"{"done":{"scope":"tts"}}"#)), vec!["tts"]);
        assert_eq!(scopes(&classify(r#"{"done":{"type":"output"}}"#)), vec!["output"]);
        assert_eq!(scopes(&classify(r#"{"done":{"extra":1}}"#)), vec!["*"]);
    }

    #[test]
    fn done_object_keeps_extra_fields() {
        let events = classify(r#"{"done":{"scope":"tts","chunks":3}}"#);
        let StreamEvent::Done(done) = &events[0] else {
            panic!("expected done, got {events:?}");
        };
        assert_eq!(done.fields.get("chunks"), Some(&json!(3)));
        assert!(!done.fields.contains_key("scope"));
    }

    #[test]
    fn type_discriminator_maps_events() {
        let events = classify(r#"{"type":"tool_call","data":{"name":"lookup"}}"#);
        assert_eq!(
            events,
            vec![StreamEvent::ToolCall {
                call: json!({"name":"lookup"})
            }]
        );

        let events = classify(r#"{"type":"mcp_call","server":"s","method":"m"}"#);
        assert!(
            matches!(&events[0], StreamEvent::ExternalToolCall { call } if call["server"] == "s")
        );

        let events = classify(r#"{"type":"conversation"}"#);
        assert!(
            matches!(&events[0], StreamEvent::ConversationSnapshot { conversation, .. } if conversation == &json!([]))
        );

        let events = classify(r#"{"type":"error","message":"bad"}"#);
        assert!(matches!(&events[1], StreamEvent::Error(f) if f.message() == "bad"));
    }

    #[test]
    fn scope_from_type_is_removed_from_fields() {
        let events = classify(r#"{"done":{"type":"tts","chunks":3}}"#);
        let StreamEvent::Done(done) = &events[0] else {
            panic!("expected done, got {events:?}");
        };
        assert_eq!(done.scope, "tts");
        assert!(!done.fields.contains_key("type"));
        assert_eq!(done.fields.get("chunks"), Some(&json!(3)));
    }

    #[test]
    fn type_done_without_data_is_partial() {
        let events = classify(r#"{"type":"done"}"#);
        assert_eq!(scopes(&events), vec!["done"]);
        assert!(!events[0].is_total_done());
        assert_eq!(scopes(&classify(r#"{"type":"done","scope":"*"}"#)), vec!["*"]);
        assert_eq!(
            scopes(&classify(r#"{"type":"complete","data":{"type":"tts"}}"#)),
            vec!["tts"]
        );
    }

    #[test]
    fn field_and_type_rules_both_fire() {
        let events = classify(r#"{"type":"response","response":"x","content":"y"}"#);
        let kinds: Vec<_> = events
            .iter()
            .map(|e| match e {
                StreamEvent::FinalResponse { text, .. } => format!("final:{text}"),
                StreamEvent::OutputText { text, .. } => format!("output:{text}"),
                other => format!("{other:?}"),
            })
            .collect();
        assert_eq!(kinds, vec!["final:x", "output:y", "final:y"]);
    }

    #[test]
    fn unknown_type_and_non_objects_yield_nothing() {
        assert!(classify(r#"{"type":"heartbeat"}"#).is_empty());
        assert!(classify("42").is_empty());
        assert!(classify(r#"["a"]"#).is_empty());
    }
}

use serde_json::{Map, Value};

use crate::errors::StreamFailure;

/// Scope carried by a done event that ends the whole session.
pub const TOTAL_SCOPE: &str = "*";

/// Completion signal for the whole session or one of its sub-channels.
#[derive(Clone, Debug, PartialEq)]
pub struct DoneEvent {
    /// `"*"` for total completion, otherwise the finished sub-channel
    /// (for example `"output"` or `"tts"`).
    pub scope: String,
    /// Remaining fields of the wire object, untouched.
    pub fields: Map<String, Value>,
}

impl DoneEvent {
    /// Done event that ends the session.
    pub fn total() -> Self {
        Self::scoped(TOTAL_SCOPE)
    }

    pub fn scoped(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            fields: Map::new(),
        }
    }

    /// Returns true when this event ends the whole session.
    pub fn is_total(&self) -> bool {
        self.scope == TOTAL_SCOPE
    }
}

/// Observer category an event is dispatched to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Output,
    ToolCalls,
    ToolCall,
    ExternalToolCalls,
    ExternalToolCall,
    Thoughts,
    Response,
    Nlu,
    Conversation,
    AudioChunk,
    Error,
    Done,
}

/// A classified stream event.
///
/// `data` fields hold the full JSON object the event was extracted from.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// Plain output text. `data` is `None` for non-JSON payloads.
    OutputText { text: String, data: Option<Value> },
    InterimResponse { text: String, data: Value },
    FinalResponse { text: String, data: Value },
    InterimThoughts { thoughts: Value, data: Value },
    FinalThoughts { thoughts: Value, data: Value },
    /// The whole `tool_calls` array of one payload.
    ToolCalls { calls: Vec<Value>, data: Value },
    /// One tool invocation.
    ToolCall { call: Value },
    /// The whole `mcp_tool_calls` array of one payload.
    ExternalToolCalls { calls: Vec<Value>, data: Value },
    /// One external (MCP) tool invocation.
    ExternalToolCall { call: Value },
    NluResult { result: Value, data: Value },
    ConversationSnapshot { conversation: Value, data: Value },
    /// Opaque audio payload, passed through as received.
    AudioChunk { chunk: String, data: Value },
    Error(StreamFailure),
    Done(DoneEvent),
}

impl StreamEvent {
    pub fn category(&self) -> EventCategory {
        match self {
            Self::OutputText { .. } => EventCategory::Output,
            Self::InterimResponse { .. } | Self::FinalResponse { .. } => EventCategory::Response,
            Self::InterimThoughts { .. } | Self::FinalThoughts { .. } => EventCategory::Thoughts,
            Self::ToolCalls { .. } => EventCategory::ToolCalls,
            Self::ToolCall { .. } => EventCategory::ToolCall,
            Self::ExternalToolCalls { .. } => EventCategory::ExternalToolCalls,
            Self::ExternalToolCall { .. } => EventCategory::ExternalToolCall,
            Self::NluResult { .. } => EventCategory::Nlu,
            Self::ConversationSnapshot { .. } => EventCategory::Conversation,
            Self::AudioChunk { .. } => EventCategory::AudioChunk,
            Self::Error(_) => EventCategory::Error,
            Self::Done(_) => EventCategory::Done,
        }
    }

    /// Returns true for a done event with scope `"*"`.
    pub fn is_total_done(&self) -> bool {
        matches!(self, Self::Done(done) if done.is_total())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interim_and_final_share_observer_category() {
        let interim = StreamEvent::InterimResponse {
            text: "H".into(),
            data: Value::Null,
        };
        let last = StreamEvent::FinalResponse {
            text: "Hi".into(),
            data: Value::Null,
        };
        assert_eq!(interim.category(), last.category());
    }

    #[test]
    fn only_star_scope_is_total() {
        assert!(StreamEvent::Done(DoneEvent::total()).is_total_done());
        assert!(!StreamEvent::Done(DoneEvent::scoped("tts")).is_total_done());
    }
}

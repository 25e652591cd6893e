use serde_json::Value;

use crate::errors::StreamFailure;
use crate::stream::{DoneEvent, StreamEvent};

/// Extra context passed to response and thoughts observers.
#[derive(Clone, Copy, Debug)]
pub struct EventMeta<'a> {
    /// False for interim fragments, true for the final version.
    pub is_final: bool,
    /// The JSON object the event was extracted from.
    pub data: &'a Value,
}

pub type OutputObserver = Box<dyn FnMut(&str, Option<&Value>) + Send>;
pub type ToolCallsObserver = Box<dyn FnMut(&[Value], &Value) + Send>;
pub type ToolCallObserver = Box<dyn FnMut(&Value) + Send>;
pub type ThoughtsObserver = Box<dyn FnMut(&Value, EventMeta<'_>) + Send>;
pub type ResponseObserver = Box<dyn FnMut(&str, EventMeta<'_>) + Send>;
pub type ValueObserver = Box<dyn FnMut(&Value, &Value) + Send>;
pub type AudioChunkObserver = Box<dyn FnMut(&str, &Value) + Send>;
pub type ErrorObserver = Box<dyn FnMut(&StreamFailure) + Send>;
pub type DoneObserver = Box<dyn FnMut(&DoneEvent) + Send>;

/// Ordered observer lists, one per event category.
#[derive(Default)]
pub struct Observers {
    pub(crate) output: Vec<OutputObserver>,
    pub(crate) tool_calls: Vec<ToolCallsObserver>,
    pub(crate) tool_call: Vec<ToolCallObserver>,
    pub(crate) external_tool_calls: Vec<ToolCallsObserver>,
    pub(crate) external_tool_call: Vec<ToolCallObserver>,
    pub(crate) thoughts: Vec<ThoughtsObserver>,
    pub(crate) response: Vec<ResponseObserver>,
    pub(crate) nlu: Vec<ValueObserver>,
    pub(crate) conversation: Vec<ValueObserver>,
    pub(crate) audio_chunk: Vec<AudioChunkObserver>,
    pub(crate) error: Vec<ErrorObserver>,
    pub(crate) done: Vec<DoneObserver>,
}

impl Observers {
    /// Invokes every observer registered for the event's category, in
    /// registration order. Observer panics are not caught.
    pub fn dispatch(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::OutputText { text, data } => {
                for f in &mut self.output {
                    f(text.as_str(), data.as_ref());
                }
            }
            StreamEvent::InterimResponse { text, data } => {
                self.dispatch_response(text, false, data)
            }
            StreamEvent::FinalResponse { text, data } => self.dispatch_response(text, true, data),
            StreamEvent::InterimThoughts { thoughts, data } => {
                self.dispatch_thoughts(thoughts, false, data)
            }
            StreamEvent::FinalThoughts { thoughts, data } => {
                self.dispatch_thoughts(thoughts, true, data)
            }
            StreamEvent::ToolCalls { calls, data } => {
                for f in &mut self.tool_calls {
                    f(calls.as_slice(), data);
                }
            }
            StreamEvent::ToolCall { call } => {
                for f in &mut self.tool_call {
                    f(call);
                }
            }
            StreamEvent::ExternalToolCalls { calls, data } => {
                for f in &mut self.external_tool_calls {
                    f(calls.as_slice(), data);
                }
            }
            StreamEvent::ExternalToolCall { call } => {
                for f in &mut self.external_tool_call {
                    f(call);
                }
            }
            StreamEvent::NluResult { result, data } => {
                for f in &mut self.nlu {
                    f(result, data);
                }
            }
            StreamEvent::ConversationSnapshot { conversation, data } => {
                for f in &mut self.conversation {
                    f(conversation, data);
                }
            }
            StreamEvent::AudioChunk { chunk, data } => {
                for f in &mut self.audio_chunk {
                    f(chunk.as_str(), data);
                }
            }
            StreamEvent::Error(failure) => {
                for f in &mut self.error {
                    f(failure);
                }
            }
            StreamEvent::Done(done) => {
                for f in &mut self.done {
                    f(done);
                }
            }
        }
    }

    fn dispatch_response(&mut self, text: &str, is_final: bool, data: &Value) {
        for f in &mut self.response {
            f(text, EventMeta { is_final, data });
        }
    }

    fn dispatch_thoughts(&mut self, thoughts: &Value, is_final: bool, data: &Value) {
        for f in &mut self.thoughts {
            f(thoughts, EventMeta { is_final, data });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn observers_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut observers = Observers::default();
        for name in ["first", "second", "third"] {
            let log = log.clone();
            observers.done.push(Box::new(move |done: &DoneEvent| {
                log.lock().unwrap().push(format!("{name}:{}", done.scope));
            }));
        }
        observers.dispatch(&StreamEvent::Done(DoneEvent::scoped("tts")));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:tts", "second:tts", "third:tts"]
        );
    }

    #[test]
    fn response_observers_see_final_flag() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut observers = Observers::default();
        let sink = seen.clone();
        observers
            .response
            .push(Box::new(move |text: &str, meta: EventMeta<'_>| {
                sink.lock().unwrap().push((text.to_string(), meta.is_final));
            }));
        observers.dispatch(&StreamEvent::InterimResponse {
            text: "H".into(),
            data: Value::Null,
        });
        observers.dispatch(&StreamEvent::FinalResponse {
            text: "Hi".into(),
            data: Value::Null,
        });
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("H".to_string(), false), ("Hi".to_string(), true)]
        );
    }

    #[test]
    fn events_without_observers_are_dropped_quietly() {
        let mut observers = Observers::default();
        observers.dispatch(&StreamEvent::ToolCall {
            call: Value::Null,
        });
    }
}

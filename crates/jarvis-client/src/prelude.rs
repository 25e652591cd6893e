//! Re-exports of the types most applications touch.
pub use crate::{
    ClientConfig, ClientError, DoneEvent, EventMeta, JarvisClient, JarvisStreamOptions,
    NluStreamOptions, StopHandle, StreamEvent, StreamFailure, StreamOutcome, StreamSession,
    TtsStreamOptions, init_observability,
};

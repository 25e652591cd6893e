use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt as _;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::classify::classify;
use crate::errors::{ClientError, StreamFailure, TransportError};
use crate::observers::{EventMeta, Observers};
use crate::sse::FrameDecoder;
use crate::stream::{DoneEvent, StreamEvent};
use crate::transport::{StreamFetcher, StreamMethod, StreamRequest};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const TERMINATED: u8 = 2;

/// Lifecycle state of a [`StreamSession`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Created, `start()` not called yet.
    Idle,
    /// Reading the stream. Partial done events keep the session here.
    Running,
    /// Finished, stopped, or failed. Sessions are not restartable.
    Terminated,
}

/// How a call to [`StreamSession::start`] ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    /// A done event with scope `"*"` arrived, or the server closed the stream.
    Completed,
    /// `stop()` was called.
    Stopped,
    /// The transport failed; the failure was dispatched to `on_error`.
    Failed,
}

struct Control {
    state: AtomicU8,
    cancel: watch::Sender<bool>,
}

impl Control {
    fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            state: AtomicU8::new(IDLE),
            cancel,
        }
    }

    fn begin(&self) -> Result<(), ClientError> {
        match self
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(RUNNING) => Err(ClientError::AlreadyRunning),
            Err(_) => Err(ClientError::SessionFinished),
        }
    }

    fn state(&self) -> SessionState {
        match self.state.load(Ordering::Acquire) {
            IDLE => SessionState::Idle,
            RUNNING => SessionState::Running,
            _ => SessionState::Terminated,
        }
    }

    fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    /// Returns true only for the call that performed the transition.
    fn terminate(&self) -> bool {
        self.state.swap(TERMINATED, Ordering::AcqRel) != TERMINATED
    }

    fn stop(&self) -> bool {
        let changed = self.terminate();
        if changed {
            self.cancel.send_replace(true);
        }
        changed
    }
}

/// Cloneable handle that stops a session from anywhere, including from inside
/// one of its observers.
#[derive(Clone)]
pub struct StopHandle {
    control: Arc<Control>,
}

impl StopHandle {
    /// Stops the session. Calling it again has no effect.
    pub fn stop(&self) {
        if self.control.stop() {
            debug!("stream session stopped");
        }
    }

    /// Returns true once the session has terminated for any reason.
    pub fn is_terminated(&self) -> bool {
        self.control.state() == SessionState::Terminated
    }
}

/// One streaming call and its observers.
///
/// Observers are registered fluently before `start()`:
///
/// ```no_run
/// # use jarvis_client::{ClientConfig, JarvisClient, JarvisStreamOptions};
/// # async fn demo() -> Result<(), jarvis_client::ClientError> {
/// let client = JarvisClient::new(ClientConfig::new("key"))?;
/// let session = client
///     .stream()
///     .jarvis("hi", JarvisStreamOptions::default())?
///     .on_response(|text, meta| {
///         if meta.is_final {
///             println!("{text}");
///         }
///     })
///     .on_done(|done| println!("done: {}", done.scope));
/// session.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct StreamSession {
    id: uuid::Uuid,
    request: StreamRequest,
    payload: Map<String, Value>,
    fetcher: Arc<dyn StreamFetcher>,
    control: Arc<Control>,
    observers: Mutex<Observers>,
}

impl StreamSession {
    /// Creates an idle session for an already resolved request.
    pub fn new(
        request: StreamRequest,
        payload: Map<String, Value>,
        fetcher: Arc<dyn StreamFetcher>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            request,
            payload,
            fetcher,
            control: Arc::new(Control::new()),
            observers: Mutex::new(Observers::default()),
        }
    }

    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    /// Target URL, fixed at construction.
    pub fn url(&self) -> &str {
        &self.request.url
    }

    pub fn method(&self) -> StreamMethod {
        self.request.method
    }

    /// Request payload the URL (or body) was built from.
    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn state(&self) -> SessionState {
        self.control.state()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            control: self.control.clone(),
        }
    }

    /// Stops the session and cancels any in-flight read. Idempotent.
    pub fn stop(&self) {
        if self.control.stop() {
            info!(session_id = %self.id, "stream session stopped");
        }
    }

    fn observers_mut(&mut self) -> &mut Observers {
        self.observers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Plain text output (`content` / `text` / `message`, or non-JSON frames).
    pub fn on_output<F>(mut self, f: F) -> Self
    where
        F: FnMut(&str, Option<&Value>) + Send + 'static,
    {
        self.observers_mut().output.push(Box::new(f));
        self
    }

    /// Whole `tool_calls` arrays.
    pub fn on_tool_calls<F>(mut self, f: F) -> Self
    where
        F: FnMut(&[Value], &Value) + Send + 'static,
    {
        self.observers_mut().tool_calls.push(Box::new(f));
        self
    }

    /// Individual tool calls.
    pub fn on_tool_call<F>(mut self, f: F) -> Self
    where
        F: FnMut(&Value) + Send + 'static,
    {
        self.observers_mut().tool_call.push(Box::new(f));
        self
    }

    /// Whole `mcp_tool_calls` arrays.
    pub fn on_mcp_tool_calls<F>(mut self, f: F) -> Self
    where
        F: FnMut(&[Value], &Value) + Send + 'static,
    {
        self.observers_mut().external_tool_calls.push(Box::new(f));
        self
    }

    /// Individual external (MCP) tool calls.
    pub fn on_mcp_call<F>(mut self, f: F) -> Self
    where
        F: FnMut(&Value) + Send + 'static,
    {
        self.observers_mut().external_tool_call.push(Box::new(f));
        self
    }

    /// Interim and final reasoning traces.
    pub fn on_thoughts<F>(mut self, f: F) -> Self
    where
        F: FnMut(&Value, EventMeta<'_>) + Send + 'static,
    {
        self.observers_mut().thoughts.push(Box::new(f));
        self
    }

    /// Interim and final response text.
    pub fn on_response<F>(mut self, f: F) -> Self
    where
        F: FnMut(&str, EventMeta<'_>) + Send + 'static,
    {
        self.observers_mut().response.push(Box::new(f));
        self
    }

    pub fn on_nlu<F>(mut self, f: F) -> Self
    where
        F: FnMut(&Value, &Value) + Send + 'static,
    {
        self.observers_mut().nlu.push(Box::new(f));
        self
    }

    pub fn on_conversation<F>(mut self, f: F) -> Self
    where
        F: FnMut(&Value, &Value) + Send + 'static,
    {
        self.observers_mut().conversation.push(Box::new(f));
        self
    }

    pub fn on_audio_chunk<F>(mut self, f: F) -> Self
    where
        F: FnMut(&str, &Value) + Send + 'static,
    {
        self.observers_mut().audio_chunk.push(Box::new(f));
        self
    }

    /// Application errors and transport failures.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: FnMut(&StreamFailure) + Send + 'static,
    {
        self.observers_mut().error.push(Box::new(f));
        self
    }

    /// Partial (`scope != "*"`) and total completion.
    pub fn on_done<F>(mut self, f: F) -> Self
    where
        F: FnMut(&DoneEvent) + Send + 'static,
    {
        self.observers_mut().done.push(Box::new(f));
        self
    }

    /// Opens the stream and dispatches events until completion, `stop()`, or a
    /// transport failure.
    ///
    /// Fails with `AlreadyRunning` / `SessionFinished` without touching the
    /// transport when the session is not idle, and with `Protocol` when the
    /// response has no body. Transport failures are dispatched to `on_error`
    /// and reported as [`StreamOutcome::Failed`].
    pub async fn start(&self) -> Result<StreamOutcome, ClientError> {
        self.control.begin()?;
        let mut cancel_rx = self.control.cancel.subscribe();
        info!(session_id = %self.id, method = ?self.request.method, "starting stream session");

        let opened = tokio::select! {
            biased;
            _ = cancelled(&mut cancel_rx) => return Ok(StreamOutcome::Stopped),
            opened = self.fetcher.open(&self.request) => opened,
        };
        let mut body = match opened {
            Ok(body) => body,
            Err(TransportError::MissingBody) => {
                self.control.terminate();
                return Err(TransportError::MissingBody.into());
            }
            Err(err) => return Ok(self.fail(&err)),
        };

        let mut decoder = FrameDecoder::new();
        loop {
            if !self.control.is_running() {
                return Ok(StreamOutcome::Stopped);
            }
            let next = tokio::select! {
                biased;
                _ = cancelled(&mut cancel_rx) => return Ok(StreamOutcome::Stopped),
                next = body.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    if let Some(outcome) = self.process_chunk(&mut decoder, &chunk) {
                        return Ok(outcome);
                    }
                }
                Some(Err(err)) => return Ok(self.fail(&err)),
                None => {
                    debug!(
                        session_id = %self.id,
                        pending_bytes = decoder.pending_len(),
                        "stream ended by server"
                    );
                    self.emit(&StreamEvent::Done(DoneEvent::total()));
                    self.control.terminate();
                    return Ok(StreamOutcome::Completed);
                }
            }
        }
    }

    fn process_chunk(&self, decoder: &mut FrameDecoder, chunk: &[u8]) -> Option<StreamOutcome> {
        for frame in decoder.feed(chunk) {
            if let Some(event) = &frame.event {
                debug!(session_id = %self.id, event = %event, "frame event hint");
            }
            for event in classify(&frame.data) {
                if !self.control.is_running() {
                    return Some(StreamOutcome::Stopped);
                }
                self.emit(&event);
                if event.is_total_done() {
                    self.control.terminate();
                    info!(session_id = %self.id, "stream session completed");
                    return Some(StreamOutcome::Completed);
                }
            }
        }
        if self.control.is_running() {
            None
        } else {
            Some(StreamOutcome::Stopped)
        }
    }

    fn fail(&self, err: &TransportError) -> StreamOutcome {
        if !self.control.is_running() {
            return StreamOutcome::Stopped;
        }
        warn!(session_id = %self.id, error = %err, "stream transport failed");
        self.emit(&StreamEvent::Error(StreamFailure::from(err)));
        self.control.terminate();
        StreamOutcome::Failed
    }

    fn emit(&self, event: &StreamEvent) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .dispatch(event);
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ByteStream;
    use bytes::Bytes;
    use futures::stream;
    use std::sync::atomic::AtomicUsize;

    enum Script {
        Chunks(Vec<Result<Bytes, TransportError>>),
        Pending,
        Fail(TransportError),
    }

    struct FakeFetcher {
        calls: Arc<AtomicUsize>,
        script: Script,
    }

    #[async_trait::async_trait]
    impl StreamFetcher for FakeFetcher {
        async fn open(&self, _request: &StreamRequest) -> Result<ByteStream, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.script {
                Script::Chunks(chunks) => Ok(Box::pin(stream::iter(chunks.clone()))),
                Script::Pending => Ok(Box::pin(stream::pending())),
                Script::Fail(err) => Err(err.clone()),
            }
        }
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn session_with(script: Script) -> (StreamSession, Arc<AtomicUsize>, Log) {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = Arc::new(FakeFetcher {
            calls: calls.clone(),
            script,
        });
        let request = StreamRequest {
            url: "http://jarvis.test/api/new-jarvis-stream?key=k".into(),
            method: StreamMethod::Get,
            body: None,
            bearer: None,
        };
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let session = recording(StreamSession::new(request, Map::new(), fetcher), &log);
        (session, calls, log)
    }

    fn recording(session: StreamSession, log: &Log) -> StreamSession {
        let push = |log: &Log| {
            let log = log.clone();
            move |entry: String| log.lock().unwrap().push(entry)
        };
        let (output, tool_calls, tool_call, response, thoughts, error, done) = (
            push(log),
            push(log),
            push(log),
            push(log),
            push(log),
            push(log),
            push(log),
        );
        session
            .on_output(move |text, _| output(format!("output:{text}")))
            .on_tool_calls(move |calls, _| tool_calls(format!("tool_calls:{}", calls.len())))
            .on_tool_call(move |call| tool_call(format!("tool_call:{}", call["name"])))
            .on_response(move |text, meta| {
                let kind = if meta.is_final { "final" } else { "interim" };
                response(format!("{kind}:{text}"))
            })
            .on_thoughts(move |t, meta| thoughts(format!("thoughts:{t}:{}", meta.is_final)))
            .on_error(move |failure| error(format!("error:{}", failure.message())))
            .on_done(move |d| done(format!("done:{}", d.scope)))
    }

    fn chunks(parts: &[&str]) -> Script {
        Script::Chunks(
            parts
                .iter()
                .map(|p| Ok(Bytes::copy_from_slice(p.as_bytes())))
                .collect(),
        )
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn interim_then_final_with_total_done() {
        let (session, calls, log) = session_with(chunks(&[
            "data: {\"interrim_response\":\"H\"}\n\n",
            "data: {\"response\":\"Hi there\",\"done\":{\"scope\":\"*\"}}\n\n",
        ]));
        let outcome = session.start().await.expect("start");
        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(entries(&log), vec!["interim:H", "final:Hi there", "done:*"]);
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn any_chunk_split_yields_same_events() {
        let text = "event: message\ndata: {\"tool_calls\":[{\"name\":\"a\"}],\"response\":\"é!\"}\n\ndata: {\"interrim_thoughts\":\"t\"}\n\n";
        let bytes = text.as_bytes();

        let (whole, _, whole_log) = session_with(chunks(&[text]));
        whole.start().await.expect("start");
        let expected = entries(&whole_log);
        assert_eq!(
            expected,
            vec![
                "tool_calls:1",
                "tool_call:\"a\"",
                "final:é!",
                "thoughts:\"t\":false",
                "done:*"
            ]
        );

        for split in 1..bytes.len() {
            let script = Script::Chunks(vec![
                Ok(Bytes::copy_from_slice(&bytes[..split])),
                Ok(Bytes::copy_from_slice(&bytes[split..])),
            ]);
            let (session, _, log) = session_with(script);
            session.start().await.expect("start");
            assert_eq!(entries(&log), expected, "split at byte {split}");
        }

        let single_bytes = Script::Chunks(
            bytes
                .iter()
                .map(|b| Ok(Bytes::copy_from_slice(&[*b])))
                .collect(),
        );
        let (session, _, log) = session_with(single_bytes);
        session.start().await.expect("start");
        assert_eq!(entries(&log), expected);
    }

    #[tokio::test]
    async fn nothing_dispatched_after_total_done() {
        let (session, _, log) = session_with(chunks(&[
            "data: [DONE]\n\ndata: {\"response\":\"late\"}\n\n",
            "data: {\"response\":\"later\"}\n\n",
        ]));
        assert_eq!(session.start().await.expect("start"), StreamOutcome::Completed);
        assert_eq!(entries(&log), vec!["done:*"]);
    }

    #[tokio::test]
    async fn partial_done_keeps_session_running() {
        let (session, _, log) = session_with(chunks(&[
            "data: {\"done\":{\"scope\":\"tts\"}}\n\n",
            "data: {\"response\":\"x\"}\n\n",
        ]));
        assert_eq!(session.start().await.expect("start"), StreamOutcome::Completed);
        assert_eq!(entries(&log), vec!["done:tts", "final:x", "done:*"]);
    }

    #[tokio::test]
    async fn application_error_does_not_terminate() {
        let (session, _, log) = session_with(chunks(&[
            "data: {\"error\":{\"message\":\"rate limited\"}}\n\n",
            "data: hello world\n\n",
        ]));
        session.start().await.expect("start");
        assert_eq!(
            entries(&log),
            vec!["error:rate limited", "output:hello world", "done:*"]
        );
    }

    #[tokio::test]
    async fn stop_twice_is_noop_and_session_is_not_restartable() {
        let (session, calls, log) = session_with(chunks(&["data: {\"response\":\"x\"}\n\n"]));
        let handle = session.stop_handle();
        session.stop();
        handle.stop();
        session.stop();
        assert!(handle.is_terminated());
        assert!(matches!(
            session.start().await,
            Err(ClientError::SessionFinished)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(entries(&log).is_empty());
    }

    #[tokio::test]
    async fn start_while_running_fails_without_second_fetch() {
        let (session, calls, log) = session_with(Script::Pending);
        let session = Arc::new(session);
        let runner = {
            let session = session.clone();
            tokio::spawn(async move { session.start().await })
        };
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(session.state(), SessionState::Running);
        assert!(matches!(
            session.start().await,
            Err(ClientError::AlreadyRunning)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        session.stop();
        let outcome = runner.await.expect("join").expect("start");
        assert_eq!(outcome, StreamOutcome::Stopped);
        assert!(entries(&log).is_empty());
    }

    #[tokio::test]
    async fn stop_from_observer_halts_buffered_frames() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = Arc::new(FakeFetcher {
            calls,
            script: chunks(&["data: {\"response\":\"one\"}\n\ndata: {\"response\":\"two\"}\n\n"]),
        });
        let request = StreamRequest {
            url: "http://jarvis.test/s".into(),
            method: StreamMethod::Get,
            body: None,
            bearer: None,
        };
        let session = StreamSession::new(request, Map::new(), fetcher);
        let handle = session.stop_handle();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let session = session
            .on_response(move |text, _| {
                sink.lock().unwrap().push(text.to_string());
                handle.stop();
                handle.stop();
            })
            .on_done({
                let seen = seen.clone();
                move |d| seen.lock().unwrap().push(format!("done:{}", d.scope))
            });
        assert_eq!(session.start().await.expect("start"), StreamOutcome::Stopped);
        assert_eq!(*seen.lock().unwrap(), vec!["one"]);
    }

    #[tokio::test]
    async fn read_failure_is_dispatched_and_terminates() {
        let (session, _, log) = session_with(Script::Chunks(vec![
            Ok(Bytes::from_static(b"data: {\"response\":\"partial\"}\n\n")),
            Err(TransportError::network("connection reset")),
            Ok(Bytes::from_static(b"data: {\"response\":\"never\"}\n\n")),
        ]));
        assert_eq!(session.start().await.expect("start"), StreamOutcome::Failed);
        assert_eq!(
            entries(&log),
            vec![
                "final:partial",
                "error:network error: connection reset"
            ]
        );
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn http_status_failure_is_dispatched() {
        let (session, _, log) = session_with(Script::Fail(TransportError::Status {
            status: 401,
            reason: "Unauthorized".into(),
            body: "bad key".into(),
        }));
        assert_eq!(session.start().await.expect("start"), StreamOutcome::Failed);
        assert_eq!(
            entries(&log),
            vec!["error:HTTP 401: Unauthorized - bad key"]
        );
    }

    #[tokio::test]
    async fn missing_body_is_returned_not_dispatched() {
        let (session, _, log) = session_with(Script::Fail(TransportError::MissingBody));
        assert!(matches!(session.start().await, Err(ClientError::Protocol(_))));
        assert!(entries(&log).is_empty());
        assert_eq!(session.state(), SessionState::Terminated);
    }
}

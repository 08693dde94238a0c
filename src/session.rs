// Manages generation state: the one live session, its token and its output

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::attachments::EncodedAttachment;
use crate::error::GenerationError;
use crate::notice::{Notice, NoticeSink};
use crate::ticket_api::{self, FragmentStream, TicketRequest, TicketTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    InFlight,
    Completed,
    Cancelled,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen-{}", self.0)
    }
}

/// How the read loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Cancelled,
    Failed(GenerationError),
}

impl SessionOutcome {
    pub fn status(&self) -> SessionStatus {
        match self {
            Self::Completed => SessionStatus::Completed,
            Self::Cancelled => SessionStatus::Cancelled,
            Self::Failed(_) => SessionStatus::Failed,
        }
    }
}

/// Final account of one session, returned by [`SessionHandle::wait`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub id: SessionId,
    pub outcome: SessionOutcome,
    /// Everything this session appended, in arrival order.
    pub text: String,
}

impl SessionReport {
    pub fn status(&self) -> SessionStatus {
        self.outcome.status()
    }

    pub fn message(&self) -> Option<String> {
        match &self.outcome {
            SessionOutcome::Failed(err) => Some(err.to_string()),
            _ => None,
        }
    }
}

/// Result of one cancellation-aware read.
enum ReadOutcome {
    Fragment(String),
    End,
    Cancelled,
    Failed(GenerationError),
}

async fn next_fragment(stream: &mut FragmentStream, token: &CancellationToken) -> ReadOutcome {
    tokio::select! {
        biased;
        _ = token.cancelled() => ReadOutcome::Cancelled,
        item = stream.next() => match item {
            Some(Ok(text)) => ReadOutcome::Fragment(text),
            Some(Err(e)) => ReadOutcome::Failed(e),
            None => ReadOutcome::End,
        },
    }
}

struct ActiveGeneration {
    id: SessionId,
    token: CancellationToken,
}

#[derive(Default)]
struct GenerationState {
    current: Option<ActiveGeneration>,
}

impl GenerationState {
    fn is_running(&self) -> bool {
        self.current.is_some()
    }

    fn is_live(&self, id: SessionId, token: &CancellationToken) -> bool {
        !token.is_cancelled() && self.current.as_ref().map(|a| a.id) == Some(id)
    }
}

struct Shared {
    state: Mutex<GenerationState>,
    text: watch::Sender<String>,
    status: watch::Sender<SessionStatus>,
    notices: NoticeSink,
}

impl Shared {
    /// Signals and releases the live session (only `target`, when given) and
    /// publishes `Cancelled`, all under the state lock.
    async fn cancel(&self, target: Option<SessionId>) -> bool {
        let mut state = self.state.lock().await;
        let matches = match (&state.current, target) {
            (Some(active), Some(id)) => active.id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return false;
        }
        match state.current.take() {
            Some(active) => {
                active.token.cancel();
                self.status.send_replace(SessionStatus::Cancelled);
                info!(session = %active.id, "generation cancelled");
                true
            }
            None => false,
        }
    }
}

/// Runs generations for one consumer, at most one at a time.
///
/// The consumer observes the live session through [`Generator::subscribe_text`]
/// and [`Generator::subscribe_status`]; only the live session's read loop may
/// change either.
pub struct Generator {
    transport: Arc<dyn TicketTransport>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
}

impl Generator {
    pub fn new(transport: Arc<dyn TicketTransport>, notices: NoticeSink) -> Self {
        let (text, _) = watch::channel(String::new());
        let (status, _) = watch::channel(SessionStatus::Idle);
        Self {
            transport,
            shared: Arc::new(Shared {
                state: Mutex::new(GenerationState::default()),
                text,
                status,
                notices,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.shared.status.borrow()
    }

    pub fn text(&self) -> String {
        self.shared.text.borrow().clone()
    }

    pub fn subscribe_text(&self) -> watch::Receiver<String> {
        self.shared.text.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status.subscribe()
    }

    pub async fn is_running(&self) -> bool {
        self.shared.state.lock().await.is_running()
    }

    /// Starts a new generation, cancelling the live one first.
    ///
    /// Input errors are returned before any state changes or network call.
    pub async fn start(
        &self,
        description: &str,
        images: Vec<EncodedAttachment>,
    ) -> Result<SessionHandle, GenerationError> {
        let request = TicketRequest::new(description, images)?;
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let token = CancellationToken::new();

        {
            let mut state = self.shared.state.lock().await;
            if let Some(previous) = state.current.take() {
                info!(session = %previous.id, next = %id, "cancelling in-flight generation");
                previous.token.cancel();
            }
            state.current = Some(ActiveGeneration {
                id,
                token: token.clone(),
            });
            self.shared.text.send_replace(String::new());
            self.shared.status.send_replace(SessionStatus::InFlight);
        }

        info!(session = %id, images = request.images().len(), "generation started");
        let task = tokio::spawn(run_session(
            id,
            Arc::clone(&self.transport),
            Arc::clone(&self.shared),
            token.clone(),
            request,
        ));

        Ok(SessionHandle {
            id,
            shared: Arc::clone(&self.shared),
            task,
        })
    }

    /// Stops the live generation. Returns `false` when nothing was running.
    pub async fn cancel(&self) -> bool {
        self.shared.cancel(None).await
    }

    /// Returns a terminal status to `Idle` once the consumer has shown it.
    pub async fn acknowledge(&self) -> bool {
        let _state = self.shared.state.lock().await;
        self.shared.status.send_if_modified(|status| {
            if status.is_terminal() {
                *status = SessionStatus::Idle;
                true
            } else {
                false
            }
        })
    }
}

/// Caller-side handle to a started session.
///
/// Dropping it does not stop the session; use [`Generator::cancel`] or
/// [`SessionHandle::cancel`].
pub struct SessionHandle {
    id: SessionId,
    shared: Arc<Shared>,
    task: JoinHandle<SessionReport>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Same as [`Generator::cancel`], but only while this session is the live
    /// one. Returns `false` once it has finished or been superseded.
    pub async fn cancel(&self) -> bool {
        self.shared.cancel(Some(self.id)).await
    }

    pub async fn wait(self) -> Result<SessionReport, tokio::task::JoinError> {
        self.task.await
    }
}

async fn run_session(
    id: SessionId,
    transport: Arc<dyn TicketTransport>,
    shared: Arc<Shared>,
    token: CancellationToken,
    request: TicketRequest,
) -> SessionReport {
    let mut accumulated = String::new();
    let outcome = stream_generation(
        id,
        transport.as_ref(),
        &shared,
        &token,
        request,
        &mut accumulated,
    )
    .await;
    finish(id, &shared, &token, outcome, accumulated).await
}

async fn stream_generation(
    id: SessionId,
    transport: &dyn TicketTransport,
    shared: &Shared,
    token: &CancellationToken,
    request: TicketRequest,
    accumulated: &mut String,
) -> SessionOutcome {
    let mut stream = tokio::select! {
        biased;
        _ = token.cancelled() => return SessionOutcome::Cancelled,
        opened = transport.open(request) => match opened {
            Ok(stream) => stream,
            Err(e) => return SessionOutcome::Failed(e),
        },
    };

    loop {
        match next_fragment(&mut stream, token).await {
            ReadOutcome::Fragment(text) => {
                if let Some(message) = ticket_api::in_band_error(&text) {
                    return SessionOutcome::Failed(GenerationError::InBand(message));
                }

                let state = shared.state.lock().await;
                if !state.is_live(id, token) {
                    return SessionOutcome::Cancelled;
                }
                shared.text.send_modify(|buffer| buffer.push_str(&text));
                drop(state);

                debug!(session = %id, bytes = text.len(), "fragment received");
                accumulated.push_str(&text);
            }
            ReadOutcome::End => return SessionOutcome::Completed,
            ReadOutcome::Cancelled => return SessionOutcome::Cancelled,
            ReadOutcome::Failed(e) => return SessionOutcome::Failed(e),
        }
    }
}

/// Releases the live slot if this session still holds it and publishes the
/// terminal status. Once the token has been signalled the outcome is
/// `Cancelled` whatever ended the loop, so an abort-induced read error is never
/// reported as a failure.
async fn finish(
    id: SessionId,
    shared: &Shared,
    token: &CancellationToken,
    outcome: SessionOutcome,
    text: String,
) -> SessionReport {
    let outcome = {
        let mut state = shared.state.lock().await;
        let outcome = if token.is_cancelled() {
            SessionOutcome::Cancelled
        } else {
            outcome
        };
        // otherwise start() or cancel() already published the status
        if state.current.as_ref().map(|a| a.id) == Some(id) {
            state.current = None;
            shared.status.send_replace(outcome.status());
        }
        outcome
    };

    match &outcome {
        SessionOutcome::Completed => {
            info!(session = %id, bytes = text.len(), "generation completed");
        }
        SessionOutcome::Cancelled => {
            info!(session = %id, bytes = text.len(), "generation stopped");
            shared.notices.emit(Notice::info("Generation stopped"));
        }
        SessionOutcome::Failed(e) => {
            warn!(session = %id, error = %e, "generation failed");
            shared.notices.emit(Notice::error(e.to_string()));
        }
    }

    SessionReport { id, outcome, text }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use futures_util::future::{BoxFuture, FutureExt};
    use futures_util::stream;
    use tokio::sync::mpsc;

    use super::*;

    pub type FragmentSender = mpsc::UnboundedSender<Result<String, GenerationError>>;

    enum Script {
        Stream(mpsc::UnboundedReceiver<Result<String, GenerationError>>),
        Reject(GenerationError),
    }

    /// In-memory transport: every `open` consumes the next scripted response.
    #[derive(Default)]
    pub struct ScriptedTransport {
        scripts: StdMutex<VecDeque<Script>>,
        requests: StdMutex<Vec<TicketRequest>>,
    }

    impl ScriptedTransport {
        /// Queues a streaming response; fragments are pushed through the sender
        /// and dropping it ends the stream.
        pub fn push_stream(&self) -> FragmentSender {
            let (tx, rx) = mpsc::unbounded_channel();
            self.scripts.lock().expect("scripts lock").push_back(Script::Stream(rx));
            tx
        }

        pub fn push_rejection(&self, err: GenerationError) {
            self.scripts.lock().expect("scripts lock").push_back(Script::Reject(err));
        }

        pub fn requests(&self) -> Vec<TicketRequest> {
            self.requests.lock().expect("requests lock").clone()
        }
    }

    impl TicketTransport for ScriptedTransport {
        fn open(
            &self,
            request: TicketRequest,
        ) -> BoxFuture<'static, Result<FragmentStream, GenerationError>> {
            self.requests.lock().expect("requests lock").push(request);
            let script = self.scripts.lock().expect("scripts lock").pop_front();
            async move {
                match script {
                    Some(Script::Stream(rx)) => Ok(stream::unfold(rx, |mut rx| async move {
                        rx.recv().await.map(|item| (item, rx))
                    })
                    .boxed()),
                    Some(Script::Reject(err)) => Err(err),
                    None => Err(GenerationError::transport("no scripted response")),
                }
            }
            .boxed()
        }
    }
}

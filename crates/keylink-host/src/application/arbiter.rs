//! Connection arbiter: the single owner of one physical link.
//!
//! # Why an arbiter? (for beginners)
//!
//! A key has one half-duplex link and one "currently selected" application.
//! If two callers talked to it at once, one caller's command could land in
//! the other caller's application, or two frames could interleave on the
//! wire.  The arbiter prevents both:
//!
//! - Every request (a new session, or a command on an existing session) is
//!   sent as a message to a single Tokio task that owns the transport.  The
//!   task handles one message at a time, so there is never more than one
//!   exchange on the wire and requests are served in the order they arrived.
//! - Granting a session issues SELECT and bumps a [`GenerationCounter`].  Each
//!   [`SessionHandle`] remembers the generation it was granted under, so once
//!   anybody else is granted a session the old handle knows it is stale and
//!   refuses to send anything.
//! - The task also watches the transport's link state.  When the link drops it
//!   fails the exchange in progress and every queued request with
//!   [`SessionError::Disconnected`], retires the current session, and starts
//!   clean when the link comes back.
//!
//! ```text
//!  callers ──▶ Connection ──mpsc──▶ Arbiter task ──▶ Transport
//!                   ▲                    │
//!                   └──── oneshot ◀──────┘
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use keylink_core::{
    Aid, ApduError, ApduFormat, ChainStep, CommandApdu, Generation, GenerationCounter,
    ResponseApdu, ResponseChain, SessionKind, SessionState, SessionStateCell, StatusWord,
    TlvError,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::infrastructure::transport::{LinkState, Transport, TransportError};

// ── Errors ────────────────────────────────────────────────────────────────────

/// A frame or payload that could not be encoded or decoded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error(transparent)]
    Apdu(#[from] ApduError),
    #[error(transparent)]
    Tlv(#[from] TlvError),
}

/// Error type for every asynchronous session operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No key was connected when the request was made.
    #[error("no key is connected")]
    NotConnected,

    /// The link dropped before the operation completed.
    #[error("the key was disconnected")]
    Disconnected,

    /// SELECT was refused (`status` is set) or failed on the transport.
    #[error("selecting the {kind} application failed{}", describe_status(.status))]
    SelectionFailed {
        kind: SessionKind,
        status: Option<StatusWord>,
    },

    /// The handle was superseded, closed, or issued before a disconnect.
    #[error("session is no longer current")]
    SessionClosed,

    /// The transport failed for a reason other than a link drop.
    #[error("transport error: {0}")]
    Transport(#[source] TransportError),

    /// A frame or payload was malformed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The device answered with a status word other than `90 00`.
    #[error("device rejected the command with status {status}")]
    DeviceRejected { status: StatusWord },
}

fn describe_status(status: &Option<StatusWord>) -> String {
    status
        .map(|sw| format!(" with status {sw}"))
        .unwrap_or_default()
}

impl From<TransportError> for SessionError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::LinkDown => SessionError::Disconnected,
            other => SessionError::Transport(other),
        }
    }
}

impl From<ApduError> for SessionError {
    fn from(error: ApduError) -> Self {
        SessionError::Protocol(error.into())
    }
}

impl From<TlvError> for SessionError {
    fn from(error: TlvError) -> Self {
        SessionError::Protocol(error.into())
    }
}

// ── Completion ────────────────────────────────────────────────────────────────

/// The eventual result of a request submitted to the arbiter.
///
/// The request is queued when the `Completion` is created, not when it is
/// first polled, so submission order is call order.  Dropping it abandons the
/// result but does not cancel the request.
#[must_use = "the request is queued either way; await the completion to see its result"]
pub struct Completion<T> {
    state: CompletionState<T>,
}

enum CompletionState<T> {
    Ready(Option<Result<T, SessionError>>),
    Waiting(oneshot::Receiver<Result<T, SessionError>>),
}

impl<T> Completion<T> {
    fn ready(result: Result<T, SessionError>) -> Self {
        Self {
            state: CompletionState::Ready(Some(result)),
        }
    }

    fn waiting(rx: oneshot::Receiver<Result<T, SessionError>>) -> Self {
        Self {
            state: CompletionState::Waiting(rx),
        }
    }
}

impl<T> Unpin for Completion<T> {}

impl<T> Future for Completion<T> {
    type Output = Result<T, SessionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            CompletionState::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(SessionError::Disconnected)))
            }
            // A dropped sender means the connection task went away.
            CompletionState::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(SessionError::Disconnected))),
        }
    }
}

// ── Identity and options ──────────────────────────────────────────────────────

/// Identifies one [`Connection`] in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        f.write_str(&simple[..8])
    }
}

/// Tuning knobs for the arbiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArbiterOptions {
    /// Overrides the transport's own extended length report.
    pub extended_length: Option<bool>,
    /// Data bytes per frame when chaining.
    pub max_chunk_size: usize,
    /// GET RESPONSE rounds allowed per exchange.
    pub get_response_limit: usize,
    /// Reuse the current selection when the same application is requested
    /// again instead of sending SELECT.
    pub skip_redundant_select: bool,
}

impl Default for ArbiterOptions {
    fn default() -> Self {
        Self {
            extended_length: None,
            max_chunk_size: 255,
            get_response_limit: 64,
            skip_redundant_select: false,
        }
    }
}

// ── Shared state and messages ─────────────────────────────────────────────────

struct Shared {
    id: ConnectionId,
    generation: GenerationCounter,
    transport: Arc<dyn Transport>,
}

enum Command {
    RequestSession {
        kind: SessionKind,
        /// Handed to the new session so it can submit commands.
        commands: mpsc::UnboundedSender<Command>,
        reply: oneshot::Sender<Result<SessionHandle, SessionError>>,
    },
    Transceive {
        generation: Generation,
        state: Arc<SessionStateCell>,
        command: CommandApdu,
        reply: oneshot::Sender<Result<ResponseApdu, SessionError>>,
    },
}

impl Command {
    fn fail(self, error: SessionError) {
        // The caller may have stopped waiting; nothing to do then.
        match self {
            Command::RequestSession { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Command::Transceive { reply, .. } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

// ── Connection ────────────────────────────────────────────────────────────────

/// The client-facing side of one physical link.
///
/// Cheap to clone; every clone talks to the same arbiter task.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Connection {
    /// Starts the arbiter task for `transport`.
    ///
    /// Must be called from within a Tokio runtime.  The task stops once every
    /// clone of the connection and every session handle has been dropped.
    pub fn spawn(transport: Arc<dyn Transport>, options: ArbiterOptions) -> Self {
        let shared = Arc::new(Shared {
            id: ConnectionId::new(),
            generation: GenerationCounter::new(),
            transport: Arc::clone(&transport),
        });
        let (tx, rx) = mpsc::unbounded_channel();

        let link = transport.link_state();
        let up = *link.borrow() == LinkState::Up;
        let arbiter = Arbiter {
            shared: Arc::clone(&shared),
            options,
            link,
            link_open: true,
            up,
            lost: false,
            selected: None,
            active: None,
        };
        tokio::spawn(arbiter.run(rx));
        info!(connection = %shared.id, link_up = up, "connection task started");

        Self {
            shared,
            commands: tx,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn is_connected(&self) -> bool {
        self.shared.transport.is_connected()
    }

    /// The generation of the most recently granted session.
    pub fn generation(&self) -> Generation {
        self.shared.generation.current()
    }

    /// Queues a request for a session of `kind`.
    ///
    /// Resolves immediately with [`SessionError::NotConnected`] if the link
    /// is down.  Otherwise the request waits its turn behind earlier requests
    /// and commands, then SELECTs the application.
    pub fn request_session(&self, kind: SessionKind) -> Completion<SessionHandle> {
        if !self.is_connected() {
            debug!(connection = %self.shared.id, %kind, "session requested while not connected");
            return Completion::ready(Err(SessionError::NotConnected));
        }
        let (reply, rx) = oneshot::channel();
        let request = Command::RequestSession {
            kind,
            commands: self.commands.clone(),
            reply,
        };
        if self.commands.send(request).is_err() {
            return Completion::ready(Err(SessionError::Disconnected));
        }
        Completion::waiting(rx)
    }

    /// Callback form of [`request_session`](Self::request_session).
    ///
    /// `callback` runs exactly once, on a Tokio worker rather than the
    /// calling thread.
    pub fn request_session_with<F>(&self, kind: SessionKind, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<SessionHandle, SessionError>) + Send + 'static,
    {
        let completion = self.request_session(kind);
        tokio::spawn(async move { callback(completion.await) })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("generation", &self.shared.generation.current())
            .finish()
    }
}

// ── Session handle ────────────────────────────────────────────────────────────

/// One selected application.
///
/// Valid until another session is granted on the same connection, the link
/// drops, or [`close`](Self::close) is called.  After that every
/// [`transceive`](Self::transceive) fails with [`SessionError::SessionClosed`]
/// without touching the transport.
#[derive(Clone)]
pub struct SessionHandle {
    kind: SessionKind,
    generation: Generation,
    select_response: Arc<[u8]>,
    state: Arc<SessionStateCell>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn aid(&self) -> Aid {
        self.kind.aid()
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.shared.id
    }

    /// The data the application returned to SELECT.
    pub fn select_response(&self) -> &[u8] {
        &self.select_response
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Returns `true` while commands sent through this handle will be
    /// forwarded.
    pub fn is_valid(&self) -> bool {
        self.shared.generation.is_current(self.generation) && self.state.get().accepts_commands()
    }

    /// Queues `command` for the selected application.
    ///
    /// Commands are sent in submission order.  `61 XX` continuations are
    /// collected before the completion resolves; any other status word than
    /// `90 00` resolves to [`SessionError::DeviceRejected`].
    pub fn transceive(&self, command: CommandApdu) -> Completion<ResponseApdu> {
        if !self.is_valid() {
            debug!(
                connection = %self.shared.id,
                kind = %self.kind,
                generation = %self.generation,
                state = %self.state.get(),
                "rejecting command on stale session"
            );
            return Completion::ready(Err(SessionError::SessionClosed));
        }
        let (reply, rx) = oneshot::channel();
        let request = Command::Transceive {
            generation: self.generation,
            state: Arc::clone(&self.state),
            command,
            reply,
        };
        if self.commands.send(request).is_err() {
            return Completion::ready(Err(SessionError::Disconnected));
        }
        Completion::waiting(rx)
    }

    /// Marks the session closed.  Other clones of this handle stop working
    /// too; the application stays selected until the next request.
    pub fn close(self) {
        let _ = self.state.transition(SessionState::Closed);
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("connection", &self.shared.id)
            .field("kind", &self.kind)
            .field("generation", &self.generation)
            .field("state", &self.state.get())
            .finish()
    }
}

// ── Arbiter task ──────────────────────────────────────────────────────────────

struct Selection {
    aid: Aid,
    response: Arc<[u8]>,
}

struct Arbiter {
    shared: Arc<Shared>,
    options: ArbiterOptions,
    link: watch::Receiver<LinkState>,
    /// `false` once the transport dropped its link state sender.
    link_open: bool,
    up: bool,
    /// Set when an exchange noticed the link drop before the main loop did.
    lost: bool,
    selected: Option<Selection>,
    active: Option<Arc<SessionStateCell>>,
}

impl Arbiter {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                biased;

                changed = self.link.changed(), if self.link_open => {
                    if changed.is_err() {
                        warn!(connection = %self.shared.id, "transport closed its link state channel");
                        self.link_open = false;
                        self.link_lost(&mut rx);
                        continue;
                    }
                    let state = *self.link.borrow_and_update();
                    match state {
                        LinkState::Down => self.link_lost(&mut rx),
                        LinkState::Up => {
                            // Up while already up: the link bounced unseen.
                            if self.up {
                                self.link_lost(&mut rx);
                            }
                            self.link_restored();
                        }
                    }
                }

                command = rx.recv() => {
                    let Some(command) = command else { break };
                    self.dispatch(command).await;
                    if self.lost {
                        self.lost = false;
                        self.link_lost(&mut rx);
                        self.resync_link();
                    }
                }
            }
        }
        debug!(connection = %self.shared.id, "connection task stopped");
    }

    async fn dispatch(&mut self, command: Command) {
        if !self.up {
            command.fail(SessionError::Disconnected);
            return;
        }
        match command {
            Command::RequestSession {
                kind,
                commands,
                reply,
            } => {
                if reply.is_closed() {
                    debug!(connection = %self.shared.id, %kind, "requester gone; skipping");
                    return;
                }
                let result = self.grant(kind, commands).await;
                let _ = reply.send(result);
            }
            Command::Transceive {
                generation,
                state,
                command,
                reply,
            } => {
                // Closed while queued counts as stale too.
                let current = self.shared.generation.is_current(generation)
                    && state.get().accepts_commands();
                let result = if current {
                    self.transceive(&command).await
                } else {
                    Err(SessionError::SessionClosed)
                };
                let _ = reply.send(result);
            }
        }
    }

    async fn grant(
        &mut self,
        kind: SessionKind,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Result<SessionHandle, SessionError> {
        let state = Arc::new(SessionStateCell::new(SessionState::Unselected));
        let _ = state.transition(SessionState::Selecting);

        let reuse = match &self.selected {
            Some(selection) if self.options.skip_redundant_select && selection.aid == kind.aid() => {
                Some(Arc::clone(&selection.response))
            }
            _ => None,
        };
        let select_response = match reuse {
            Some(response) => {
                debug!(connection = %self.shared.id, %kind, "application already selected; skipping SELECT");
                response
            }
            None => match self.select(kind).await {
                Ok(response) => response,
                Err(error) => {
                    let _ = state.transition(SessionState::Closed);
                    return Err(error);
                }
            },
        };

        let generation = self.shared.generation.advance();
        self.retire_active(SessionState::Superseded);
        let _ = state.transition(SessionState::Active);
        self.active = Some(Arc::clone(&state));
        info!(connection = %self.shared.id, %kind, %generation, "session granted");

        Ok(SessionHandle {
            kind,
            generation,
            select_response,
            state,
            shared: Arc::clone(&self.shared),
            commands,
        })
    }

    async fn select(&mut self, kind: SessionKind) -> Result<Arc<[u8]>, SessionError> {
        let aid = kind.aid();
        let response = match self.exchange(&CommandApdu::select(&aid)).await {
            Ok(response) => response,
            Err(SessionError::Disconnected) => return Err(SessionError::Disconnected),
            Err(error) => {
                // The device state is unknown after a failed exchange.
                self.selected = None;
                warn!(connection = %self.shared.id, %kind, %error, "SELECT failed on the transport");
                return Err(SessionError::SelectionFailed { kind, status: None });
            }
        };

        if !response.is_success() {
            self.selected = None;
            warn!(
                connection = %self.shared.id,
                %kind,
                aid = %aid,
                status = %response.status(),
                "device refused SELECT"
            );
            return Err(SessionError::SelectionFailed {
                kind,
                status: Some(response.status()),
            });
        }

        let data: Arc<[u8]> = response.into_data().into();
        self.selected = Some(Selection {
            aid,
            response: Arc::clone(&data),
        });
        Ok(data)
    }

    async fn transceive(&mut self, command: &CommandApdu) -> Result<ResponseApdu, SessionError> {
        let response = self.exchange(command).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(SessionError::DeviceRejected {
                status: response.status(),
            })
        }
    }

    /// Sends one command, chaining or extending it as needed, and follows
    /// `61 XX` continuations until a terminal status word arrives.
    async fn exchange(&mut self, command: &CommandApdu) -> Result<ResponseApdu, SessionError> {
        let extended = self
            .options
            .extended_length
            .unwrap_or_else(|| self.shared.transport.supports_extended_length());
        let frames = command.to_frames(extended, self.options.max_chunk_size)?;
        let Some((last, leading)) = frames.split_last() else {
            return Err(ApduError::MalformedCommand("command produced no frames".into()).into());
        };

        for frame in leading {
            let response = self.round_trip(frame).await?;
            if !response.is_success() {
                // The device refused part of the chain.
                return Ok(response);
            }
        }

        let mut chain = ResponseChain::new(self.options.get_response_limit);
        let mut response = self.round_trip(last).await?;
        loop {
            match chain.push(response)? {
                ChainStep::Complete(done) => return Ok(done),
                ChainStep::Fetch(get_response) => {
                    response = self
                        .round_trip(&get_response.encode(ApduFormat::Short)?)
                        .await?;
                }
            }
        }
    }

    /// One frame out, one frame back.  Gives up as soon as the link drops.
    async fn round_trip(&mut self, frame: &[u8]) -> Result<ResponseApdu, SessionError> {
        let transport = Arc::clone(&self.shared.transport);
        // Own receiver, so changes stay unseen on `self.link`.
        let mut link = self.link.clone();
        let result = tokio::select! {
            biased;
            _ = wait_for_down(&mut link) => Err(TransportError::LinkDown),
            result = transport.transmit(frame) => result,
        };

        // A bounce during the exchange leaves the link up but resets the key.
        if !matches!(self.link.has_changed(), Ok(false)) {
            self.lost = true;
            return Err(SessionError::Disconnected);
        }

        let raw = match result {
            Ok(raw) => raw,
            Err(TransportError::LinkDown) => {
                self.lost = true;
                return Err(SessionError::Disconnected);
            }
            Err(error) => return Err(SessionError::Transport(error)),
        };

        let response = ResponseApdu::from_bytes(&raw)?;
        debug!(
            connection = %self.shared.id,
            ins = format_args!("0x{:02X}", frame.get(1).copied().unwrap_or_default()),
            sent = frame.len(),
            received = response.data().len(),
            status = %response.status(),
            "exchange"
        );
        Ok(response)
    }

    fn retire_active(&mut self, cause: SessionState) {
        // A client may already have closed it.
        let previous = self.active.take().filter(|cell| !cell.get().is_retired());
        if let Some(previous) = previous {
            if previous.transition(cause).is_ok() {
                debug!(connection = %self.shared.id, state = %cause, "previous session retired");
            }
        }
    }

    fn link_lost(&mut self, rx: &mut mpsc::UnboundedReceiver<Command>) {
        if self.up {
            self.up = false;
            self.selected = None;
            let generation = self.shared.generation.advance();
            self.retire_active(SessionState::Disconnected);
            info!(connection = %self.shared.id, %generation, "link down; sessions retired");
        }

        let mut drained = 0usize;
        while let Ok(command) = rx.try_recv() {
            command.fail(SessionError::Disconnected);
            drained += 1;
        }
        if drained > 0 {
            warn!(connection = %self.shared.id, drained, "queued requests failed after link loss");
        }
    }

    /// Catches up with the link after an exchange noticed it drop.
    fn resync_link(&mut self) {
        if !self.link_open {
            return;
        }
        if self.link.has_changed().is_err() {
            warn!(connection = %self.shared.id, "transport closed its link state channel");
            self.link_open = false;
            return;
        }
        if *self.link.borrow_and_update() == LinkState::Up {
            self.link_restored();
        }
    }

    fn link_restored(&mut self) {
        if !self.up {
            self.up = true;
            self.selected = None;
            info!(connection = %self.shared.id, "link up; starting clean");
        }
    }
}

async fn wait_for_down(link: &mut watch::Receiver<LinkState>) {
    // A closed channel counts as down.
    let _ = link.wait_for(|state| *state == LinkState::Down).await;
}

// ── Tests ─────────────────────────────────────────────────────────────────────

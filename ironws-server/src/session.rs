//! WebSocket sessions.
//!
//! A [`Session`] is the application's handle to one accepted connection.
//! The connection is split in two halves, each driven by its own task on
//! the execution context:
//!
//! - the reader task owns the read half and reads one message at a time.
//!   Messages that arrive before a message handler is registered are
//!   buffered and delivered in order once one is.
//! - the writer task owns the write half and drains the outbound queue one
//!   write at a time.
//!
//! Both tasks hold a reference to the shared session state, as does every
//! application clone of [`Session`]. The state is released when all of them
//! are gone. Dropping every application clone does not close a session
//! that has a message handler: the pending read keeps it alive until the
//! peer closes. A session released without ever getting a handler is
//! closed.

use crate::config::WritePolicy;
use crate::context::ContextHandle;
use crate::error::{LifecycleError, SessionError};
use crate::listener::ConnectionSlot;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use ironws_transport::tcp::{WsMessage, WsStream, is_connection_closed};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_util::sync::CancellationToken;

/// Session identifier, unique per listener.
pub type SessionId = u64;

type MessageHandler = Arc<dyn Fn(&str) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&SessionError) + Send + Sync>;
type CloseHandler = Box<dyn FnOnce() + Send>;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The WebSocket handshake is in progress.
    Connecting,
    /// Messages can be sent and received.
    Open,
    /// Shutdown started; outstanding operations are finishing.
    Closing,
    /// All operations finished and resources were released.
    Closed,
}

/// Per-session settings taken from the server configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionSettings {
    pub(crate) write_policy: WritePolicy,
    pub(crate) close_timeout: Duration,
}

#[derive(Default)]
struct Callbacks {
    on_message: Option<MessageHandler>,
    on_error: Option<ErrorHandler>,
    on_close: Option<CloseHandler>,
}

struct SessionShared {
    id: SessionId,
    peer_addr: SocketAddr,
    settings: SessionSettings,
    state: Mutex<SessionState>,
    callbacks: Mutex<Callbacks>,
    // Messages read before a message handler was registered.
    pending: Mutex<VecDeque<String>>,
    outbound: mpsc::UnboundedSender<String>,
    write_busy: AtomicBool,
    close: CancellationToken,
    closed_by_peer: AtomicBool,
    // Wakes the reader when a handler is registered or the app lets go.
    wake: Notify,
    released: AtomicBool,
    live_tasks: AtomicUsize,
    slot: Mutex<Option<ConnectionSlot>>,
}

impl SessionShared {
    fn new(
        id: SessionId,
        peer_addr: SocketAddr,
        settings: SessionSettings,
        close: CancellationToken,
        slot: Option<ConnectionSlot>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Self {
            id,
            peer_addr,
            settings,
            state: Mutex::new(SessionState::Connecting),
            callbacks: Mutex::new(Callbacks::default()),
            pending: Mutex::new(VecDeque::new()),
            outbound,
            write_busy: AtomicBool::new(false),
            close,
            closed_by_peer: AtomicBool::new(false),
            wake: Notify::new(),
            released: AtomicBool::new(false),
            live_tasks: AtomicUsize::new(0),
            slot: Mutex::new(slot),
        });
        (shared, rx)
    }

    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn send(&self, text: String) -> Result<(), SessionError> {
        if self.state() != SessionState::Open {
            return Err(SessionError::Closed);
        }
        if self.settings.write_policy == WritePolicy::Reject
            && self.write_busy.swap(true, Ordering::AcqRel)
        {
            return Err(SessionError::WriteInProgress);
        }
        self.outbound.send(text).map_err(|_| {
            self.write_busy.store(false, Ordering::Release);
            SessionError::Closed
        })
    }

    /// Moves an active session to `Closing` and stops both tasks.
    fn begin_close(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, SessionState::Connecting | SessionState::Open) {
                *state = SessionState::Closing;
                tracing::debug!(session_id = self.id, peer = %self.peer_addr, "session closing");
            }
        }
        self.close.cancel();
    }

    /// Runs once, when the last I/O task exits.
    fn finish(&self) {
        self.close.cancel();
        *self.state.lock() = SessionState::Closed;
        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        self.pending.lock().clear();
        self.slot.lock().take();
        tracing::debug!(session_id = self.id, peer = %self.peer_addr, "session closed");

        if let Some(on_close) = callbacks.on_close {
            on_close();
        }
        // Dropping the remaining callbacks releases any Session they captured.
    }

    fn report(&self, error: SessionError) {
        tracing::error!(session_id = self.id, peer = %self.peer_addr, error = %error, "session error");
        let handler = self.callbacks.lock().on_error.clone();
        if let Some(handler) = handler {
            handler(&error);
        }
    }

    fn deliver(&self, text: &str) {
        let handler = self.callbacks.lock().on_message.clone();
        match handler {
            Some(handler) => {
                self.drain_pending(&handler);
                handler(text);
            }
            None => self.pending.lock().push_back(text.to_owned()),
        }
    }

    /// Delivers buffered messages if a message handler is registered.
    fn flush_pending(&self) {
        let handler = self.callbacks.lock().on_message.clone();
        if let Some(handler) = handler {
            self.drain_pending(&handler);
        }
    }

    fn drain_pending(&self, handler: &MessageHandler) {
        loop {
            let Some(text) = self.pending.lock().pop_front() else {
                break;
            };
            handler(&text);
        }
    }

    /// Handles one inbound message. Returns false once the peer sent Close.
    fn dispatch(&self, message: WsMessage) -> bool {
        match message {
            WsMessage::Text(text) => self.deliver(text.as_str()),
            WsMessage::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => self.deliver(text),
                Err(e) => self.report(SessionError::InvalidUtf8(e)),
            },
            WsMessage::Close(frame) => {
                tracing::debug!(session_id = self.id, ?frame, "close frame received");
                self.closed_by_peer.store(true, Ordering::Release);
                return false;
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
        }
        true
    }

    /// True once the application dropped every handle without ever
    /// registering a message handler.
    fn abandoned(&self) -> bool {
        self.released.load(Ordering::Acquire) && self.callbacks.lock().on_message.is_none()
    }

    /// Stores a callback unless the session already closed.
    fn register(&self, store: impl FnOnce(&mut Callbacks)) -> bool {
        let mut callbacks = self.callbacks.lock();
        if self.state() == SessionState::Closed {
            return false;
        }
        store(&mut callbacks);
        true
    }
}

/// Keeps the session state alive while an I/O task runs.
struct TaskGuard(Arc<SessionShared>);

impl TaskGuard {
    fn new(shared: &Arc<SessionShared>) -> Self {
        shared.live_tasks.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(shared))
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.0.live_tasks.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.finish();
        }
    }
}

/// Marks the moment the application lets go of every handle.
struct AppLease(Arc<SessionShared>);

impl Drop for AppLease {
    fn drop(&mut self) {
        self.0.released.store(true, Ordering::Release);
        self.0.wake.notify_one();
    }
}

/// Application handle to a WebSocket connection.
///
/// Cheap to clone; all clones refer to the same connection. `send`,
/// `close` and the callback setters may be called from any thread.
/// Callbacks run on the execution context's worker thread.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
    _lease: Arc<AppLease>,
}

impl Session {
    /// Starts the I/O tasks for an upgraded connection and returns the
    /// open session.
    ///
    /// # Errors
    /// Returns [`LifecycleError::Stopped`] if the context is shutting down;
    /// the connection is dropped in that case.
    pub(crate) fn open(
        ws: WsStream,
        id: SessionId,
        peer_addr: SocketAddr,
        context: &ContextHandle,
        settings: SessionSettings,
        slot: ConnectionSlot,
    ) -> Result<Self, LifecycleError> {
        let close = context.shutdown_token().child_token();
        let (shared, outbound) = SessionShared::new(id, peer_addr, settings, close, Some(slot));
        let (sink, stream) = ws.split();

        *shared.state.lock() = SessionState::Open;
        let writer = write_loop(TaskGuard::new(&shared), sink, outbound);
        let reader = read_loop(TaskGuard::new(&shared), stream);
        context.spawn(writer)?;
        context.spawn(reader)?;

        tracing::debug!(session_id = id, peer = %peer_addr, "session open");
        Ok(Self::from_shared(shared))
    }

    fn from_shared(shared: Arc<SessionShared>) -> Self {
        let lease = Arc::new(AppLease(Arc::clone(&shared)));
        Self {
            shared,
            _lease: lease,
        }
    }

    /// Returns the session ID.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// Returns the peer address.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Returns true while messages can be sent.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Queues a text message and returns without waiting for the write.
    ///
    /// With [`WritePolicy::Queue`] messages are written in submission order.
    /// With [`WritePolicy::Reject`] a send issued before the previous write
    /// completed fails. Write failures after this returns are reported to
    /// the error handler, not here.
    ///
    /// # Errors
    /// Returns [`SessionError::Closed`] unless the session is open, and
    /// [`SessionError::WriteInProgress`] under the reject policy.
    pub fn send(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.shared.send(text.into())
    }

    /// Registers the message handler, replacing any previous one.
    ///
    /// Messages received before the first handler was registered are
    /// delivered to it first, in order. A replacement applies from the next
    /// message. Ignored once the session closed.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let handler: MessageHandler = Arc::new(handler);
        if self.shared.register(|cb| cb.on_message = Some(handler)) {
            self.shared.wake.notify_one();
        }
    }

    /// Registers the error handler for asynchronous read and write errors.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&SessionError) + Send + Sync + 'static,
    {
        let handler: ErrorHandler = Arc::new(handler);
        self.shared.register(|cb| cb.on_error = Some(handler));
    }

    /// Registers a handler run once when the session reaches `Closed`.
    ///
    /// Runs immediately if the session already closed.
    pub fn on_close<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut handler = Some(handler);
        self.shared.register(|cb| {
            if let Some(h) = handler.take() {
                cb.on_close = Some(Box::new(h));
            }
        });
        if let Some(h) = handler {
            h();
        }
    }

    /// Starts closing the session.
    ///
    /// Messages queued before the call are still written, followed by a
    /// Close frame. Idempotent.
    pub fn close(&self) {
        self.shared.begin_close();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("peer_addr", &self.shared.peer_addr)
            .field("state", &self.shared.state())
            .finish()
    }
}

async fn read_loop(guard: TaskGuard, mut stream: SplitStream<WsStream>) {
    let shared = &guard.0;

    loop {
        if shared.abandoned() {
            tracing::debug!(session_id = shared.id, "released without a message handler");
            break;
        }

        let next = tokio::select! {
            biased;
            () = shared.close.cancelled() => break,
            () = shared.wake.notified() => {
                shared.flush_pending();
                continue;
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(message)) => {
                if !shared.dispatch(message) {
                    break;
                }
            }
            Some(Err(e)) if is_connection_closed(&e) => {
                tracing::debug!(session_id = shared.id, error = %e, "connection closed by peer");
                shared.closed_by_peer.store(true, Ordering::Release);
                break;
            }
            Some(Err(e)) => {
                shared.report(SessionError::Read(e));
                break;
            }
            None => {
                shared.closed_by_peer.store(true, Ordering::Release);
                break;
            }
        }
    }

    shared.begin_close();
}

async fn write_loop(
    guard: TaskGuard,
    mut sink: SplitSink<WsStream, WsMessage>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    let shared = &guard.0;
    let close_timeout = shared.settings.close_timeout;

    loop {
        let text = tokio::select! {
            biased;
            text = outbound.recv() => text,
            () = shared.close.cancelled() => None,
        };
        let Some(text) = text else { break };
        if shared.closed_by_peer.load(Ordering::Acquire) {
            break;
        }

        // A write in flight when the session starts closing gets
        // `close_timeout` to finish.
        let result = tokio::select! {
            result = sink.send(WsMessage::text(text)) => result,
            () = async {
                shared.close.cancelled().await;
                tokio::time::sleep(close_timeout).await;
            } => {
                tracing::debug!(session_id = shared.id, "write abandoned while closing");
                return;
            }
        };
        shared.write_busy.store(false, Ordering::Release);

        if let Err(e) = result {
            if is_connection_closed(&e) {
                tracing::debug!(session_id = shared.id, error = %e, "connection closed during write");
            } else {
                shared.report(SessionError::Write(e));
            }
            shared.begin_close();
            return;
        }
    }

    outbound.close();
    let drain = !shared.closed_by_peer.load(Ordering::Acquire);
    let closing = flush_and_close(&mut sink, &mut outbound, drain);

    match tokio::time::timeout(close_timeout, closing).await {
        Ok(Ok(())) => tracing::debug!(session_id = shared.id, "close handshake sent"),
        Ok(Err(e)) if is_connection_closed(&e) => {}
        Ok(Err(e)) => tracing::debug!(session_id = shared.id, error = %e, "close failed"),
        Err(_) => tracing::debug!(session_id = shared.id, "close timed out"),
    }
}

/// Writes messages queued before the close, if `drain`, then the Close frame.
async fn flush_and_close(
    sink: &mut SplitSink<WsStream, WsMessage>,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    drain: bool,
) -> Result<(), WsError> {
    if drain {
        while let Ok(text) = outbound.try_recv() {
            sink.send(WsMessage::text(text)).await?;
        }
    }
    sink.close().await
}

#[cfg(test)]
impl Session {
    /// Builds a session with no connection behind it.
    fn detached(
        policy: WritePolicy,
    ) -> (Self, Arc<SessionShared>, mpsc::UnboundedReceiver<String>) {
        let settings = SessionSettings {
            write_policy: policy,
            close_timeout: Duration::from_millis(100),
        };
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let (shared, rx) = SessionShared::new(7, peer, settings, CancellationToken::new(), None);
        (Self::from_shared(Arc::clone(&shared)), shared, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_send_before_open_fails() {
        let (session, _shared, _rx) = Session::detached(WritePolicy::Queue);
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(matches!(session.send("early"), Err(SessionError::Closed)));
    }

    #[test]
    fn test_queue_policy_keeps_order() {
        let (session, shared, mut rx) = Session::detached(WritePolicy::Queue);
        *shared.state.lock() = SessionState::Open;

        for i in 0..5 {
            session.send(format!("msg-{i}")).unwrap();
        }
        for i in 0..5 {
            assert_eq!(rx.try_recv().unwrap(), format!("msg-{i}"));
        }
    }

    #[test]
    fn test_reject_policy_refuses_overlap() {
        let (session, shared, mut rx) = Session::detached(WritePolicy::Reject);
        *shared.state.lock() = SessionState::Open;

        session.send("first").unwrap();
        assert!(matches!(
            session.send("second"),
            Err(SessionError::WriteInProgress)
        ));

        // The writer clears the flag once the write completes.
        assert_eq!(rx.try_recv().unwrap(), "first");
        shared.write_busy.store(false, Ordering::Release);
        session.send("third").unwrap();
        assert_eq!(rx.try_recv().unwrap(), "third");
    }

    #[test]
    fn test_close_moves_to_closing() {
        let (session, shared, _rx) = Session::detached(WritePolicy::Queue);
        *shared.state.lock() = SessionState::Open;

        session.close();
        assert_eq!(session.state(), SessionState::Closing);
        assert!(shared.close.is_cancelled());
        assert!(matches!(session.send("late"), Err(SessionError::Closed)));

        session.close();
        assert_eq!(session.state(), SessionState::Closing);
    }

    #[test]
    fn test_last_task_finishes_session() {
        let (session, shared, _rx) = Session::detached(WritePolicy::Queue);
        *shared.state.lock() = SessionState::Open;

        let closes = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&closes);
        session.on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let reader = TaskGuard::new(&shared);
        let writer = TaskGuard::new(&shared);
        drop(reader);
        assert_ne!(session.state(), SessionState::Closed);
        drop(writer);

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_finish_releases_handler_cycle() {
        let (session, shared, _rx) = Session::detached(WritePolicy::Queue);
        *shared.state.lock() = SessionState::Open;

        let captured = session.clone();
        session.on_message(move |text| {
            let _ = captured.send(text);
        });
        drop(session);
        assert!(!shared.released.load(Ordering::Acquire));

        drop(TaskGuard::new(&shared));
        assert!(shared.callbacks.lock().on_message.is_none());
        assert!(shared.released.load(Ordering::Acquire));
    }

    #[test]
    fn test_callbacks_after_close() {
        let (session, shared, _rx) = Session::detached(WritePolicy::Queue);
        drop(TaskGuard::new(&shared));
        assert_eq!(session.state(), SessionState::Closed);

        session.on_message(|_| {});
        assert!(shared.callbacks.lock().on_message.is_none());

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        session.on_close(move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_dispatch_text_and_binary() {
        let (session, shared, _rx) = Session::detached(WritePolicy::Queue);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        session.on_message(move |text| sink.lock().push(text.to_string()));

        let errors = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&errors);
        session.on_error(move |err| {
            assert!(matches!(err, SessionError::InvalidUtf8(_)));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(shared.dispatch(WsMessage::text("hello")));
        assert!(shared.dispatch(WsMessage::binary(b"bytes".to_vec())));
        assert!(shared.dispatch(WsMessage::binary(vec![0xff, 0xfe])));
        assert!(!shared.dispatch(WsMessage::Close(None)));

        assert_eq!(*received.lock(), vec!["hello".to_string(), "bytes".to_string()]);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(shared.closed_by_peer.load(Ordering::Acquire));
    }

    #[test]
    fn test_replacing_handler() {
        let (session, shared, _rx) = Session::detached(WritePolicy::Queue);
        let hits = Arc::new(AtomicU32::new(0));

        let first = Arc::clone(&hits);
        session.on_message(move |_| {
            first.fetch_add(1, Ordering::SeqCst);
        });
        let second = Arc::clone(&hits);
        session.on_message(move |_| {
            second.fetch_add(100, Ordering::SeqCst);
        });

        shared.dispatch(WsMessage::text("x"));
        assert_eq!(hits.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_messages_buffered_until_handler() {
        let (session, shared, _rx) = Session::detached(WritePolicy::Queue);
        assert!(shared.dispatch(WsMessage::text("first")));
        assert!(shared.dispatch(WsMessage::binary(b"second".to_vec())));
        assert_eq!(shared.pending.lock().len(), 2);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        session.on_message(move |text| sink.lock().push(text.to_string()));
        shared.flush_pending();
        assert!(shared.pending.lock().is_empty());

        shared.dispatch(WsMessage::text("third"));
        assert_eq!(*received.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_buffered_messages_precede_new_ones() {
        let (session, shared, _rx) = Session::detached(WritePolicy::Queue);
        shared.dispatch(WsMessage::text("early"));

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        session.on_message(move |text| sink.lock().push(text.to_string()));

        // The reader has not flushed yet when the next message arrives.
        shared.dispatch(WsMessage::text("late"));
        assert_eq!(*received.lock(), vec!["early", "late"]);
    }

    #[test]
    fn test_abandoned_without_handler() {
        let (session, shared, _rx) = Session::detached(WritePolicy::Queue);
        assert!(!shared.abandoned());
        drop(session);
        assert!(shared.abandoned());
    }

    #[test]
    fn test_not_abandoned_with_handler() {
        let (session, shared, _rx) = Session::detached(WritePolicy::Queue);
        session.on_message(|_| {});
        drop(session);
        assert!(shared.released.load(Ordering::Acquire));
        assert!(!shared.abandoned());
    }

    #[test]
    fn test_session_debug() {
        let (session, _shared, _rx) = Session::detached(WritePolicy::Queue);
        let debug_str = format!("{:?}", session);
        assert!(debug_str.contains("Session"));
        assert!(debug_str.contains("Connecting"));
        assert_eq!(session.id(), 7);
        assert_eq!(session.peer_addr().port(), 40000);
    }
}

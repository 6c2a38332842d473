//! One connection's lifecycle: handshake, the active read loop, and the
//! disconnect path.
//!
//! A [`Session`] is shared (behind an `Arc`) between its own read task and any
//! router invocation that delivers to it. Reads are owned by the task running
//! [`serve`]; writes go through [`Session::send`], which serializes them under
//! a per-session lock.

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc, Mutex, OnceLock, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use crate::{
    error::SessionError,
    protocol::{ClientFrame, ServerFrame, parse_handshake, read_line, write_line},
    router::Router,
};

pub type SessionId = u64;

type FrameWriter = Box<dyn AsyncWrite + Send + Unpin>;

const DUPLICATE_NOTICE: &str = "Username already taken. Please choose another one.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Registering,
    Active,
    Disconnecting,
    Closed,
}

pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    username: OnceLock<String>,
    active: AtomicBool,
    finished: AtomicBool,
    state: Mutex<SessionState>,
    writer: tokio::sync::Mutex<Option<FrameWriter>>,
}

impl Session {
    pub fn new<W>(id: SessionId, writer: W, peer: Option<SocketAddr>) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id,
            peer,
            username: OnceLock::new(),
            active: AtomicBool::new(true),
            finished: AtomicBool::new(false),
            state: Mutex::new(SessionState::Connecting),
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn username(&self) -> Option<&str> {
        self.username.get().map(String::as_str)
    }

    /// Returns `false` if the session already carries a name.
    pub(crate) fn assign_username(&self, name: &str) -> bool {
        self.username.set(name.to_string()).is_ok()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: SessionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Writes one frame to the peer. Returns whether the frame was written.
    ///
    /// Inactive sessions drop the frame silently. A failed write marks the
    /// session inactive; nothing is retried.
    pub async fn send(&self, frame: &ServerFrame) -> bool {
        self.send_line(&frame.to_string()).await
    }

    pub(crate) async fn send_line(&self, line: &str) -> bool {
        if !self.is_active() {
            return false;
        }

        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return false;
        };

        match write_line(sink, line).await {
            Ok(()) => true,
            Err(error) => {
                debug!(session = self.id, ?error, "failed to deliver frame");
                self.active.store(false, Ordering::Release);
                false
            }
        }
    }

    /// Marks the session inactive and shuts its writer down. Safe to call
    /// more than once.
    pub async fn close(&self) {
        self.active.store(false, Ordering::Release);
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(error) = writer.shutdown().await {
                debug!(session = self.id, ?error, "failed to shut down writer");
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("username", &self.username())
            .field("active", &self.is_active())
            .field("state", &self.state())
            .finish()
    }
}

/// Drives a connection from handshake to close.
///
/// Every exit path, including handshake rejection and I/O errors, goes
/// through [`disconnect`] before this returns.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    peer: Option<SocketAddr>,
    router: &Router,
) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let registry = router.registry();
    let session = Arc::new(Session::new(registry.next_id(), writer, peer));
    registry.track(Arc::clone(&session));

    let mut reader = BufReader::new(reader);
    let outcome = match perform_handshake(&session, &mut reader, router).await {
        Ok(()) => run_active(&session, &mut reader, router).await,
        Err(error) => Err(error),
    };

    disconnect(&session, router).await;
    outcome
}

async fn perform_handshake<R>(
    session: &Arc<Session>,
    reader: &mut R,
    router: &Router,
) -> Result<(), SessionError>
where
    R: AsyncBufRead + Unpin,
{
    session.set_state(SessionState::Registering);

    let line = read_line(reader).await?.ok_or(SessionError::Handshake)?;
    let name = parse_handshake(&line)
        .ok_or(SessionError::Handshake)?
        .to_string();

    if let Err(error) = router.registry().register(&name, session) {
        debug!(peer = ?session.peer(), %error, "rejecting handshake");
        session
            .send(&ServerFrame::ErrorNotice(DUPLICATE_NOTICE.to_string()))
            .await;
        return Err(SessionError::DuplicateUsername(name));
    }

    session.set_state(SessionState::Active);
    info!(peer = ?session.peer(), username = %name, "client joined");

    session
        .send(&ServerFrame::SystemNotice(format!(
            "Welcome to the chat, {name}!"
        )))
        .await;
    router
        .broadcast_notice(&format!("{name} joined the chat"), Some(session.id()))
        .await;
    router.sync_user_list().await;

    Ok(())
}

async fn run_active<R>(session: &Session, reader: &mut R, router: &Router) -> Result<(), SessionError>
where
    R: AsyncBufRead + Unpin,
{
    while session.is_active() {
        let Some(line) = read_line(reader).await? else {
            break;
        };
        match ClientFrame::parse(&line) {
            ClientFrame::Quit => break,
            ClientFrame::Command(command) => {
                if let Err(error) = router.handle_command(session, command).await {
                    debug!(session = session.id(), %error, "command rejected");
                }
            }
            ClientFrame::PrivateText { recipient, text } => {
                if let Err(error) = router.send_private_text(session, &recipient, &text).await {
                    debug!(session = session.id(), %error, "private message not delivered");
                }
            }
            ClientFrame::PrivateImage { recipient, payload } => {
                if let Err(error) = router
                    .send_private_image(session, &recipient, &payload)
                    .await
                {
                    debug!(session = session.id(), %error, "private image not delivered");
                }
            }
            ClientFrame::BroadcastImage { payload } => {
                router.broadcast_image(session, &payload).await;
            }
            ClientFrame::Chat { text } => {
                router.broadcast_text(session, &text).await;
            }
            ClientFrame::Malformed { line } => {
                debug!(session = session.id(), %line, "ignoring malformed frame");
            }
        }
    }

    Ok(())
}

/// Tears a session down: releases its username, tells everyone else, and
/// closes the socket. Only the first call has any effect.
pub async fn disconnect(session: &Session, router: &Router) {
    if session.finished.swap(true, Ordering::AcqRel) {
        return;
    }
    session.set_state(SessionState::Disconnecting);

    let registry = router.registry();
    registry.untrack(session.id());

    if let Some(name) = session.username() {
        if registry.deregister(name, session.id()) {
            info!(peer = ?session.peer(), username = %name, "client disconnected");
        }
        router
            .broadcast_notice(&format!("{name} left the chat"), Some(session.id()))
            .await;
        router.sync_user_list().await;
    }

    session.close().await;
    session.set_state(SessionState::Closed);
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::{
        io::{BufReader, DuplexStream, ReadHalf, WriteHalf},
        task::JoinHandle,
        time::timeout,
    };

    use super::*;
    use crate::registry::Registry;

    struct Client {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn send(&mut self, line: &str) {
            write_line(&mut self.writer, line).await.expect("client write");
        }

        async fn recv(&mut self) -> Option<String> {
            timeout(Duration::from_secs(1), read_line(&mut self.reader))
                .await
                .expect("timed out waiting for frame")
                .expect("client read")
        }
    }

    fn connect(router: &Router) -> (Client, JoinHandle<Result<(), SessionError>>) {
        let (client, server) = tokio::io::duplex(4096);
        let (server_reader, server_writer) = tokio::io::split(server);
        let router = router.clone();
        let task =
            tokio::spawn(async move { serve(server_reader, server_writer, None, &router).await });

        let (reader, writer) = tokio::io::split(client);
        let client = Client {
            reader: BufReader::new(reader),
            writer,
        };
        (client, task)
    }

    async fn join(router: &Router, name: &str) -> (Client, JoinHandle<Result<(), SessionError>>) {
        let (mut client, task) = connect(router);
        client.send(&format!("USERNAME:{name}")).await;
        assert_eq!(
            client.recv().await.as_deref(),
            Some(format!("SYSTEM:Welcome to the chat, {name}!").as_str())
        );
        (client, task)
    }

    #[tokio::test]
    async fn malformed_handshake_closes_silently() {
        let router = Router::new(Arc::new(Registry::new()));
        let (mut client, task) = connect(&router);

        client.send("hello there").await;

        assert_eq!(client.recv().await, None);
        assert!(matches!(
            task.await.expect("session task"),
            Err(SessionError::Handshake)
        ));
        assert_eq!(router.registry().tracked_count(), 0);
        assert_eq!(router.registry().online_count(), 0);
    }

    #[tokio::test]
    async fn end_of_stream_before_handshake_is_a_handshake_error() {
        let router = Router::new(Arc::new(Registry::new()));
        let (client, task) = connect(&router);

        drop(client);

        assert!(matches!(
            task.await.expect("session task"),
            Err(SessionError::Handshake)
        ));
        assert_eq!(router.registry().tracked_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected_without_touching_holder() {
        let router = Router::new(Arc::new(Registry::new()));
        let (mut alice, _alice_task) = join(&router, "alice").await;
        assert_eq!(alice.recv().await.as_deref(), Some("USERS_LIST:alice"));
        let holder = router.registry().lookup("alice").expect("alice online");

        let (mut impostor, impostor_task) = connect(&router);
        impostor.send("USERNAME:alice").await;

        assert_eq!(
            impostor.recv().await.as_deref(),
            Some("ERROR:Username already taken. Please choose another one.")
        );
        assert_eq!(impostor.recv().await, None);
        assert!(matches!(
            impostor_task.await.expect("session task"),
            Err(SessionError::DuplicateUsername(name)) if name == "alice"
        ));

        let still_holder = router.registry().lookup("alice").expect("alice online");
        assert_eq!(still_holder.id(), holder.id());
        assert_eq!(still_holder.state(), SessionState::Active);

        alice.send("/users").await;
        assert_eq!(alice.recv().await.as_deref(), Some("USERLIST:alice"));
    }

    #[tokio::test]
    async fn join_and_quit_notify_other_sessions() {
        let router = Router::new(Arc::new(Registry::new()));
        let (mut alice, alice_task) = join(&router, "alice").await;
        assert_eq!(alice.recv().await.as_deref(), Some("USERS_LIST:alice"));

        let (mut bob, _bob_task) = join(&router, "bob").await;
        assert_eq!(bob.recv().await.as_deref(), Some("USERS_LIST:alice,bob"));
        assert_eq!(
            alice.recv().await.as_deref(),
            Some("SYSTEM:bob joined the chat")
        );
        assert_eq!(alice.recv().await.as_deref(), Some("USERS_LIST:alice,bob"));

        alice.send("/quit").await;

        assert!(alice_task.await.expect("session task").is_ok());
        assert_eq!(alice.recv().await, None);
        assert_eq!(
            bob.recv().await.as_deref(),
            Some("SYSTEM:alice left the chat")
        );
        assert_eq!(bob.recv().await.as_deref(), Some("USERS_LIST:bob"));
        assert!(!router.registry().is_online("alice"));
    }

    #[tokio::test]
    async fn dropped_connection_runs_cleanup() {
        let router = Router::new(Arc::new(Registry::new()));
        let (mut bob, _bob_task) = join(&router, "bob").await;
        assert_eq!(bob.recv().await.as_deref(), Some("USERS_LIST:bob"));

        let (mut carol, carol_task) = join(&router, "carol").await;
        assert_eq!(carol.recv().await.as_deref(), Some("USERS_LIST:bob,carol"));
        assert_eq!(
            bob.recv().await.as_deref(),
            Some("SYSTEM:carol joined the chat")
        );
        assert_eq!(bob.recv().await.as_deref(), Some("USERS_LIST:bob,carol"));

        drop(carol);

        assert!(carol_task.await.expect("session task").is_ok());
        assert_eq!(
            bob.recv().await.as_deref(),
            Some("SYSTEM:carol left the chat")
        );
        assert_eq!(bob.recv().await.as_deref(), Some("USERS_LIST:bob"));
    }

    #[tokio::test]
    async fn whitespace_lines_are_broadcast_as_chat() {
        let router = Router::new(Arc::new(Registry::new()));
        let (mut alice, _alice_task) = join(&router, "alice").await;
        assert_eq!(alice.recv().await.as_deref(), Some("USERS_LIST:alice"));
        let (mut bob, _bob_task) = join(&router, "bob").await;
        assert_eq!(bob.recv().await.as_deref(), Some("USERS_LIST:alice,bob"));

        alice.send("   ").await;
        alice.send("").await;

        assert_eq!(bob.recv().await.as_deref(), Some("alice:    "));
        assert_eq!(bob.recv().await.as_deref(), Some("alice: "));
    }

    #[tokio::test]
    async fn failed_write_marks_session_inactive() {
        let (client, server) = tokio::io::duplex(1024);
        let session = Session::new(1, server, None);
        drop(client);

        assert!(!session.send(&ServerFrame::SystemNotice("hi".into())).await);
        assert!(!session.is_active());
        assert!(!session.send(&ServerFrame::SystemNotice("again".into())).await);
    }

    #[tokio::test]
    async fn disconnect_runs_once() {
        let registry = Arc::new(Registry::new());
        let router = Router::new(Arc::clone(&registry));

        let (observer_end, observer_server) = tokio::io::duplex(4096);
        let observer = Arc::new(Session::new(registry.next_id(), observer_server, None));
        registry.track(Arc::clone(&observer));
        registry.register("bob", &observer).expect("register bob");

        let leaving = Arc::new(Session::new(registry.next_id(), tokio::io::sink(), None));
        registry.track(Arc::clone(&leaving));
        registry.register("dave", &leaving).expect("register dave");

        disconnect(&leaving, &router).await;
        disconnect(&leaving, &router).await;

        assert_eq!(leaving.state(), SessionState::Closed);
        assert!(!leaving.is_active());
        assert!(!registry.is_online("dave"));

        observer.close().await;
        let mut reader = BufReader::new(observer_end);
        let mut received = Vec::new();
        while let Some(line) = read_line(&mut reader).await.expect("read") {
            received.push(line);
        }
        assert_eq!(received, vec!["SYSTEM:dave left the chat", "USERS_LIST:bob"]);
    }

    #[tokio::test]
    async fn send_after_close_is_a_no_op() {
        let (client, server) = tokio::io::duplex(1024);
        let session = Session::new(1, server, None);

        assert!(session.send(&ServerFrame::SystemNotice("hi".into())).await);
        session.close().await;
        session.close().await;
        assert!(!session.send(&ServerFrame::SystemNotice("late".into())).await);

        let mut reader = BufReader::new(client);
        assert_eq!(
            read_line(&mut reader).await.expect("read").as_deref(),
            Some("SYSTEM:hi")
        );
        assert_eq!(read_line(&mut reader).await.expect("read"), None);
    }
}

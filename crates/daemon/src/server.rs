//! Unix domain socket server for client connections.
//!
//! Every connection gets its own task that reads framed packets and writes
//! replies. Requests are funnelled through a channel to the server loop,
//! which owns the [`Service`] and hands it one request at a time, between
//! status ticks and driver events.

use crate::locks::UNKNOWN_UID;
use openct_protocol::{ByteOrder, Error, FramedMessage, Header};
use std::future::Future;
use std::io::{self, ErrorKind};
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::unix::{AsyncFd, AsyncFdReadyGuard};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

/// Identity of one accepted connection. Never reused while the server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(u64);

impl SocketId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

/// A connected client as seen by a [`Service`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub id: SocketId,
    /// Uid reported by the kernel, or [`UNKNOWN_UID`].
    pub uid: u32,
}

/// What the server runs on behalf of its clients.
pub trait Service {
    /// Handle one request payload.
    ///
    /// An error becomes the reply's error code with an empty payload.
    fn process(&mut self, peer: &Peer, payload: &[u8]) -> openct_protocol::Result<Vec<u8>>;

    /// `peer` has disconnected.
    fn closed(&mut self, _peer: &Peer) {}

    /// Called once per poll interval. An error stops the server.
    fn tick(&mut self) -> openct_protocol::Result<()> {
        Ok(())
    }

    /// Extra descriptor to watch for readability.
    fn event_fd(&self) -> Option<RawFd> {
        None
    }

    /// The event descriptor is readable. An error stops the server.
    fn event(&mut self) -> openct_protocol::Result<()> {
        Ok(())
    }

    /// The event descriptor reported an error or hangup.
    fn event_error(&mut self) -> openct_protocol::Result<()> {
        Err(Error::DeviceDisconnected)
    }
}

/// Sent from a connection task to the server loop.
enum ClientEvent {
    Request {
        peer: Peer,
        payload: Vec<u8>,
        reply: oneshot::Sender<openct_protocol::Result<Vec<u8>>>,
    },
    Closed(Peer),
}

/// Socket server for handling client connections
pub struct Server {
    /// Path to the Unix socket
    socket_path: PathBuf,
    listener: UnixListener,
    max_clients: usize,
    poll_interval: Duration,
}

impl Server {
    /// Bind `socket_path`, replacing a stale socket file.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(socket_path: PathBuf, max_clients: usize, poll_interval: Duration) -> io::Result<Self> {
        // Remove existing socket file if present
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }

        // Create parent directory if needed
        if let Some(parent) = socket_path.parent()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&socket_path)?;
        tracing::info!(socket = %socket_path.display(), "Server listening");

        // Set socket permissions (allow all users to connect)
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o666);
            std::fs::set_permissions(&socket_path, permissions)?;
        }

        Ok(Self {
            socket_path,
            listener,
            max_clients: max_clients.max(1),
            poll_interval,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Serve until `shutdown` completes or the service ends the loop.
    pub async fn run<S: Service>(
        &mut self,
        service: &mut S,
        shutdown: impl Future<Output = ()>,
    ) -> openct_protocol::Result<()> {
        let (events_tx, mut events) = mpsc::channel::<ClientEvent>(self.max_clients);
        let mut connected = 0usize;
        let mut next_id = 0u64;

        let mut ticker = tokio::time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let event_fd = service.event_fd().map(AsyncFd::new).transpose()?;

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Server shutting down");
                    break;
                }
                // The listener is left alone while the client table is full.
                accept_result = self.listener.accept(), if connected < self.max_clients => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let peer = Peer {
                                id: SocketId::new(next_id),
                                uid: peer_uid(&stream),
                            };
                            next_id += 1;
                            connected += 1;
                            tracing::debug!(client = ?peer.id, uid = peer.uid, "Client connected");
                            if connected >= self.max_clients {
                                tracing::warn!(max_clients = self.max_clients, "Client limit reached, not accepting");
                            }
                            tokio::spawn(handle_client(stream, peer, events_tx.clone()));
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Accept error");
                        }
                    }
                }
                Some(event) = events.recv() => match event {
                    ClientEvent::Request { peer, payload, reply } => {
                        let _ = reply.send(service.process(&peer, &payload));
                    }
                    ClientEvent::Closed(peer) => {
                        connected -= 1;
                        tracing::debug!(client = ?peer.id, "Client disconnected");
                        service.closed(&peer);
                    }
                },
                _ = ticker.tick() => service.tick()?,
                ready = readable(event_fd.as_ref()) => {
                    let mut guard = ready?;
                    let state = guard.ready();
                    if state.is_error() || state.is_read_closed() {
                        service.event_error()?;
                    } else {
                        service.event()?;
                    }
                    guard.clear_ready();
                }
            }
        }

        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // Clean up socket file
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

/// Wait on the driver event descriptor; never completes without one.
async fn readable(fd: Option<&AsyncFd<RawFd>>) -> io::Result<AsyncFdReadyGuard<'_, RawFd>> {
    match fd {
        Some(fd) => fd.readable().await,
        None => std::future::pending().await,
    }
}

/// Handle a single client connection
async fn handle_client(mut stream: UnixStream, peer: Peer, events: mpsc::Sender<ClientEvent>) {
    if let Err(e) = serve_client(&mut stream, peer, &events).await {
        tracing::debug!(client = ?peer.id, error = %e, "Dropping client");
    }
    let _ = events.send(ClientEvent::Closed(peer)).await;
}

/// Answer packets in arrival order until the client hangs up.
async fn serve_client(
    stream: &mut UnixStream,
    peer: Peer,
    events: &mpsc::Sender<ClientEvent>,
) -> openct_protocol::Result<()> {
    let order = ByteOrder::Native;
    let mut head = [0u8; Header::SIZE];

    loop {
        match stream.read_exact(&mut head).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let header = Header::from_bytes(&head, order).ok_or(Error::InvalidMsg)?;
        let mut payload = vec![0u8; header.count as usize];
        stream.read_exact(&mut payload).await?;
        tracing::trace!(client = ?peer.id, xid = header.xid, bytes = payload.len(), "Received");

        let (reply, answer) = oneshot::channel();
        let request = ClientEvent::Request { peer, payload, reply };
        if events.send(request).await.is_err() {
            return Ok(());
        }
        let Ok(result) = answer.await else {
            return Ok(());
        };

        let (code, body) = match result {
            Ok(body) => (Error::SUCCESS, body),
            Err(err) => (err.code(), Vec::new()),
        };
        let packet = FramedMessage::frame(&Header::reply(header.xid, code, 0), &body, order)?;
        stream.write_all(&packet).await?;
    }
}

fn peer_uid(stream: &UnixStream) -> u32 {
    stream.peer_cred().map(|cred| cred.uid()).unwrap_or(UNKNOWN_UID)
}

/// Check if a daemon is listening by attempting to connect to the socket
pub async fn is_daemon_running(socket_path: &Path) -> bool {
    UnixStream::connect(socket_path).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream as StdStream;
    use std::sync::mpsc as std_mpsc;
    use std::thread;

    /// Echoes payloads; an empty payload fails with `InvalidMsg`.
    struct Echo {
        closed: std_mpsc::Sender<Peer>,
        ticks: usize,
    }

    impl Service for Echo {
        fn process(&mut self, _peer: &Peer, payload: &[u8]) -> openct_protocol::Result<Vec<u8>> {
            if payload.is_empty() {
                return Err(Error::InvalidMsg);
            }
            Ok(payload.to_vec())
        }

        fn closed(&mut self, peer: &Peer) {
            let _ = self.closed.send(*peer);
        }

        fn tick(&mut self) -> openct_protocol::Result<()> {
            self.ticks += 1;
            Ok(())
        }
    }

    /// A server on its own runtime thread, driven by blocking test clients.
    struct Running {
        path: PathBuf,
        stop: Option<oneshot::Sender<()>>,
        closed: std_mpsc::Receiver<Peer>,
        handle: Option<thread::JoinHandle<usize>>,
        _dir: tempfile::TempDir,
    }

    impl Running {
        fn start(max_clients: usize) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("0");
            let (stop, stopped) = oneshot::channel::<()>();
            let (tx, closed) = std_mpsc::channel();
            let (ready, started) = std_mpsc::channel();
            let socket = path.clone();
            let handle = thread::spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                runtime.block_on(async move {
                    let mut server = Server::bind(socket, max_clients, Duration::from_millis(10)).unwrap();
                    ready.send(()).unwrap();
                    let mut echo = Echo { closed: tx, ticks: 0 };
                    server
                        .run(&mut echo, async move {
                            let _ = stopped.await;
                        })
                        .await
                        .unwrap();
                    echo.ticks
                })
            });
            started.recv().unwrap();
            Self {
                path,
                stop: Some(stop),
                closed,
                handle: Some(handle),
                _dir: dir,
            }
        }

        fn stop(&mut self) -> usize {
            if let Some(stop) = self.stop.take() {
                let _ = stop.send(());
            }
            self.handle.take().unwrap().join().unwrap()
        }
    }

    impl Drop for Running {
        fn drop(&mut self) {
            if self.handle.is_some() {
                self.stop();
            }
        }
    }

    fn exchange(stream: &mut StdStream, xid: u32, payload: &[u8]) -> (Header, Vec<u8>) {
        let packet = FramedMessage::frame(&Header::request(xid, 0), payload, ByteOrder::Native).unwrap();
        stream.write_all(&packet).unwrap();
        read_reply(stream)
    }

    fn read_reply(stream: &mut StdStream) -> (Header, Vec<u8>) {
        let mut head = [0u8; Header::SIZE];
        stream.read_exact(&mut head).unwrap();
        let header = Header::from_bytes(&head, ByteOrder::Native).unwrap();
        let mut body = vec![0u8; header.count as usize];
        stream.read_exact(&mut body).unwrap();
        (header, body)
    }

    #[tokio::test]
    async fn test_is_daemon_running_nonexistent() {
        assert!(!is_daemon_running(Path::new("/nonexistent/path.sock")).await);
    }

    #[test]
    fn test_request_reply() {
        let server = Running::start(4);
        let mut stream = StdStream::connect(&server.path).unwrap();

        let (header, body) = exchange(&mut stream, 7, b"\x00\x00hello");
        assert_eq!(header.xid, 7);
        assert!(header.is_reply());
        assert_eq!(header.error, 0);
        assert_eq!(body, b"\x00\x00hello");

        let (header, body) = exchange(&mut stream, 8, &[]);
        assert_eq!(header.error, Error::InvalidMsg.code());
        assert!(body.is_empty());
    }

    #[test]
    fn test_service_ticks() {
        let mut server = Running::start(4);
        thread::sleep(Duration::from_millis(60));
        assert!(server.stop() > 0);
    }

    #[test]
    fn test_split_and_pipelined_packets() {
        let server = Running::start(4);
        let mut stream = StdStream::connect(&server.path).unwrap();

        let first = FramedMessage::frame(&Header::request(1, 0), b"ab", ByteOrder::Native).unwrap();
        let second = FramedMessage::frame(&Header::request(2, 0), b"cd", ByteOrder::Native).unwrap();
        stream.write_all(&first[..5]).unwrap();
        thread::sleep(Duration::from_millis(30));
        let mut rest = first[5..].to_vec();
        rest.extend_from_slice(&second);
        stream.write_all(&rest).unwrap();

        assert_eq!(read_reply(&mut stream).0.xid, 1);
        let (header, body) = read_reply(&mut stream);
        assert_eq!(header.xid, 2);
        assert_eq!(body, b"cd");
    }

    #[test]
    fn test_disconnect_notifies_service() {
        let server = Running::start(4);
        let stream = StdStream::connect(&server.path).unwrap();
        drop(stream);

        let peer = server.closed.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(peer.id, SocketId::new(0));
    }

    #[test]
    fn test_client_limit() {
        let server = Running::start(1);
        let mut first = StdStream::connect(&server.path).unwrap();
        exchange(&mut first, 1, b"x");

        // Connects at the kernel level but is not served until a slot frees.
        let mut second = StdStream::connect(&server.path).unwrap();
        second.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        let packet = FramedMessage::frame(&Header::request(2, 0), b"y", ByteOrder::Native).unwrap();
        second.write_all(&packet).unwrap();
        let mut byte = [0u8; 1];
        assert!(second.read(&mut byte).is_err());

        drop(first);
        second.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let (header, _) = read_reply(&mut second);
        assert_eq!(header.xid, 2);
    }

    #[test]
    fn test_eof_mid_packet_drops_client() {
        let server = Running::start(4);
        let mut stream = StdStream::connect(&server.path).unwrap();

        let mut head = Header::request(1, 0).to_bytes(ByteOrder::Native);
        head[10..12].copy_from_slice(&u16::MAX.to_ne_bytes());
        stream.write_all(&head).unwrap();
        stream.write_all(&[0u8; 16]).unwrap();
        drop(stream);

        server.closed.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_connection_ids_are_not_reused() {
        let server = Running::start(4);
        drop(StdStream::connect(&server.path).unwrap());
        let first = server.closed.recv_timeout(Duration::from_secs(5)).unwrap();
        drop(StdStream::connect(&server.path).unwrap());
        let second = server.closed.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_peer_uid_is_ours() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().unwrap();
        let ours = std::fs::metadata(dir.path()).unwrap().uid();
        let (a, _b) = UnixStream::pair().unwrap();
        assert_eq!(peer_uid(&a), ours);
    }
}

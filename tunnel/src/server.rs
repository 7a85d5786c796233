use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result, anyhow};
use envelope::{Cmd, Message, Packer};
use futures::SinkExt as _;
use futures::stream::{SplitSink, SplitStream};
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{self, ServerConfig};
use crate::streams::{HasTid, StreamTable};
use crate::tunnel;
use crate::{BUFFER_SIZE, DIAL_TIMEOUT, INACTIVE_TIMEOUT, READ_TIMEOUT};

type SrvSink = SplitSink<WebSocketStream<TcpStream>, tungstenite::Message>;
type SrvStream = SplitStream<WebSocketStream<TcpStream>>;

/// The server peer: terminates tunnels upgraded on `/ws`, dials the real
/// destinations and relays bytes between them and the tunnels.
pub struct Server {
    packer: Packer,
    streams: StreamTable<ServerStream>,
    listener: SyncMutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    switches: AtomicU64,
}

/// One accepted WebSocket. All frames written to it go through the sink
/// mutex, shared by every stream currently bound to it.
struct TunnelSocket {
    sink: Mutex<SrvSink>,
}

struct ServerStream {
    sid: String,
    tid: String,
    network: String,
    address: String,
    /// The socket currently serving this stream's tunnel id; swapped on
    /// SWITCH.
    socket: RwLock<Arc<TunnelSocket>>,
    dest: Mutex<OwnedWriteHalf>,
    quit: CancellationToken,
    /// Set once the local peer announced it will send no more data.
    half_closed: AtomicBool,
    last_activity: SyncMutex<Instant>,
}

impl HasTid for ServerStream {
    fn tid(&self) -> &str {
        &self.tid
    }
}

impl ServerStream {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn current_socket(&self) -> Arc<TunnelSocket> {
        Arc::clone(&self.socket.read())
    }
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Arc<Self>> {
        let (_, address) = config::split_listen(&config.listen)?;

        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("failed to listen on {address}"))?;
        let local_addr = listener.local_addr()?;

        Ok(Arc::new(Self {
            packer: Packer::new(config.password),
            streams: StreamTable::new(),
            listener: SyncMutex::new(Some(listener)),
            local_addr,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            switches: AtomicU64::new(0),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// SWITCH announcements handled so far; one per completed rotation.
    pub fn num_switches(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .take()
            .context("server peer is already running")?;

        tracing::info!("Listening on tcp://{}", self.local_addr);

        let this = Arc::clone(&self);
        self.tracker.spawn(async move { this.housekeep().await });

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (socket, _peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!("Accept failed: {e}");
                    continue;
                }
            };

            let this = Arc::clone(&self);
            let shutdown = self.shutdown.clone();
            self.tracker.spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = this.handle_upgrade(socket) => {}
                }
            });
        }

        drop(listener);
        for stream in self.streams.collect(|_| true) {
            stream.quit.cancel();
        }
        self.tracker.close();
        self.tracker.wait().await;

        tracing::info!("Server stopped");

        Ok(())
    }

    async fn handle_upgrade(self: Arc<Self>, socket: TcpStream) {
        let ws = match tokio_tungstenite::accept_hdr_async(socket, check_path).await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::debug!("WebSocket upgrade failed: {e}");
                return;
            }
        };

        let (sink, stream) = futures::StreamExt::split(ws);
        let socket = Arc::new(TunnelSocket {
            sink: Mutex::new(sink),
        });

        tracing::debug!("Tunnel attached");

        self.read_loop(socket, stream).await;
    }

    /// The per-tunnel frame loop.
    ///
    /// Exiting does not evict any stream: after a rotation, this socket's
    /// streams already ride a newer socket carrying the same tunnel id.
    async fn read_loop(self: &Arc<Self>, socket: Arc<TunnelSocket>, mut reader: SrvStream) {
        loop {
            let msg = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                msg = tunnel::read_message(&mut reader, &self.packer) => match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::debug!("Tunnel reader exiting: {e}");
                        break;
                    }
                },
            };

            match msg.cmd {
                Cmd::Connect => {
                    // dialing can take seconds; never block the frame loop
                    let this = Arc::clone(self);
                    let socket = Arc::clone(&socket);
                    let shutdown = self.shutdown.clone();
                    self.tracker.spawn(async move {
                        tokio::select! {
                            _ = shutdown.cancelled() => {}
                            _ = this.handle_connect(msg, socket) => {}
                        }
                    });
                }
                Cmd::Data => self.handle_data(msg, &socket).await,
                Cmd::Close => self.handle_close(msg).await,
                Cmd::Switch => self.handle_switch(msg, &socket).await,
            }
        }
    }

    async fn handle_connect(self: Arc<Self>, msg: Message, socket: Arc<TunnelSocket>) {
        match self.open_destination(&msg).await {
            Ok(tcp) => {
                let (stream, dest_reader) = self.install(&msg, tcp, Arc::clone(&socket));

                // ack strictly before the forwarder starts: the first frame
                // the local peer sees for this sid must be the CONNECT reply
                let ack = Message::connect_ok(&msg.tid, &msg.sid);
                if self.send(&socket, &ack).await.is_err() {
                    self.evict(&stream).await;
                    return;
                }

                self.spawn_forwarder(stream, dest_reader);
            }
            Err(e) => {
                tracing::debug!(sid = %msg.sid, address = %msg.address, "Dial failed: {e:#}");
                let nack = Message::connect_err(&msg.tid, &msg.sid, format!("{e:#}"));
                let _ = self.send(&socket, &nack).await;
            }
        }
    }

    async fn handle_data(self: &Arc<Self>, msg: Message, socket: &Arc<TunnelSocket>) {
        if let Some(stream) = self.streams.get(&msg.sid) {
            stream.touch();

            if msg.data.is_empty() {
                return;
            }

            if let Err(e) = stream.dest.lock().await.write_all(&msg.data).await {
                tracing::debug!(sid = %msg.sid, "Destination write failed: {e}");
                let _ = self
                    .send(socket, &Message::close(&msg.tid, &msg.sid))
                    .await;
                self.evict(&stream).await;
            }
            return;
        }

        // The stream is gone (one-shot request, restart, inactivity): re-dial
        // the destination carried in the frame and resurrect it.
        if msg.network.is_empty() || msg.address.is_empty() {
            let _ = self
                .send(socket, &Message::close(&msg.tid, &msg.sid))
                .await;
            return;
        }

        tracing::debug!(sid = %msg.sid, address = %msg.address, "DATA for unknown stream, re-dialing");

        match self.open_destination(&msg).await {
            Ok(tcp) => {
                let (stream, dest_reader) = self.install(&msg, tcp, Arc::clone(socket));

                if let Err(e) = stream.dest.lock().await.write_all(&msg.data).await {
                    tracing::debug!(sid = %msg.sid, "Destination write failed after re-dial: {e}");
                    let _ = self
                        .send(socket, &Message::close(&msg.tid, &msg.sid))
                        .await;
                    self.evict(&stream).await;
                    return;
                }

                self.spawn_forwarder(stream, dest_reader);
            }
            Err(e) => {
                tracing::debug!(sid = %msg.sid, "Re-dial failed: {e:#}");
                let _ = self
                    .send(socket, &Message::close(&msg.tid, &msg.sid))
                    .await;
            }
        }
    }

    async fn handle_close(&self, msg: Message) {
        let Some(stream) = self.streams.get(&msg.sid) else {
            return;
        };

        if stream.half_closed.swap(true, Ordering::SeqCst) {
            // second CLOSE: the local side is gone for good
            self.evict(&stream).await;
            return;
        }

        // graceful: stop sending to the destination, keep relaying whatever
        // it still has to say
        tracing::debug!(sid = %msg.sid, "Half-closing destination");
        stream.touch();
        let _ = stream.dest.lock().await.shutdown().await;
    }

    /// Rebinds every stream of `msg.tid` onto the socket the SWITCH arrived
    /// on. The old sink is held during each swap so no in-flight write
    /// straddles the boundary.
    async fn handle_switch(&self, msg: Message, socket: &Arc<TunnelSocket>) {
        self.switches.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(tid = %msg.tid, "Rebinding streams to a fresh socket");

        for stream in self.streams.collect(|s| s.tid == msg.tid) {
            let current = stream.current_socket();
            if Arc::ptr_eq(&current, socket) {
                continue;
            }

            let guard = current.sink.lock().await;
            *stream.socket.write() = Arc::clone(socket);
            drop(guard);
        }
    }

    async fn open_destination(&self, msg: &Message) -> Result<TcpStream> {
        let connect = TcpStream::connect(msg.address.as_str());

        match tokio::time::timeout(DIAL_TIMEOUT, connect).await {
            Ok(Ok(tcp)) => Ok(tcp),
            Ok(Err(e)) => Err(e).with_context(|| format!("failed to dial {}", msg.address)),
            Err(_elapsed) => Err(anyhow!("dialing {} timed out", msg.address)),
        }
    }

    fn install(
        self: &Arc<Self>,
        msg: &Message,
        tcp: TcpStream,
        socket: Arc<TunnelSocket>,
    ) -> (Arc<ServerStream>, OwnedReadHalf) {
        let (dest_reader, dest_writer) = tcp.into_split();

        let stream = Arc::new(ServerStream {
            sid: msg.sid.clone(),
            tid: msg.tid.clone(),
            network: msg.network.clone(),
            address: msg.address.clone(),
            socket: RwLock::new(socket),
            dest: Mutex::new(dest_writer),
            quit: CancellationToken::new(),
            half_closed: AtomicBool::new(false),
            last_activity: SyncMutex::new(Instant::now()),
        });

        if let Some(old) = self.streams.insert(&msg.sid, Arc::clone(&stream)) {
            old.quit.cancel();
        }

        tracing::debug!(sid = %msg.sid, tid = %msg.tid, address = %msg.address, "Stream open");

        (stream, dest_reader)
    }

    fn spawn_forwarder(self: &Arc<Self>, stream: Arc<ServerStream>, dest_reader: OwnedReadHalf) {
        let this = Arc::clone(self);
        self.tracker
            .spawn(async move { this.forward(stream, dest_reader).await });
    }

    /// Destination -> tunnel. Destination EOF completes the stream: CLOSE is
    /// sent after all DATA, so the local peer sees every byte first.
    async fn forward(self: Arc<Self>, stream: Arc<ServerStream>, mut dest: OwnedReadHalf) {
        let mut buf = vec![0u8; BUFFER_SIZE];

        loop {
            let read = tokio::select! {
                _ = stream.quit.cancelled() => return,
                read = tokio::time::timeout(READ_TIMEOUT, dest.read(&mut buf)) => read,
            };

            let n = match read {
                // idle is fine; the housekeeper evicts truly dead streams
                Err(_elapsed) => continue,
                Ok(Ok(0)) => {
                    tracing::debug!(sid = %stream.sid, "Destination finished");
                    break;
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    tracing::debug!(sid = %stream.sid, "Destination read failed: {e}");
                    break;
                }
            };

            stream.touch();

            let msg = Message::data(
                &stream.tid,
                &stream.sid,
                &stream.network,
                &stream.address,
                buf[..n].to_vec(),
            );
            if self.send(&stream.current_socket(), &msg).await.is_err() {
                // the local peer resurrects the stream with its next DATA
                // frame if it still cares
                break;
            }
        }

        let close = Message::close(&stream.tid, &stream.sid);
        let _ = self.send(&stream.current_socket(), &close).await;
        self.evict(&stream).await;
    }

    async fn evict(&self, stream: &Arc<ServerStream>) {
        if !self.streams.remove_entry(&stream.sid, stream) {
            return;
        }

        tracing::debug!(sid = %stream.sid, "Stream evicted");

        stream.quit.cancel();
        let _ = stream.dest.lock().await.shutdown().await;

        // last stream on this tunnel id: release the WebSocket
        if self.streams.count_for(&stream.tid) == 0 {
            let socket = stream.current_socket();
            let _ = socket.sink.lock().await.close().await;
        }
    }

    /// Evicts streams that have seen no traffic for [`INACTIVE_TIMEOUT`].
    async fn housekeep(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(60));

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }

            let idle = self
                .streams
                .collect(|s| s.last_activity.lock().elapsed() > INACTIVE_TIMEOUT);

            for stream in idle {
                tracing::debug!(sid = %stream.sid, "Evicting inactive stream");
                let close = Message::close(&stream.tid, &stream.sid);
                let _ = self.send(&stream.current_socket(), &close).await;
                self.evict(&stream).await;
            }
        }
    }

    async fn send(
        &self,
        socket: &TunnelSocket,
        msg: &Message,
    ) -> Result<(), tungstenite::Error> {
        let frame = self.packer.pack(msg);

        socket
            .sink
            .lock()
            .await
            .send(tungstenite::Message::binary(frame))
            .await
    }
}

fn check_path(request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    if request.uri().path() == "/ws" {
        return Ok(response);
    }

    let not_found = tungstenite::http::Response::builder()
        .status(tungstenite::http::StatusCode::NOT_FOUND)
        .body(None)
        .expect("a status-only response is always valid");

    Err(not_found)
}

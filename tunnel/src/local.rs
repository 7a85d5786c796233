use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use backoff::backoff::Backoff as _;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use envelope::{Cmd, Message, Packer};
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

use crate::config::{self, LocalConfig, Proto};
use crate::pool::Pool;
use crate::streams::{HasTid, StreamTable};
use crate::tunnel::{self, Tunnel, TunnelError, WsStream};
use crate::{
    BUFFER_SIZE, FLUSH_TIMEOUT, INACTIVE_TIMEOUT, MAILBOX_DEPTH, READ_TIMEOUT,
    RECONNECT_INTERVAL, RETRY_INITIAL_INTERVAL, RETRY_MAX_INTERVAL, proto,
};

/// The local peer: accepts application connections, speaks the configured
/// proxy protocol to them and multiplexes the resulting streams over the
/// tunnel pool.
pub struct Local {
    proto: Proto,
    packer: Packer,
    pool: Pool,
    streams: StreamTable<LocalStream>,
    time_to_live: Duration,
    listener: SyncMutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

struct LocalStream {
    sid: String,
    tid: String,
    network: String,
    address: String,
    tunnel: Arc<Tunnel>,
    mailbox: mpsc::Sender<Message>,
    quit: CancellationToken,
}

impl HasTid for LocalStream {
    fn tid(&self) -> &str {
        &self.tid
    }
}

impl Local {
    pub async fn bind(config: LocalConfig) -> Result<Arc<Self>> {
        let (_, address) = config::split_listen(&config.listen)?;

        let urls = config.remote_urls();
        if urls.is_empty() {
            bail!("no remote URLs configured");
        }
        for url in &urls {
            let parsed =
                Url::parse(url).with_context(|| format!("invalid remote URL `{url}`"))?;
            if !matches!(parsed.scheme(), "ws" | "wss") {
                bail!("remote URL `{url}` must use ws:// or wss://");
            }
        }

        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("failed to listen on {address}"))?;
        let local_addr = listener.local_addr()?;

        let time_to_live = config.time_to_live();
        let packer = Packer::new(config.password);

        Ok(Arc::new(Self {
            proto: config.proto,
            pool: Pool::new(urls, &packer),
            packer,
            streams: StreamTable::new(),
            time_to_live,
            listener: SyncMutex::new(Some(listener)),
            local_addr,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Initiates a graceful shutdown; [`Local::run`] returns once all tasks
    /// have drained.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .take()
            .context("local peer is already running")?;

        tracing::info!(proto = %self.proto, "Listening on tcp://{}", self.local_addr);

        for tunnel in self.pool.tunnels() {
            let this = Arc::clone(&self);
            let tunnel = Arc::clone(tunnel);
            self.tracker.spawn(async move { this.supervise(tunnel).await });
        }

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
                    _ = this.handle_conn(socket) => {}
                }
            });
        }

        drop(listener);
        for tunnel in self.pool.tunnels() {
            tunnel.close().await;
        }
        for stream in self.streams.collect(|_| true) {
            stream.quit.cancel();
        }
        self.tracker.close();
        self.tracker.wait().await;

        tracing::info!("Local peer stopped");

        Ok(())
    }

    async fn handle_conn(self: Arc<Self>, mut socket: TcpStream) {
        let request = match proto::get(self.proto, &mut socket).await {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!("Adapter rejected connection: {e:#}");
                return;
            }
        };

        let tunnel = match self.pool.pick().await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                tracing::warn!(address = %request.address, "No usable tunnel: {e:#}");
                let _ = proto::ack(&mut socket, false, &e.to_string(), &request).await;
                return;
            }
        };

        let sid = envelope::random_id(6);
        let (mailbox_tx, mut mailbox_rx) = mpsc::channel(MAILBOX_DEPTH);
        let stream = Arc::new(LocalStream {
            sid: sid.clone(),
            tid: tunnel.tid.clone(),
            network: request.network.clone(),
            address: request.address.clone(),
            tunnel: Arc::clone(&tunnel),
            mailbox: mailbox_tx,
            quit: CancellationToken::new(),
        });

        if let Some(old) = self.streams.insert(&sid, Arc::clone(&stream)) {
            old.quit.cancel();
        }
        tunnel.wake.notify_one();

        let connect = Message::connect(&tunnel.tid, &sid, &request.network, &request.address);
        if let Err(e) = tunnel.write_message(&connect).await {
            tracing::debug!(%sid, "Failed to send CONNECT: {e}");
            let _ = proto::ack(&mut socket, false, "tunnel write failed", &request).await;
            self.teardown(&stream);
            return;
        }

        let ack = tokio::select! {
            _ = stream.quit.cancelled() => {
                self.teardown(&stream);
                return;
            }
            msg = mailbox_rx.recv() => match msg {
                Some(msg) => msg,
                None => {
                    self.teardown(&stream);
                    return;
                }
            },
        };

        if ack.cmd != Cmd::Connect || !ack.ok {
            tracing::debug!(%sid, address = %request.address, msg = %ack.msg, "Remote connect failed");
            let _ = proto::ack(&mut socket, false, &ack.msg, &request).await;
            self.teardown(&stream);
            return;
        }

        if let Err(e) = proto::ack(&mut socket, true, "", &request).await {
            tracing::debug!(%sid, "Failed to ack the adapter: {e:#}");
            let _ = tunnel
                .write_message(&Message::close(&stream.tid, &sid))
                .await;
            self.teardown(&stream);
            return;
        }

        // flush what the adapter already buffered (HTTP non-CONNECT)
        for chunk in request.prebuffer.chunks(BUFFER_SIZE) {
            let msg = Message::data(
                &stream.tid,
                &sid,
                &stream.network,
                &stream.address,
                chunk.to_vec(),
            );
            if let Err(e) = tunnel.write_message(&msg).await {
                tracing::debug!(%sid, "Failed to flush the buffered request: {e}");
                self.teardown(&stream);
                return;
            }
        }

        tracing::debug!(%sid, tid = %stream.tid, address = %stream.address, "Stream open");

        let (app_reader, app_writer) = socket.into_split();

        let this = Arc::clone(&self);
        let upload = Arc::clone(&stream);
        self.tracker
            .spawn(async move { this.copy_to_tunnel(upload, app_reader).await });

        let this = Arc::clone(&self);
        self.tracker
            .spawn(async move { this.copy_from_tunnel(stream, mailbox_rx, app_writer).await });
    }

    /// Application -> tunnel. EOF from the application half-closes: the
    /// stream stays registered and keeps receiving until the peer's CLOSE.
    async fn copy_to_tunnel(&self, stream: Arc<LocalStream>, mut app: OwnedReadHalf) {
        let mut buf = vec![0u8; BUFFER_SIZE];

        loop {
            let read = tokio::select! {
                _ = stream.quit.cancelled() => return,
                read = tokio::time::timeout(READ_TIMEOUT, app.read(&mut buf)) => read,
            };

            let n = match read {
                // idle is not an error; the server's housekeeper reaps
                // streams that stay silent for too long
                Err(_elapsed) => continue,
                Ok(Ok(0)) => {
                    tracing::debug!(sid = %stream.sid, "Application finished sending");
                    let _ = stream
                        .tunnel
                        .write_message(&Message::close(&stream.tid, &stream.sid))
                        .await;
                    return;
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    tracing::debug!(sid = %stream.sid, "Application read failed: {e}");
                    break;
                }
            };

            let msg = Message::data(
                &stream.tid,
                &stream.sid,
                &stream.network,
                &stream.address,
                buf[..n].to_vec(),
            );
            if let Err(e) = stream.tunnel.write_message(&msg).await {
                tracing::debug!(sid = %stream.sid, "Tunnel write failed: {e}");
                break;
            }
        }

        let _ = stream
            .tunnel
            .write_message(&Message::close(&stream.tid, &stream.sid))
            .await;
        self.teardown(&stream);
    }

    /// Tunnel -> application.
    async fn copy_from_tunnel(
        &self,
        stream: Arc<LocalStream>,
        mut mailbox: mpsc::Receiver<Message>,
        mut app: OwnedWriteHalf,
    ) {
        loop {
            let msg = tokio::select! {
                _ = stream.quit.cancelled() => break,
                msg = tokio::time::timeout(INACTIVE_TIMEOUT, mailbox.recv()) => match msg {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break,
                    Err(_elapsed) => {
                        // nothing heard for a long time, not even a CLOSE;
                        // assume the stream is dead
                        tracing::debug!(sid = %stream.sid, "Stream inactive, giving up");
                        break;
                    }
                },
            };

            match msg.cmd {
                Cmd::Close => {
                    tracing::debug!(sid = %stream.sid, "Stream closed by the server");
                    break;
                }
                Cmd::Data => {
                    if msg.data.is_empty() {
                        break;
                    }
                    if let Err(e) = app.write_all(&msg.data).await {
                        tracing::debug!(sid = %stream.sid, "Application write failed: {e}");
                        let _ = stream
                            .tunnel
                            .write_message(&Message::close(&stream.tid, &stream.sid))
                            .await;
                        break;
                    }
                }
                // a late duplicate ack; nothing to deliver
                Cmd::Connect | Cmd::Switch => {}
            }
        }

        let _ = app.shutdown().await;
        self.teardown(&stream);
    }

    fn teardown(&self, stream: &Arc<LocalStream>) {
        self.streams.remove_entry(&stream.sid, stream);
        stream.quit.cancel();
    }

    /// Per-tunnel supervisor: keeps the tunnel alive, routes inbound frames
    /// and rotates the underlying socket before its time-to-live expires.
    async fn supervise(self: Arc<Self>, tunnel: Arc<Tunnel>) {
        enum Tick {
            Rotate,
            Inbound(Result<Message, TunnelError>),
        }

        let mut reader: Option<WsStream> = None;
        let mut deadline = Instant::now() + self.time_to_live;
        let mut retry = dial_backoff();

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            // broken: force-retry with backoff until the remote comes back
            if !tunnel.can_connect() {
                let pause = retry.next_backoff().unwrap_or(RETRY_MAX_INTERVAL);
                tracing::debug!(tid = %tunnel.tid, "Tunnel unreachable, retrying in {pause:?}");
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
                if tunnel.dial(true).await.is_ok() {
                    retry.reset();
                    deadline = Instant::now() + self.time_to_live;
                }
                continue;
            }

            // park while no stream references this tunnel
            if self.streams.count_for(&tunnel.tid) == 0 {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tunnel.wake.notified() => {}
                }
                deadline = Instant::now() + self.time_to_live;
                continue;
            }

            if !tunnel.connected() {
                reader = None;
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_INTERVAL) => {}
                }
                match tunnel.dial(true).await {
                    Ok(()) => {
                        retry.reset();
                        deadline = Instant::now() + self.time_to_live;
                    }
                    Err(e) => {
                        tracing::debug!(tid = %tunnel.tid, "Reconnect failed: {e}");
                        continue;
                    }
                }
            }

            if reader.is_none() {
                reader = tunnel.take_reader();
                if reader.is_none() {
                    // someone else claimed the socket's read half; treat the
                    // tunnel as down and dial a fresh one
                    tunnel.mark_disconnected();
                    continue;
                }
            }
            let Some(stream_reader) = reader.as_mut() else {
                continue;
            };

            let tick = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => Tick::Rotate,
                msg = tunnel::read_message(stream_reader, &self.packer) => Tick::Inbound(msg),
            };

            match tick {
                Tick::Rotate => {
                    if let Some(old_reader) = reader.as_mut() {
                        match self.rotate(&tunnel, old_reader).await {
                            Ok(new_reader) => reader = Some(new_reader),
                            Err(e) => {
                                tracing::warn!(
                                    tid = %tunnel.tid,
                                    "Rotation failed, keeping the old socket: {e:#}"
                                );
                            }
                        }
                    }
                    deadline = Instant::now() + self.time_to_live;
                }
                Tick::Inbound(Ok(msg)) => self.route(&tunnel, msg).await,
                Tick::Inbound(Err(e)) => {
                    tracing::debug!(tid = %tunnel.tid, "Tunnel read failed: {e}");
                    tunnel.mark_disconnected();
                    reader = None;
                }
            }
        }
    }

    /// Swaps the tunnel onto a fresh WebSocket without disturbing its
    /// streams.
    ///
    /// The replacement socket announces SWITCH first so the server rebinds,
    /// then the old socket is drained under a short deadline and closed under
    /// the write lock. Stream tasks never notice: their next write simply
    /// lands on the new sink.
    async fn rotate(&self, tunnel: &Arc<Tunnel>, old_reader: &mut WsStream) -> Result<WsStream> {
        tracing::debug!(tid = %tunnel.tid, "Rotating tunnel socket");

        let fresh = Tunnel::new(tunnel.url.clone(), tunnel.tid.clone(), self.packer.clone());
        fresh.dial(false).await.context("replacement dial failed")?;
        fresh
            .write_message(&Message::switch(&tunnel.tid))
            .await
            .context("failed to announce the switch")?;

        let drain_until = Instant::now() + FLUSH_TIMEOUT;
        loop {
            let read = tokio::time::timeout_at(
                drain_until,
                tunnel::read_message(old_reader, &self.packer),
            )
            .await;

            match read {
                Ok(Ok(msg)) => self.deliver(msg).await,
                Ok(Err(_)) | Err(_) => break,
            }
        }

        let new_sink = fresh.take_writer().await.context("replacement sink missing")?;
        let new_reader = fresh.take_reader().context("replacement reader missing")?;
        tunnel.swap_socket(new_sink).await;

        tracing::debug!(tid = %tunnel.tid, "Rotation complete");

        Ok(new_reader)
    }

    /// Routes one inbound frame to its stream's mailbox; unknown streams get
    /// a CLOSE back so the server stops forwarding.
    async fn route(&self, tunnel: &Arc<Tunnel>, msg: Message) {
        if let Some(stream) = self.streams.get(&msg.sid) {
            let _ = stream.mailbox.send(msg).await;
            return;
        }

        if msg.cmd != Cmd::Close {
            let _ = tunnel
                .write_message(&Message::close(&msg.tid, &msg.sid))
                .await;
        }
    }

    /// Mailbox delivery only; used while draining during rotation, where
    /// answering on the half-dead socket is pointless.
    async fn deliver(&self, msg: Message) {
        if let Some(stream) = self.streams.get(&msg.sid) {
            let _ = stream.mailbox.send(msg).await;
        }
    }
}

fn dial_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(RETRY_INITIAL_INTERVAL)
        .with_multiplier(2.0)
        .with_max_interval(RETRY_MAX_INTERVAL)
        .with_max_elapsed_time(None)
        .build()
}

use envelope::{Message, Packer};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::DIAL_TIMEOUT;

pub(crate) type WsSink =
    SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, tungstenite::Message>;
pub(crate) type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, thiserror::Error)]
pub(crate) enum TunnelError {
    #[error("tunnel is marked unreachable")]
    Unreachable,
    #[error("tunnel is not connected")]
    NotConnected,
    #[error("websocket handshake timed out")]
    HandshakeTimeout,
    #[error("websocket stream ended")]
    StreamClosed,
    #[error(transparent)]
    WebSocket(#[from] tungstenite::Error),
}

/// `connected` tracks the current socket, `can_connect` whether dialing is
/// worth trying at all: (true, true) is healthy, (false, true) transiently
/// down, (false, false) broken until a forced dial succeeds.
#[derive(Clone, Copy)]
struct Flags {
    connected: bool,
    can_connect: bool,
}

/// One logical tunnel to a remote URL.
///
/// The underlying WebSocket is replaced on rotation and reconnect; streams
/// only ever hold the [`Tunnel`] itself, so a swap is invisible to them.
/// Writes are serialized by the sink mutex, which is also held across the
/// swap so no frame straddles two sockets.
pub(crate) struct Tunnel {
    pub(crate) url: String,
    pub(crate) tid: String,
    packer: Packer,
    flags: RwLock<Flags>,
    writer: Mutex<Option<WsSink>>,
    /// The read half of a freshly dialed socket, parked here until the
    /// supervisor claims it.
    reader: SyncMutex<Option<WsStream>>,
    /// Serializes concurrent dialers; losers observe `connected` and no-op.
    dial_gate: Mutex<()>,
    /// Wakes the supervisor to re-examine tunnel state.
    pub(crate) wake: Notify,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("url", &self.url)
            .field("tid", &self.tid)
            .finish()
    }
}

impl Tunnel {
    pub(crate) fn new(url: String, tid: String, packer: Packer) -> Self {
        Self {
            url,
            tid,
            packer,
            flags: RwLock::new(Flags {
                connected: false,
                can_connect: true,
            }),
            writer: Mutex::new(None),
            reader: SyncMutex::new(None),
            dial_gate: Mutex::new(()),
            wake: Notify::new(),
        }
    }

    pub(crate) fn connected(&self) -> bool {
        self.flags.read().connected
    }

    pub(crate) fn can_connect(&self) -> bool {
        self.flags.read().can_connect
    }

    pub(crate) fn mark_disconnected(&self) {
        self.flags.write().connected = false;
    }

    /// Dials the remote URL unless already connected.
    ///
    /// A broken tunnel (`can_connect == false`) refuses non-forced dials and
    /// instead nudges its supervisor, which owns the forced retry loop.
    pub(crate) async fn dial(&self, force: bool) -> Result<(), TunnelError> {
        let _gate = self.dial_gate.lock().await;

        if self.connected() {
            return Ok(());
        }

        if !self.can_connect() && !force {
            self.wake.notify_one();
            return Err(TunnelError::Unreachable);
        }

        tracing::debug!(tid = %self.tid, url = %self.url, "Dialing tunnel");

        let connect = tokio_tungstenite::connect_async(self.url.as_str());
        let socket = match tokio::time::timeout(DIAL_TIMEOUT, connect).await {
            Ok(Ok((socket, _response))) => socket,
            Ok(Err(e)) => {
                self.set_flags(false, false);
                return Err(e.into());
            }
            Err(_elapsed) => {
                self.set_flags(false, false);
                return Err(TunnelError::HandshakeTimeout);
            }
        };

        let (sink, stream) = socket.split();
        *self.writer.lock().await = Some(sink);
        *self.reader.lock() = Some(stream);
        self.set_flags(true, true);
        self.wake.notify_one();

        tracing::debug!(tid = %self.tid, url = %self.url, "Tunnel connected");

        Ok(())
    }

    /// Packs `msg` and sends it as one binary frame, serialized with all
    /// other writers of this tunnel.
    pub(crate) async fn write_message(&self, msg: &Message) -> Result<(), TunnelError> {
        let frame = self.packer.pack(msg);

        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(TunnelError::NotConnected)?;

        if let Err(e) = sink.send(tungstenite::Message::binary(frame)).await {
            self.mark_disconnected();
            return Err(e.into());
        }

        Ok(())
    }

    /// Claims the read half parked by the most recent dial.
    pub(crate) fn take_reader(&self) -> Option<WsStream> {
        self.reader.lock().take()
    }

    pub(crate) async fn take_writer(&self) -> Option<WsSink> {
        self.writer.lock().await.take()
    }

    /// Installs a replacement sink under the write lock, closing the old
    /// socket. Frames queued behind the lock continue on the new socket.
    pub(crate) async fn swap_socket(&self, new_sink: WsSink) {
        let mut writer = self.writer.lock().await;

        if let Some(mut old) = writer.replace(new_sink) {
            let _ = old.close().await;
        }

        self.flags.write().connected = true;
    }

    pub(crate) async fn close(&self) {
        self.mark_disconnected();

        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.close().await;
        }
        self.reader.lock().take();

        self.wake.notify_one();
    }

    fn set_flags(&self, connected: bool, can_connect: bool) {
        *self.flags.write() = Flags {
            connected,
            can_connect,
        };
    }
}

/// Reads the next message from a WebSocket read half.
///
/// Non-binary frames are skipped; frames that fail to decode are logged and
/// dropped so one bad envelope does not kill the tunnel.
pub(crate) async fn read_message<S>(
    reader: &mut SplitStream<WebSocketStream<S>>,
    packer: &Packer,
) -> Result<Message, TunnelError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        match reader.next().await {
            None => return Err(TunnelError::StreamClosed),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(tungstenite::Message::Binary(frame))) => match packer.unpack(&frame) {
                Ok(msg) => return Ok(msg),
                Err(e) => {
                    tracing::warn!("Dropping frame that failed to decode: {e}");
                    continue;
                }
            },
            Some(Ok(_)) => continue,
        }
    }
}

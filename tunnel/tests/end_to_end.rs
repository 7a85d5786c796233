#![allow(clippy::unwrap_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use rand::RngCore as _;
use secrecy::SecretString;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tunnel::{Local, LocalConfig, Proto, Server, ServerConfig};

const PASSWORD: &str = "pass123";

const SOCKS5_OK: [u8; 10] = [5, 0, 0, 1, 0, 0, 0, 0, 0, 0];
const SOCKS5_FAIL: [u8; 10] = [5, 1, 0, 1, 0, 0, 0, 0, 0, 0];

fn logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

async fn start_server() -> Arc<Server> {
    let server = Server::bind(ServerConfig {
        listen: "tcp://127.0.0.1:0".to_owned(),
        password: SecretString::from(PASSWORD),
    })
    .await
    .unwrap();

    tokio::spawn(Arc::clone(&server).run());

    server
}

async fn start_local(remotes: String, ttl_secs: u64) -> Arc<Local> {
    let local = Local::bind(LocalConfig {
        listen: "tcp://127.0.0.1:0".to_owned(),
        remotes,
        password: SecretString::from(PASSWORD),
        proto: Proto::Socks5,
        ttl_secs,
    })
    .await
    .unwrap();

    tokio::spawn(Arc::clone(&local).run());

    local
}

/// A TCP server that echoes until EOF, then closes.
async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };

            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    addr
}

async fn try_socks5_connect(proxy: SocketAddr, target: SocketAddr) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(proxy).await?;

    stream.write_all(&[5, 1, 0]).await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply != [5, 0] {
        bail!("unexpected method selection {reply:?}");
    }

    let SocketAddr::V4(v4) = target else {
        bail!("expected an IPv4 target");
    };
    let mut request = vec![5, 1, 0, 1];
    request.extend_from_slice(&v4.ip().octets());
    request.extend_from_slice(&v4.port().to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await?;
    if reply != SOCKS5_OK {
        bail!("connect refused: {reply:?}");
    }

    Ok(stream)
}

async fn socks5_connect(proxy: SocketAddr, target: SocketAddr) -> TcpStream {
    try_socks5_connect(proxy, target).await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn socks5_roundtrip_through_the_tunnel() {
    logging();

    let echo = spawn_echo().await;
    let server = start_server().await;
    let local = start_local(format!("ws://{}/ws", server.local_addr()), 56).await;

    let stream = socks5_connect(local.local_addr(), echo).await;
    let (mut reader, mut writer) = stream.into_split();

    let mut payload = vec![0u8; 65536];
    rand::thread_rng().fill_bytes(&mut payload);

    let upload = {
        let payload = payload.clone();
        tokio::spawn(async move {
            writer.write_all(&payload).await.unwrap();
            writer.shutdown().await.unwrap();
        })
    };

    let mut echoed = Vec::with_capacity(payload.len());
    timeout(Duration::from_secs(30), reader.read_to_end(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    upload.await.unwrap();

    assert_eq!(echoed.len(), payload.len());
    assert_eq!(echoed, payload);

    // every stream record is gone once the session is over
    timeout(Duration::from_secs(10), async {
        while local.stream_count() != 0 || server.stream_count() != 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();

    local.stop();
    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn rotation_preserves_streams() {
    logging();

    let echo = spawn_echo().await;
    let server = start_server().await;
    let local = start_local(format!("ws://{}/ws", server.local_addr()), 2).await;

    let stream = socks5_connect(local.local_addr(), echo).await;
    let (mut reader, mut writer) = stream.into_split();

    let mut payload = vec![0u8; 50 * 1024];
    rand::thread_rng().fill_bytes(&mut payload);

    // spread the upload over ~5s so rotations land mid-stream
    let upload = {
        let payload = payload.clone();
        tokio::spawn(async move {
            for chunk in payload.chunks(1024) {
                writer.write_all(chunk).await.unwrap();
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            writer.shutdown().await.unwrap();
        })
    };

    // mid-transfer the stream count on the server stays at exactly one
    let mid_transfer = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            server.stream_count()
        })
    };

    let mut echoed = Vec::new();
    timeout(Duration::from_secs(60), reader.read_to_end(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    upload.await.unwrap();

    assert_eq!(echoed, payload);
    assert!(server.num_switches() >= 1, "no rotation was observed");
    assert_eq!(mid_transfer.await.unwrap(), 1);

    local.stop();
    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_backend_fails_the_socks_handshake() {
    logging();

    let server = start_server().await;
    let local = start_local(format!("ws://{}/ws", server.local_addr()), 56).await;

    let mut stream = TcpStream::connect(local.local_addr()).await.unwrap();

    stream.write_all(&[5, 1, 0]).await.unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [5, 0]);

    // port 1 on loopback is not listening
    stream
        .write_all(&[5, 1, 0, 1, 127, 0, 0, 1, 0, 1])
        .await
        .unwrap();

    let mut reply = [0u8; 10];
    timeout(Duration::from_secs(10), stream.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, SOCKS5_FAIL);

    local.stop();
    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn recovers_after_all_tunnels_were_down() {
    logging();

    let echo = spawn_echo().await;

    // reserve two ports, then leave them closed
    let placeholder_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let placeholder_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr_a = placeholder_a.local_addr().unwrap();
    let addr_b = placeholder_b.local_addr().unwrap();
    drop(placeholder_a);
    drop(placeholder_b);

    let local = start_local(format!("ws://{addr_a}/ws,ws://{addr_b}/ws"), 56).await;

    // with every tunnel down the adapter must hear a failure
    let mut stream = TcpStream::connect(local.local_addr()).await.unwrap();
    stream.write_all(&[5, 1, 0]).await.unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [5, 0]);

    let SocketAddr::V4(echo_v4) = echo else {
        panic!("expected an IPv4 echo server")
    };
    let mut request = vec![5, 1, 0, 1];
    request.extend_from_slice(&echo_v4.ip().octets());
    request.extend_from_slice(&echo_v4.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    timeout(Duration::from_secs(15), stream.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, SOCKS5_FAIL);
    drop(stream);

    // one remote comes back up
    let server = Server::bind(ServerConfig {
        listen: format!("tcp://{addr_a}"),
        password: SecretString::from(PASSWORD),
    })
    .await
    .unwrap();
    tokio::spawn(Arc::clone(&server).run());

    // a fresh connection succeeds within one backoff cycle
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "local never recovered"
        );

        if let Ok(mut stream) = try_socks5_connect(local.local_addr(), echo).await {
            stream.write_all(b"ping").await.unwrap();
            stream.shutdown().await.unwrap();

            let mut pong = Vec::new();
            timeout(Duration::from_secs(10), stream.read_to_end(&mut pong))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(pong, b"ping");
            break;
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    local.stop();
    server.stop();
}

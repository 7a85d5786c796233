use std::net::{Ipv4Addr, Ipv6Addr};

use anyhow::{Result, bail};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use super::{Kind, Request};

const VERSION: u8 = 5;
const NO_AUTH: u8 = 0;
const CMD_CONNECT: u8 = 1;

const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

const REPLY_OK: [u8; 10] = [5, 0, 0, 1, 0, 0, 0, 0, 0, 0];
const REPLY_FAIL: [u8; 10] = [5, 1, 0, 1, 0, 0, 0, 0, 0, 0];
const REPLY_NO_METHOD: [u8; 2] = [5, 255];

pub(crate) async fn get<S>(socket: &mut S) -> Result<Request>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut greeting = [0u8; 2];
    socket.read_exact(&mut greeting).await?;

    if greeting[0] != VERSION {
        socket.write_all(&REPLY_NO_METHOD).await?;
        bail!("only socks5 is supported, got version {}", greeting[0]);
    }

    if greeting[1] == 0 {
        socket.write_all(&REPLY_NO_METHOD).await?;
        bail!("client offered no auth methods");
    }

    let mut methods = vec![0u8; usize::from(greeting[1])];
    socket.read_exact(&mut methods).await?;

    if !methods.contains(&NO_AUTH) {
        socket.write_all(&REPLY_NO_METHOD).await?;
        bail!("only NOAUTH is supported");
    }

    socket.write_all(&[VERSION, NO_AUTH]).await?;

    let mut head = [0u8; 4];
    socket.read_exact(&mut head).await?;

    if head[1] != CMD_CONNECT {
        socket.write_all(&REPLY_FAIL).await?;
        bail!("only CONNECT is supported, got command {}", head[1]);
    }

    let (network, address) = match head[3] {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            socket.read_exact(&mut buf).await?;

            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);

            ("tcp", format!("{ip}:{port}"))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            socket.read_exact(&mut len).await?;

            let mut buf = vec![0u8; usize::from(len[0]) + 2];
            socket.read_exact(&mut buf).await?;

            let (domain, port) = buf.split_at(buf.len() - 2);
            let domain = std::str::from_utf8(domain)?;
            let port = u16::from_be_bytes([port[0], port[1]]);

            ("tcp", format!("{domain}:{port}"))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            socket.read_exact(&mut buf).await?;

            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([buf[16], buf[17]]);

            ("tcp6", format!("[{ip}]:{port}"))
        }
        other => {
            socket.write_all(&REPLY_FAIL).await?;
            bail!("unsupported address type {other}");
        }
    };

    Ok(Request {
        network: network.to_owned(),
        address,
        prebuffer: Vec::new(),
        kind: Kind::Socks5,
    })
}

pub(crate) async fn ack<S>(socket: &mut S, ok: bool) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let reply = if ok { &REPLY_OK } else { &REPLY_FAIL };
    socket.write_all(reply).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse(request: &[u8]) -> Result<Request> {
        let (mut client, mut server) = tokio::io::duplex(1024);

        client.write_all(&[5, 1, 0]).await.unwrap();
        client.write_all(request).await.unwrap();

        let parsed = get(&mut server).await;

        // method selection reply
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 0]);

        parsed
    }

    #[tokio::test]
    async fn parses_ipv4_connect() {
        let request = parse(&[5, 1, 0, 1, 127, 0, 0, 1, 0x1f, 0x90]).await.unwrap();

        assert_eq!(request.network, "tcp");
        assert_eq!(request.address, "127.0.0.1:8080");
    }

    #[tokio::test]
    async fn parses_domain_connect() {
        let mut bytes = vec![5, 1, 0, 3, 12];
        bytes.extend_from_slice(b"example.test");
        bytes.extend_from_slice(&[0, 80]);

        let request = parse(&bytes).await.unwrap();

        assert_eq!(request.network, "tcp");
        assert_eq!(request.address, "example.test:80");
    }

    #[tokio::test]
    async fn parses_ipv6_connect() {
        let mut bytes = vec![5, 1, 0, 4];
        bytes.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        bytes.extend_from_slice(&[1, 187]);

        let request = parse(&bytes).await.unwrap();

        assert_eq!(request.network, "tcp6");
        assert_eq!(request.address, "[::1]:443");
    }

    #[tokio::test]
    async fn rejects_non_connect_commands() {
        assert!(parse(&[5, 2, 0, 1, 127, 0, 0, 1, 0, 80]).await.is_err());
    }

    #[tokio::test]
    async fn rejects_clients_without_noauth() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        client.write_all(&[5, 1, 2]).await.unwrap();

        assert!(get(&mut server).await.is_err());

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 255]);
    }
}

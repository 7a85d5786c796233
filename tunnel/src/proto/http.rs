use anyhow::{Context as _, Result, bail};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use super::{Kind, Request};

/// Upper bound on the request head; anything larger is not a proxy request.
const MAX_HEAD: usize = 64 * 1024;

pub(crate) async fn get<S>(socket: &mut S) -> Result<Request>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut buf = Vec::with_capacity(1024);
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }

        if buf.len() > MAX_HEAD {
            bail!("request head exceeds {MAX_HEAD} bytes");
        }

        let mut chunk = [0u8; 1024];
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            bail!("connection closed before the request head completed");
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let (head, body) = buf.split_at(head_end + 4);
    let head = std::str::from_utf8(head).context("request head is not valid UTF-8")?;

    let (request_line, headers) = head
        .split_once("\r\n")
        .context("request head has no request line")?;

    let mut parts = request_line.split_ascii_whitespace();
    let (Some(method), Some(uri), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        bail!("malformed request line: {request_line}");
    };

    let host = host_of(uri, headers).context("request carries no destination host")?;

    if method.eq_ignore_ascii_case("CONNECT") {
        return Ok(Request {
            network: "tcp".to_owned(),
            address: host,
            prebuffer: Vec::new(),
            kind: Kind::HttpConnect,
        });
    }

    // Plain proxy request: rewrite the absolute-form URI to origin-form and
    // stream the rewritten head (plus whatever body we already read) ahead of
    // the copy loops.
    let mut prebuffer =
        format!("{method} {} {version}\r\n{headers}", origin_form(uri)).into_bytes();
    prebuffer.extend_from_slice(body);

    Ok(Request {
        network: "tcp".to_owned(),
        address: host,
        prebuffer,
        kind: Kind::HttpForward,
    })
}

pub(crate) async fn ack<S>(socket: &mut S, ok: bool, msg: &str, kind: Kind) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if !ok {
        let reason = if msg.is_empty() { "Bad Gateway" } else { msg };
        socket
            .write_all(format!("HTTP/1.1 502 {reason}\r\n\r\n").as_bytes())
            .await?;
        return Ok(());
    }

    // Only CONNECT expects a reply; forwarded requests get the origin's.
    if kind == Kind::HttpConnect {
        socket.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
    }

    Ok(())
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// The destination `host:port`, preferring the Host header, defaulting to
/// port 80.
fn host_of(uri: &str, headers: &str) -> Option<String> {
    let host = headers
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("host"))
        .map(|(_, value)| value.trim().to_owned())
        .or_else(|| authority_of(uri).map(str::to_owned))?;

    if host.rsplit(':').next()?.parse::<u16>().is_ok() {
        Some(host)
    } else {
        Some(format!("{host}:80"))
    }
}

fn authority_of(uri: &str) -> Option<&str> {
    let rest = uri.split_once("://").map_or(uri, |(_, rest)| rest);

    Some(rest.split('/').next()?.trim()).filter(|a| !a.is_empty())
}

/// `http://host:port/path?q` -> `/path?q`
fn origin_form(uri: &str) -> &str {
    let Some((_, rest)) = uri.split_once("://") else {
        return uri;
    };

    match rest.find('/') {
        Some(pos) => &rest[pos..],
        None => "/",
    }
}

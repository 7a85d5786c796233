//! Client-facing protocol adapters.
//!
//! An adapter parses the client's proxy protocol into a [`Request`] and later
//! acknowledges success or failure in that protocol's native format. HTTP
//! non-CONNECT requests arrive with their body already started, so the
//! rewritten request rides along as a prebuffer to be flushed ahead of the
//! copy loops.

mod http;
mod socks5;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::Proto;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Socks5,
    HttpConnect,
    HttpForward,
}

#[derive(Debug)]
pub struct Request {
    pub network: String,
    pub address: String,
    /// Bytes to forward before the copy loops start (rewritten HTTP head plus
    /// any body already read off the socket).
    pub prebuffer: Vec<u8>,
    pub(crate) kind: Kind,
}

pub(crate) async fn get<S>(proto: Proto, socket: &mut S) -> Result<Request>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match proto {
        Proto::Socks5 => socks5::get(socket).await,
        Proto::Http => http::get(socket).await,
    }
}

pub(crate) async fn ack<S>(socket: &mut S, ok: bool, msg: &str, request: &Request) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match request.kind {
        Kind::Socks5 => socks5::ack(socket, ok).await,
        Kind::HttpConnect | Kind::HttpForward => http::ack(socket, ok, msg, request.kind).await,
    }
}

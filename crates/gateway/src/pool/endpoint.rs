//! Endpoint parsing and transport selection for enclave targets.
//!
//! Supported address forms:
//! - `host:port` — plain TCP (the default)
//! - `unix://path` — UNIX-domain socket
//! - `vsock://<cid>:<port>` — virtio vsock, two decimal integers
//!
//! The tonic channel is built over a custom connector so all three stream
//! types share one HTTP/2 client stack.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio_vsock::{VsockAddr, VsockStream};
use tonic::transport::{Channel, Endpoint};
use tower::service_fn;

use super::{PoolConfig, PoolError};

/// Parsed form of a target endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointAddr {
    Tcp(String),
    Unix(String),
    Vsock { cid: u32, port: u32 },
}

impl EndpointAddr {
    /// Parse a raw endpoint string by scheme prefix.
    pub fn parse(raw: &str) -> Result<Self, PoolError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PoolError::InvalidEndpoint(raw.to_owned()));
        }
        if let Some(path) = raw.strip_prefix("unix://").or_else(|| raw.strip_prefix("unix:")) {
            if path.is_empty() {
                return Err(PoolError::InvalidEndpoint(raw.to_owned()));
            }
            return Ok(EndpointAddr::Unix(path.to_owned()));
        }
        if let Some(addr) = raw
            .strip_prefix("vsock://")
            .or_else(|| raw.strip_prefix("vsock:"))
        {
            let (cid, port) = addr
                .split_once(':')
                .ok_or_else(|| PoolError::InvalidEndpoint(raw.to_owned()))?;
            let cid: u32 = cid
                .parse()
                .map_err(|_| PoolError::InvalidEndpoint(raw.to_owned()))?;
            let port: u32 = port
                .parse()
                .map_err(|_| PoolError::InvalidEndpoint(raw.to_owned()))?;
            return Ok(EndpointAddr::Vsock { cid, port });
        }
        Ok(EndpointAddr::Tcp(raw.to_owned()))
    }

    async fn connect_stream(&self) -> io::Result<EnclaveStream> {
        match self {
            EndpointAddr::Tcp(addr) => Ok(EnclaveStream::Tcp(TcpStream::connect(addr).await?)),
            EndpointAddr::Unix(path) => Ok(EnclaveStream::Unix(UnixStream::connect(path).await?)),
            EndpointAddr::Vsock { cid, port } => Ok(EnclaveStream::Vsock(
                VsockStream::connect(VsockAddr::new(*cid, *port)).await?,
            )),
        }
    }
}

/// Open an HTTP/2 channel to `raw` with the pool's keepalive and timeout
/// policy applied.
pub async fn connect(raw: &str, cfg: &PoolConfig) -> Result<Channel, PoolError> {
    let addr = EndpointAddr::parse(raw)?;
    // The URI authority is only used for the HTTP/2 :authority header; the
    // connector below performs the actual dial.
    let uri = match &addr {
        EndpointAddr::Tcp(hostport) => format!("http://{hostport}"),
        _ => "http://enclave.local".to_owned(),
    };
    let endpoint = Endpoint::try_from(uri)
        .map_err(PoolError::Dial)?
        .connect_timeout(cfg.dial_timeout)
        .timeout(cfg.call_timeout)
        .http2_keep_alive_interval(cfg.keepalive_time)
        .keep_alive_timeout(cfg.keepalive_timeout)
        .keep_alive_while_idle(true);

    let channel = endpoint
        .connect_with_connector(service_fn(move |_: tonic::transport::Uri| {
            let addr = addr.clone();
            async move {
                let stream = addr.connect_stream().await?;
                Ok::<_, io::Error>(TokioIo::new(stream))
            }
        }))
        .await
        .map_err(PoolError::Dial)?;
    Ok(channel)
}

/// Stream over any of the supported transports.
pub enum EnclaveStream {
    Tcp(TcpStream),
    Unix(UnixStream),
    Vsock(VsockStream),
}

impl AsyncRead for EnclaveStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            EnclaveStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            EnclaveStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            EnclaveStream::Vsock(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for EnclaveStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            EnclaveStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            EnclaveStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            EnclaveStream::Vsock(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            EnclaveStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            EnclaveStream::Unix(s) => Pin::new(s).poll_flush(cx),
            EnclaveStream::Vsock(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            EnclaveStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            EnclaveStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            EnclaveStream::Vsock(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

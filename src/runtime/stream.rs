use std::{
    net::SocketAddr,
    ops::DerefMut,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use super::{tls_rustls::TlsStream, TlsConfig};
use crate::{
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
    runtime,
};

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
#[cfg(not(target_os = "wasi"))]
const KEEPALIVE_TIME: Duration = Duration::from_secs(120);

/// An async stream possibly using TLS.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub(crate) enum AsyncStream {
    /// Placeholder left behind when a connection's stream has been moved out.
    Null,

    /// A basic TCP connection to the server.
    Tcp(TcpStream),

    /// A TLS connection over TCP.
    Tls(TlsStream),

    /// An in-memory connection to a mock deployment.
    #[cfg(test)]
    Duplex(tokio::io::DuplexStream),
}

impl AsyncStream {
    /// Opens a connection to `address`, wrapping it in TLS when a configuration is provided. The
    /// whole attempt (resolution, TCP connect and TLS handshake) is bounded by `connect_timeout`.
    pub(crate) async fn connect(
        address: &ServerAddress,
        tls_cfg: Option<&TlsConfig>,
        connect_timeout: Option<Duration>,
    ) -> Result<Self> {
        let timeout = match connect_timeout {
            Some(d) if d.is_zero() => None,
            Some(d) => Some(d),
            None => Some(DEFAULT_CONNECT_TIMEOUT),
        };
        let connect = async {
            let tcp_stream = tcp_connect(address).await?;
            match tls_cfg {
                Some(cfg) => Ok(AsyncStream::Tls(
                    cfg.connect(address.host(), tcp_stream).await?,
                )),
                None => Ok(AsyncStream::Tcp(tcp_stream)),
            }
        };
        match timeout {
            Some(timeout) => runtime::timeout(timeout, connect).await?,
            None => connect.await,
        }
    }
}

async fn tcp_try_connect(address: &SocketAddr) -> Result<TcpStream> {
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;

    #[cfg(not(target_os = "wasi"))]
    {
        let sock_ref = socket2::SockRef::from(&stream);
        let conf = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
        sock_ref.set_tcp_keepalive(&conf)?;
    }

    Ok(stream)
}

/// Connects to the first reachable socket address `address` resolves to, returning the error of
/// the first attempt if none succeed.
pub(crate) async fn tcp_connect(address: &ServerAddress) -> Result<TcpStream> {
    let resolved: Vec<SocketAddr> =
        tokio::net::lookup_host((address.host(), address.port_or_default()))
            .await?
            .collect();
    if resolved.is_empty() {
        return Err(Error::invalid_argument(format!(
            "No DNS results for domain {address}"
        )));
    }

    let mut connect_error = None;
    for socket_address in &resolved {
        match tcp_try_connect(socket_address).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                connect_error.get_or_insert(e);
            }
        }
    }

    Err(connect_error.unwrap_or_else(|| {
        ErrorKind::Internal {
            message: "connecting to all DNS results failed but no error reported".to_string(),
        }
        .into()
    }))
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(())),
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_read(cx, buf),
            Self::Tls(ref mut inner) => Pin::new(inner).poll_read(cx, buf),
            #[cfg(test)]
            Self::Duplex(ref mut inner) => Pin::new(inner).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(0)),
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_write(cx, buf),
            Self::Tls(ref mut inner) => Pin::new(inner).poll_write(cx, buf),
            #[cfg(test)]
            Self::Duplex(ref mut inner) => Pin::new(inner).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(())),
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_flush(cx),
            Self::Tls(ref mut inner) => Pin::new(inner).poll_flush(cx),
            #[cfg(test)]
            Self::Duplex(ref mut inner) => Pin::new(inner).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(())),
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_shutdown(cx),
            Self::Tls(ref mut inner) => Pin::new(inner).poll_shutdown(cx),
            #[cfg(test)]
            Self::Duplex(ref mut inner) => Pin::new(inner).poll_shutdown(cx),
        }
    }
}

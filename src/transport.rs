//! Local stream sockets for both endpoint variants.
//!
//! A TCP endpoint binds an ephemeral loopback port and publishes the port
//! number in the endpoint file. A Unix endpoint binds the endpoint path itself.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::config::TransportKind;
use crate::endpoint::Endpoint;
use crate::error::PortalError;

/// One accepted or connected stream, whatever the transport.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedConnection = Box<dyn Connection>;

/// A bound listening socket.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

impl Listener {
    /// Bind a listening socket for `endpoint`.
    ///
    /// Does not publish TCP endpoints; see [`Listener::discovery_value`].
    pub async fn bind(endpoint: &Endpoint) -> crate::Result<Self> {
        let bind_err = |source| PortalError::Bind {
            endpoint: endpoint.path().to_path_buf(),
            source,
        };
        match endpoint.kind() {
            TransportKind::Tcp => {
                let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
                let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
                Ok(Listener::Tcp(listener))
            }
            #[cfg(unix)]
            TransportKind::Unix => {
                let path = endpoint.path();
                if tokio::fs::try_exists(path).await.unwrap_or(false) {
                    if tokio::net::UnixStream::connect(path).await.is_ok() {
                        return Err(bind_err(std::io::Error::from(ErrorKind::AddrInUse)));
                    }
                    // Nobody answers: a leftover from a portal that died
                    tracing::debug!(endpoint = %path.display(), "removing stale socket");
                    endpoint.remove().await?;
                }
                let listener = tokio::net::UnixListener::bind(path).map_err(bind_err)?;
                Ok(Listener::Unix(listener))
            }
            #[cfg(not(unix))]
            TransportKind::Unix => Err(bind_err(std::io::Error::from(ErrorKind::Unsupported))),
        }
    }

    /// The value to publish in the endpoint file, if this transport needs one.
    pub fn discovery_value(&self) -> crate::Result<Option<String>> {
        match self {
            Listener::Tcp(listener) => Ok(Some(listener.local_addr()?.port().to_string())),
            #[cfg(unix)]
            Listener::Unix(_) => Ok(None),
        }
    }

    /// Human-readable bound address, for logs.
    pub fn describe(&self) -> String {
        match self {
            Listener::Tcp(listener) => match listener.local_addr() {
                Ok(addr) => format!("tcp://{addr}"),
                Err(_) => "tcp://<unknown>".to_string(),
            },
            #[cfg(unix)]
            Listener::Unix(listener) => match listener.local_addr() {
                Ok(addr) => match addr.as_pathname() {
                    Some(path) => format!("unix://{}", path.display()),
                    None => "unix://<unnamed>".to_string(),
                },
                Err(_) => "unix://<unknown>".to_string(),
            },
        }
    }

    pub async fn accept(&self) -> std::io::Result<BoxedConnection> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// Connect to the portal published at `endpoint`.
pub async fn connect(endpoint: &Endpoint) -> crate::Result<BoxedConnection> {
    let connect_err = |source| PortalError::Connect {
        endpoint: endpoint.path().to_path_buf(),
        source,
    };
    match endpoint.kind() {
        TransportKind::Tcp => {
            let port = match endpoint.read_port().await {
                Ok(port) => port,
                Err(PortalError::Io(e)) => return Err(connect_err(e)),
                Err(other) => return Err(other),
            };
            let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
                .await
                .map_err(connect_err)?;
            stream.set_nodelay(true).map_err(connect_err)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        TransportKind::Unix => {
            let stream = tokio::net::UnixStream::connect(endpoint.path())
                .await
                .map_err(connect_err)?;
            Ok(Box::new(stream))
        }
        #[cfg(not(unix))]
        TransportKind::Unix => Err(connect_err(std::io::Error::from(ErrorKind::Unsupported))),
    }
}

//! Listen addresses, listeners, and the stream they accept.
//!
//! Two connection-oriented transports carry the framed protocol: TCP
//! (`tcp:<ip>:<port>`) and Unix domain sockets (`ux:<path>`). Accepting a
//! connection yields the stream plus a [`Peer`]: the display form of the
//! remote address and the user identity the session's resource charges
//! are booked under. For TCP the identity defaults to the remote IP; for
//! Unix sockets the transport supplies an authenticated identity from the
//! peer's credentials (`SO_PEERCRED`).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::debug;

/// One address a domain listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// `tcp:<ip>:<port>`.
    Tcp(SocketAddr),
    /// `ux:<path>`.
    Unix(PathBuf),
}

/// Error parsing a listen address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid listen address {addr:?}: {reason}")]
pub struct AddrParseError {
    /// The rejected address text.
    pub addr: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

impl std::str::FromStr for ListenAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| AddrParseError {
            addr: s.to_owned(),
            reason,
        };
        let (scheme, rest) = s.split_once(':').ok_or_else(|| err("missing scheme"))?;
        match scheme {
            "tcp" => rest
                .parse()
                .map(Self::Tcp)
                .map_err(|_| err("expected tcp:<ip>:<port>")),
            "ux" => {
                if rest.is_empty() {
                    Err(err("expected ux:<path>"))
                } else {
                    Ok(Self::Unix(PathBuf::from(rest)))
                }
            },
            _ => Err(err("unknown scheme, expected tcp: or ux:")),
        }
    }
}

impl std::fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp:{addr}"),
            Self::Unix(path) => write!(f, "ux:{}", path.display()),
        }
    }
}

/// What the transport knows about an accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Display form of the remote endpoint.
    pub addr: String,
    /// User identity for resource accounting.
    pub user: String,
}

/// A bound listener for one [`ListenAddr`].
#[derive(Debug)]
pub enum Listener {
    /// TCP listener.
    Tcp(TcpListener),
    /// Unix socket listener, remembering its path for unlink on close.
    Unix(UnixListener, PathBuf),
}

impl Listener {
    /// Binds a listener.
    ///
    /// A stale Unix socket file left by an earlier process is removed
    /// before binding.
    ///
    /// # Errors
    ///
    /// Any bind failure, address in use included.
    pub async fn bind(addr: &ListenAddr) -> std::io::Result<Self> {
        match addr {
            ListenAddr::Tcp(socket_addr) => {
                Ok(Self::Tcp(TcpListener::bind(socket_addr).await?))
            },
            ListenAddr::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                Ok(Self::Unix(UnixListener::bind(path)?, path.clone()))
            },
        }
    }

    /// The bound address, with the kernel-assigned port for `tcp:…:0`.
    pub fn local_addr(&self) -> std::io::Result<ListenAddr> {
        match self {
            Self::Tcp(listener) => Ok(ListenAddr::Tcp(listener.local_addr()?)),
            Self::Unix(_, path) => Ok(ListenAddr::Unix(path.clone())),
        }
    }

    /// Accepts one connection and derives its [`Peer`].
    pub async fn accept(&self) -> std::io::Result<(Stream, Peer)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, remote) = listener.accept().await?;
                let peer = Peer {
                    addr: format!("tcp:{remote}"),
                    user: remote.ip().to_string(),
                };
                debug!(addr = %peer.addr, "accepted tcp connection");
                Ok((Stream::Tcp(stream), peer))
            },
            Self::Unix(listener, path) => {
                let (stream, _) = listener.accept().await?;
                let cred = stream.peer_cred()?;
                let peer = Peer {
                    addr: format!(
                        "ux:{}:pid={}",
                        path.display(),
                        cred.pid().map_or_else(|| "?".to_owned(), |p| p.to_string()),
                    ),
                    user: format!("uid:{}", cred.uid()),
                };
                debug!(addr = %peer.addr, user = %peer.user, "accepted unix connection");
                Ok((Stream::Unix(stream), peer))
            },
        }
    }

    /// Removes the socket file of a Unix listener. TCP is a no-op.
    pub fn cleanup(&self) {
        if let Self::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// An accepted connection stream of either transport.
#[derive(Debug)]
pub enum Stream {
    /// TCP connection.
    Tcp(TcpStream),
    /// Unix socket connection.
    Unix(UnixStream),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Self::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Connects to a listen address, for clients and tests.
pub async fn connect(addr: &ListenAddr) -> std::io::Result<Stream> {
    match addr {
        ListenAddr::Tcp(socket_addr) => Ok(Stream::Tcp(TcpStream::connect(socket_addr).await?)),
        ListenAddr::Unix(path) => Ok(Stream::Unix(UnixStream::connect(path).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_addresses() {
        let addr: ListenAddr = "tcp:127.0.0.1:4711".parse().unwrap();
        assert_eq!(
            addr,
            ListenAddr::Tcp("127.0.0.1:4711".parse().unwrap())
        );
        assert_eq!(addr.to_string(), "tcp:127.0.0.1:4711");
    }

    #[test]
    fn parses_unix_addresses() {
        let addr: ListenAddr = "ux:/run/pathfinder/domain.sock".parse().unwrap();
        assert_eq!(
            addr,
            ListenAddr::Unix(PathBuf::from("/run/pathfinder/domain.sock"))
        );
        assert_eq!(addr.to_string(), "ux:/run/pathfinder/domain.sock");
    }

    #[test]
    fn rejects_malformed_addresses() {
        for text in ["", "4711", "tcp:", "tcp:localhost", "ux:", "tls:1.2.3.4:1"] {
            assert!(
                text.parse::<ListenAddr>().is_err(),
                "{text:?} should not parse"
            );
        }
    }

    #[tokio::test]
    async fn tcp_peer_user_is_the_remote_ip() {
        let listener = Listener::bind(&"tcp:127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move { connect(&addr).await });
        let (_stream, peer) = listener.accept().await.unwrap();
        client.await.unwrap().unwrap();

        assert_eq!(peer.user, "127.0.0.1");
        assert!(peer.addr.starts_with("tcp:127.0.0.1:"));
    }

    #[tokio::test]
    async fn unix_peer_user_is_the_peer_uid() {
        let dir = tempfile::tempdir().unwrap();
        let addr = ListenAddr::Unix(dir.path().join("test.sock"));
        let listener = Listener::bind(&addr).await.unwrap();

        let client_addr = addr.clone();
        let client = tokio::spawn(async move { connect(&client_addr).await });
        let (_stream, peer) = listener.accept().await.unwrap();
        client.await.unwrap().unwrap();

        assert!(peer.user.starts_with("uid:"));
        listener.cleanup();
        assert!(!dir.path().join("test.sock").exists());
    }

    #[tokio::test]
    async fn binding_over_a_stale_socket_file_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, b"").unwrap();

        let addr = ListenAddr::Unix(path);
        let listener = Listener::bind(&addr).await.unwrap();
        drop(listener);
    }
}

// A worker-local server backed by a descriptor shared with the
// supervisor.

use std::net::SocketAddr;
use std::sync::Arc;

use cluster_common::ClusterError;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// A server whose listening socket is owned jointly with the supervisor
/// and, through it, with every sibling worker that asked for the same
/// spec. Closing this copy leaves the others open.
#[derive(Clone)]
pub struct SharedServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    address: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    shutdown: CancellationToken,
}

impl SharedServer {
    pub(crate) fn new(address: SocketAddr, listener: TcpListener) -> Self {
        SharedServer {
            inner: Arc::new(ServerInner {
                address,
                listener: Mutex::new(Some(listener)),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// The address the shared socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.address
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Accept the next connection from the shared accept queue. Which
    /// worker a given connection lands on is the kernel's choice.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ClusterError> {
        let guard = self.inner.listener.lock().await;
        let Some(listener) = guard.as_ref() else {
            return Err(ClusterError::Closed);
        };
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(ClusterError::Closed),
            accepted = listener.accept() => accepted.map_err(ClusterError::Io),
        }
    }

    /// Close the server and release its descriptor. Idempotent; resolves
    /// once any in-flight accept has let go of the socket.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let mut guard = self.inner.listener.lock().await;
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn local_server() -> SharedServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        SharedServer::new(address, listener)
    }

    #[tokio::test]
    async fn test_accepts_connections_until_closed() {
        let server = local_server().await;
        let address = server.local_addr();

        let client = tokio::spawn(async move {
            TcpStream::connect(address).await.unwrap();
        });
        let (_stream, peer) = server.accept().await.unwrap();
        assert_eq!(peer.ip(), address.ip());
        client.await.unwrap();

        server.close().await;
        assert!(server.is_closed());
        assert!(matches!(server.accept().await, Err(ClusterError::Closed)));
    }

    #[tokio::test]
    async fn test_close_interrupts_pending_accept() {
        let server = local_server().await;
        let waiting = server.clone();
        let pending = tokio::spawn(async move { waiting.accept().await });

        tokio::task::yield_now().await;
        server.close().await;
        assert!(matches!(pending.await.unwrap(), Err(ClusterError::Closed)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let server = local_server().await;
        server.close().await;
        server.close().await;
        assert!(server.is_closed());
    }
}

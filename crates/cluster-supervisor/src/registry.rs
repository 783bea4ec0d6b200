// Shared-listener registry: at most one kernel socket per listen
// fingerprint, duplicated to every worker that asks for it.

use std::collections::HashMap;
use std::net::TcpListener as StdTcpListener;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;

use anyhow::{Context, Result};
use cluster_common::constants::DEFAULT_BACKLOG;
use cluster_common::{ChannelSender, ClusterDebug, InternalMessage, ListenSpec, WorkerId};
use parking_lot::Mutex;
use tokio::net::TcpSocket;

/// A worker waiting for a shared-listener reply.
pub(crate) struct Waiter {
    pub sender: ChannelSender,
    /// The request token to echo; a token-less request gets no reply.
    pub token: Option<String>,
    pub worker: WorkerId,
    /// The original command, kept on the echo.
    pub cmd: String,
}

enum Entry {
    /// Bind in flight. Requesters with the same key queue here and are
    /// all answered once the socket reaches the listening state.
    Binding(Vec<Waiter>),
    Bound(StdTcpListener),
}

/// Master-side registry of shared listeners, keyed by listen fingerprint.
/// The supervisor keeps its own copy of every bound socket; workers hold
/// duplicates.
pub(crate) struct SharedListeners {
    entries: Mutex<HashMap<String, Entry>>,
    debug: ClusterDebug,
}

impl SharedListeners {
    pub fn new(debug: ClusterDebug) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            debug,
        })
    }

    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Handle one queryServer request. The reply is sent from here or
    /// from the bind task, never by the dispatch loop.
    pub fn query(self: Arc<Self>, spec: ListenSpec, waiter: Waiter) {
        let key = spec.fingerprint();
        let mut entries = self.entries.lock();
        match entries.get_mut(&key) {
            Some(Entry::Bound(listener)) => {
                let dup = listener
                    .as_fd()
                    .try_clone_to_owned()
                    .map_err(|err| err.to_string());
                drop(entries);
                self.debug
                    .log(&format!("worker {} joins shared listener {}", waiter.worker, key));
                answer(waiter, dup);
            }
            Some(Entry::Binding(waiters)) => {
                self.debug
                    .log(&format!("worker {} queued behind bind of {}", waiter.worker, key));
                waiters.push(waiter);
            }
            None => {
                entries.insert(key.clone(), Entry::Binding(vec![waiter]));
                drop(entries);
                self.debug.log(&format!("binding shared listener {}", key));
                let registry = Arc::clone(&self);
                tokio::spawn(async move { registry.bind_and_flush(key, spec).await });
            }
        }
    }

    /// Finish the one bind for `key` and flush everyone queued on it.
    async fn bind_and_flush(self: Arc<Self>, key: String, spec: ListenSpec) {
        let bound = bind_listener(&spec).await;

        let replies: Vec<(Waiter, std::result::Result<OwnedFd, String>)> = {
            let mut entries = self.entries.lock();
            let waiters = match entries.remove(&key) {
                Some(Entry::Binding(waiters)) => waiters,
                _ => Vec::new(),
            };
            match bound {
                Ok(listener) => {
                    let replies = waiters
                        .into_iter()
                        .map(|waiter| {
                            let dup = listener
                                .as_fd()
                                .try_clone_to_owned()
                                .map_err(|err| err.to_string());
                            (waiter, dup)
                        })
                        .collect();
                    entries.insert(key, Entry::Bound(listener));
                    replies
                }
                Err(err) => {
                    // The entry stays out of the registry so a later
                    // listen may retry once the condition clears.
                    let message = format!("{:#}", err);
                    self.debug
                        .log(&format!("shared bind of {} failed: {}", key, message));
                    waiters
                        .into_iter()
                        .map(|waiter| (waiter, Err(message.clone())))
                        .collect()
                }
            }
        };

        for (waiter, outcome) in replies {
            answer(waiter, outcome);
        }
    }

    /// Drop every shared listener. Worker copies are separate descriptors
    /// and stay open until the workers close them.
    pub fn close_all(&self) {
        self.entries.lock().clear();
    }
}

/// Echo a queryServer reply back to its requester, carrying either the
/// duplicated descriptor or the bind failure.
fn answer(waiter: Waiter, outcome: std::result::Result<OwnedFd, String>) {
    let Some(token) = waiter.token else { return };
    let reply = InternalMessage {
        cmd: waiter.cmd,
        ..Default::default()
    }
    .with_query_echo(token);
    tokio::spawn(async move {
        let result = match outcome {
            Ok(fd) => waiter.sender.send(&reply.to_value(), Some(fd.as_fd())).await,
            Err(error) => {
                waiter
                    .sender
                    .send(&reply.with_error(error).to_value(), None)
                    .await
            }
        };
        if let Err(err) = result {
            tracing::warn!(target: "cluster", worker = waiter.worker, "shared-listener reply failed: {}", err);
        }
    });
}

async fn bind_listener(spec: &ListenSpec) -> Result<StdTcpListener> {
    let mut addrs = tokio::net::lookup_host((spec.host.as_str(), spec.port))
        .await
        .with_context(|| format!("resolving {}:{}", spec.host, spec.port))?;
    let addr = addrs
        .next()
        .with_context(|| format!("no address for {}:{}", spec.host, spec.port))?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr).with_context(|| format!("binding {}", addr))?;
    let listener = socket
        .listen(spec.backlog.unwrap_or(DEFAULT_BACKLOG))
        .with_context(|| format!("listening on {}", addr))?;
    Ok(listener.into_std()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_common::{DebugRole, MessageChannel};
    use serde_json::Value;

    fn test_waiter(sender: &ChannelSender, worker: WorkerId, token: &str) -> Waiter {
        Waiter {
            sender: sender.clone(),
            token: Some(token.to_string()),
            worker,
            cmd: "NODE_CLUSTER_queryServer".to_string(),
        }
    }

    async fn next_reply(
        rx: &mut cluster_common::ChannelReceiver,
    ) -> (Value, Option<OwnedFd>) {
        rx.recv().await.unwrap().expect("registry reply")
    }

    #[tokio::test]
    async fn test_equal_specs_share_one_bind() {
        let registry = SharedListeners::new(ClusterDebug::new(DebugRole::Master));
        let (master_end, worker_end) = MessageChannel::pair().unwrap();
        let (sender, _keep) = master_end.split();
        let (_tx, mut worker_rx) = MessageChannel::from_fd(worker_end).unwrap().split();

        let spec = ListenSpec::new("127.0.0.1", 0);
        Arc::clone(&registry).query(spec.clone(), test_waiter(&sender, 1, "1:0"));
        Arc::clone(&registry).query(spec.clone(), test_waiter(&sender, 2, "2:0"));

        let (first, first_fd) = next_reply(&mut worker_rx).await;
        let (second, second_fd) = next_reply(&mut worker_rx).await;
        assert!(first_fd.is_some());
        assert!(second_fd.is_some());

        let tokens: Vec<&str> = [&first, &second]
            .iter()
            .map(|v| v["_queryEcho"].as_str().unwrap())
            .collect();
        assert!(tokens.contains(&"1:0"));
        assert!(tokens.contains(&"2:0"));

        // One entry, and both descriptors name the same socket.
        assert_eq!(registry.count(), 1);
        let addr_a = std::net::TcpListener::from(first_fd.unwrap())
            .local_addr()
            .unwrap();
        let addr_b = std::net::TcpListener::from(second_fd.unwrap())
            .local_addr()
            .unwrap();
        assert_eq!(addr_a, addr_b);
    }

    #[tokio::test]
    async fn test_distinct_specs_bind_separately() {
        let registry = SharedListeners::new(ClusterDebug::new(DebugRole::Master));
        let (master_end, worker_end) = MessageChannel::pair().unwrap();
        let (sender, _keep) = master_end.split();
        let (_tx, mut worker_rx) = MessageChannel::from_fd(worker_end).unwrap().split();

        Arc::clone(&registry).query(ListenSpec::new("127.0.0.1", 0), test_waiter(&sender, 1, "1:0"));
        let _ = next_reply(&mut worker_rx).await;
        Arc::clone(&registry).query(
            ListenSpec::new("127.0.0.1", 0).with_backlog(16),
            test_waiter(&sender, 1, "1:1"),
        );
        let _ = next_reply(&mut worker_rx).await;

        assert_eq!(registry.count(), 2);
    }

    #[tokio::test]
    async fn test_bind_failure_reaches_every_requester() {
        let registry = SharedListeners::new(ClusterDebug::new(DebugRole::Master));
        let (master_end, worker_end) = MessageChannel::pair().unwrap();
        let (sender, _keep) = master_end.split();
        let (_tx, mut worker_rx) = MessageChannel::from_fd(worker_end).unwrap().split();

        // A host that cannot resolve makes the bind fail deterministically.
        let spec = ListenSpec::new("invalid.host.name.invalid", 1);
        Arc::clone(&registry).query(spec.clone(), test_waiter(&sender, 1, "1:0"));
        Arc::clone(&registry).query(spec, test_waiter(&sender, 2, "2:0"));

        let (first, first_fd) = next_reply(&mut worker_rx).await;
        let (second, second_fd) = next_reply(&mut worker_rx).await;
        assert!(first_fd.is_none());
        assert!(second_fd.is_none());
        assert!(first["error"].is_string());
        assert!(second["error"].is_string());

        // The failed key is gone; a later listen may retry.
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_close_all_empties_the_registry() {
        let registry = SharedListeners::new(ClusterDebug::new(DebugRole::Master));
        let (master_end, worker_end) = MessageChannel::pair().unwrap();
        let (sender, _keep) = master_end.split();
        let (_tx, mut worker_rx) = MessageChannel::from_fd(worker_end).unwrap().split();

        Arc::clone(&registry).query(ListenSpec::new("127.0.0.1", 0), test_waiter(&sender, 1, "1:0"));
        let (_, fd) = next_reply(&mut worker_rx).await;
        let worker_copy = std::net::TcpListener::from(fd.unwrap());
        let addr = worker_copy.local_addr().unwrap();

        registry.close_all();
        assert_eq!(registry.count(), 0);

        // The worker's duplicate outlives the master's copy.
        assert_eq!(worker_copy.local_addr().unwrap(), addr);
    }
}

// The supervisor's record of one worker.

use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cluster_common::{
    ChannelSender, ClusterError, InternalCmd, InternalMessage, WorkerId, WorkerState,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::spawn::ChildExit;

/// Handle to one worker. Clones share the underlying record; the
/// supervisor's workers map holds one more clone until the worker leaves.
#[derive(Clone)]
pub struct Worker {
    pub(crate) shared: Arc<WorkerShared>,
}

pub(crate) struct WorkerShared {
    pub(crate) id: WorkerId,
    pub(crate) sender: ChannelSender,
    state: watch::Sender<WorkerState>,
    /// Unset until the worker exits or someone asks it to; coerced to a
    /// plain bool when the record is retired.
    suicide: Mutex<Option<bool>>,
    exit: watch::Sender<Option<ChildExit>>,
    /// Cancelled when the process should receive the kill signal.
    pub(crate) kill_requested: CancellationToken,
    pub(crate) kill_on_disconnect: AtomicBool,
    pid: Mutex<Option<u32>>,
}

impl Worker {
    pub(crate) fn new(id: WorkerId, sender: ChannelSender) -> Self {
        let (state, _) = watch::channel(WorkerState::None);
        let (exit, _) = watch::channel(None);
        Worker {
            shared: Arc::new(WorkerShared {
                id,
                sender,
                state,
                suicide: Mutex::new(None),
                exit,
                kill_requested: CancellationToken::new(),
                kill_on_disconnect: AtomicBool::new(false),
                pid: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.shared.id
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.state.borrow()
    }

    /// Whether the worker's end was intentional. Unset until either side
    /// asks for termination; `Some(true)` on the exit event means the end
    /// came from `disconnect` or `destroy`.
    pub fn suicide(&self) -> Option<bool> {
        *self.shared.suicide.lock()
    }

    pub fn pid(&self) -> Option<u32> {
        *self.shared.pid.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.sender.is_connected()
    }

    /// Send a user message to the worker.
    pub async fn send(&self, value: Value) -> Result<(), ClusterError> {
        self.shared.sender.send(&value, None).await
    }

    /// Send a user message with a descriptor riding along.
    pub async fn send_with_handle(
        &self,
        value: Value,
        handle: BorrowedFd<'_>,
    ) -> Result<(), ClusterError> {
        self.shared.sender.send(&value, Some(handle)).await
    }

    /// Ask the worker to shut down gracefully: it closes its listeners,
    /// then its channel. The exit that follows is recorded as intentional.
    pub async fn disconnect(&self) -> Result<(), ClusterError> {
        self.shared.set_suicide();
        let msg = InternalMessage::new(InternalCmd::Disconnect);
        self.shared.sender.send(&msg.to_value(), None).await
    }

    /// Hard stop: close the channel, then kill the process once the
    /// channel reports disconnect (immediately when already closed).
    pub fn destroy(&self) {
        self.shared.set_suicide();
        if self.is_connected() {
            self.shared.kill_on_disconnect.store(true, Ordering::SeqCst);
            self.shared.sender.close();
        } else {
            self.shared.kill_requested.cancel();
        }
    }

    /// Resolve once the worker's channel has closed.
    pub async fn wait_disconnect(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|state| *state >= WorkerState::Disconnected).await;
    }

    /// Resolve with the exit status once the worker process has ended.
    /// A worker whose spawn failed reports an empty status right away.
    pub async fn wait_exit(&self) -> ChildExit {
        let mut rx = self.shared.exit.subscribe();
        let result = match rx.wait_for(|status| status.is_some()).await {
            Ok(status) => status.clone().unwrap_or_default(),
            Err(_) => ChildExit::default(),
        };
        result
    }
}

impl WorkerShared {
    pub(crate) fn set_suicide(&self) {
        *self.suicide.lock() = Some(true);
    }

    /// Read the flag as the exit event reports it, pinning the unset case
    /// to `false`.
    pub(crate) fn coerce_suicide(&self) -> bool {
        let mut slot = self.suicide.lock();
        let value = slot.unwrap_or(false);
        *slot = Some(value);
        value
    }

    /// Move the state forward. Regressions (a dead worker reporting
    /// disconnect, replayed transitions) are dropped. Returns whether the
    /// state changed.
    pub(crate) fn advance_state(&self, next: WorkerState) -> bool {
        self.state.send_if_modified(|current| {
            if current.can_advance_to(next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn set_pid(&self, pid: Option<u32>) {
        *self.pid.lock() = pid;
    }

    pub(crate) fn record_exit(&self, status: ChildExit) {
        self.exit.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(status);
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_common::MessageChannel;

    fn test_worker() -> Worker {
        let (channel, _peer) = MessageChannel::pair().unwrap();
        let (sender, _receiver) = channel.split();
        Worker::new(7, sender)
    }

    #[tokio::test]
    async fn test_new_record_starts_blank() {
        let worker = test_worker();
        assert_eq!(worker.id(), 7);
        assert_eq!(worker.state(), WorkerState::None);
        assert_eq!(worker.suicide(), None);
        assert!(worker.is_connected());
    }

    #[tokio::test]
    async fn test_state_never_regresses() {
        let worker = test_worker();
        assert!(worker.shared.advance_state(WorkerState::Online));
        assert!(worker.shared.advance_state(WorkerState::Listening));
        assert!(!worker.shared.advance_state(WorkerState::Online));
        assert!(worker.shared.advance_state(WorkerState::Dead));
        assert!(!worker.shared.advance_state(WorkerState::Disconnected));
        assert_eq!(worker.state(), WorkerState::Dead);
    }

    #[tokio::test]
    async fn test_suicide_coercion_pins_unset_to_false() {
        let worker = test_worker();
        assert!(!worker.shared.coerce_suicide());
        assert_eq!(worker.suicide(), Some(false));

        let intentional = test_worker();
        intentional.shared.set_suicide();
        assert!(intentional.shared.coerce_suicide());
        assert_eq!(intentional.suicide(), Some(true));
    }

    #[tokio::test]
    async fn test_exit_status_is_recorded_once() {
        let worker = test_worker();
        worker.shared.record_exit(ChildExit { code: Some(0), signal: None });
        worker.shared.record_exit(ChildExit { code: Some(9), signal: None });
        assert_eq!(worker.wait_exit().await.code, Some(0));
    }
}

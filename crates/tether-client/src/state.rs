//! Connectivity state shared by the pump's loops.
//!
//! The state lives in a `watch` channel so any number of loops can wait for a
//! transition; a waiter always re-checks the value after waking. The current
//! connection and its generation sit behind one mutex, and every transition
//! happens under that mutex, so a loop can never pair a state with a
//! connection it does not belong to. Each connection also carries a `lost`
//! token, cancelled as soon as it stops being current, so a loop blocked on
//! an old connection wakes even if that connection's I/O never returns.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tether_transport::Connection;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Whether the pump currently has a usable connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// A connection is installed.
    Connected,
    /// No connection; waiting for a (re)dial.
    Disconnected,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => f.write_str("connected"),
            Self::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// Current connection tagged with its generation.
pub(crate) struct Current {
    pub epoch: u64,
    pub conn: Arc<dyn Connection>,
    /// Cancelled once this connection is replaced or disconnected.
    pub lost: CancellationToken,
}

struct Slot {
    epoch: u64,
    conn: Option<Arc<dyn Connection>>,
    lost: CancellationToken,
    retired: Vec<Arc<dyn Connection>>,
}

impl Slot {
    fn retire_current(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.retired.push(conn);
        }
        self.lost.cancel();
    }
}

pub(crate) struct Link {
    state: watch::Sender<ConnectivityState>,
    slot: Mutex<Slot>,
}

impl Link {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectivityState::Disconnected);
        Self {
            state,
            slot: Mutex::new(Slot {
                epoch: 0,
                conn: None,
                lost: CancellationToken::new(),
                retired: Vec::new(),
            }),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    /// Install a freshly dialed connection and flip to Connected.
    pub fn install(&self, conn: Arc<dyn Connection>) -> u64 {
        let mut slot = self.slot();
        slot.retire_current();
        slot.epoch += 1;
        slot.conn = Some(conn);
        slot.lost = CancellationToken::new();
        self.state.send_if_modified(|s| {
            let changed = *s != ConnectivityState::Connected;
            *s = ConnectivityState::Connected;
            changed
        });
        slot.epoch
    }

    /// Flip to Disconnected if `epoch` is still the current connection.
    ///
    /// Returns `false` when the failure belongs to a connection that was
    /// already replaced or retired.
    pub fn mark_disconnected(&self, epoch: u64) -> bool {
        let mut slot = self.slot();
        if slot.epoch != epoch || slot.conn.is_none() {
            return false;
        }
        slot.retire_current();
        self.state.send_if_modified(|s| {
            let changed = *s != ConnectivityState::Disconnected;
            *s = ConnectivityState::Disconnected;
            changed
        });
        true
    }

    /// Snapshot of the current connection, if any.
    pub fn current(&self) -> Option<Current> {
        let slot = self.slot();
        slot.conn.as_ref().map(|conn| Current {
            epoch: slot.epoch,
            conn: conn.clone(),
            lost: slot.lost.clone(),
        })
    }

    /// Connections that were replaced or failed and still need closing.
    pub fn take_retired(&self) -> Vec<Arc<dyn Connection>> {
        std::mem::take(&mut self.slot().retired)
    }

    /// Retire everything and flip to Disconnected.
    pub fn shutdown(&self) -> Vec<Arc<dyn Connection>> {
        let mut slot = self.slot();
        slot.retire_current();
        self.state.send_if_modified(|s| {
            let changed = *s != ConnectivityState::Disconnected;
            *s = ConnectivityState::Disconnected;
            changed
        });
        std::mem::take(&mut slot.retired)
    }

    /// Wait until a connection is installed.
    ///
    /// Returns `None` once `cancel` fires.
    pub async fn connected(&self, cancel: &CancellationToken) -> Option<Current> {
        let mut rx = self.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                changed = rx.wait_for(|s| *s == ConnectivityState::Connected) => {
                    changed.ok()?;
                }
            }
            if let Some(current) = self.current() {
                return Some(current);
            }
            // Lost a race with a disconnect; the next wait re-checks the value.
        }
    }

    /// Wait until the state is Disconnected.
    ///
    /// Returns `false` once `cancel` fires.
    pub async fn disconnected(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.subscribe();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            changed = rx.wait_for(|s| *s == ConnectivityState::Disconnected) => changed.is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tether_transport::memory;

    fn conn() -> Arc<dyn Connection> {
        Arc::new(memory::pair(1).0)
    }

    #[test]
    fn test_stale_failure_ignored() {
        let link = Link::new();
        let first = link.install(conn());
        let second = link.install(conn());
        assert_eq!(link.state(), ConnectivityState::Connected);

        assert!(!link.mark_disconnected(first));
        assert_eq!(link.state(), ConnectivityState::Connected);
        assert_eq!(link.take_retired().len(), 1);

        assert!(link.mark_disconnected(second));
        assert!(!link.mark_disconnected(second));
        assert_eq!(link.state(), ConnectivityState::Disconnected);
        assert!(link.current().is_none());
        assert_eq!(link.take_retired().len(), 1);
    }

    #[test]
    fn test_lost_fires_on_replace_and_disconnect() {
        let link = Link::new();
        link.install(conn());
        let first = link.current().unwrap();
        assert!(!first.lost.is_cancelled());

        let epoch = link.install(conn());
        assert!(first.lost.is_cancelled());
        let second = link.current().unwrap();
        assert!(!second.lost.is_cancelled());

        // A stale report leaves the current connection alone.
        assert!(!link.mark_disconnected(first.epoch));
        assert!(!second.lost.is_cancelled());

        assert!(link.mark_disconnected(epoch));
        assert!(second.lost.is_cancelled());

        link.install(conn());
        let third = link.current().unwrap();
        link.shutdown();
        assert!(third.lost.is_cancelled());
    }

    #[tokio::test]
    async fn test_waiters_wake_on_transition() {
        let link = Arc::new(Link::new());
        let cancel = CancellationToken::new();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let (link, cancel) = (link.clone(), cancel.clone());
                tokio::spawn(async move { link.connected(&cancel).await.map(|c| c.epoch) })
            })
            .collect();

        tokio::task::yield_now().await;
        let epoch = link.install(conn());
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Some(epoch));
        }

        assert!(tokio::time::timeout(Duration::from_millis(10), link.disconnected(&cancel))
            .await
            .is_err());
        link.mark_disconnected(epoch);
        assert!(link.disconnected(&cancel).await);
    }

    #[tokio::test]
    async fn test_cancel_releases_waiters() {
        let link = Link::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(link.connected(&cancel).await.is_none());
    }
}

//! Connectivity signal and a polling reachability probe.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::remote::{HttpRemote, ServiceError, ServiceErrorKind};

/// Snapshot of network connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStatus {
  /// A network link is up
  pub is_connected: bool,
  /// The backend actually answers
  pub is_reachable: bool,
}

impl NetworkStatus {
  pub const ONLINE: Self = Self {
    is_connected: true,
    is_reachable: true,
  };

  pub const OFFLINE: Self = Self {
    is_connected: false,
    is_reachable: false,
  };

  pub fn is_online(&self) -> bool {
    self.is_connected && self.is_reachable
  }
}

/// Receiving side of the connectivity signal.
pub type ConnectivitySignal = watch::Receiver<NetworkStatus>;

/// Create a connectivity signal that is driven by hand.
pub fn channel(initial: NetworkStatus) -> (watch::Sender<NetworkStatus>, ConnectivitySignal) {
  watch::channel(initial)
}

fn status_from_probe(result: &Result<(), ServiceError>) -> NetworkStatus {
  match result {
    Ok(()) => NetworkStatus::ONLINE,
    // The link is up but the backend did not answer in time
    Err(err) if err.kind == ServiceErrorKind::Timeout => NetworkStatus {
      is_connected: true,
      is_reachable: false,
    },
    Err(_) => NetworkStatus::OFFLINE,
  }
}

/// Background task that probes the backend on a fixed interval and
/// publishes every status change.
pub struct ConnectivityMonitor {
  rx: ConnectivitySignal,
  handle: JoinHandle<()>,
}

impl ConnectivityMonitor {
  /// Start probing `remote` every `interval`.
  pub fn spawn(remote: HttpRemote, interval: Duration) -> Self {
    let (tx, rx) = watch::channel(NetworkStatus::OFFLINE);

    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        let status = status_from_probe(&remote.probe().await);
        let changed = tx.send_if_modified(|current| {
          if *current == status {
            return false;
          }
          *current = status;
          true
        });
        if changed {
          info!(online = status.is_online(), "connectivity changed");
        } else {
          debug!(online = status.is_online(), "connectivity unchanged");
        }
        if tx.is_closed() {
          break;
        }
      }
    });

    Self { rx, handle }
  }

  /// A new receiver for the connectivity signal.
  pub fn subscribe(&self) -> ConnectivitySignal {
    self.rx.clone()
  }

  pub fn current(&self) -> NetworkStatus {
    *self.rx.borrow()
  }
}

impl Drop for ConnectivityMonitor {
  fn drop(&mut self) {
    self.handle.abort();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_online_requires_both_flags() {
    assert!(NetworkStatus::ONLINE.is_online());
    assert!(!NetworkStatus::OFFLINE.is_online());
    assert!(!NetworkStatus {
      is_connected: true,
      is_reachable: false
    }
    .is_online());
  }

  #[test]
  fn test_probe_result_mapping() {
    assert_eq!(status_from_probe(&Ok(())), NetworkStatus::ONLINE);
    assert_eq!(
      status_from_probe(&Err(ServiceError::network("refused"))),
      NetworkStatus::OFFLINE
    );
    let slow = status_from_probe(&Err(ServiceError::timeout("5s")));
    assert!(slow.is_connected && !slow.is_reachable);
  }
}

//! Online/offline tracking.
//!
//! [`Connectivity`] is the single owner of the current connectivity state and
//! of the transition listeners. It is created once per process and handed to
//! whoever needs it; [`ConnectivityProbe`] feeds it from a reachability check.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::subscription::Subscription;

type Callback = Arc<dyn Fn() + Send + Sync>;

struct Listener {
  id: u64,
  on_up: Callback,
  on_down: Callback,
}

struct Shared {
  online: AtomicBool,
  next_id: AtomicU64,
  listeners: Mutex<Vec<Listener>>,
}

impl Shared {
  fn listeners(&self) -> MutexGuard<'_, Vec<Listener>> {
    self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// Connectivity monitor shared by the sync engine and the live feed.
#[derive(Clone)]
pub struct Connectivity {
  shared: Arc<Shared>,
}

impl Connectivity {
  pub fn new(initially_online: bool) -> Self {
    Self {
      shared: Arc::new(Shared {
        online: AtomicBool::new(initially_online),
        next_id: AtomicU64::new(0),
        listeners: Mutex::new(Vec::new()),
      }),
    }
  }

  /// Point-in-time read of the connectivity signal.
  pub fn is_online(&self) -> bool {
    self.shared.online.load(Ordering::SeqCst)
  }

  /// Feed a new reading of the platform signal.
  ///
  /// Listeners fire only when the value actually changes.
  pub fn set_online(&self, online: bool) {
    let was_online = self.shared.online.swap(online, Ordering::SeqCst);
    if was_online == online {
      return;
    }

    info!(online, "Connectivity changed");

    // Callbacks run outside the lock so they may subscribe or unsubscribe.
    let callbacks: Vec<Callback> = self
      .shared
      .listeners()
      .iter()
      .map(|l| {
        if online {
          Arc::clone(&l.on_up)
        } else {
          Arc::clone(&l.on_down)
        }
      })
      .collect();

    for callback in callbacks {
      callback();
    }
  }

  /// Register transition callbacks. Nothing fires on registration.
  pub fn on_transition<U, D>(&self, on_up: U, on_down: D) -> Subscription
  where
    U: Fn() + Send + Sync + 'static,
    D: Fn() + Send + Sync + 'static,
  {
    let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
    self.shared.listeners().push(Listener {
      id,
      on_up: Arc::new(on_up),
      on_down: Arc::new(on_down),
    });

    let shared = Arc::downgrade(&self.shared);
    Subscription::new(move || {
      if let Some(shared) = shared.upgrade() {
        shared.listeners().retain(|l| l.id != id);
      }
    })
  }

  #[cfg(test)]
  fn listener_count(&self) -> usize {
    self.shared.listeners().len()
  }
}

/// Periodic reachability check that drives a [`Connectivity`] monitor.
#[derive(Debug, Clone)]
pub struct ConnectivityProbe {
  address: String,
  interval: Duration,
  timeout: Duration,
}

impl ConnectivityProbe {
  pub fn new(address: impl Into<String>, interval: Duration, timeout: Duration) -> Self {
    Self {
      address: address.into(),
      interval,
      timeout,
    }
  }

  /// Try a TCP connection to the probe address within the timeout.
  pub async fn check(&self) -> bool {
    let reachable = matches!(
      tokio::time::timeout(self.timeout, TcpStream::connect(&self.address)).await,
      Ok(Ok(_))
    );
    debug!(address = %self.address, reachable, "Connectivity probe");
    reachable
  }

  /// Run the probe on its interval, feeding every reading to `connectivity`.
  pub fn spawn(self, connectivity: Connectivity) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let online = self.check().await;
        connectivity.set_online(online);
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  fn counters(
    monitor: &Connectivity,
  ) -> (Arc<AtomicUsize>, Arc<AtomicUsize>, Subscription) {
    let ups = Arc::new(AtomicUsize::new(0));
    let downs = Arc::new(AtomicUsize::new(0));
    let (u, d) = (Arc::clone(&ups), Arc::clone(&downs));
    let sub = monitor.on_transition(
      move || {
        u.fetch_add(1, Ordering::SeqCst);
      },
      move || {
        d.fetch_add(1, Ordering::SeqCst);
      },
    );
    (ups, downs, sub)
  }

  #[test]
  fn test_no_callback_on_registration() {
    let monitor = Connectivity::new(true);
    let (ups, downs, _sub) = counters(&monitor);
    assert_eq!(ups.load(Ordering::SeqCst), 0);
    assert_eq!(downs.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_fires_once_per_transition() {
    let monitor = Connectivity::new(true);
    let (ups, downs, _sub) = counters(&monitor);

    monitor.set_online(false);
    monitor.set_online(false);
    monitor.set_online(true);
    monitor.set_online(true);
    monitor.set_online(false);

    assert_eq!(ups.load(Ordering::SeqCst), 1);
    assert_eq!(downs.load(Ordering::SeqCst), 2);
    assert!(!monitor.is_online());
  }

  #[test]
  fn test_unsubscribe_stops_callbacks() {
    let monitor = Connectivity::new(false);
    let (ups, _downs, mut sub) = counters(&monitor);

    sub.unsubscribe();
    sub.unsubscribe();
    monitor.set_online(true);

    assert_eq!(ups.load(Ordering::SeqCst), 0);
    assert_eq!(monitor.listener_count(), 0);
  }

  #[test]
  fn test_unsubscribe_only_removes_own_listener() {
    let monitor = Connectivity::new(false);
    let (ups_a, _, mut sub_a) = counters(&monitor);
    let (ups_b, _, _sub_b) = counters(&monitor);

    sub_a.unsubscribe();
    monitor.set_online(true);

    assert_eq!(ups_a.load(Ordering::SeqCst), 0);
    assert_eq!(ups_b.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_probe_reports_unreachable_address() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let probe = ConnectivityProbe::new(address, Duration::from_secs(1), Duration::from_millis(200));
    assert!(!probe.check().await);
  }

  #[tokio::test]
  async fn test_probe_reports_reachable_listener() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let probe = ConnectivityProbe::new(address, Duration::from_secs(1), Duration::from_secs(1));
    assert!(probe.check().await);
  }
}

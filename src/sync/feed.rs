use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::LocalCache;
use crate::connectivity::Connectivity;
use crate::remote::RemoteStore;
use crate::subscription::Subscription;
use crate::vehicle::Vehicle;

/// Publishes the full vehicle set to a subscriber.
///
/// The source is chosen once, at subscription time: a live remote query when
/// online, the cached snapshot otherwise.
pub struct LiveFeed<R: RemoteStore> {
  remote: Arc<R>,
  cache: LocalCache,
  connectivity: Connectivity,
  collection: String,
}

impl<R: RemoteStore> LiveFeed<R> {
  pub fn new(
    remote: Arc<R>,
    cache: LocalCache,
    connectivity: Connectivity,
    collection: impl Into<String>,
  ) -> Self {
    Self {
      remote,
      cache,
      connectivity,
      collection: collection.into(),
    }
  }

  /// Deliver vehicle sets to `callback` until the returned handle is dropped.
  ///
  /// Offline, the cached snapshot is delivered once before this returns.
  /// Online, every remote result set is persisted to the cache and then
  /// delivered. If the live query fails, the cached snapshot is delivered
  /// once and the feed ends.
  pub fn subscribe<F>(&self, callback: F) -> Subscription
  where
    F: Fn(Vec<Vehicle>) + Send + Sync + 'static,
  {
    if !self.connectivity.is_online() {
      debug!("Offline, serving cached vehicles");
      callback(self.cache.load());
      return Subscription::noop();
    }

    let mut snapshots = self.remote.watch(&self.collection);
    let cache = self.cache.clone();
    let task = tokio::spawn(async move {
      while let Some(next) = snapshots.recv().await {
        match next {
          Ok(vehicles) => {
            cache.persist_remote_snapshot(&vehicles);
            callback(vehicles);
          }
          Err(e) => {
            warn!(error = %e, "Live query failed, serving cached vehicles");
            callback(cache.load());
            break;
          }
        }
      }
    });

    Subscription::new(move || task.abort())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::remote::memory::MemoryStore;
  use crate::remote::RemoteError;
  use crate::vehicle::{mint_local_id, NewVehicle};
  use chrono::Utc;
  use std::time::Duration;
  use tokio::sync::mpsc;

  fn setup(online: bool) -> (Arc<MemoryStore>, LiveFeed<MemoryStore>) {
    let remote = Arc::new(MemoryStore::new());
    let cache = LocalCache::new(Arc::new(SqliteStorage::open_in_memory().unwrap()));
    let feed = LiveFeed::new(
      Arc::clone(&remote),
      cache,
      Connectivity::new(online),
      "vehicles",
    );
    (remote, feed)
  }

  fn remote_vehicle(id: &str, plate: &str) -> Vehicle {
    let mut vehicle = NewVehicle::new(plate).into_vehicle(Some(id.to_string()));
    vehicle.sync_timestamp = Some(Utc::now());
    vehicle
  }

  fn channel_sink() -> (
    impl Fn(Vec<Vehicle>) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<Vec<Vehicle>>,
  ) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
      move |vehicles| {
        let _ = tx.send(vehicles);
      },
      rx,
    )
  }

  async fn next(rx: &mut mpsc::UnboundedReceiver<Vec<Vehicle>>) -> Vec<Vehicle> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
      .await
      .unwrap()
      .unwrap()
  }

  #[tokio::test]
  async fn test_offline_delivers_cache_once() {
    let (remote, feed) = setup(false);
    let local = NewVehicle::new("LOC-1111").into_vehicle(Some(mint_local_id()));
    feed.cache.save(&[local.clone()]);
    let (sink, mut rx) = channel_sink();

    let _sub = feed.subscribe(sink);

    assert_eq!(rx.try_recv().unwrap(), vec![local]);
    assert!(rx.try_recv().is_err());
    assert!(remote.calls().is_empty());
  }

  #[tokio::test]
  async fn test_online_persists_and_delivers_remote_set() {
    let (remote, feed) = setup(true);
    remote.insert(remote_vehicle("remote-1", "AAA-1111"));
    let local = NewVehicle::new("LOC-1111").into_vehicle(Some(mint_local_id()));
    feed.cache.save(&[local.clone()]);
    let (sink, mut rx) = channel_sink();

    let _sub = feed.subscribe(sink);

    let first = next(&mut rx).await;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].id(), Some("remote-1"));

    let cached = feed.cache.load();
    assert_eq!(cached.len(), 2);
    assert_eq!(cached[1], local);

    remote.insert(remote_vehicle("remote-2", "BBB-2222"));
    let second = next(&mut rx).await;
    assert_eq!(second.len(), 2);
  }

  #[tokio::test]
  async fn test_query_failure_falls_back_to_cache() {
    let (remote, feed) = setup(true);
    let cached = remote_vehicle("remote-9", "OLD-9999");
    feed.cache.save(&[cached.clone()]);
    remote.fail_watch(RemoteError::PermissionDenied("rules".to_string()));
    let (sink, mut rx) = channel_sink();

    let _sub = feed.subscribe(sink);

    assert_eq!(next(&mut rx).await, vec![cached]);
    assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv())
      .await
      .map_or(true, |v| v.is_none()));
  }

  #[tokio::test]
  async fn test_broken_stream_serves_cache_after_remote_sets() {
    let (remote, feed) = setup(true);
    remote.insert(remote_vehicle("remote-1", "AAA-1111"));
    let (sink, mut rx) = channel_sink();
    let _sub = feed.subscribe(sink);
    next(&mut rx).await;

    remote.break_watchers(RemoteError::Unavailable("stream reset".to_string()));

    let fallback = next(&mut rx).await;
    assert_eq!(fallback.len(), 1);
    assert_eq!(fallback[0].id(), Some("remote-1"));
  }

  #[tokio::test]
  async fn test_unsubscribe_stops_delivery() {
    let (remote, feed) = setup(true);
    let (sink, mut rx) = channel_sink();
    let mut sub = feed.subscribe(sink);
    next(&mut rx).await;

    sub.unsubscribe();
    tokio::task::yield_now().await;
    remote.insert(remote_vehicle("remote-1", "AAA-1111"));

    assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv())
      .await
      .map_or(true, |v| v.is_none()));
  }

  #[tokio::test]
  async fn test_mode_is_fixed_at_subscription() {
    let (remote, feed) = setup(false);
    let (sink, mut rx) = channel_sink();
    let _sub = feed.subscribe(sink);
    assert!(rx.try_recv().is_ok());

    feed.connectivity.set_online(true);
    remote.insert(remote_vehicle("remote-1", "AAA-1111"));

    assert!(rx.try_recv().is_err());
    assert!(remote.calls().is_empty());
  }
}

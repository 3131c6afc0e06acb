//! In-flight request coalescing
//!
//! Identical concurrent GET/HEAD requests share one wire request. The
//! first caller for a key becomes the leader and does the work; everyone
//! else becomes a follower awaiting the leader's published outcome. If a
//! leader is cancelled before publishing, its followers re-join and one
//! of them takes over, so a dying leader never strands the rest.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Map of in-flight operations keyed by request identity.
///
/// Cheap to clone; all clones share the map.
pub struct InflightMap<T: Clone> {
    inner: Arc<Mutex<HashMap<String, watch::Receiver<Option<T>>>>>,
}

impl<T: Clone> Clone for InflightMap<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Default for InflightMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Role assigned to a joining caller.
pub enum Flight<T: Clone> {
    /// Do the work, then publish through the guard.
    Leader(FlightGuard<T>),
    /// Await the leader's outcome.
    Follower(watch::Receiver<Option<T>>),
}

impl<T: Clone> InflightMap<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Join the flight for `key`, becoming leader iff none is active.
    pub fn join(&self, key: &str) -> Flight<T> {
        let mut inner = self.inner.lock();
        if let Some(rx) = inner.get(key) {
            return Flight::Follower(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        inner.insert(key.to_string(), rx);
        Flight::Leader(FlightGuard {
            map: Arc::clone(&self.inner),
            key: key.to_string(),
            tx: Some(tx),
        })
    }

    /// Number of in-flight keys.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Leader handle. Publishing (or dropping) removes the key, so a new
/// request for the same identity starts a fresh flight.
pub struct FlightGuard<T: Clone> {
    map: Arc<Mutex<HashMap<String, watch::Receiver<Option<T>>>>>,
    key: String,
    tx: Option<watch::Sender<Option<T>>>,
}

impl<T: Clone> FlightGuard<T> {
    /// Publish the outcome to all followers and retire the flight.
    pub fn complete(mut self, value: T) {
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(value));
        }
        self.map.lock().remove(&self.key);
    }
}

impl<T: Clone> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        // Leader abandoned without publishing: retire the flight so
        // followers can re-join and elect a new leader.
        if self.tx.is_some() {
            self.map.lock().remove(&self.key);
        }
    }
}

/// Await a leader's outcome; `None` means the leader died unpublished.
pub async fn await_outcome<T: Clone>(mut rx: watch::Receiver<Option<T>>) -> Option<T> {
    match rx.wait_for(Option::is_some).await {
        Ok(guard) => guard.clone(),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_first_joiner_leads() {
        let map: InflightMap<String> = InflightMap::new();
        match map.join("k") {
            Flight::Leader(_) => {}
            Flight::Follower(_) => panic!("first joiner must lead"),
        }
    }

    #[tokio::test]
    async fn test_followers_share_leader_outcome() {
        let map: InflightMap<String> = InflightMap::new();

        let leader = match map.join("k") {
            Flight::Leader(guard) => guard,
            Flight::Follower(_) => unreachable!(),
        };

        let mut followers = Vec::new();
        for _ in 0..3 {
            match map.join("k") {
                Flight::Follower(rx) => followers.push(rx),
                Flight::Leader(_) => panic!("only one leader per key"),
            }
        }

        leader.complete("result".to_string());

        for rx in followers {
            assert_eq!(await_outcome(rx).await.as_deref(), Some("result"));
        }
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_completion_retires_flight() {
        let map: InflightMap<String> = InflightMap::new();
        let leader = match map.join("k") {
            Flight::Leader(guard) => guard,
            _ => unreachable!(),
        };
        leader.complete("x".to_string());

        // New joiner starts a fresh flight
        assert!(matches!(map.join("k"), Flight::Leader(_)));
    }

    #[tokio::test]
    async fn test_dropped_leader_releases_followers() {
        let map: InflightMap<String> = InflightMap::new();
        let leader = match map.join("k") {
            Flight::Leader(guard) => guard,
            _ => unreachable!(),
        };
        let rx = match map.join("k") {
            Flight::Follower(rx) => rx,
            _ => unreachable!(),
        };

        drop(leader);

        // Follower learns there is no outcome and can re-join as leader
        assert!(await_outcome(rx).await.is_none());
        assert!(matches!(map.join("k"), Flight::Leader(_)));
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_coalesce() {
        let map: InflightMap<String> = InflightMap::new();
        let _a = match map.join("a") {
            Flight::Leader(guard) => guard,
            _ => unreachable!(),
        };
        assert!(matches!(map.join("b"), Flight::Leader(_)));
    }

    #[tokio::test]
    async fn test_follower_waits_until_publish() {
        let map: InflightMap<u32> = InflightMap::new();
        let leader = match map.join("k") {
            Flight::Leader(guard) => guard,
            _ => unreachable!(),
        };
        let rx = match map.join("k") {
            Flight::Follower(rx) => rx,
            _ => unreachable!(),
        };

        let waiter = tokio::spawn(async move { await_outcome(rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        leader.complete(7);
        assert_eq!(waiter.await.unwrap(), Some(7));
    }
}

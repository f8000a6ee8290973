//! Local cache of subscribed registry parameters.
//!
//! Values enter the cache through `subscribeParam`; the registry then pushes
//! `paramUpdate` to the slave API whenever the key or anything related to it
//! changes.  An update invalidates the key, every key below it and every key
//! above it, so the next read goes back to the registry.

use std::collections::{HashMap, HashSet};

use parking_lot::{Mutex, RwLock};

/// Fetches of one key currently in flight.
#[derive(Debug, Default)]
struct InFlight {
    fetches: usize,
    /// An update arrived after the first of them started.
    stale: bool,
}

#[derive(Debug, Default)]
pub struct ParamCache {
    values: RwLock<HashMap<String, serde_json::Value>>,
    subscribed: RwLock<HashSet<String>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

/// A registry fetch of one key.  Dropping it without [`finish`](Self::finish)
/// abandons the fetch.
#[must_use]
pub struct PendingFetch<'a> {
    cache: &'a ParamCache,
    key: String,
    done: bool,
}

impl PendingFetch<'_> {
    /// Record the subscription and cache `value`, unless the key was
    /// invalidated while the fetch was running.  Returns whether it was cached.
    pub fn finish(mut self, value: serde_json::Value) -> bool {
        self.done = true;
        let mut in_flight = self.cache.in_flight.lock();
        let stale = release(&mut in_flight, &self.key);
        self.cache.subscribed.write().insert(self.key.clone());
        if !stale {
            self.cache.values.write().insert(self.key.clone(), value);
        }
        !stale
    }
}

impl Drop for PendingFetch<'_> {
    fn drop(&mut self) {
        if !self.done {
            release(&mut self.cache.in_flight.lock(), &self.key);
        }
    }
}

/// Returns whether the fetch went stale.
fn release(in_flight: &mut HashMap<String, InFlight>, key: &str) -> bool {
    let Some(entry) = in_flight.get_mut(key) else {
        return false;
    };
    let stale = entry.stale;
    entry.fetches -= 1;
    if entry.fetches == 0 {
        in_flight.remove(key);
    }
    stale
}

impl ParamCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.values.read().get(key).cloned()
    }

    /// Start fetching `key` from the registry.
    pub fn begin(&self, key: &str) -> PendingFetch<'_> {
        self.in_flight
            .lock()
            .entry(key.to_owned())
            .or_default()
            .fetches += 1;
        PendingFetch {
            cache: self,
            key: key.to_owned(),
            done: false,
        }
    }

    pub fn insert(&self, key: &str, value: serde_json::Value) {
        self.subscribed.write().insert(key.to_owned());
        self.values.write().insert(key.to_owned(), value);
    }

    /// Drop `key`, its descendants and its ancestors.
    pub fn invalidate(&self, key: &str) {
        let key = key.trim_end_matches('/');
        let mut in_flight = self.in_flight.lock();
        for (fetching, entry) in in_flight.iter_mut() {
            if related(fetching.trim_end_matches('/'), key) {
                entry.stale = true;
            }
        }
        self.values
            .write()
            .retain(|cached, _| !related(cached.trim_end_matches('/'), key));
    }

    /// Keys this node has subscribed to, for unsubscribing at shutdown.
    pub fn take_subscriptions(&self) -> Vec<String> {
        self.values.write().clear();
        self.subscribed.write().drain().collect()
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn related(a: &str, b: &str) -> bool {
    a == b || is_below(a, b) || is_below(b, a)
}

fn is_below(child: &str, parent: &str) -> bool {
    if parent.is_empty() {
        return true;
    }
    child
        .strip_prefix(parent)
        .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn update_invalidates_family_only() {
        let cache = ParamCache::new();
        cache.insert("/robot", json!({"arm": {"speed": 1}}));
        cache.insert("/robot/arm", json!({"speed": 1}));
        cache.insert("/robot/arm/speed", json!(1));
        cache.insert("/robot/armor", json!(true));
        cache.insert("/other", json!("x"));

        cache.invalidate("/robot/arm");

        assert!(cache.get("/robot").is_none());
        assert!(cache.get("/robot/arm").is_none());
        assert!(cache.get("/robot/arm/speed").is_none());
        assert_eq!(cache.get("/robot/armor"), Some(json!(true)));
        assert_eq!(cache.get("/other"), Some(json!("x")));
    }

    #[test]
    fn trailing_slash_is_ignored() {
        let cache = ParamCache::new();
        cache.insert("/a/b", json!(2));
        cache.invalidate("/a/");
        assert!(cache.is_empty());
    }

    #[test]
    fn subscriptions_survive_invalidation() {
        let cache = ParamCache::new();
        cache.insert("/a", json!(1));
        cache.invalidate("/a");
        assert_eq!(cache.take_subscriptions(), vec!["/a".to_owned()]);
        assert!(cache.take_subscriptions().is_empty());
    }

    #[test]
    fn update_during_fetch_keeps_value_out() {
        let cache = ParamCache::new();
        let fetch = cache.begin("/robot/speed");
        cache.invalidate("/robot");
        assert!(!fetch.finish(json!(1)));
        assert!(cache.get("/robot/speed").is_none());
        // Still subscribed, so the next update reaches this key.
        assert_eq!(cache.take_subscriptions(), vec!["/robot/speed".to_owned()]);

        // Once nothing is in flight, fetches cache normally again.
        let fetch = cache.begin("/robot/speed");
        assert!(fetch.finish(json!(2)));
        assert_eq!(cache.get("/robot/speed"), Some(json!(2)));
    }

    #[test]
    fn unrelated_update_does_not_spoil_fetch() {
        let cache = ParamCache::new();
        let fetch = cache.begin("/a");
        cache.invalidate("/b");
        assert!(fetch.finish(json!(1)));
        assert_eq!(cache.get("/a"), Some(json!(1)));
    }

    #[test]
    fn abandoned_fetch_is_released() {
        let cache = ParamCache::new();
        drop(cache.begin("/a"));
        cache.invalidate("/a");
        assert!(cache.begin("/a").finish(json!(3)));
        assert_eq!(cache.get("/a"), Some(json!(3)));
    }
}

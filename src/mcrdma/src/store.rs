//! In-memory item store backing the ASCII protocol.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use minstant::Instant;

/// Relative expiration times above this many seconds are absolute unix timestamps.
const REALTIME_MAXDELTA: i64 = 60 * 60 * 24 * 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub data: Vec<u8>,
    pub flags: u32,
    pub cas: u64,
    expires: Option<Instant>,
}

impl Item {
    #[inline]
    fn is_live(&self, now: Instant) -> bool {
        self.expires.map_or(true, |t| now < t)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    NotStored,
    Exists,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    Value(u64),
    NotFound,
    NonNumeric,
}

/// Converts a protocol expiration time into a deadline. `Err(())` means already expired. A
/// deadline past what the clock can represent never expires.
fn deadline(exptime: i64, now: Instant) -> Result<Option<Instant>, ()> {
    let secs = match exptime {
        0 => return Ok(None),
        t if t < 0 => return Err(()),
        t if t <= REALTIME_MAXDELTA => t,
        t => {
            let unix_now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs() as i64);
            if t <= unix_now {
                return Err(());
            }
            t - unix_now
        }
    };
    Ok(now.checked_add(Duration::from_secs(secs as u64)))
}

#[derive(Debug, Default)]
pub struct Store {
    items: DashMap<Vec<u8>, Item>,
    next_cas: AtomicU64,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn cas_unique(&self) -> u64 {
        self.next_cas.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, key: &[u8]) -> Option<Item> {
        let now = Instant::now();
        let item = self.items.get(key)?;
        if item.is_live(now) {
            return Some(item.clone());
        }
        drop(item);
        self.items.remove_if(key, |_, item| !item.is_live(now));
        None
    }

    pub fn store(
        &self,
        mode: StoreMode,
        key: &[u8],
        flags: u32,
        exptime: i64,
        data: Vec<u8>,
    ) -> StoreOutcome {
        let now = Instant::now();
        let expires = deadline(exptime, now);
        let cas = self.cas_unique();

        match self.items.entry(key.to_vec()) {
            Entry::Occupied(mut entry) => {
                let live = entry.get().is_live(now);
                match mode {
                    StoreMode::Add if live => return StoreOutcome::NotStored,
                    StoreMode::Replace | StoreMode::Append | StoreMode::Prepend if !live => {
                        entry.remove();
                        return StoreOutcome::NotStored;
                    }
                    StoreMode::Cas(_) if !live => {
                        entry.remove();
                        return StoreOutcome::NotFound;
                    }
                    StoreMode::Cas(unique) if entry.get().cas != unique => {
                        return StoreOutcome::Exists;
                    }
                    _ => {}
                }
                let expires = match (mode, expires) {
                    (StoreMode::Append | StoreMode::Prepend, _) => None,
                    (_, Ok(expires)) => expires,
                    (_, Err(())) => {
                        // stored and immediately expired
                        entry.remove();
                        return StoreOutcome::Stored;
                    }
                };
                let item = entry.get_mut();
                match mode {
                    StoreMode::Append => {
                        item.data.extend_from_slice(&data);
                        item.cas = cas;
                    }
                    StoreMode::Prepend => {
                        let mut joined = data;
                        joined.extend_from_slice(&item.data);
                        item.data = joined;
                        item.cas = cas;
                    }
                    _ => {
                        *item = Item {
                            data,
                            flags,
                            cas,
                            expires,
                        }
                    }
                }
                StoreOutcome::Stored
            }
            Entry::Vacant(entry) => match mode {
                StoreMode::Replace | StoreMode::Append | StoreMode::Prepend => {
                    StoreOutcome::NotStored
                }
                StoreMode::Cas(_) => StoreOutcome::NotFound,
                StoreMode::Set | StoreMode::Add => {
                    if let Ok(expires) = expires {
                        entry.insert(Item {
                            data,
                            flags,
                            cas,
                            expires,
                        });
                    }
                    StoreOutcome::Stored
                }
            },
        }
    }

    pub fn delete(&self, key: &[u8]) -> bool {
        let now = Instant::now();
        matches!(self.items.remove(key), Some((_, item)) if item.is_live(now))
    }

    /// Adds `delta` to a decimal value, or subtracts it when `incr` is false. Increments wrap
    /// at 64 bits, decrements stop at zero.
    pub fn delta(&self, key: &[u8], incr: bool, delta: u64) -> DeltaOutcome {
        let now = Instant::now();
        let mut item = match self.items.get_mut(key) {
            Some(item) if item.is_live(now) => item,
            _ => return DeltaOutcome::NotFound,
        };
        let current = match std::str::from_utf8(&item.data)
            .ok()
            .and_then(|s| s.trim_end().parse::<u64>().ok())
        {
            Some(v) => v,
            None => return DeltaOutcome::NonNumeric,
        };
        let value = if incr {
            current.wrapping_add(delta)
        } else {
            current.saturating_sub(delta)
        };
        item.data = value.to_string().into_bytes();
        item.cas = self.cas_unique();
        DeltaOutcome::Value(value)
    }

    pub fn touch(&self, key: &[u8], exptime: i64) -> bool {
        let now = Instant::now();
        let mut item = match self.items.get_mut(key) {
            Some(item) if item.is_live(now) => item,
            _ => return false,
        };
        match deadline(exptime, now) {
            Ok(expires) => item.expires = expires,
            Err(()) => item.expires = Some(now),
        }
        true
    }

    /// Invalidates every item, now or after `delay` seconds.
    pub fn flush_all(&self, delay: u64) {
        if delay == 0 {
            self.items.clear();
            return;
        }
        let at = match Instant::now().checked_add(Duration::from_secs(delay)) {
            Some(at) => at,
            None => return,
        };
        for mut item in self.items.iter_mut() {
            if item.expires.map_or(true, |t| t > at) {
                item.expires = Some(at);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_replace_respect_existence() {
        let store = Store::new();
        assert_eq!(
            store.store(StoreMode::Replace, b"k", 0, 0, b"a".to_vec()),
            StoreOutcome::NotStored
        );
        assert_eq!(
            store.store(StoreMode::Add, b"k", 1, 0, b"a".to_vec()),
            StoreOutcome::Stored
        );
        assert_eq!(
            store.store(StoreMode::Add, b"k", 1, 0, b"b".to_vec()),
            StoreOutcome::NotStored
        );
        assert_eq!(
            store.store(StoreMode::Replace, b"k", 2, 0, b"c".to_vec()),
            StoreOutcome::Stored
        );
        let item = store.get(b"k").unwrap();
        assert_eq!(item.data, b"c");
        assert_eq!(item.flags, 2);
    }

    #[test]
    fn cas_checks_the_unique_value() {
        let store = Store::new();
        assert_eq!(
            store.store(StoreMode::Cas(1), b"k", 0, 0, b"a".to_vec()),
            StoreOutcome::NotFound
        );
        store.store(StoreMode::Set, b"k", 0, 0, b"a".to_vec());
        let cas = store.get(b"k").unwrap().cas;
        assert_eq!(
            store.store(StoreMode::Cas(cas + 1), b"k", 0, 0, b"b".to_vec()),
            StoreOutcome::Exists
        );
        assert_eq!(
            store.store(StoreMode::Cas(cas), b"k", 0, 0, b"b".to_vec()),
            StoreOutcome::Stored
        );
        assert_ne!(store.get(b"k").unwrap().cas, cas);
    }

    #[test]
    fn append_and_prepend_keep_flags() {
        let store = Store::new();
        store.store(StoreMode::Set, b"k", 7, 0, b"mid".to_vec());
        store.store(StoreMode::Append, b"k", 0, 0, b">".to_vec());
        store.store(StoreMode::Prepend, b"k", 0, 0, b"<".to_vec());
        let item = store.get(b"k").unwrap();
        assert_eq!(item.data, b"<mid>");
        assert_eq!(item.flags, 7);
    }

    #[test]
    fn delta_wraps_and_floors() {
        let store = Store::new();
        store.store(StoreMode::Set, b"n", 0, 0, u64::MAX.to_string().into_bytes());
        assert_eq!(store.delta(b"n", true, 2), DeltaOutcome::Value(1));
        assert_eq!(store.delta(b"n", false, 5), DeltaOutcome::Value(0));
        store.store(StoreMode::Set, b"s", 0, 0, b"abc".to_vec());
        assert_eq!(store.delta(b"s", true, 1), DeltaOutcome::NonNumeric);
        assert_eq!(store.delta(b"x", true, 1), DeltaOutcome::NotFound);
    }

    #[test]
    fn expired_items_disappear() {
        let store = Store::new();
        store.store(StoreMode::Set, b"k", 0, -1, b"a".to_vec());
        assert!(store.get(b"k").is_none());
        store.store(StoreMode::Set, b"k", 0, 0, b"a".to_vec());
        assert!(store.touch(b"k", -1));
        assert!(store.get(b"k").is_none());
        assert!(!store.delete(b"k"));
    }

    #[test]
    fn flush_all_empties_the_store() {
        let store = Store::new();
        store.store(StoreMode::Set, b"a", 0, 0, b"1".to_vec());
        store.store(StoreMode::Set, b"b", 0, 0, b"2".to_vec());
        assert_eq!(store.len(), 2);
        store.flush_all(0);
        assert!(store.is_empty());
    }

    #[test]
    fn far_deadlines_never_expire() {
        let store = Store::new();
        assert_eq!(
            store.store(StoreMode::Set, b"k", 0, i64::MAX, b"a".to_vec()),
            StoreOutcome::Stored
        );
        assert!(store.get(b"k").is_some());
        assert!(store.touch(b"k", i64::MAX));
        store.flush_all(u64::MAX);
        assert_eq!(store.get(b"k").unwrap().data, b"a");
        assert_eq!(store.len(), 1);
    }
}

// Copyright 2024 The Lattice Project Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    borrow::Borrow,
    collections::HashMap,
    hash::Hash,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

/// A TTL cache tracking items that recently failed.
///
/// Entries become inactive once their TTL elapses instead of being discarded,
/// which lets repeated failures extend the TTL with exponential backoff.
/// Entries are only ever dropped by an explicit [`FailuresCache::remove()`]
/// call, typically once the item succeeds again.
#[derive(Clone, Debug)]
pub struct FailuresCache<T: Eq + Hash> {
    inner: Arc<RwLock<HashMap<T, Backoff>>>,
}

#[derive(Debug, Clone, Copy)]
struct Backoff {
    last_failure: Instant,
    ttl: Duration,
    /// How often the item failed after it first entered the cache, i.e. one
    /// less than the total number of failures.
    strikes: u8,
}

impl Backoff {
    fn is_active(&self) -> bool {
        self.last_failure.elapsed() < self.ttl
    }
}

impl<T> FailuresCache<T>
where
    T: Eq + Hash,
{
    const BASE_DELAY_SECS: u64 = 15;
    const MAX_DELAY_SECS: u64 = 15 * 60;

    /// Create a new, empty cache.
    pub fn new() -> Self {
        Self { inner: Default::default() }
    }

    /// Is the given item in the cache with an unexpired TTL?
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.read().unwrap().get(key).is_some_and(|b| b.is_active())
    }

    /// The backoff delay doubles with every strike, starting at 15 seconds
    /// and capped at 15 minutes.
    fn delay_for(strikes: u8) -> Duration {
        let factor = 2u64.saturating_pow(strikes.into());
        let secs = factor.saturating_mul(Self::BASE_DELAY_SECS).clamp(1, Self::MAX_DELAY_SECS);

        Duration::from_secs(secs)
    }

    /// Record a failure for a single item.
    pub fn insert(&self, item: T) {
        self.extend([item]);
    }

    /// Record a failure for every item in the iterator.
    ///
    /// Items already in the cache, expired or not, get their strike count
    /// bumped and their TTL recomputed.
    pub fn extend(&self, items: impl IntoIterator<Item = T>) {
        let mut inner = self.inner.write().unwrap();
        let now = Instant::now();

        for item in items {
            let strikes = match inner.get(&item) {
                Some(backoff) => backoff.strikes.saturating_add(1),
                None => 0,
            };

            let entry =
                Backoff { last_failure: now, ttl: Self::delay_for(strikes), strikes };
            inner.insert(item, entry);
        }
    }

    /// Forget the given items entirely, resetting their strike counts.
    pub fn remove<'a, I, Q>(&'a self, items: I)
    where
        I: Iterator<Item = &'a Q>,
        T: Borrow<Q>,
        Q: Hash + Eq + 'a + ?Sized,
    {
        let mut inner = self.inner.write().unwrap();

        for item in items {
            inner.remove(item);
        }
    }
}

impl<T: Eq + Hash> Default for FailuresCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::FailuresCache;

    #[test]
    fn insert_and_expiry() {
        let cache = FailuresCache::new();

        assert!(!cache.contains(&1u8));
        cache.insert(1u8);
        assert!(cache.contains(&1));

        // Force the entry to expire, it should become inactive but stay
        // around so the strike count survives.
        cache.inner.write().unwrap().get_mut(&1).unwrap().ttl = Duration::from_secs(0);
        assert!(!cache.contains(&1));

        cache.extend([1u8]);
        assert!(cache.contains(&1));
        assert_eq!(cache.inner.read().unwrap().get(&1).unwrap().strikes, 1);

        cache.remove([1u8].iter());
        assert!(cache.inner.read().unwrap().get(&1).is_none());
    }

    #[test]
    fn backoff_sequence() {
        let delays: Vec<u64> =
            (0..8).map(|i| FailuresCache::<u8>::delay_for(i).as_secs()).collect();
        assert_eq!(delays, [15, 30, 60, 120, 240, 480, 900, 900]);
    }

    #[test]
    fn removal_resets_the_strike_count() {
        let cache = FailuresCache::new();

        cache.extend([1u8, 1, 1]);
        assert_eq!(cache.inner.read().unwrap().get(&1).unwrap().strikes, 2);

        // A success wipes the history, the next failure starts over at the
        // base delay.
        cache.remove([1u8].iter());
        cache.insert(1u8);

        let entry = *cache.inner.read().unwrap().get(&1).unwrap();
        assert_eq!(entry.strikes, 0);
        assert_eq!(entry.ttl, Duration::from_secs(15));
    }

    proptest! {
        #[test]
        fn backoff_delay_stays_in_bounds(strikes in 0..=u8::MAX) {
            let delay = FailuresCache::<u8>::delay_for(strikes).as_secs();

            prop_assert!(delay >= 15);
            prop_assert!(delay <= 900);

            // One more strike never shortens the delay.
            let next = FailuresCache::<u8>::delay_for(strikes.saturating_add(1)).as_secs();
            prop_assert!(next >= delay);
        }
    }
}

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::trace;

use crate::error::SqlAccessError;

type Waiter<V> = oneshot::Sender<Result<Option<V>, SqlAccessError>>;

struct LoaderState<K, V> {
    resolved: HashMap<K, Option<V>>,
    waiting: HashMap<K, Vec<Waiter<V>>>,
    queue: Vec<K>,
    dispatching: bool,
}

/// Coalesces point lookups issued concurrently into batched fetches.
///
/// The first caller to find no batch in flight becomes the dispatcher: it yields once so that
/// concurrent callers can enqueue their keys, then fetches everything queued in chunks of at
/// most `max_batch_size` keys. Resolved keys, including misses, are remembered for the lifetime
/// of the loader.
pub struct DataLoader<K, V> {
    max_batch_size: usize,
    state: Mutex<LoaderState<K, V>>,
}

impl<K, V> DataLoader<K, V>
where
    K: Eq + Hash + Clone + Send,
    V: Clone + Send,
{
    #[must_use]
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            state: Mutex::new(LoaderState {
                resolved: HashMap::new(),
                waiting: HashMap::new(),
                queue: Vec::new(),
                dispatching: false,
            }),
        }
    }

    /// Load one key.
    ///
    /// # Errors
    /// Returns the fetch error of the batch that contained the key.
    pub async fn load<F, Fut>(&self, key: K, fetch: F) -> Result<Option<V>, SqlAccessError>
    where
        F: Fn(Vec<K>) -> Fut,
        Fut: Future<Output = Result<Vec<(K, V)>, SqlAccessError>>,
    {
        let mut found = self.load_many(std::slice::from_ref(&key), fetch).await?;
        Ok(found.remove(&key))
    }

    /// Load every key; keys without a row are absent from the result.
    ///
    /// `fetch` receives a padded key list (see [`bucket_size`]) and returns `(key, value)` pairs
    /// in any order.
    ///
    /// # Errors
    /// Returns the first fetch error affecting one of `keys`.
    pub async fn load_many<F, Fut>(
        &self,
        keys: &[K],
        fetch: F,
    ) -> Result<HashMap<K, V>, SqlAccessError>
    where
        F: Fn(Vec<K>) -> Fut,
        Fut: Future<Output = Result<Vec<(K, V)>, SqlAccessError>>,
    {
        let mut found = HashMap::with_capacity(keys.len());
        let mut remaining: Vec<K> = {
            let mut seen = HashSet::with_capacity(keys.len());
            keys.iter().filter(|k| seen.insert(*k)).cloned().collect()
        };

        while !remaining.is_empty() {
            let (waits, lead) = self.enqueue(&remaining, &mut found);
            if lead {
                tokio::task::yield_now().await;
                self.dispatch(&fetch).await;
            }

            remaining.clear();
            for (key, rx) in waits {
                match rx.await {
                    Ok(Ok(Some(value))) => {
                        found.insert(key, value);
                    }
                    Ok(Ok(None)) => {}
                    Ok(Err(err)) => return Err(err),
                    // The dispatcher was dropped before serving this key; queue it again.
                    Err(_) => remaining.push(key),
                }
            }
        }
        Ok(found)
    }

    #[allow(clippy::type_complexity)]
    fn enqueue(
        &self,
        keys: &[K],
        found: &mut HashMap<K, V>,
    ) -> (Vec<(K, oneshot::Receiver<Result<Option<V>, SqlAccessError>>)>, bool) {
        let mut state = self.lock();
        let mut waits = Vec::new();
        for key in keys {
            if let Some(resolved) = state.resolved.get(key) {
                if let Some(value) = resolved {
                    found.insert(key.clone(), value.clone());
                }
                continue;
            }
            let (tx, rx) = oneshot::channel();
            let waiters = state.waiting.entry(key.clone()).or_default();
            let first = waiters.is_empty();
            waiters.push(tx);
            if first {
                state.queue.push(key.clone());
            }
            waits.push((key.clone(), rx));
        }
        let lead = !state.dispatching && !state.queue.is_empty();
        if lead {
            state.dispatching = true;
        }
        (waits, lead)
    }

    async fn dispatch<F, Fut>(&self, fetch: &F)
    where
        F: Fn(Vec<K>) -> Fut,
        Fut: Future<Output = Result<Vec<(K, V)>, SqlAccessError>>,
    {
        let mut guard = DispatchGuard {
            loader: self,
            finished: false,
        };
        loop {
            let mut batch: Vec<(K, Vec<Waiter<V>>)> = {
                let mut state = self.lock();
                if state.queue.is_empty() {
                    state.dispatching = false;
                    guard.finished = true;
                    return;
                }
                let queue = std::mem::take(&mut state.queue);
                queue
                    .into_iter()
                    .filter_map(|key| state.waiting.remove(&key).map(|w| (key, w)))
                    .collect()
            };

            while !batch.is_empty() {
                let rest = batch.split_off(batch.len().min(self.max_batch_size));
                let chunk = std::mem::replace(&mut batch, rest);
                let keys: Vec<K> = chunk.iter().map(|(key, _)| key.clone()).collect();
                let padded = pad_keys(&keys, self.max_batch_size);
                trace!(keys = keys.len(), padded = padded.len(), "data loader batch");

                match fetch(padded).await {
                    Ok(rows) => {
                        let mut by_key: HashMap<K, V> = rows.into_iter().collect();
                        let mut state = self.lock();
                        for (key, waiters) in chunk {
                            let value = by_key.remove(&key);
                            for waiter in waiters {
                                let _ = waiter.send(Ok(value.clone()));
                            }
                            state.resolved.insert(key, value);
                        }
                    }
                    Err(err) => {
                        for (_, waiters) in chunk {
                            for waiter in waiters {
                                let _ = waiter.send(Err(err.shared()));
                            }
                        }
                    }
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, LoaderState<K, V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the dispatcher role if the dispatching future is dropped mid-batch. Queued waiters
/// are dropped too, so their callers re-enqueue and elect a new dispatcher.
struct DispatchGuard<'a, K, V> {
    loader: &'a DataLoader<K, V>,
    finished: bool,
}

impl<K, V> Drop for DispatchGuard<'_, K, V> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut state = self
            .loader
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.dispatching = false;
        state.queue.clear();
        state.waiting.clear();
    }
}

/// Placeholder count used for a chunk of `len` keys: the next power of two, capped at
/// `max_batch_size`. Keeps the number of distinct statements small so prepared statements are
/// reused.
#[must_use]
pub fn bucket_size(len: usize, max_batch_size: usize) -> usize {
    len.next_power_of_two().min(max_batch_size).max(len)
}

/// Pad with copies of the last real key. No sentinel value can collide with a real key.
fn pad_keys<K: Clone>(keys: &[K], max_batch_size: usize) -> Vec<K> {
    let mut padded = keys.to_vec();
    if let Some(last) = keys.last() {
        padded.resize(bucket_size(keys.len(), max_batch_size), last.clone());
    }
    padded
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn bucket_sizes() {
        assert_eq!(bucket_size(1, 128), 1);
        assert_eq!(bucket_size(3, 128), 4);
        assert_eq!(bucket_size(100, 128), 128);
        assert_eq!(bucket_size(100, 100), 100);
        assert_eq!(pad_keys(&[1, 2, 3], 128), vec![1, 2, 3, 3]);
    }

    #[tokio::test]
    async fn concurrent_loads_share_one_fetch() {
        let loader = Arc::new(DataLoader::<i64, String>::new(16));
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = |keys: Vec<i64>| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, SqlAccessError>(keys
                    .into_iter()
                    .filter(|k| k % 2 == 0)
                    .map(|k| (k, format!("row {k}")))
                    .collect())
            }
        };

        let (a, b) = tokio::join!(loader.load(2, fetch), loader.load(3, fetch));
        assert_eq!(a.expect("loads"), Some("row 2".to_owned()));
        assert_eq!(b.expect("loads"), None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // resolved keys, misses included, are not fetched again
        let again = loader.load_many(&[2, 3], fetch).await.expect("loads");
        assert_eq!(again.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn large_requests_are_chunked() {
        let loader = DataLoader::<i64, i64>::new(8);
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let fetch = |keys: Vec<i64>| {
            let sizes = Arc::clone(&sizes);
            async move {
                sizes.lock().expect("lock").push(keys.len());
                Ok::<_, SqlAccessError>(keys.into_iter().map(|k| (k, k * 10)).collect())
            }
        };
        let keys: Vec<i64> = (0..19).collect();
        let found = loader.load_many(&keys, fetch).await.expect("loads");
        assert_eq!(found.len(), 19);
        assert_eq!(found[&18], 180);
        assert_eq!(*sizes.lock().expect("lock"), vec![8, 8, 4]);
    }
}

//! Keyed call coalescing: concurrent callers presenting the same key
//! share one execution. Finalization uses this with the
//! (view id, shard id) key so duplicate finalize triggers collapse into
//! a single run.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Mutex;
use tokio::sync::broadcast;

pub struct SingleFlight<K> {
    inflight: Mutex<HashMap<K, broadcast::Sender<()>>>,
}

impl<K: Eq + Hash + Clone> SingleFlight<K> {
    pub fn new() -> Self {
        Self { inflight: Mutex::new(HashMap::new()) }
    }

    /// Runs `work` unless a flight for `key` is already up, in which case
    /// this call waits for that flight to land instead. Returns whether
    /// this caller was the one that executed.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut waiter = {
            let mut inflight = self.inflight.lock().unwrap();
            match inflight.get(&key) {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    inflight.insert(key.clone(), tx);
                    None
                }
            }
        };

        if let Some(rx) = waiter.as_mut() {
            // The leader dropping its sender also wakes us.
            let _ = rx.recv().await;
            return false;
        }

        work().await;

        let tx = self.inflight.lock().unwrap().remove(&key);
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
        true
    }
}

impl<K: Eq + Hash + Clone> Default for SingleFlight<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let flight = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let flight = flight.clone();
            let executions = executions.clone();
            tasks.push(tokio::spawn(async move {
                flight
                    .run(("1-1", 0u32), || async {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    })
                    .await
            }));
        }

        let mut executed = 0;
        for task in tasks {
            if task.await.unwrap() {
                executed += 1;
            }
        }

        assert_eq!(executions.load(Ordering::SeqCst), 1, "exactly one execution");
        assert_eq!(executed, 1, "exactly one caller reports execution");
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let flight = SingleFlight::new();
        let executions = AtomicUsize::new(0);

        for key in [1u64, 2, 3] {
            flight
                .run(key, || async {
                    executions.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }
        assert_eq!(executions.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn key_is_reusable_after_landing() {
        let flight = SingleFlight::new();
        assert!(flight.run(9u8, || async {}).await);
        assert!(flight.run(9u8, || async {}).await, "finished keys run again");
    }
}

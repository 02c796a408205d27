use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;

type SharedRun<V> = Shared<BoxFuture<'static, V>>;

/// Collapses concurrent runs for the same key into one execution.
///
/// The entry is dropped as soon as the run finishes, so a call made after
/// completion starts a fresh run.
pub(crate) struct SingleFlight<K, V: Clone> {
    in_flight: Arc<Mutex<HashMap<K, SharedRun<V>>>>,
}

impl<K, V: Clone> Clone for SingleFlight<K, V> {
    fn clone(&self) -> Self {
        Self { in_flight: Arc::clone(&self.in_flight) }
    }
}

impl<K, V: Clone> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self { in_flight: Arc::new(Mutex::new(HashMap::new())) }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) async fn run<F>(&self, key: K, work: F) -> V
    where
        F: Future<Output = V> + Send + 'static,
    {
        let shared = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(&key) {
                Some(existing) => {
                    metrics::counter!("single_flight_joins_total").increment(1);
                    existing.clone()
                }
                None => {
                    let registry = Arc::clone(&self.in_flight);
                    let finished_key = key.clone();
                    let run = async move {
                        let value = work.await;
                        registry.lock().await.remove(&finished_key);
                        value
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(key, run.clone());
                    run
                }
            }
        };

        shared.await
    }

    #[cfg(test)]
    pub(crate) async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}

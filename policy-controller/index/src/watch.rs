use crate::{metrics::IndexMetrics, SharedIndex};
use futures::prelude::*;
use rbac_policy_core::{EventType, Kind, PolicyStore, StoreError, WatchStream};
use std::sync::Arc;
use tokio::{task::JoinHandle, time};
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Clone, Debug)]
pub struct IndexConfig {
    /// The delay before the first reconnect attempt after a watch fails.
    pub min_backoff: time::Duration,

    /// Reconnect delays double after each consecutive failure, up to this limit.
    pub max_backoff: time::Duration,
}

/// Keeps the index for a single kind up to date with the store.
///
/// ```text
///              +--------------+   list ok    +-----------+
///   start ---> |  Relisting   | -----------> | Streaming |
///              +--------------+              +-----------+
///                 ^       | list failed          | watch failed
///                 |       v                      v
///                 +-- [ Disconnected (backoff) ] <
/// ```
pub struct Watcher {
    kind: Kind,
    store: Arc<dyn PolicyStore>,
    index: SharedIndex,
    metrics: IndexMetrics,
    backoff: Backoff,
}

enum State {
    Disconnected,
    Relisting,
    Streaming { since: String, events: WatchStream },
}

#[derive(Debug)]
struct Backoff {
    min: time::Duration,
    max: time::Duration,
    next: time::Duration,
}

/// Spawns one watcher task per kind. Each task runs until `drain` is signaled.
pub fn spawn_watches(
    store: Arc<dyn PolicyStore>,
    index: SharedIndex,
    metrics: IndexMetrics,
    config: IndexConfig,
    drain: drain::Watch,
) -> Vec<JoinHandle<()>> {
    Kind::ALL
        .into_iter()
        .map(|kind| {
            let watcher = Watcher::new(
                kind,
                store.clone(),
                index.clone(),
                metrics.clone(),
                config.clone(),
            );
            tokio::spawn(
                watcher
                    .run(drain.clone())
                    .instrument(info_span!("watch", %kind)),
            )
        })
        .collect()
}

// === impl IndexConfig ===

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            min_backoff: time::Duration::from_secs(1),
            max_backoff: time::Duration::from_secs(30),
        }
    }
}

// === impl Watcher ===

impl Watcher {
    pub fn new(
        kind: Kind,
        store: Arc<dyn PolicyStore>,
        index: SharedIndex,
        metrics: IndexMetrics,
        config: IndexConfig,
    ) -> Self {
        Self {
            kind,
            store,
            index,
            metrics,
            backoff: Backoff::new(&config),
        }
    }

    pub async fn run(mut self, drain: drain::Watch) {
        tokio::pin! {
            let shutdown = drain.signaled();
        }

        let mut state = State::Relisting;
        loop {
            state = tokio::select! {
                biased;

                _ = &mut shutdown => {
                    debug!("Shutting down");
                    return;
                }

                state = self.step(state) => state,
            };
        }
    }

    async fn step(&mut self, state: State) -> State {
        match state {
            State::Disconnected => {
                let delay = self.backoff.next();
                debug!(?delay, "Waiting to reconnect");
                time::sleep(delay).await;
                State::Relisting
            }

            State::Relisting => match self.store.list(self.kind, None).await {
                Ok(list) => {
                    let since = list.resource_version.clone();
                    info!(items = list.items.len(), version = %since, "Listed");
                    self.metrics.reset(self.kind);
                    self.index
                        .write()
                        .reset(self.kind, list.items, list.resource_version);
                    self.backoff.reset();
                    let events = self.store.watch(self.kind, Some(since.clone()));
                    State::Streaming { since, events }
                }
                Err(error) => {
                    warn!(%error, "Failed to list");
                    self.metrics.restart(self.kind);
                    self.index.write().set_disconnected(self.kind, &error);
                    State::Disconnected
                }
            },

            State::Streaming { since, mut events } => match events.next().await {
                Some(Ok(event)) => {
                    let version = event.resource_version.clone();
                    match event.event_type {
                        EventType::Deleted => self.metrics.delete(self.kind),
                        EventType::Added | EventType::Modified => self.metrics.apply(self.kind),
                    }
                    self.index.write().apply_event(event);
                    State::Streaming {
                        since: version,
                        events,
                    }
                }
                Some(Err(error)) => {
                    self.restart(&since, error);
                    State::Disconnected
                }
                None => {
                    self.restart(&since, StoreError::Unavailable("watch ended".to_string()));
                    State::Disconnected
                }
            },
        }
    }

    fn restart(&self, since: &str, error: StoreError) {
        if error.is_expired() {
            info!(%since, %error, "Watch expired; relisting");
        } else {
            warn!(%since, %error, "Watch failed");
        }
        self.metrics.restart(self.kind);
    }
}

// === impl Backoff ===

impl Backoff {
    fn new(config: &IndexConfig) -> Self {
        let min = config.min_backoff;
        let max = config.max_backoff.max(min);
        Self { min, max, next: min }
    }

    fn next(&mut self) -> time::Duration {
        let delay = self.next;
        self.next = (delay * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.next = self.min;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_max_and_resets() {
        let mut backoff = Backoff::new(&IndexConfig::default());
        let delays = (0..7).map(|_| backoff.next().as_secs()).collect::<Vec<_>>();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);

        backoff.reset();
        assert_eq!(backoff.next(), time::Duration::from_secs(1));
    }
}

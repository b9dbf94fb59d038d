use super::event::ClusterEvent;
use crate::config::EventBusPolicy;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{Level, event};

/// Receives cluster events on its own task.
#[async_trait]
pub trait ClusterEventListener: Send + Sync {
    async fn on_event(&self, event: ClusterEvent);

    fn name(&self) -> &str {
        "listener"
    }
}

/// Adapts a synchronous closure into a listener.
pub struct FnListener<F> {
    name: String,
    callback: F,
}

impl<F> FnListener<F>
where
    F: Fn(ClusterEvent) + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, callback: F) -> Self {
        Self {
            name: name.into(),
            callback,
        }
    }
}

#[async_trait]
impl<F> ClusterEventListener for FnListener<F>
where
    F: Fn(ClusterEvent) + Send + Sync + 'static,
{
    async fn on_event(&self, event: ClusterEvent) {
        (self.callback)(event)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// In-process publish/subscribe for [`ClusterEvent`]s.
///
/// Every subscriber reads from its own position in a bounded ring. A listener
/// that falls behind loses the oldest events; publishers never wait on
/// listeners.
#[derive(Clone)]
pub struct ClusterEventBus {
    sender: broadcast::Sender<ClusterEvent>,
    dropped: Arc<AtomicU64>,
}

impl Default for ClusterEventBus {
    fn default() -> Self {
        Self::new(&EventBusPolicy::default())
    }
}

impl ClusterEventBus {
    pub fn new(policy: &EventBusPolicy) -> Self {
        let (sender, _) = broadcast::channel(policy.listener_capacity.max(1));
        Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publishes an event; returns how many subscribers will see it.
    pub fn publish(&self, cluster_event: ClusterEvent) -> usize {
        let event_type = cluster_event.event_type();
        match self.sender.send(cluster_event) {
            Ok(receivers) => {
                event!(Level::DEBUG, %event_type, receivers, "cluster event published");
                receivers
            }
            Err(_) => {
                event!(Level::TRACE, %event_type, "cluster event published without subscribers");
                0
            }
        }
    }

    /// Registers a listener. Delivery stops when the returned subscription is
    /// dropped.
    pub fn subscribe(&self, listener: Arc<dyn ClusterEventListener>) -> Subscription {
        let mut receiver = self.sender.subscribe();
        let dropped = self.dropped.clone();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(cluster_event) => listener.on_event(cluster_event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        dropped.fetch_add(skipped, Ordering::Relaxed);
                        event!(
                            Level::WARN,
                            listener = listener.name(),
                            skipped,
                            "cluster event listener lagging, oldest events dropped"
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Subscription { task }
    }

    /// Raw receiver for consumers that drive their own loop.
    pub fn subscribe_receiver(&self) -> broadcast::Receiver<ClusterEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Events skipped by lagging listeners since creation.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Handle of a registered listener.
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self)
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

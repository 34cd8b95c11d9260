//! Event Publisher Adapters
//!
//! Implementations of the `EventPublisher` port: tracing output, an
//! in-memory collector for tests, fan-out to several publishers, and typed
//! per-subscriber channels.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::events::PipelineEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;

/// Renders events as JSON into the tracing output.
#[derive(Debug, Clone, Default)]
pub struct LoggingEventPublisher {
    info_level: bool,
}

impl LoggingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info_level() -> Self {
        Self { info_level: true }
    }

    pub fn debug_level() -> Self {
        Self { info_level: false }
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: PipelineEvent) -> Result<()> {
        let event_type = event.event_type();
        let json = serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event));

        match &event {
            PipelineEvent::BlockAtRisk { .. }
            | PipelineEvent::BackupAborted { .. }
            | PipelineEvent::BackupRaidMakeFailed { .. }
            | PipelineEvent::RestoreFailed { .. } => {
                warn!(event_type = %event_type, event = %json, "Pipeline event")
            }
            _ if self.info_level => info!(event_type = %event_type, event = %json, "Pipeline event"),
            _ => debug!(event_type = %event_type, event = %json, "Pipeline event"),
        }
        Ok(())
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: RwLock<Vec<PipelineEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Events whose kebab-case type matches, e.g. `backup-done`.
    pub fn events_of_type(&self, event_type: &str) -> Vec<PipelineEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: PipelineEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }

    async fn publish_all(&self, events: Vec<PipelineEvent>) -> Result<()> {
        self.events.write().extend(events);
        Ok(())
    }
}

/// Publishes every event to each inner publisher in turn.
#[derive(Default)]
pub struct CompositeEventPublisher {
    publishers: Vec<Arc<dyn EventPublisher>>,
}

impl CompositeEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publishers.push(publisher);
        self
    }
}

impl std::fmt::Debug for CompositeEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeEventPublisher")
            .field("publisher_count", &self.publishers.len())
            .finish()
    }
}

#[async_trait]
impl EventPublisher for CompositeEventPublisher {
    async fn publish(&self, event: PipelineEvent) -> Result<()> {
        for publisher in &self.publishers {
            publisher.publish(event.clone()).await?;
        }
        Ok(())
    }
}

/// Gives each subscriber its own unbounded receiver.
///
/// Subscribers whose receiver was dropped are pruned on the next publish.
#[derive(Debug, Default)]
pub struct ChannelEventPublisher {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<PipelineEvent>>>,
}

impl ChannelEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PipelineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[async_trait]
impl EventPublisher for ChannelEventPublisher {
    async fn publish(&self, event: PipelineEvent) -> Result<()> {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::BackupId;

    fn started() -> PipelineEvent {
        let id: BackupId = "alice:0/F1".parse().unwrap();
        PipelineEvent::backup_started(id, None)
    }

    fn done() -> PipelineEvent {
        let id: BackupId = "alice:0/F1".parse().unwrap();
        PipelineEvent::backup_done(id, None, 3)
    }

    #[tokio::test]
    async fn test_logging_publisher() {
        LoggingEventPublisher::info_level()
            .publish(started())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_in_memory_collector() {
        let collector = InMemoryEventCollector::new();
        assert!(collector.is_empty());

        collector.publish(started()).await.unwrap();
        collector.publish_all(vec![done(), done()]).await.unwrap();

        assert_eq!(collector.len(), 3);
        assert_eq!(collector.events_of_type("backup-done").len(), 2);
        collector.clear();
        assert!(collector.is_empty());
    }

    #[tokio::test]
    async fn test_composite_publisher() {
        let a = Arc::new(InMemoryEventCollector::new());
        let b = Arc::new(InMemoryEventCollector::new());
        let composite = CompositeEventPublisher::new()
            .with_publisher(a.clone())
            .with_publisher(b.clone())
            .with_publisher(Arc::new(LoggingEventPublisher::debug_level()));

        composite.publish(started()).await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    #[tokio::test]
    async fn test_channel_publisher_prunes_dropped() {
        let publisher = ChannelEventPublisher::new();
        let mut kept = publisher.subscribe();
        let dropped = publisher.subscribe();
        drop(dropped);

        publisher.publish(started()).await.unwrap();
        assert_eq!(publisher.subscriber_count(), 1);
        assert_eq!(kept.recv().await.unwrap().event_type(), "backup-started");
    }
}

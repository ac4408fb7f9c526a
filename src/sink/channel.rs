use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error};

use super::EventSink;
use crate::postgres::ChangeEvent;
use crate::{Error, Result};

/// Consumer side of a [`ChannelSink`].
pub type EventStream = ReceiverStream<ChangeEvent>;

/// Hands events to a bounded queue drained by another task.
///
/// `emit` waits while the queue is full, so a slow consumer applies
/// backpressure instead of growing memory without bound.
pub struct ChannelSink {
    sender: mpsc::Sender<ChangeEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, EventStream) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, ReceiverStream::new(receiver))
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&mut self, event: ChangeEvent) -> Result<()> {
        self.sender
            .send(event)
            .await
            .map_err(|_| Error::Sink("event consumer has stopped".to_string()))
    }
}

/// Drains `events` into `sink` until every [`ChannelSink`] is dropped.
///
/// Returns the number of events forwarded; stops at the first sink error.
pub fn spawn_forwarder<S>(mut events: EventStream, mut sink: S) -> JoinHandle<Result<u64>>
where
    S: EventSink + 'static,
{
    tokio::spawn(async move {
        let mut forwarded = 0u64;
        while let Some(event) = events.next().await {
            if let Err(e) = sink.emit(event).await {
                error!("Event consumer failed: {}", e);
                return Err(e);
            }
            forwarded += 1;
        }
        sink.flush().await?;
        debug!(forwarded, "Event queue drained");
        Ok(forwarded)
    })
}

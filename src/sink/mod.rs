//! Downstream destinations for decoded change events.
//!
//! The session awaits [`EventSink::emit`] for every event before it confirms
//! the event's position upstream, so a sink that stalls also stalls
//! acknowledgments. [`ChannelSink`] decouples the two with a bounded queue.

pub mod channel;
pub mod console;
pub mod serializer;

use async_trait::async_trait;

use crate::postgres::ChangeEvent;
use crate::Result;

pub use channel::{spawn_forwarder, ChannelSink, EventStream};
pub use console::ConsoleSink;
pub use serializer::{JsonSerializer, TextSerializer};

#[async_trait]
pub trait EventSink: Send {
    /// Accepts one event. An error is fatal to the session.
    async fn emit(&mut self, event: ChangeEvent) -> Result<()>;

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<S: EventSink + ?Sized> EventSink for Box<S> {
    async fn emit(&mut self, event: ChangeEvent) -> Result<()> {
        (**self).emit(event).await
    }

    async fn flush(&mut self) -> Result<()> {
        (**self).flush().await
    }
}

#[cfg(test)]
mod tests;

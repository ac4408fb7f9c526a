use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt, Stdout};

use super::serializer::render;
use super::EventSink;
use crate::config::OutputFormat;
use crate::postgres::ChangeEvent;
use crate::Result;

/// Writes one line per event, as JSON or text.
pub struct ConsoleSink<W = Stdout> {
    writer: W,
    format: OutputFormat,
}

impl ConsoleSink<Stdout> {
    pub fn stdout(format: OutputFormat) -> Self {
        Self::with_writer(tokio::io::stdout(), format)
    }
}

impl<W> ConsoleSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn with_writer(writer: W, format: OutputFormat) -> Self {
        Self { writer, format }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> EventSink for ConsoleSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn emit(&mut self, event: ChangeEvent) -> Result<()> {
        let mut line = render(&event, self.format)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }
}

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::postgres::PgConnector;
use crate::session::{ReplicationSession, SessionOptions, SessionStats};
use crate::sink::{spawn_forwarder, ChannelSink, ConsoleSink};
use crate::{Config, Error, Result};

/// Wires a PostgreSQL session to the console output and runs it until
/// Ctrl+C or a fatal error.
pub struct Replicator {
    config: Config,
    shutdown: CancellationToken,
}

impl Replicator {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the replicator when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(&mut self) -> Result<SessionStats> {
        info!("Replicator starting");

        let connector = PgConnector::new(self.config.connection_params()?);
        let options = SessionOptions::from_config(&self.config)?;

        let (sink, events) = ChannelSink::new(self.config.sink.queue_capacity);
        let forwarder = spawn_forwarder(events, ConsoleSink::stdout(self.config.sink.format));

        let signal_token = self.shutdown.clone();
        let signal_task = tokio::spawn(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => match result {
                    Ok(()) => {
                        info!("Received Ctrl+C, shutting down");
                        signal_token.cancel();
                    }
                    Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
                },
                _ = signal_token.cancelled() => {}
            }
        });

        let mut session = ReplicationSession::new(connector, sink, options);
        let result = session.run(&self.shutdown).await;

        // Dropping the session drops the last sender, letting the forwarder drain.
        drop(session);
        signal_task.abort();

        let forwarded = match forwarder.await {
            Ok(Ok(count)) => count,
            Ok(Err(e)) => {
                error!("Output task failed: {}", e);
                return result.and(Err(e));
            }
            Err(e) => {
                return result.and(Err(Error::Sink(format!("output task panicked: {}", e))));
            }
        };

        match &result {
            Ok(stats) => info!(
                forwarded,
                events = stats.events_emitted,
                skipped = stats.frames_skipped,
                "Replicator stopped"
            ),
            Err(e) => error!("Replicator stopped with error: {}", e),
        }
        result
    }
}

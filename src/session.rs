//! Replication session lifecycle and receive loop.
//!
//! A [`ReplicationSession`] moves through
//! `Disconnected → Connected → SlotEnsured → Streaming` and ends in either
//! `Closing` (clean shutdown) or `Failed` (a fatal [`Error`]). It owns every
//! piece of per-stream state: the connection, the relation cache (inside the
//! dispatcher), the confirmed LSN and the ack timer. Nothing is shared
//! between sessions.
//!
//! # Example
//!
//! ```rust,no_run
//! use pg_capture::config::{Config, OutputFormat};
//! use pg_capture::postgres::PgConnector;
//! use pg_capture::sink::ConsoleSink;
//! use pg_capture::{ReplicationSession, SessionOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(config: Config) -> pg_capture::Result<()> {
//! let connector = PgConnector::new(config.connection_params()?);
//! let options = SessionOptions::from_config(&config)?;
//! let sink = ConsoleSink::stdout(OutputFormat::Json);
//!
//! let mut session = ReplicationSession::new(connector, sink, options);
//! let stats = session.run(&CancellationToken::new()).await?;
//! println!("processed {} frames", stats.frames_received);
//! # Ok(())
//! # }
//! ```

use bytes::Bytes;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::postgres::{
    AckScheduler, Connector, DecodeError, Dispatch, Lsn, ProtocolDispatcher, ReplicationTransport,
};
use crate::sink::EventSink;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Disconnected,
    Connected,
    SlotEnsured,
    Streaming,
    Closing,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub slot_name: String,
    pub output_plugin: String,
    pub publication: String,
    pub plugin_args: Vec<(String, String)>,
    pub start_lsn: Lsn,
    pub create_slot: bool,
    pub heartbeat_interval: Duration,
    pub recv_timeout: Duration,
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            slot_name: config.replication.slot_name.clone(),
            output_plugin: config.replication.output_plugin.clone(),
            publication: config.replication.publication.clone(),
            plugin_args: config.plugin_args(),
            start_lsn: config.start_lsn()?,
            create_slot: config.replication.create_slot,
            heartbeat_interval: config.heartbeat_interval(),
            recv_timeout: config.recv_timeout(),
        })
    }
}

/// Mutable state of one session.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub slot_name: String,
    pub output_plugin: String,
    pub publication: String,
    /// Highest position whose frame was fully processed.
    pub lsn: Lsn,
    pub phase: SessionPhase,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_received: u64,
    pub events_emitted: u64,
    pub frames_skipped: u64,
    pub keepalives: u64,
    pub status_updates: u64,
}

enum Received {
    Cancelled,
    Timeout,
    Frame(Result<Option<Bytes>>),
}

pub struct ReplicationSession<C: Connector, S> {
    connector: C,
    transport: Option<C::Transport>,
    sink: S,
    options: SessionOptions,
    state: SessionState,
    dispatcher: ProtocolDispatcher,
    ack: AckScheduler,
    /// Position before the first skipped frame; status updates never report past it.
    held_at: Option<Lsn>,
    stats: SessionStats,
}

impl<C, S> ReplicationSession<C, S>
where
    C: Connector,
    S: EventSink,
{
    pub fn new(connector: C, sink: S, options: SessionOptions) -> Self {
        let state = SessionState {
            slot_name: options.slot_name.clone(),
            output_plugin: options.output_plugin.clone(),
            publication: options.publication.clone(),
            lsn: options.start_lsn,
            phase: SessionPhase::Disconnected,
        };
        let ack = AckScheduler::new(options.heartbeat_interval);

        Self {
            connector,
            transport: None,
            sink,
            options,
            state,
            dispatcher: ProtocolDispatcher::new(),
            ack,
            held_at: None,
            stats: SessionStats::default(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.phase
    }

    pub fn lsn(&self) -> Lsn {
        self.state.lsn
    }

    /// The position reported to the server in status updates.
    ///
    /// Equal to [`lsn`](Self::lsn) until a frame is skipped, then pinned to
    /// the position processed before that frame for the rest of the session.
    pub fn confirmed_lsn(&self) -> Lsn {
        self.held_at.unwrap_or(self.state.lsn)
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn dispatcher(&self) -> &ProtocolDispatcher {
        &self.dispatcher
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Connects, ensures the slot, streams until cancelled or failed, and
    /// always closes the connection before returning.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<SessionStats> {
        let result = self.run_until_stopped(cancel).await;
        self.close().await;

        if let Err(e) = self.sink.flush().await {
            warn!("Failed to flush sink: {}", e);
        }

        info!(
            phase = ?self.state.phase,
            lsn = %self.state.lsn,
            confirmed = %self.confirmed_lsn(),
            frames = self.stats.frames_received,
            events = self.stats.events_emitted,
            skipped = self.stats.frames_skipped,
            "Replication session finished"
        );
        result.map(|()| self.stats)
    }

    async fn run_until_stopped(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.stop_requested(cancel) {
            return Ok(());
        }
        self.connect().await?;

        if self.stop_requested(cancel) {
            return Ok(());
        }
        self.ensure_slot().await?;

        if self.stop_requested(cancel) {
            return Ok(());
        }
        self.start_streaming().await?;

        self.run_loop(cancel).await
    }

    fn stop_requested(&mut self, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            info!("Shutdown requested before streaming started");
            self.state.phase = SessionPhase::Closing;
            return true;
        }
        false
    }

    pub async fn connect(&mut self) -> Result<()> {
        self.expect_phase(SessionPhase::Disconnected, "connect")?;

        let mut transport = match self.connector.connect().await {
            Ok(transport) => transport,
            Err(e) => return Err(self.fail(e)),
        };

        match transport.identify_system().await {
            Ok(system) => info!(
                system_id = %system.system_id,
                timeline = system.timeline,
                xlogpos = %system.xlogpos,
                "Identified upstream system"
            ),
            Err(e) => warn!("IDENTIFY_SYSTEM failed: {}", e),
        }

        self.transport = Some(transport);
        self.state.phase = SessionPhase::Connected;
        Ok(())
    }

    /// Creates the slot, treating "already exists" as success.
    pub async fn ensure_slot(&mut self) -> Result<()> {
        self.expect_phase(SessionPhase::Connected, "ensure_slot")?;

        if self.options.create_slot {
            let slot_name = &self.options.slot_name;
            let plugin = &self.options.output_plugin;
            let result = match self.transport.as_mut() {
                Some(transport) => transport.create_replication_slot(slot_name, plugin).await,
                None => Err(not_connected()),
            };

            match result {
                Ok(slot) => info!(
                    consistent_point = ?slot.consistent_point.map(|lsn| lsn.to_string()),
                    "Created replication slot '{}'",
                    slot.slot_name
                ),
                Err(e) if e.is_already_exists() => {
                    info!("Replication slot '{}' already exists", self.options.slot_name)
                }
                Err(e) => return Err(self.fail(e)),
            }
        } else {
            debug!("Slot creation disabled; assuming '{}' exists", self.options.slot_name);
        }

        self.state.phase = SessionPhase::SlotEnsured;
        Ok(())
    }

    pub async fn start_streaming(&mut self) -> Result<()> {
        self.expect_phase(SessionPhase::SlotEnsured, "start_streaming")?;

        let result = match self.transport.as_mut() {
            Some(transport) => {
                transport
                    .start_replication(
                        &self.options.slot_name,
                        self.options.start_lsn,
                        &self.options.plugin_args,
                    )
                    .await
            }
            None => Err(not_connected()),
        };
        if let Err(e) = result {
            return Err(self.fail(e));
        }

        info!(
            slot = %self.state.slot_name,
            publication = %self.state.publication,
            start_lsn = %self.options.start_lsn,
            "Streaming changes"
        );
        self.ack = AckScheduler::new(self.options.heartbeat_interval);
        self.state.phase = SessionPhase::Streaming;
        Ok(())
    }

    /// Receives and processes frames until cancelled or a fatal error.
    ///
    /// Cancellation is only observed between frames: a frame that has been
    /// received is always processed to completion first.
    pub async fn run_loop(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.expect_phase(SessionPhase::Streaming, "run_loop")?;

        loop {
            if self.ack.is_due(Instant::now()) {
                self.send_status_update(false).await?;
            }

            let wait = self
                .ack
                .time_until_due(Instant::now())
                .min(self.options.recv_timeout);

            let received = match self.transport.as_mut() {
                Some(transport) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Received::Cancelled,
                        result = tokio::time::timeout(wait, transport.recv_frame()) => match result {
                            Ok(frame) => Received::Frame(frame),
                            Err(_) => Received::Timeout,
                        },
                    }
                }
                None => Received::Frame(Err(not_connected())),
            };

            match received {
                Received::Cancelled => {
                    info!(lsn = %self.state.lsn, "Shutdown requested, leaving receive loop");
                    self.state.phase = SessionPhase::Closing;
                    return Ok(());
                }
                Received::Timeout => trace!("Receive timed out"),
                Received::Frame(Ok(Some(frame))) => self.handle_frame(frame).await?,
                Received::Frame(Ok(None)) => {
                    return Err(self.fail(Error::Replication {
                        message: "server ended the replication stream".to_string(),
                    }))
                }
                Received::Frame(Err(e)) => return Err(self.fail(e)),
            }
        }
    }

    async fn handle_frame(&mut self, frame: Bytes) -> Result<()> {
        self.stats.frames_received += 1;

        match self.dispatcher.dispatch(frame) {
            Ok(Dispatch::Keepalive {
                wal_end,
                reply_requested,
            }) => {
                self.stats.keepalives += 1;
                trace!(wal_end = %wal_end, reply_requested, "Primary keepalive");
                if reply_requested {
                    self.send_status_update(false).await?;
                }
            }
            Ok(Dispatch::Data {
                end_lsn,
                kind,
                event,
            }) => {
                if let Some(event) = event {
                    if let Err(e) = self.sink.emit(event).await {
                        return Err(self.fail(e));
                    }
                    self.stats.events_emitted += 1;
                }
                trace!(kind, end_lsn = %end_lsn, "Processed XLogData");
                self.advance(end_lsn);
            }
            Ok(Dispatch::Ignored(tag)) => {
                debug!("Ignoring replication frame with tag '{}'", tag as char);
            }
            Err(e) => self.skip(e),
        }

        Ok(())
    }

    /// The frame's position, and everything after it, is left unconfirmed.
    fn skip(&mut self, err: DecodeError) {
        self.stats.frames_skipped += 1;
        if self.held_at.is_none() {
            warn!(
                confirmed = %self.state.lsn,
                "Holding confirmed position until the session restarts"
            );
            self.held_at = Some(self.state.lsn);
        }
        match err {
            DecodeError::UnknownRelation(_) | DecodeError::ColumnCountMismatch { .. } => {
                warn!(lsn = %self.state.lsn, "Dropping change event: {}", err)
            }
            _ => error!(lsn = %self.state.lsn, "Skipping undecodable frame: {}", err),
        }
    }

    fn advance(&mut self, lsn: Lsn) {
        if lsn > self.state.lsn {
            self.state.lsn = lsn;
        }
    }

    async fn send_status_update(&mut self, reply_requested: bool) -> Result<()> {
        let confirmed = self.confirmed_lsn();
        let result = match self.transport.as_mut() {
            Some(transport) => self.ack.send(transport, confirmed, reply_requested).await,
            None => Err(not_connected()),
        };

        match result {
            Ok(()) => {
                self.stats.status_updates += 1;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Releases the connection. Safe to call on any path and more than once.
    pub async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                warn!("Error while closing replication connection: {}", e);
            }
        }
        if self.state.phase != SessionPhase::Failed {
            self.state.phase = SessionPhase::Closing;
        }
    }

    fn fail(&mut self, err: Error) -> Error {
        error!(phase = ?self.state.phase, lsn = %self.state.lsn, "Replication session failed: {}", err);
        self.state.phase = SessionPhase::Failed;
        err
    }

    fn expect_phase(&self, expected: SessionPhase, operation: &str) -> Result<()> {
        if self.state.phase == expected {
            Ok(())
        } else {
            Err(Error::Replication {
                message: format!(
                    "{} requires phase {:?}, session is {:?}",
                    operation, expected, self.state.phase
                ),
            })
        }
    }
}

fn not_connected() -> Error {
    Error::Replication {
        message: "no replication connection".to_string(),
    }
}

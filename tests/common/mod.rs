#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use pg_capture::config::{
    Config, OutputFormat, PostgresConfig, ReplicationConfig, SinkConfig,
};
use pg_capture::postgres::{
    ChangeEvent, Connector, Lsn, ReplicationTransport, SlotInfo, StatusUpdate, SystemInfo,
};
use pg_capture::sink::EventSink;
use pg_capture::{Error, Result, SessionOptions};
use std::collections::VecDeque;
use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Get test configuration from environment variables
pub fn get_test_config() -> Config {
    let postgres = PostgresConfig {
        url: None,
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: Some(env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string())),
        connect_timeout_secs: 30,
    };

    let replication = ReplicationConfig {
        slot_name: format!("test_slot_{}", std::process::id()),
        publication: format!("test_publication_{}", std::process::id()),
        output_plugin: "pgoutput".to_string(),
        proto_version: 1,
        start_lsn: None,
        create_slot: true,
        heartbeat_interval_secs: 1,
        recv_timeout_secs: 1,
    };

    Config {
        postgres,
        replication,
        sink: SinkConfig {
            format: OutputFormat::Json,
            queue_capacity: 100,
        },
    }
}

pub fn session_options(heartbeat: Duration) -> SessionOptions {
    SessionOptions {
        slot_name: "test_slot".to_string(),
        output_plugin: "pgoutput".to_string(),
        publication: "test_pub".to_string(),
        plugin_args: vec![
            ("proto_version".to_string(), "1".to_string()),
            ("publication_names".to_string(), "test_pub".to_string()),
        ],
        start_lsn: Lsn::ZERO,
        create_slot: true,
        heartbeat_interval: heartbeat,
        recv_timeout: heartbeat,
    }
}

/// What the scripted server does on the next `recv_frame`.
pub enum Step {
    Frame(Bytes),
    /// Stay silent for this long before moving on.
    Silence(Duration),
    Fail(Error),
    /// Server sends CopyDone.
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotBehavior {
    Create,
    AlreadyExists,
    Fail,
}

/// Everything a scripted transport observed, shared with the test.
#[derive(Debug, Default)]
pub struct Recorded {
    pub commands: Vec<String>,
    pub status_updates: Vec<(Instant, StatusUpdate)>,
    pub failed_status_updates: usize,
    pub closed: bool,
}

pub type Recorder = Arc<Mutex<Recorded>>;

/// In-memory stand-in for a replication connection that replays a script
/// and then idles forever.
pub struct ScriptedTransport {
    script: VecDeque<Step>,
    silence_until: Option<Instant>,
    slot: SlotBehavior,
    fail_status_updates: bool,
    recorder: Recorder,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Step>) -> (Self, Recorder) {
        let recorder = Recorder::default();
        let transport = Self {
            script: script.into(),
            silence_until: None,
            slot: SlotBehavior::Create,
            fail_status_updates: false,
            recorder: recorder.clone(),
        };
        (transport, recorder)
    }

    pub fn with_frames(frames: Vec<Bytes>) -> (Self, Recorder) {
        Self::new(frames.into_iter().map(Step::Frame).collect())
    }

    pub fn slot_behavior(mut self, slot: SlotBehavior) -> Self {
        self.slot = slot;
        self
    }

    /// Every status update fails as if the socket had gone away.
    pub fn fail_status_updates(mut self) -> Self {
        self.fail_status_updates = true;
        self
    }

    fn record(&self, command: impl Into<String>) {
        self.recorder.lock().unwrap().commands.push(command.into());
    }
}

#[async_trait]
impl ReplicationTransport for ScriptedTransport {
    async fn identify_system(&mut self) -> Result<SystemInfo> {
        self.record("IDENTIFY_SYSTEM");
        Ok(SystemInfo {
            system_id: "7000000000000000001".to_string(),
            timeline: 1,
            xlogpos: Lsn::new(0x1000),
            dbname: Some("postgres".to_string()),
        })
    }

    async fn create_replication_slot(&mut self, slot_name: &str, plugin: &str) -> Result<SlotInfo> {
        self.record(format!("CREATE_REPLICATION_SLOT {} {}", slot_name, plugin));
        match self.slot {
            SlotBehavior::Create => Ok(SlotInfo {
                slot_name: slot_name.to_string(),
                consistent_point: Some(Lsn::new(0x1000)),
                output_plugin: Some(plugin.to_string()),
            }),
            SlotBehavior::AlreadyExists => Err(Error::Server {
                code: "42710".to_string(),
                message: format!("replication slot \"{}\" already exists", slot_name),
            }),
            SlotBehavior::Fail => Err(Error::Server {
                code: "42501".to_string(),
                message: "must be superuser or replication role".to_string(),
            }),
        }
    }

    async fn start_replication(
        &mut self,
        slot_name: &str,
        start_lsn: Lsn,
        _plugin_args: &[(String, String)],
    ) -> Result<()> {
        self.record(format!("START_REPLICATION {} {}", slot_name, start_lsn));
        Ok(())
    }

    async fn recv_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.script.front() {
                None => std::future::pending::<()>().await,
                Some(Step::Silence(duration)) => {
                    let duration = *duration;
                    let until = *self
                        .silence_until
                        .get_or_insert_with(|| Instant::now() + duration);
                    tokio::time::sleep_until(until).await;
                    self.silence_until = None;
                    self.script.pop_front();
                }
                Some(_) => match self.script.pop_front() {
                    Some(Step::Frame(frame)) => return Ok(Some(frame)),
                    Some(Step::Fail(err)) => return Err(err),
                    _ => return Ok(None),
                },
            }
        }
    }

    async fn send_status_update(&mut self, update: &StatusUpdate) -> Result<()> {
        let mut recorded = self.recorder.lock().unwrap();
        if self.fail_status_updates {
            recorded.failed_status_updates += 1;
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "broken pipe",
            )));
        }
        recorded.status_updates.push((Instant::now(), update.clone()));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.recorder.lock().unwrap().closed = true;
        Ok(())
    }
}

/// Hands out a single prepared transport.
pub struct ScriptedConnector {
    transport: Mutex<Option<ScriptedTransport>>,
}

impl ScriptedConnector {
    pub fn new(transport: ScriptedTransport) -> Self {
        Self {
            transport: Mutex::new(Some(transport)),
        }
    }

    pub fn refusing() -> Self {
        Self {
            transport: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    type Transport = ScriptedTransport;

    async fn connect(&self) -> Result<ScriptedTransport> {
        self.transport
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Connection("connection refused".to_string()))
    }
}

/// Sink that keeps every event, optionally failing from the n-th one on.
#[derive(Default)]
pub struct CollectingSink {
    pub events: Vec<ChangeEvent>,
    pub fail_from: Option<usize>,
}

impl CollectingSink {
    pub fn failing_from(n: usize) -> Self {
        Self {
            events: Vec::new(),
            fail_from: Some(n),
        }
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn emit(&mut self, event: ChangeEvent) -> Result<()> {
        if self.fail_from.is_some_and(|n| self.events.len() >= n) {
            return Err(Error::Sink("downstream unavailable".to_string()));
        }
        self.events.push(event);
        Ok(())
    }
}

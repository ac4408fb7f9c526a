use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication::{self, sasl};
use postgres_protocol::message::backend::{self, ErrorResponseBody, NoticeResponseBody};
use postgres_protocol::message::frontend;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::lsn::Lsn;
use super::messages::StatusUpdate;
use crate::config::ConnectionParams;
use crate::{Error, Result};

/// Frames larger than this are treated as a protocol violation.
const MAX_FRAME_LEN: usize = 1 << 30;

/// The replication commands and CopyBoth stream a session drives.
///
/// `recv_frame` must be cancel safe: dropping its future before completion
/// must not lose or tear a frame, since the session races it against a
/// timeout and a shutdown signal.
#[async_trait]
pub trait ReplicationTransport: Send {
    async fn identify_system(&mut self) -> Result<SystemInfo>;

    /// Creates a logical slot. A slot that already exists is reported as a
    /// server error for which [`Error::is_already_exists`] holds.
    async fn create_replication_slot(&mut self, slot_name: &str, plugin: &str) -> Result<SlotInfo>;

    async fn start_replication(
        &mut self,
        slot_name: &str,
        start_lsn: Lsn,
        plugin_args: &[(String, String)],
    ) -> Result<()>;

    /// Next CopyData payload; `None` once the server has ended the stream.
    async fn recv_frame(&mut self) -> Result<Option<Bytes>>;

    async fn send_status_update(&mut self, update: &StatusUpdate) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens replication transports.
#[async_trait]
pub trait Connector: Send + Sync {
    type Transport: ReplicationTransport;

    async fn connect(&self) -> Result<Self::Transport>;
}

/// Connects [`ReplicationConnection`]s to a PostgreSQL server.
#[derive(Debug, Clone)]
pub struct PgConnector {
    params: ConnectionParams,
}

impl PgConnector {
    pub fn new(params: ConnectionParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Transport = ReplicationConnection;

    async fn connect(&self) -> Result<ReplicationConnection> {
        ReplicationConnection::connect(&self.params).await
    }
}

#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub system_id: String,
    pub timeline: i32,
    pub xlogpos: Lsn,
    pub dbname: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub slot_name: String,
    pub consistent_point: Option<Lsn>,
    pub output_plugin: Option<String>,
}

/// One row of a simple-query result, as text.
#[derive(Debug, Clone)]
pub struct SimpleRow {
    columns: Vec<String>,
    values: Vec<Option<String>>,
}

impl SimpleRow {
    pub fn get(&self, column: &str) -> Option<&str> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.values.get(idx)?.as_deref()
    }
}

/// A replication-mode connection speaking the frontend/backend protocol
/// directly over TCP.
pub struct ReplicationConnection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    server_version: Option<String>,
    streaming: bool,
}

impl ReplicationConnection {
    pub async fn connect(params: &ConnectionParams) -> Result<Self> {
        info!(
            host = %params.host,
            port = params.port,
            database = %params.database,
            user = %params.user,
            "Connecting to PostgreSQL in replication mode"
        );

        let stream = tokio::time::timeout(
            params.connect_timeout,
            TcpStream::connect((params.host.as_str(), params.port)),
        )
        .await
        .map_err(|_| Error::Timeout {
            message: format!(
                "connecting to {}:{} after {:?}",
                params.host, params.port, params.connect_timeout
            ),
        })?
        .map_err(|e| Error::Connection(format!("{}:{}: {}", params.host, params.port, e)))?;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream,
            read_buf: BytesMut::with_capacity(8192),
            write_buf: BytesMut::with_capacity(1024),
            server_version: None,
            streaming: false,
        };

        let startup = [
            ("user", params.user.as_str()),
            ("database", params.database.as_str()),
            ("replication", "database"),
            ("application_name", params.application_name.as_str()),
            ("client_encoding", "UTF8"),
        ];
        frontend::startup_message(startup.iter().copied(), &mut conn.write_buf)?;
        conn.flush().await?;

        let handshake = async {
            conn.authenticate(params).await?;
            conn.wait_for_ready().await
        };
        tokio::time::timeout(params.connect_timeout, handshake)
            .await
            .map_err(|_| Error::Timeout {
                message: "waiting for authentication to complete".to_string(),
            })??;

        info!(
            server_version = conn.server_version.as_deref().unwrap_or("unknown"),
            "Successfully connected to PostgreSQL in replication mode"
        );
        Ok(conn)
    }

    pub fn server_version(&self) -> Option<&str> {
        self.server_version.as_deref()
    }

    async fn authenticate(&mut self, params: &ConnectionParams) -> Result<()> {
        loop {
            let message = parse_backend(self.read_frame().await?)?;
            match message {
                backend::Message::AuthenticationOk => {
                    debug!("Authentication successful");
                    return Ok(());
                }
                backend::Message::AuthenticationCleartextPassword => {
                    let password = require_password(params)?;
                    frontend::password_message(password.as_bytes(), &mut self.write_buf)?;
                    self.flush().await?;
                }
                backend::Message::AuthenticationMd5Password(body) => {
                    let password = require_password(params)?;
                    let hash = authentication::md5_hash(
                        params.user.as_bytes(),
                        password.as_bytes(),
                        body.salt(),
                    );
                    frontend::password_message(hash.as_bytes(), &mut self.write_buf)?;
                    self.flush().await?;
                }
                backend::Message::AuthenticationSasl(body) => {
                    let mut mechanisms = body.mechanisms();
                    let mut scram_offered = false;
                    while let Some(mechanism) = mechanisms.next()? {
                        scram_offered |= mechanism == sasl::SCRAM_SHA_256;
                    }
                    if !scram_offered {
                        return Err(Error::Authentication(
                            "server offered no supported SASL mechanism".to_string(),
                        ));
                    }
                    let password = require_password(params)?;
                    self.authenticate_scram(password).await?;
                }
                backend::Message::ErrorResponse(body) => {
                    return Err(Error::Authentication(server_error(&body).to_string()));
                }
                _ => {
                    return Err(Error::Authentication(
                        "unsupported authentication request from server".to_string(),
                    ));
                }
            }
        }
    }

    async fn authenticate_scram(&mut self, password: &str) -> Result<()> {
        let mut scram =
            sasl::ScramSha256::new(password.as_bytes(), sasl::ChannelBinding::unsupported());

        frontend::sasl_initial_response(sasl::SCRAM_SHA_256, scram.message(), &mut self.write_buf)?;
        self.flush().await?;

        match parse_backend(self.read_frame().await?)? {
            backend::Message::AuthenticationSaslContinue(body) => scram
                .update(body.data())
                .map_err(|e| Error::Authentication(format!("SCRAM exchange failed: {}", e)))?,
            backend::Message::ErrorResponse(body) => {
                return Err(Error::Authentication(server_error(&body).to_string()))
            }
            _ => {
                return Err(Error::Authentication(
                    "expected SASL continue message".to_string(),
                ))
            }
        }

        frontend::sasl_response(scram.message(), &mut self.write_buf)?;
        self.flush().await?;

        match parse_backend(self.read_frame().await?)? {
            backend::Message::AuthenticationSaslFinal(body) => scram
                .finish(body.data())
                .map_err(|e| Error::Authentication(format!("SCRAM verification failed: {}", e))),
            backend::Message::ErrorResponse(body) => {
                Err(Error::Authentication(server_error(&body).to_string()))
            }
            _ => Err(Error::Authentication(
                "expected SASL final message".to_string(),
            )),
        }
    }

    async fn wait_for_ready(&mut self) -> Result<()> {
        loop {
            let frame = self.read_frame().await?;
            match frame[0] {
                b'Z' => return Ok(()),
                b'S' => {
                    if let backend::Message::ParameterStatus(body) = parse_backend(frame)? {
                        if body.name()? == "server_version" {
                            self.server_version = Some(body.value()?.to_string());
                        }
                    }
                }
                b'E' => return Err(error_from_frame(frame)?),
                b'N' => log_notice_frame(frame)?,
                // BackendKeyData and anything else informational
                _ => {}
            }
        }
    }

    /// Runs a simple query and collects its rows as text.
    pub async fn simple_query(&mut self, query: &str) -> Result<Vec<SimpleRow>> {
        debug!("Sending replication command: {}", query);
        frontend::query(query, &mut self.write_buf)?;
        self.flush().await?;

        let mut columns: Vec<String> = Vec::new();
        let mut rows = Vec::new();
        let mut failure = None;

        loop {
            let frame = self.read_frame().await?;
            match frame[0] {
                b'T' => {
                    if let backend::Message::RowDescription(body) = parse_backend(frame)? {
                        columns = body
                            .fields()
                            .map(|field| Ok(field.name().to_string()))
                            .collect()?;
                    }
                }
                b'D' => {
                    if let backend::Message::DataRow(body) = parse_backend(frame)? {
                        let buffer = body.buffer();
                        let values = body
                            .ranges()
                            .map(|range| {
                                Ok(range.map(|r| String::from_utf8_lossy(&buffer[r]).into_owned()))
                            })
                            .collect()?;
                        rows.push(SimpleRow {
                            columns: columns.clone(),
                            values,
                        });
                    }
                }
                b'E' => failure = Some(error_from_frame(frame)?),
                b'N' => log_notice_frame(frame)?,
                b'Z' => break,
                // CommandComplete, EmptyQueryResponse
                _ => {}
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(rows),
        }
    }

    /// Reads one complete backend message, header included.
    ///
    /// Only `read_buf` is awaited, so dropping this future never loses data:
    /// partial frames stay buffered for the next call.
    async fn read_frame(&mut self) -> Result<BytesMut> {
        loop {
            if let Some(frame) = self.split_frame()? {
                return Ok(frame);
            }
            let read = self.stream.read_buf(&mut self.read_buf).await?;
            if read == 0 {
                return Err(Error::Connection(
                    "server closed the connection".to_string(),
                ));
            }
        }
    }

    fn split_frame(&mut self) -> Result<Option<BytesMut>> {
        if self.read_buf.len() < 5 {
            return Ok(None);
        }
        let header = &self.read_buf[1..5];
        let len = i32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if len < 4 || len as usize > MAX_FRAME_LEN {
            return Err(Error::Protocol(format!(
                "invalid length {} for backend message '{}'",
                len, self.read_buf[0] as char
            )));
        }
        let total = 1 + len as usize;
        if self.read_buf.len() < total {
            self.read_buf.reserve(total - self.read_buf.len());
            return Ok(None);
        }
        Ok(Some(self.read_buf.split_to(total)))
    }

    async fn flush(&mut self) -> Result<()> {
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        self.write_buf.clear();
        Ok(())
    }
}

#[async_trait]
impl ReplicationTransport for ReplicationConnection {
    async fn identify_system(&mut self) -> Result<SystemInfo> {
        let rows = self.simple_query("IDENTIFY_SYSTEM").await?;
        let row = rows.first().ok_or_else(|| Error::Replication {
            message: "IDENTIFY_SYSTEM returned no rows".to_string(),
        })?;

        let info = SystemInfo {
            system_id: row.get("systemid").unwrap_or("unknown").to_string(),
            timeline: row.get("timeline").and_then(|t| t.parse().ok()).unwrap_or(1),
            xlogpos: row
                .get("xlogpos")
                .and_then(|p| p.parse().ok())
                .unwrap_or_default(),
            dbname: row.get("dbname").map(str::to_string),
        };
        debug!("System info: {:?}", info);
        Ok(info)
    }

    async fn create_replication_slot(&mut self, slot_name: &str, plugin: &str) -> Result<SlotInfo> {
        validate_identifier("slot name", slot_name)?;
        validate_identifier("output plugin", plugin)?;

        let query = format!(
            "CREATE_REPLICATION_SLOT {} LOGICAL {} NOEXPORT_SNAPSHOT",
            slot_name, plugin
        );
        let rows = self.simple_query(&query).await?;

        let row = rows.first();
        Ok(SlotInfo {
            slot_name: row
                .and_then(|r| r.get("slot_name"))
                .unwrap_or(slot_name)
                .to_string(),
            consistent_point: row
                .and_then(|r| r.get("consistent_point"))
                .and_then(|p| p.parse().ok()),
            output_plugin: row.and_then(|r| r.get("output_plugin")).map(str::to_string),
        })
    }

    async fn start_replication(
        &mut self,
        slot_name: &str,
        start_lsn: Lsn,
        plugin_args: &[(String, String)],
    ) -> Result<()> {
        validate_identifier("slot name", slot_name)?;
        let mut options = Vec::with_capacity(plugin_args.len());
        for (key, value) in plugin_args {
            validate_identifier("plugin option", key)?;
            options.push(format!("{} {}", key, quote_literal(value)));
        }

        let mut query = format!("START_REPLICATION SLOT {} LOGICAL {}", slot_name, start_lsn);
        if !options.is_empty() {
            query.push_str(&format!(" ({})", options.join(", ")));
        }

        info!("Starting replication from LSN: {}", start_lsn);
        debug!("Sending replication command: {}", query);
        frontend::query(&query, &mut self.write_buf)?;
        self.flush().await?;

        loop {
            let frame = self.read_frame().await?;
            match frame[0] {
                b'W' => {
                    self.streaming = true;
                    info!("Entered CopyBoth mode");
                    return Ok(());
                }
                b'E' => return Err(error_from_frame(frame)?),
                b'N' => log_notice_frame(frame)?,
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected response '{}' to START_REPLICATION",
                        other as char
                    )))
                }
            }
        }
    }

    async fn recv_frame(&mut self) -> Result<Option<Bytes>> {
        if !self.streaming {
            return Err(Error::Replication {
                message: "Replication not started".to_string(),
            });
        }

        loop {
            let frame = self.read_frame().await?;
            match frame[0] {
                b'd' => return Ok(Some(frame.freeze().slice(5..))),
                b'c' => {
                    debug!("Server sent CopyDone");
                    self.streaming = false;
                    return Ok(None);
                }
                b'E' => return Err(error_from_frame(frame)?),
                b'N' => log_notice_frame(frame)?,
                b'S' => {}
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message '{}' during replication",
                        other as char
                    )))
                }
            }
        }
    }

    async fn send_status_update(&mut self, update: &StatusUpdate) -> Result<()> {
        if !self.streaming {
            return Err(Error::Replication {
                message: "No active replication stream".to_string(),
            });
        }

        let payload = update.encode();
        self.write_buf.put_u8(b'd');
        self.write_buf.put_i32(payload.len() as i32 + 4);
        self.write_buf.put_slice(&payload);
        self.flush().await
    }

    async fn close(&mut self) -> Result<()> {
        info!("Closing replication connection");

        if self.streaming {
            frontend::copy_done(&mut self.write_buf);
            self.streaming = false;
        }
        frontend::terminate(&mut self.write_buf);
        let flushed = self.flush().await;
        let _ = tokio::time::timeout(Duration::from_secs(1), self.stream.shutdown()).await;
        flushed
    }
}

fn require_password(params: &ConnectionParams) -> Result<&str> {
    params
        .password
        .as_deref()
        .ok_or_else(|| Error::Authentication("password required but not provided".to_string()))
}

fn parse_backend(mut frame: BytesMut) -> Result<backend::Message> {
    backend::Message::parse(&mut frame)?
        .ok_or_else(|| Error::Protocol("incomplete backend message".to_string()))
}

fn error_from_frame(frame: BytesMut) -> Result<Error> {
    match parse_backend(frame)? {
        backend::Message::ErrorResponse(body) => Ok(server_error(&body)),
        _ => Err(Error::Protocol("expected ErrorResponse".to_string())),
    }
}

fn server_error(body: &ErrorResponseBody) -> Error {
    let mut code = String::new();
    let mut message = String::new();

    let mut fields = body.fields();
    while let Ok(Some(field)) = fields.next() {
        match field.type_() {
            b'C' => code = String::from_utf8_lossy(field.value_bytes()).into_owned(),
            b'M' => message = String::from_utf8_lossy(field.value_bytes()).into_owned(),
            _ => {}
        }
    }

    Error::Server { code, message }
}

fn log_notice_frame(frame: BytesMut) -> Result<()> {
    if let backend::Message::NoticeResponse(body) = parse_backend(frame)? {
        log_notice(&body);
    }
    Ok(())
}

fn log_notice(body: &NoticeResponseBody) {
    let mut severity = String::new();
    let mut message = String::new();

    let mut fields = body.fields();
    while let Ok(Some(field)) = fields.next() {
        match field.type_() {
            b'S' => severity = String::from_utf8_lossy(field.value_bytes()).into_owned(),
            b'M' => message = String::from_utf8_lossy(field.value_bytes()).into_owned(),
            _ => {}
        }
    }

    if severity == "WARNING" {
        warn!("Server notice: {}", message);
    } else {
        info!("Server notice ({}): {}", severity, message);
    }
}

/// Replication commands take bare identifiers; accept only the characters
/// PostgreSQL allows in slot names.
fn validate_identifier(what: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "invalid {} '{}': use 1-63 lowercase letters, digits or underscores",
            what, value
        )))
    }
}

/// Single-quoted SQL literal with embedded quotes doubled.
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

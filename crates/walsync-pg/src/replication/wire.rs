//! Replication-mode connection speaking the frontend/backend protocol directly.
//!
//! tokio-postgres cannot enter COPY BOTH mode, so the replication half of a
//! source is a raw socket: startup with `replication=database`, optional TLS,
//! password authentication, then simple queries and CopyData frames.

use bytes::{Buf, Bytes, BytesMut};
use postgres_protocol::authentication::md5_hash;
use postgres_protocol::authentication::sasl::{ChannelBinding, ScramSha256, SCRAM_SHA_256};
use postgres_protocol::message::frontend;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Duration, Instant};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use walsync_config::ConnectionConfig;
use walsync_core::Position;

use super::frame::{pg_now_micros, ServerMessage, StatusUpdate};
use super::transport::ReplicationTransport;
use crate::connect::tls_client_config;
use crate::error::{PgError, PgResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of `IDENTIFY_SYSTEM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInfo {
    pub system_id: String,
    pub timeline: u32,
    pub xlog_pos: Position,
    pub database: Option<String>,
}

enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Stream {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Stream::Plain(s) => {
                s.write_all(buf).await?;
                s.flush().await
            }
            Stream::Tls(s) => {
                s.write_all(buf).await?;
                s.flush().await
            }
        }
    }

    async fn read_buf(&mut self, buf: &mut BytesMut) -> std::io::Result<usize> {
        match self {
            Stream::Plain(s) => s.read_buf(buf).await,
            Stream::Tls(s) => s.read_buf(buf).await,
        }
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Plain(s) => s.shutdown().await,
            Stream::Tls(s) => s.shutdown().await,
        }
    }
}

/// A logical replication connection.
pub struct ReplicationConnection {
    stream: Stream,
    buf: BytesMut,
    streaming: bool,
    closed: bool,
}

impl ReplicationConnection {
    /// Open, authenticate and wait for the server to become ready.
    pub async fn connect(config: &ConnectionConfig) -> PgResult<Self> {
        info!(
            host = %config.host,
            port = config.port,
            user = %config.user,
            database = %config.database,
            sslmode = ?config.ssl_mode,
            "Opening replication connection"
        );

        let deadline = Instant::now() + CONNECT_TIMEOUT;
        let tcp = timeout_at(deadline, TcpStream::connect((config.host.as_str(), config.port)))
            .await
            .map_err(|_| PgError::Connection(format!("timed out connecting to {}", config)))?
            .map_err(|e| PgError::Connection(format!("{}: {}", config, e)))?;
        tcp.set_nodelay(true)?;

        let stream = match tls_client_config(config.ssl_mode)? {
            Some(tls) => Self::negotiate_tls(tcp, tls, &config.host).await?,
            None => Stream::Plain(tcp),
        };

        let mut conn = Self {
            stream,
            buf: BytesMut::with_capacity(16 * 1024),
            streaming: false,
            closed: false,
        };

        timeout_at(deadline, conn.startup(config))
            .await
            .map_err(|_| PgError::Connection(format!("timed out authenticating to {}", config)))??;

        debug!("Replication connection ready");
        Ok(conn)
    }

    async fn negotiate_tls(
        mut tcp: TcpStream,
        tls: std::sync::Arc<rustls::ClientConfig>,
        host: &str,
    ) -> PgResult<Stream> {
        let mut buf = BytesMut::new();
        frontend::ssl_request(&mut buf);
        tcp.write_all(&buf).await?;

        match tcp.read_u8().await? {
            b'S' => {}
            b'N' => {
                return Err(PgError::Tls(
                    "server does not accept SSL connections".into(),
                ))
            }
            other => {
                return Err(PgError::Protocol(format!(
                    "unexpected SSLRequest response '{}'",
                    other as char
                )))
            }
        }

        let name = ServerName::try_from(host.to_string())
            .map_err(|e| PgError::Tls(format!("invalid server name '{}': {}", host, e)))?;
        let tls_stream = TlsConnector::from(tls)
            .connect(name, tcp)
            .await
            .map_err(|e| PgError::Tls(e.to_string()))?;

        debug!("TLS established for replication connection");
        Ok(Stream::Tls(Box::new(tls_stream)))
    }

    async fn startup(&mut self, config: &ConnectionConfig) -> PgResult<()> {
        let params = [
            ("user", config.user.as_str()),
            ("database", config.database.as_str()),
            ("replication", "database"),
            ("application_name", "walsync"),
        ];
        let mut buf = BytesMut::new();
        frontend::startup_message(params.iter().copied(), &mut buf)?;
        self.stream.write_all(&buf).await?;

        let mut scram: Option<ScramSha256> = None;

        loop {
            let (tag, mut body) = self.read_message().await?;
            match tag {
                b'R' => {
                    if body.len() < 4 {
                        return Err(PgError::Protocol("truncated authentication request".into()));
                    }
                    let code = body.get_i32();
                    match code {
                        0 => {
                            debug!("Authentication successful");
                        }
                        3 => {
                            let mut buf = BytesMut::new();
                            frontend::password_message(config.password.as_bytes(), &mut buf)?;
                            self.stream.write_all(&buf).await?;
                        }
                        5 => {
                            if body.len() < 4 {
                                return Err(PgError::Protocol("truncated MD5 salt".into()));
                            }
                            let mut salt = [0u8; 4];
                            body.copy_to_slice(&mut salt);
                            let hash = md5_hash(
                                config.user.as_bytes(),
                                config.password.as_bytes(),
                                salt,
                            );
                            let mut buf = BytesMut::new();
                            frontend::password_message(hash.as_bytes(), &mut buf)?;
                            self.stream.write_all(&buf).await?;
                        }
                        10 => {
                            let offered = parse_sasl_mechanisms(&body);
                            if !offered.iter().any(|m| m == SCRAM_SHA_256) {
                                return Err(PgError::Connection(format!(
                                    "no supported SASL mechanism offered: {:?}",
                                    offered
                                )));
                            }
                            let client = ScramSha256::new(
                                config.password.as_bytes(),
                                ChannelBinding::unsupported(),
                            );
                            let mut buf = BytesMut::new();
                            frontend::sasl_initial_response(SCRAM_SHA_256, client.message(), &mut buf)?;
                            self.stream.write_all(&buf).await?;
                            scram = Some(client);
                        }
                        11 => {
                            let client = scram.as_mut().ok_or_else(|| {
                                PgError::Protocol("SASL continue without SASL start".into())
                            })?;
                            client
                                .update(&body)
                                .map_err(|e| PgError::Connection(format!("SCRAM: {}", e)))?;
                            let mut buf = BytesMut::new();
                            frontend::sasl_response(client.message(), &mut buf)?;
                            self.stream.write_all(&buf).await?;
                        }
                        12 => {
                            let client = scram.as_mut().ok_or_else(|| {
                                PgError::Protocol("SASL final without SASL start".into())
                            })?;
                            client
                                .finish(&body)
                                .map_err(|e| PgError::Connection(format!("SCRAM: {}", e)))?;
                        }
                        other => {
                            return Err(PgError::Connection(format!(
                                "unsupported authentication method {}",
                                other
                            )))
                        }
                    }
                }
                b'E' => return Err(parse_error_response(&body)),
                b'S' | b'K' | b'N' => {}
                b'Z' => return Ok(()),
                other => {
                    return Err(PgError::Protocol(format!(
                        "unexpected message '{}' during startup",
                        other as char
                    )))
                }
            }
        }
    }

    /// Run `IDENTIFY_SYSTEM` and return the server's identity.
    pub async fn identify_system(&mut self) -> PgResult<SystemInfo> {
        let rows = self.simple_query("IDENTIFY_SYSTEM").await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| PgError::Protocol("IDENTIFY_SYSTEM returned no rows".into()))?;

        let field = |i: usize| row.get(i).cloned().flatten();
        let system_id = field(0).unwrap_or_default();
        let timeline = field(1)
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| PgError::Protocol("IDENTIFY_SYSTEM returned no timeline".into()))?;
        let xlog_pos = field(2)
            .map(|p| Position::parse(&p))
            .transpose()?
            .unwrap_or(Position::ZERO);

        Ok(SystemInfo {
            system_id,
            timeline,
            xlog_pos,
            database: field(3),
        })
    }

    /// Send a simple query and collect its text rows.
    async fn simple_query(&mut self, query: &str) -> PgResult<Vec<Vec<Option<String>>>> {
        let mut buf = BytesMut::new();
        frontend::query(query, &mut buf)?;
        self.stream.write_all(&buf).await?;

        let mut rows = Vec::new();
        let mut error = None;
        loop {
            let (tag, body) = self.read_message().await?;
            match tag {
                b'D' => rows.push(parse_data_row(body)?),
                b'E' => error = Some(parse_error_response(&body)),
                b'T' | b'C' | b'N' | b'S' | b'I' => {}
                b'Z' => break,
                other => {
                    return Err(PgError::Protocol(format!(
                        "unexpected message '{}' in response to {}",
                        other as char, query
                    )))
                }
            }
        }

        match error {
            Some(e) => Err(e),
            None => Ok(rows),
        }
    }

    /// Read one whole backend message, waiting as long as needed.
    async fn read_message(&mut self) -> PgResult<(u8, Bytes)> {
        loop {
            if let Some(message) = self.take_message()? {
                return Ok(message);
            }
            self.fill_buf().await?;
        }
    }

    async fn fill_buf(&mut self) -> PgResult<()> {
        let n = self.stream.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(PgError::Connection(
                "server closed the replication connection".into(),
            ));
        }
        Ok(())
    }

    /// Split a complete message off the read buffer, if one is buffered.
    fn take_message(&mut self) -> PgResult<Option<(u8, Bytes)>> {
        if self.buf.len() < 5 {
            return Ok(None);
        }
        let len = i32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
        if len < 4 {
            return Err(PgError::Protocol(format!("invalid message length {}", len)));
        }
        let total = 1 + len as usize;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }

        let mut frame = self.buf.split_to(total).freeze();
        let tag = frame[0];
        frame.advance(5);
        Ok(Some((tag, frame)))
    }

    async fn write_copy_data(&mut self, data: &[u8]) -> PgResult<()> {
        let mut buf = BytesMut::with_capacity(5 + data.len());
        buf.extend_from_slice(&[b'd']);
        buf.extend_from_slice(&((data.len() + 4) as i32).to_be_bytes());
        buf.extend_from_slice(data);
        self.stream.write_all(&buf).await?;
        Ok(())
    }
}

impl ReplicationTransport for ReplicationConnection {
    async fn start_replication(&mut self, slot: &str, start: Position) -> PgResult<()> {
        let system = self.identify_system().await?;
        info!(
            system_id = %system.system_id,
            timeline = system.timeline,
            xlog_pos = %system.xlog_pos,
            database = ?system.database,
            "Identified source system"
        );

        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL {} (\"format-version\" '1', \"include-lsn\" 'true', \"include-timestamp\" 'true', \"include-types\" 'false')",
            slot, start
        );
        let mut buf = BytesMut::new();
        frontend::query(&query, &mut buf)?;
        self.stream.write_all(&buf).await?;

        loop {
            let (tag, body) = self.read_message().await?;
            match tag {
                b'W' => {
                    info!(slot = %slot, lsn = %start, "Entered CopyBoth mode");
                    self.streaming = true;
                    return Ok(());
                }
                b'E' => return Err(parse_error_response(&body)),
                b'N' => {}
                other => {
                    return Err(PgError::Protocol(format!(
                        "unexpected response to START_REPLICATION: '{}'",
                        other as char
                    )))
                }
            }
        }
    }

    async fn recv(&mut self, deadline: Instant) -> PgResult<Option<ServerMessage>> {
        loop {
            if let Some((tag, body)) = self.take_message()? {
                match tag {
                    b'd' => return ServerMessage::parse_copy_data(body).map(Some),
                    b'c' => {
                        self.streaming = false;
                        return Ok(Some(ServerMessage::CopyDone));
                    }
                    b'E' => return Err(parse_error_response(&body)),
                    b'N' => {
                        let notice = parse_error_response(&body);
                        warn!(notice = %notice, "Server notice");
                        continue;
                    }
                    other => {
                        return Err(PgError::Protocol(format!(
                            "unexpected message '{}' while streaming",
                            other as char
                        )))
                    }
                }
            }

            match timeout_at(deadline, self.fill_buf()).await {
                Err(_) => return Ok(None),
                Ok(result) => result?,
            }
        }
    }

    async fn send_status(&mut self, status: StatusUpdate) -> PgResult<()> {
        let body = status.encode(pg_now_micros());
        self.write_copy_data(&body).await
    }

    async fn close(&mut self) -> PgResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut buf = BytesMut::new();
        if self.streaming {
            frontend::copy_done(&mut buf);
            self.streaming = false;
        }
        frontend::terminate(&mut buf);

        let sent = self.stream.write_all(&buf).await;
        let shutdown = self.stream.shutdown().await;
        debug!("Replication connection closed");
        sent?;
        shutdown?;
        Ok(())
    }
}

/// Parse the NUL-separated mechanism list of an AuthenticationSASL message.
fn parse_sasl_mechanisms(body: &[u8]) -> Vec<String> {
    body.split(|b| *b == 0)
        .filter(|m| !m.is_empty())
        .map(|m| String::from_utf8_lossy(m).into_owned())
        .collect()
}

/// Parse an ErrorResponse or NoticeResponse body into [`PgError::Server`].
fn parse_error_response(body: &[u8]) -> PgError {
    let mut severity = String::new();
    let mut code = String::new();
    let mut message = String::new();

    let mut rest = body;
    while let Some((&field, tail)) = rest.split_first() {
        if field == 0 {
            break;
        }
        let end = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
        let value = String::from_utf8_lossy(&tail[..end]).into_owned();
        match field {
            b'S' => severity = value,
            b'C' => code = value,
            b'M' => message = value,
            _ => {}
        }
        rest = tail.get(end + 1..).unwrap_or(&[]);
    }

    PgError::Server {
        severity,
        code,
        message,
    }
}

/// Parse a DataRow body into text columns.
fn parse_data_row(mut body: Bytes) -> PgResult<Vec<Option<String>>> {
    if body.len() < 2 {
        return Err(PgError::Protocol("truncated DataRow".into()));
    }
    let count = body.get_i16();
    let mut columns = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        if body.len() < 4 {
            return Err(PgError::Protocol("truncated DataRow".into()));
        }
        let len = body.get_i32();
        if len < 0 {
            columns.push(None);
            continue;
        }
        let len = len as usize;
        if body.len() < len {
            return Err(PgError::Protocol("truncated DataRow".into()));
        }
        let value = body.split_to(len);
        columns.push(Some(String::from_utf8_lossy(&value).into_owned()));
    }
    Ok(columns)
}

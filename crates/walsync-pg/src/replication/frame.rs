//! CopyData payloads exchanged during logical replication.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-replication.html

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use walsync_core::Position;

use crate::error::{PgError, PgResult};

/// Seconds between the Unix epoch and the Postgres epoch (2000-01-01).
const PG_EPOCH_OFFSET: i64 = 946_684_800;

const XLOG_HEADER_LEN: usize = 1 + 8 + 8 + 8;

/// A message received from the server while streaming.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    XLogData(XLogData),
    Keepalive(Keepalive),
    /// The server ended the COPY stream.
    CopyDone,
}

/// A chunk of decoded WAL (`w`).
#[derive(Debug, Clone, PartialEq)]
pub struct XLogData {
    pub wal_start: Position,
    pub wal_end: Position,
    /// Server clock, microseconds since 2000-01-01.
    pub send_time: i64,
    pub data: Bytes,
}

impl XLogData {
    /// The position just past this frame's payload.
    pub fn end_position(&self) -> Position {
        self.wal_start.advance(self.data.len() as u64)
    }
}

/// Primary keepalive (`k`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    pub wal_end: Position,
    pub send_time: i64,
    pub reply_requested: bool,
}

impl ServerMessage {
    /// Parse the body of a CopyData message.
    pub fn parse_copy_data(body: Bytes) -> PgResult<Self> {
        let tag = *body
            .first()
            .ok_or_else(|| PgError::Protocol("empty CopyData message".into()))?;

        match tag {
            b'w' => {
                if body.len() < XLOG_HEADER_LEN {
                    return Err(PgError::Protocol(format!(
                        "XLogData too short: {} bytes",
                        body.len()
                    )));
                }
                let mut cursor = Cursor::new(&body[1..XLOG_HEADER_LEN]);
                let wal_start = cursor.read_u64::<BigEndian>()?;
                let wal_end = cursor.read_u64::<BigEndian>()?;
                let send_time = cursor.read_i64::<BigEndian>()?;

                Ok(ServerMessage::XLogData(XLogData {
                    wal_start: Position::new(wal_start),
                    wal_end: Position::new(wal_end),
                    send_time,
                    data: body.slice(XLOG_HEADER_LEN..),
                }))
            }
            b'k' => {
                let mut cursor = Cursor::new(&body[1..]);
                let wal_end = cursor
                    .read_u64::<BigEndian>()
                    .map_err(|_| PgError::Protocol("keepalive too short".into()))?;
                let send_time = cursor
                    .read_i64::<BigEndian>()
                    .map_err(|_| PgError::Protocol("keepalive too short".into()))?;
                let reply = cursor
                    .read_u8()
                    .map_err(|_| PgError::Protocol("keepalive too short".into()))?;

                Ok(ServerMessage::Keepalive(Keepalive {
                    wal_end: Position::new(wal_end),
                    send_time,
                    reply_requested: reply == 1,
                }))
            }
            other => Err(PgError::Protocol(format!(
                "unexpected replication message type '{}'",
                other as char
            ))),
        }
    }
}

/// Standby status update (`r`) sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    pub write: Position,
    pub flush: Position,
    pub apply: Position,
    pub reply_requested: bool,
}

impl StatusUpdate {
    /// Report progress without confirming anything as flushed.
    pub fn keepalive(last_seen: Position) -> Self {
        Self {
            write: last_seen,
            flush: Position::ZERO,
            apply: Position::ZERO,
            reply_requested: false,
        }
    }

    /// Confirm `position` as written and flushed, releasing WAL up to it.
    pub fn acknowledge(position: Position) -> Self {
        Self {
            write: position,
            flush: position,
            apply: Position::ZERO,
            reply_requested: false,
        }
    }

    /// Whether this update confirms a flush position.
    pub fn is_acknowledgment(&self) -> bool {
        !self.flush.is_zero()
    }

    /// Encode as a CopyData body stamped with `clock`.
    pub fn encode(&self, clock: i64) -> Bytes {
        let mut buf = BytesMut::with_capacity(34);
        buf.put_u8(b'r');
        buf.put_u64(self.write.as_u64());
        buf.put_u64(self.flush.as_u64());
        buf.put_u64(self.apply.as_u64());
        buf.put_i64(clock);
        buf.put_u8(u8::from(self.reply_requested));
        buf.freeze()
    }
}

/// Current time as microseconds since the Postgres epoch.
pub fn pg_now_micros() -> i64 {
    let now = chrono::Utc::now();
    (now.timestamp() - PG_EPOCH_OFFSET) * 1_000_000 + i64::from(now.timestamp_subsec_micros())
}

/// Format a Postgres timestamp (microseconds since 2000-01-01) as ISO 8601.
pub fn format_pg_timestamp(micros: i64) -> String {
    let unix_secs = micros.div_euclid(1_000_000) + PG_EPOCH_OFFSET;
    let nanos = (micros.rem_euclid(1_000_000) * 1000) as u32;

    chrono::DateTime::from_timestamp(unix_secs, nanos)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string())
        .unwrap_or_else(|| format!("{}us", micros))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xlog(start: u64, end: u64, data: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'w');
        buf.put_u64(start);
        buf.put_u64(end);
        buf.put_i64(0);
        buf.put_slice(data);
        buf.freeze()
    }

    #[test]
    fn test_parse_xlog_data() {
        let msg = ServerMessage::parse_copy_data(xlog(0x100, 0x200, b"{}")).unwrap();
        let ServerMessage::XLogData(frame) = msg else {
            panic!("expected XLogData");
        };
        assert_eq!(frame.wal_start, Position::new(0x100));
        assert_eq!(frame.wal_end, Position::new(0x200));
        assert_eq!(&frame.data[..], b"{}");
        assert_eq!(frame.end_position(), Position::new(0x102));
    }

    #[test]
    fn test_parse_keepalive() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'k');
        buf.put_u64(0x300);
        buf.put_i64(42);
        buf.put_u8(1);

        let msg = ServerMessage::parse_copy_data(buf.freeze()).unwrap();
        assert_eq!(
            msg,
            ServerMessage::Keepalive(Keepalive {
                wal_end: Position::new(0x300),
                send_time: 42,
                reply_requested: true,
            })
        );
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(
            ServerMessage::parse_copy_data(Bytes::new()),
            Err(PgError::Protocol(_))
        ));
        assert!(matches!(
            ServerMessage::parse_copy_data(Bytes::from_static(b"w\0\0")),
            Err(PgError::Protocol(_))
        ));
        assert!(matches!(
            ServerMessage::parse_copy_data(Bytes::from_static(b"k\0")),
            Err(PgError::Protocol(_))
        ));
        assert!(matches!(
            ServerMessage::parse_copy_data(Bytes::from_static(b"x")),
            Err(PgError::Protocol(_))
        ));
    }

    #[test]
    fn test_encode_status_update() {
        let encoded = StatusUpdate::acknowledge(Position::new(0x1234)).encode(7);
        assert_eq!(encoded.len(), 34);
        assert_eq!(encoded[0], b'r');

        let mut cursor = Cursor::new(&encoded[1..]);
        assert_eq!(cursor.read_u64::<BigEndian>().unwrap(), 0x1234);
        assert_eq!(cursor.read_u64::<BigEndian>().unwrap(), 0x1234);
        assert_eq!(cursor.read_u64::<BigEndian>().unwrap(), 0);
        assert_eq!(cursor.read_i64::<BigEndian>().unwrap(), 7);
        assert_eq!(cursor.read_u8().unwrap(), 0);
    }

    #[test]
    fn test_keepalive_is_not_an_acknowledgment() {
        let keepalive = StatusUpdate::keepalive(Position::new(0x50));
        assert!(!keepalive.is_acknowledgment());
        assert_eq!(keepalive.write, Position::new(0x50));
        assert!(StatusUpdate::acknowledge(Position::new(0x50)).is_acknowledgment());
    }

    #[test]
    fn test_format_pg_timestamp() {
        assert_eq!(format_pg_timestamp(0), "2000-01-01T00:00:00.000000Z");
        assert_eq!(format_pg_timestamp(1_500_000), "2000-01-01T00:00:01.500000Z");
    }

    #[test]
    fn test_pg_now_is_after_epoch() {
        assert!(pg_now_micros() > 0);
    }
}

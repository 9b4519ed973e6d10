//! Network time over SNTP (RFC 4330).
//!
//! One 48-byte request, one 48-byte reply, transmit timestamp only. Accuracy
//! to within a second is all a departure board needs.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::debug;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: i64 = 2_208_988_800;

const PACKET_LEN: usize = 48;

#[derive(Error, Debug)]
pub enum TimeSyncError {
    #[error("time server IO: {0}")]
    Io(#[from] io::Error),

    #[error("time server did not answer in time")]
    Timeout,

    #[error("malformed time reply: {0}")]
    Malformed(&'static str),
}

/// Somewhere the current UTC time can be asked for.
pub trait TimeSource {
    fn network_time(&mut self) -> impl Future<Output = Result<DateTime<Utc>, TimeSyncError>>;
}

#[derive(Debug, Clone)]
pub struct SntpClient {
    server: String,
    timeout: Duration,
}

impl SntpClient {
    /// `server` is a `host:port` pair, e.g. `pool.ntp.org:123`.
    pub fn new(server: impl Into<String>, timeout: Duration) -> Self {
        Self {
            server: server.into(),
            timeout,
        }
    }
}

impl TimeSource for SntpClient {
    async fn network_time(&mut self) -> Result<DateTime<Utc>, TimeSyncError> {
        // Name resolution happens in connect, so it shares the deadline
        let exchange = async {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect(&self.server).await?;
            socket.send(&request_packet()).await?;
            let mut reply = [0u8; PACKET_LEN];
            let len = socket.recv(&mut reply).await?;
            Ok::<_, io::Error>((reply, len))
        };

        let (reply, len) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| TimeSyncError::Timeout)??;

        let time = parse_reply(&reply[..len])?;
        debug!(server = %self.server, time = %time, "SNTP reply");
        Ok(time)
    }
}

/// Client request: leap indicator 0, version 3, mode 3.
pub fn request_packet() -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    packet[0] = 0x1B;
    packet
}

/// Reads the transmit timestamp out of a server reply.
pub fn parse_reply(bytes: &[u8]) -> Result<DateTime<Utc>, TimeSyncError> {
    if bytes.len() < PACKET_LEN {
        return Err(TimeSyncError::Malformed("short packet"));
    }
    let mode = bytes[0] & 0x07;
    if mode != 4 && mode != 5 {
        return Err(TimeSyncError::Malformed("not a server reply"));
    }
    if bytes[1] == 0 {
        return Err(TimeSyncError::Malformed("kiss-o'-death"));
    }

    let word = |at: usize| u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
    let seconds = word(40);
    let fraction = word(44);
    if seconds == 0 {
        return Err(TimeSyncError::Malformed("empty transmit timestamp"));
    }

    // Era 1 starts in 2036; timestamps with the top bit clear belong to it
    let era_seconds = if seconds & 0x8000_0000 == 0 {
        i64::from(seconds) + (1 << 32)
    } else {
        i64::from(seconds)
    };
    let nanos = ((u64::from(fraction) * 1_000_000_000) >> 32) as u32;

    DateTime::from_timestamp(era_seconds - NTP_UNIX_OFFSET, nanos)
        .ok_or(TimeSyncError::Malformed("timestamp out of range"))
}

//! Byte-level serial transport.
//!
//! The arbiter and the connection supervisor only ever see the `DeviceLink`
//! and `LinkFactory` traits, so tests can swap the physical port for a
//! scripted in-memory stream.

use crate::errors::{BridgeError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, trace};

/// One open serial line. Exactly one owner at a time (the port-state lock).
#[async_trait]
pub trait DeviceLink: Send {
    /// Writes one command line; the newline terminator is appended here.
    async fn write_line(&mut self, line: &str) -> Result<()>;

    /// Reads one line (excluding the terminator), bounded by an absolute
    /// deadline measured from call start. A stalled device yields
    /// `BridgeError::Timeout` instead of blocking the arbiter forever.
    async fn read_line(&mut self, read_timeout: Duration) -> Result<String>;

    /// Discards buffered unsolicited bytes (boot banners, stale replies).
    /// The protocol has no correlation IDs, so anything left in the buffer
    /// would be misread as the reply to the next command.
    async fn drain_input(&mut self);
}

/// Opens links; the supervisor and discovery probes go through this so tests
/// can count and script connection attempts.
#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn open(&self, port_name: &str, baud_rate: u32) -> Result<Box<dyn DeviceLink>>;
}

/// `DeviceLink` over any async byte stream.
pub struct StreamLink<S> {
    stream: S,
}

pub type SerialLink = StreamLink<SerialStream>;

impl<S> StreamLink<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl<S> DeviceLink for StreamLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self, read_timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + read_timeout;
        let mut line = Vec::new();

        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(BridgeError::Timeout)?;

            match timeout(remaining, self.stream.read_u8()).await {
                Ok(Ok(b'\n')) => break,
                Ok(Ok(byte)) => line.push(byte),
                Ok(Err(e)) => return Err(BridgeError::Io(e)),
                Err(_) => return Err(BridgeError::Timeout),
            }
        }

        let text = String::from_utf8_lossy(&line).trim().to_string();
        trace!("Serial read: {}", text);
        Ok(text)
    }

    async fn drain_input(&mut self) {
        let mut buf = [0u8; 1024];
        loop {
            match timeout(Duration::from_millis(100), self.stream.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => {
                    debug!("Drained {} stale bytes from serial buffer", n);
                    if n < buf.len() {
                        break;
                    }
                }
                _ => break,
            }
        }
    }
}

/// Production factory opening real USB serial ports.
pub struct SerialLinkFactory;

#[async_trait]
impl LinkFactory for SerialLinkFactory {
    async fn open(&self, port_name: &str, baud_rate: u32) -> Result<Box<dyn DeviceLink>> {
        let stream = tokio_serial::new(port_name, baud_rate)
            .timeout(Duration::from_millis(1000))
            .open_native_async()?;
        debug!("Opened serial port {} at {} baud", port_name, baud_rate);
        Ok(Box::new(StreamLink::new(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_line_strips_terminator_and_cr() {
        let (client, mut server) = tokio::io::duplex(256);
        let mut link = StreamLink::new(client);

        server.write_all(b"{\"v\":12.1}\r\n").await.unwrap();
        let line = link.read_line(Duration::from_secs(1)).await.unwrap();
        assert_eq!(line, "{\"v\":12.1}");
    }

    #[tokio::test]
    async fn read_line_times_out_on_silent_peer() {
        let (client, _server) = tokio::io::duplex(256);
        let mut link = StreamLink::new(client);

        let started = Instant::now();
        let err = link.read_line(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn read_line_times_out_on_partial_line() {
        let (client, mut server) = tokio::io::duplex(256);
        let mut link = StreamLink::new(client);

        server.write_all(b"{\"unterminated").await.unwrap();
        let err = link.read_line(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout));
    }

    #[tokio::test]
    async fn drain_discards_buffered_banner() {
        let (client, mut server) = tokio::io::duplex(256);
        let mut link = StreamLink::new(client);

        server.write_all(b"boot banner\n").await.unwrap();
        link.drain_input().await;

        server.write_all(b"real reply\n").await.unwrap();
        let line = link.read_line(Duration::from_secs(1)).await.unwrap();
        assert_eq!(line, "real reply");
    }

    #[tokio::test]
    async fn write_line_appends_newline() {
        let (client, mut server) = tokio::io::duplex(256);
        let mut link = StreamLink::new(client);

        link.write_line("{\"get\":\"status\"}").await.unwrap();
        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"{\"get\":\"status\"}\n");
    }
}

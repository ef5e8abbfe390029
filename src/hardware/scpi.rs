//! SCPI communication helpers
//!
//! This module provides the transport seam for SCPI-speaking recorders:
//! - `ScpiTransport`: command/query/binary-query abstraction (TCP, or a mock in tests)
//! - `TcpScpiClient`: SCPI over a raw TCP socket (LXI port 5555 on most scopes)
//! - `parse_definite_block`: IEEE 488.2 definite-length block decoding for waveform data

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Default command timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Trait for SCPI communication transports.
///
/// Abstracts the underlying communication mechanism so the recorder binding is
/// protocol-agnostic and testable without a socket.
#[async_trait]
pub trait ScpiTransport: Send {
    /// Send a command without expecting a response.
    async fn write(&mut self, command: &str) -> Result<()>;

    /// Send a query and return the trimmed response line.
    async fn query(&mut self, query: &str) -> Result<String>;

    /// Send a query whose response is an IEEE 488.2 definite-length block.
    async fn query_binary(&mut self, query: &str) -> Result<Vec<u8>>;

    /// Close the transport.
    async fn close(&mut self) -> Result<()>;

    /// Query a floating-point value.
    async fn query_f64(&mut self, query: &str) -> Result<f64> {
        let response = self.query(query).await?;
        response.trim().parse::<f64>().with_context(|| {
            format!("Failed to parse '{}' as f64 from query: {}", response, query)
        })
    }
}

/// SCPI client over a raw TCP socket.
pub struct TcpScpiClient {
    stream: BufReader<TcpStream>,
    timeout: Duration,
}

impl TcpScpiClient {
    /// Connect to `address` (`host:port`).
    pub async fn connect(address: &str) -> Result<Self> {
        let stream = timeout(Duration::from_secs(5), TcpStream::connect(address))
            .await
            .with_context(|| format!("Connection timeout to {}", address))?
            .with_context(|| format!("Failed to connect to {}", address))?;

        // Disable Nagle's algorithm for low latency
        stream.set_nodelay(true)?;

        tracing::info!(address, "Connected to SCPI recorder");

        Ok(Self {
            stream: BufReader::new(stream),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        })
    }

    /// Set the per-response timeout.
    pub fn set_timeout(&mut self, duration: Duration) {
        self.timeout = duration;
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        let cmd = format!("{}\n", line);
        let socket = self.stream.get_mut();
        socket
            .write_all(cmd.as_bytes())
            .await
            .with_context(|| format!("Failed to write: {}", line))?;
        socket.flush().await.context("Failed to flush stream")?;
        Ok(())
    }

    async fn read_block(&mut self) -> Result<Vec<u8>> {
        // "#" <n> <n length digits> <payload> "\n"
        let mut head = [0u8; 2];
        self.stream.read_exact(&mut head).await?;
        if head[0] != b'#' {
            bail!("Expected definite-length block, got byte 0x{:02x}", head[0]);
        }
        let digits = (head[1] as char)
            .to_digit(10)
            .filter(|d| *d > 0)
            .ok_or_else(|| anyhow::anyhow!("Invalid block header digit count"))?;
        let mut len_buf = vec![0u8; digits as usize];
        self.stream.read_exact(&mut len_buf).await?;
        let len: usize = std::str::from_utf8(&len_buf)?
            .parse()
            .context("Invalid block length")?;

        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await?;

        let mut terminator = String::new();
        self.stream.read_line(&mut terminator).await?;
        Ok(payload)
    }
}

#[async_trait]
impl ScpiTransport for TcpScpiClient {
    async fn write(&mut self, command: &str) -> Result<()> {
        tracing::debug!(command, "SCPI write");
        self.send_line(command).await
    }

    async fn query(&mut self, query: &str) -> Result<String> {
        tracing::debug!(query, "SCPI query");
        self.send_line(query).await?;

        let mut response = String::new();
        match timeout(self.timeout, self.stream.read_line(&mut response)).await {
            Ok(Ok(0)) => bail!("Connection closed by recorder"),
            Ok(Ok(_)) => {
                let trimmed = response.trim().to_string();
                tracing::debug!(response = %trimmed, "SCPI response");
                Ok(trimmed)
            }
            Ok(Err(e)) => Err(e).context("Failed to read response"),
            Err(_) => bail!("Timeout waiting for response to: {}", query),
        }
    }

    async fn query_binary(&mut self, query: &str) -> Result<Vec<u8>> {
        tracing::debug!(query, "SCPI binary query");
        self.send_line(query).await?;
        let limit = self.timeout;
        timeout(limit, self.read_block())
            .await
            .with_context(|| format!("Timeout waiting for block response to: {}", query))?
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.get_mut().shutdown().await?;
        Ok(())
    }
}

/// Decode an in-memory IEEE 488.2 definite-length block.
///
/// Trailing bytes after the payload (usually a newline) are ignored.
pub fn parse_definite_block(buf: &[u8]) -> Result<&[u8]> {
    if buf.len() < 2 || buf[0] != b'#' {
        bail!("Not a definite-length block");
    }
    let digits = (buf[1] as char)
        .to_digit(10)
        .filter(|d| *d > 0)
        .ok_or_else(|| anyhow::anyhow!("Invalid block header digit count"))? as usize;
    let len_end = 2 + digits;
    if buf.len() < len_end {
        bail!("Truncated block header");
    }
    let len: usize = std::str::from_utf8(&buf[2..len_end])?
        .parse()
        .context("Invalid block length")?;
    let payload_end = len_end + len;
    if buf.len() < payload_end {
        bail!(
            "Truncated block payload: header says {} bytes, {} available",
            len,
            buf.len() - len_end
        );
    }
    Ok(&buf[len_end..payload_end])
}

/// Encode a payload as an IEEE 488.2 definite-length block.
pub fn encode_definite_block(payload: &[u8]) -> Vec<u8> {
    let len = payload.len().to_string();
    let mut out = format!("#{}{}", len.len(), len).into_bytes();
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_block_and_ignores_terminator() {
        let buf = b"#15hello\n";
        assert_eq!(parse_definite_block(buf).unwrap(), b"hello");
    }

    #[test]
    fn parses_multi_digit_length() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let block = encode_definite_block(&payload);
        assert!(block.starts_with(b"#3256"));
        assert_eq!(parse_definite_block(&block).unwrap(), payload.as_slice());
    }

    #[test]
    fn rejects_malformed_blocks() {
        assert!(parse_definite_block(b"hello").is_err());
        assert!(parse_definite_block(b"#0").is_err());
        assert!(parse_definite_block(b"#210abc").is_err());
    }

    #[tokio::test]
    async fn tcp_client_round_trip_against_local_listener() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut socket = BufReader::new(socket);
            let mut line = String::new();

            socket.read_line(&mut line).await.unwrap();
            assert_eq!(line.trim(), "*IDN?");
            socket
                .get_mut()
                .write_all(b"ACME,SCOPE,0,1.0\n")
                .await
                .unwrap();

            line.clear();
            socket.read_line(&mut line).await.unwrap();
            assert_eq!(line.trim(), ":WAV:DATA?");
            let mut block = encode_definite_block(&[1, 2, 3, 4]);
            block.push(b'\n');
            socket.get_mut().write_all(&block).await.unwrap();
        });

        let mut client = TcpScpiClient::connect(&addr).await.unwrap();
        assert_eq!(client.query("*IDN?").await.unwrap(), "ACME,SCOPE,0,1.0");
        assert_eq!(
            client.query_binary(":WAV:DATA?").await.unwrap(),
            vec![1, 2, 3, 4]
        );
        server.await.unwrap();
    }
}

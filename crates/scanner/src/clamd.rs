//! clamd client speaking the `INSTREAM` protocol over TCP.
//!
//! Wire format: `zINSTREAM\0`, then chunks each prefixed with their length
//! as a big-endian `u32`, then a zero-length chunk. clamd answers with one
//! NUL-terminated line.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use tenantry_core::RetryStrategy;

use crate::error::ScanError;
use crate::scanner::Scanner;
use crate::verdict::ScanVerdict;

const INSTREAM: &[u8] = b"zINSTREAM\0";
const PING: &[u8] = b"zPING\0";
const MAX_REPLY: usize = 4096;

/// Connection settings for [`ClamdScanner`].
#[derive(Debug, Clone)]
pub struct ClamdConfig {
    pub host: String,
    pub port: u16,
    /// Largest chunk written in one length-prefixed frame.
    pub chunk_size: usize,
    pub connect_timeout: Duration,
    /// How long to wait for the verdict after the terminating chunk.
    pub reply_timeout: Duration,
    /// Total connection attempts per scan, including the first.
    pub connect_attempts: u32,
    pub retry: RetryStrategy,
}

impl Default for ClamdConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 3310,
            chunk_size: 256 * 1024,
            connect_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(60),
            connect_attempts: 5,
            retry: RetryStrategy::default(),
        }
    }
}

impl ClamdConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    #[must_use]
    pub fn with_connect_attempts(mut self, attempts: u32, retry: RetryStrategy) -> Self {
        self.connect_attempts = attempts.max(1);
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }
}

/// Scanner backed by a clamd daemon.
#[derive(Debug, Clone)]
pub struct ClamdScanner {
    config: ClamdConfig,
}

impl ClamdScanner {
    pub fn new(config: ClamdConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClamdConfig {
        &self.config
    }

    async fn connect(&self) -> Result<TcpStream, ScanError> {
        let addr = (self.config.host.as_str(), self.config.port);
        let mut attempt = 0;
        loop {
            let last_error = match tokio::time::timeout(
                self.config.connect_timeout,
                TcpStream::connect(addr),
            )
            .await
            {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("connect timed out after {:?}", self.config.connect_timeout),
            };
            attempt += 1;
            if attempt >= self.config.connect_attempts {
                return Err(ScanError::Unavailable(format!(
                    "{}:{}: {last_error}",
                    self.config.host, self.config.port
                )));
            }
            let delay = self.config.retry.delay_for(attempt - 1);
            warn!(attempt, ?delay, error = %last_error, "clamd connect failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }

    async fn read_reply(&self, stream: &mut TcpStream) -> Result<String, ScanError> {
        let mut reply = Vec::with_capacity(64);
        tokio::time::timeout(self.config.reply_timeout, read_line(stream, &mut reply))
            .await
            .map_err(|_| ScanError::Timeout(self.config.reply_timeout))??;
        String::from_utf8(reply).map_err(|e| ScanError::Protocol(e.to_string()))
    }
}

/// Read up to the first NUL or newline, or EOF.
async fn read_line(stream: &mut TcpStream, reply: &mut Vec<u8>) -> Result<(), ScanError> {
    let mut buf = [0u8; 256];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        reply.extend_from_slice(&buf[..n]);
        if let Some(end) = reply.iter().position(|b| *b == 0 || *b == b'\n') {
            reply.truncate(end);
            return Ok(());
        }
        if reply.len() > MAX_REPLY {
            return Err(ScanError::Protocol("reply too long".into()));
        }
    }
}

impl Scanner for ClamdScanner {
    fn name(&self) -> &str {
        "clamd"
    }

    #[instrument(skip_all, fields(host = %self.config.host, port = self.config.port))]
    async fn scan(&self, mut chunks: mpsc::Receiver<Bytes>) -> Result<ScanVerdict, ScanError> {
        let mut stream = self.connect().await?;
        stream.write_all(INSTREAM).await?;
        let mut total = 0usize;
        while let Some(chunk) = chunks.recv().await {
            for frame in chunk.chunks(self.config.chunk_size) {
                let len = u32::try_from(frame.len())
                    .map_err(|_| ScanError::Protocol("chunk exceeds u32 length".into()))?;
                stream.write_all(&len.to_be_bytes()).await?;
                stream.write_all(frame).await?;
                total += frame.len();
            }
        }
        stream.write_all(&0u32.to_be_bytes()).await?;
        stream.flush().await?;
        debug!(bytes = total, "stream submitted, awaiting verdict");

        let reply = self.read_reply(&mut stream).await?;
        ScanVerdict::parse_clamd_reply(&reply)
    }

    async fn ping(&self) -> Result<(), ScanError> {
        let mut stream = self.connect().await?;
        stream.write_all(PING).await?;
        let reply = self.read_reply(&mut stream).await?;
        if reply.trim() == "PONG" {
            Ok(())
        } else {
            Err(ScanError::Protocol(format!("unexpected ping reply: {reply}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    /// Accepts one connection, records the decoded stream and answers `reply`.
    async fn fake_clamd(reply: &'static [u8]) -> (u16, tokio::task::JoinHandle<(Vec<u8>, Vec<usize>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut command = vec![0u8; INSTREAM.len()];
            socket.read_exact(&mut command).await.unwrap();
            assert_eq!(command, INSTREAM);
            let mut data = Vec::new();
            let mut frames = Vec::new();
            loop {
                let len = socket.read_u32().await.unwrap() as usize;
                if len == 0 {
                    break;
                }
                let mut frame = vec![0u8; len];
                socket.read_exact(&mut frame).await.unwrap();
                frames.push(len);
                data.extend_from_slice(&frame);
            }
            socket.write_all(reply).await.unwrap();
            (data, frames)
        });
        (port, handle)
    }

    fn scanner(port: u16) -> ClamdScanner {
        ClamdScanner::new(
            ClamdConfig::new("127.0.0.1", port)
                .with_chunk_size(4)
                .with_connect_attempts(
                    2,
                    RetryStrategy::Constant {
                        delay: Duration::from_millis(10),
                    },
                ),
        )
    }

    async fn send(data: &[&'static [u8]]) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(data.len().max(1));
        for chunk in data {
            tx.send(Bytes::from_static(chunk)).await.unwrap();
        }
        rx
    }

    #[tokio::test]
    async fn clean_stream_is_framed() {
        let (port, server) = fake_clamd(b"stream: OK\0").await;
        let verdict = Scanner::scan(&scanner(port), send(&[b"hello ", b"world"]).await)
            .await
            .unwrap();
        assert_eq!(verdict, ScanVerdict::clean());
        let (data, frames) = server.await.unwrap();
        assert_eq!(data, b"hello world");
        assert!(frames.iter().all(|len| *len <= 4));
    }

    #[tokio::test]
    async fn infected_reply() {
        let (port, server) = fake_clamd(b"stream: Eicar-Signature FOUND\0").await;
        let verdict = Scanner::scan(&scanner(port), send(&[b"X5O!P%@AP"]).await)
            .await
            .unwrap();
        assert_eq!(verdict, ScanVerdict::infected("Eicar-Signature"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn error_reply_is_protocol_error() {
        let (port, server) = fake_clamd(b"INSTREAM size limit exceeded. ERROR\0").await;
        let err = Scanner::scan(&scanner(port), send(&[b"abc"]).await)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Protocol(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_daemon_is_unavailable() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = Scanner::ping(&scanner(port)).await.unwrap_err();
        assert!(matches!(err, ScanError::Unavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn ping_pong() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut command = vec![0u8; PING.len()];
            socket.read_exact(&mut command).await.unwrap();
            assert_eq!(command, PING);
            socket.write_all(b"PONG\0").await.unwrap();
        });
        Scanner::ping(&scanner(port)).await.unwrap();
        server.await.unwrap();
    }
}

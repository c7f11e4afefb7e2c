//! Transports for the MCP server.
//!
//! The engine treats a transport as a byte-in/byte-out channel; framing is the
//! transport's concern. Two implementations ship with the crate:
//!
//! - [`LineTransport`]: newline-delimited frames over any async reader/writer.
//!   [`StdioTransport`] is the MCP stdio transport:
//!   - Messages are UTF-8 encoded JSON-RPC
//!   - Messages are delimited by newlines
//!   - Messages must not contain embedded newlines
//!   - stdin: receives messages from client
//!   - stdout: sends messages to client
//!   - stderr: may be used for logging (not MCP messages)
//! - [`MemoryTransport`]: an in-process channel pair, for embedding the server
//!   in another program and for tests.
//!
//! # Thread Safety
//!
//! Transports are shared between the receive loop and the tasks answering
//! requests, so every method takes `&self`. Reading and writing are guarded
//! by separate locks and may proceed concurrently.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};

use crate::error::TransportError;

/// A bidirectional message channel between the server and one client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Prepares the transport for traffic.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connection`] if the channel cannot be opened.
    async fn start(&self) -> Result<(), TransportError>;

    /// Sends one frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Send`] or [`TransportError::Closed`].
    async fn send(&self, message: &[u8]) -> Result<(), TransportError>;

    /// Receives the next frame, or `None` once the peer is gone.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Receive`] if reading fails.
    async fn receive(&self) -> Result<Option<Vec<u8>>, TransportError>;

    /// Stops the transport. Subsequent receives yield `None`.
    async fn stop(&self);
}

/// Newline-delimited transport over an async reader and writer.
pub struct LineTransport<R, W> {
    /// Buffered reader for incoming frames.
    reader: Mutex<BufReader<R>>,
    /// Writer for outgoing frames.
    writer: Mutex<W>,
    started: AtomicBool,
    stopped: AtomicBool,
}

/// The MCP stdio transport.
pub type StdioTransport = LineTransport<tokio::io::Stdin, tokio::io::Stdout>;

impl<R, W> LineTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Creates a transport reading from `reader` and writing to `writer`.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(writer),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Reads the next newline-terminated frame.
    ///
    /// Returns `None` if the reader is closed (EOF). The bytes are not
    /// checked for UTF-8; a malformed frame is the decoder's problem.
    async fn read_frame(&self) -> std::io::Result<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().await;
        let mut frame = Vec::new();
        let bytes_read = reader.read_until(b'\n', &mut frame).await?;

        if bytes_read == 0 {
            return Ok(None);
        }

        // Remove the trailing newline
        if frame.last() == Some(&b'\n') {
            frame.pop();
            if frame.last() == Some(&b'\r') {
                frame.pop();
            }
        }

        Ok(Some(frame))
    }

    /// Writes one frame with newline termination.
    async fn write_raw(&self, message: &[u8]) -> std::io::Result<()> {
        // MCP spec: messages must not contain embedded newlines
        debug_assert!(
            !message.contains(&b'\n'),
            "JSON message must not contain embedded newlines"
        );

        let mut writer = self.writer.lock().await;
        writer.write_all(message).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        Ok(())
    }
}

impl StdioTransport {
    /// Creates a transport over the process's stdin and stdout.
    #[must_use]
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::stdio()
    }
}

#[async_trait]
impl<R, W> Transport for LineTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn start(&self) -> Result<(), TransportError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::Connection {
                message: "transport has been stopped".to_string(),
                source: None,
            });
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: &[u8]) -> Result<(), TransportError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if !self.started.load(Ordering::SeqCst) {
            return Err(TransportError::NotStarted);
        }
        self.write_raw(message).await.map_err(TransportError::Send)
    }

    async fn receive(&self) -> Result<Option<Vec<u8>>, TransportError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(TransportError::NotStarted);
        }
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return Ok(None);
            }
            let Some(frame) = self.read_frame().await.map_err(TransportError::Receive)? else {
                return Ok(None);
            };
            if !frame.iter().all(u8::is_ascii_whitespace) {
                return Ok(Some(frame));
            }
        }
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.writer.lock().await.flush().await {
            tracing::debug!(error = %e, "Failed to flush transport on stop");
        }
    }
}

/// Server side of an in-process channel transport.
pub struct MemoryTransport {
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

/// Client side of an in-process channel transport.
pub struct MemoryClient {
    to_server: mpsc::UnboundedSender<Vec<u8>>,
    from_server: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryTransport {
    /// Creates a connected server transport and client handle.
    #[must_use]
    pub fn pair() -> (Self, MemoryClient) {
        let (to_server, inbound) = mpsc::unbounded_channel();
        let (outbound, from_server) = mpsc::unbounded_channel();
        let transport = Self {
            inbound: Mutex::new(inbound),
            outbound,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        };
        let client = MemoryClient {
            to_server,
            from_server,
        };
        (transport, client)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start(&self) -> Result<(), TransportError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::Connection {
                message: "transport has been stopped".to_string(),
                source: None,
            });
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: &[u8]) -> Result<(), TransportError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if !self.started.load(Ordering::SeqCst) {
            return Err(TransportError::NotStarted);
        }
        self.outbound
            .send(message.to_vec())
            .map_err(|_| TransportError::Closed)
    }

    async fn receive(&self) -> Result<Option<Vec<u8>>, TransportError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(TransportError::NotStarted);
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(self.inbound.lock().await.recv().await)
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

impl MemoryClient {
    /// Sends a raw frame to the server.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the server side is gone.
    pub fn send_raw(&self, message: impl Into<Vec<u8>>) -> Result<(), TransportError> {
        self.to_server
            .send(message.into())
            .map_err(|_| TransportError::Closed)
    }

    /// Sends a JSON value to the server.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the server side is gone.
    pub fn send(&self, message: &Value) -> Result<(), TransportError> {
        self.send_raw(message.to_string())
    }

    /// Receives the next raw frame from the server.
    pub async fn recv_raw(&mut self) -> Option<Vec<u8>> {
        self.from_server.recv().await
    }

    /// Receives the next frame from the server as JSON.
    ///
    /// Frames that are not valid JSON are skipped.
    pub async fn recv(&mut self) -> Option<Value> {
        while let Some(frame) = self.from_server.recv().await {
            match serde_json::from_slice(&frame) {
                Ok(value) => return Some(value),
                Err(e) => tracing::warn!(error = %e, "Skipping non-JSON frame"),
            }
        }
        None
    }

    /// Hangs up; the server's next receive yields `None`.
    pub fn close(self) {
        drop(self);
    }
}

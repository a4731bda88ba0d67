//! Control-connection I/O: stream wrapper, reply framing, command sending
//!
//! FTP replies are framed by scanning for CR, LF, or NUL terminators with
//! empty segments skipped, assembling multi-line replies (`NNN-` opener,
//! `NNN<SP>` terminator) into one [`FtpResponse`]. Reply accounting follows
//! the session counters: each non-1xx reply consumes one pending slot, and
//! replies owed to cancelled work or keepalives are silently discarded.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tracing::{debug, trace};

use super::FtpClient;
use crate::commands;
use crate::error::{FtpError, Result};
use crate::response::FtpResponse;

/// Hard cap on a single reply line; longer lines are truncated
pub(crate) const MAX_LINE_LEN: usize = 2000;

/// Timeout for one control-connection read
pub(crate) const REPLY_TIMEOUT: Duration = Duration::from_secs(60);

const RECV_CHUNK: usize = 4096;

/// A control or data stream, plain or TLS-wrapped
///
/// One enum serves both connections: the control stream upgrades in place
/// after `AUTH TLS`, and data connections are wrapped the same way when the
/// data channel is protected.
pub(crate) enum ControlStream {
    /// Plain TCP
    Plain(TcpStream),
    /// TLS over TCP; boxed since the TLS state is large
    Tls(Box<TlsStream<TcpStream>>),
    /// Stream was taken for a TLS upgrade or shut down
    Closed,
}

impl ControlStream {
    pub(crate) fn is_tls(&self) -> bool {
        matches!(self, ControlStream::Tls(_))
    }

    fn closed_error() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::NotConnected, "stream closed")
    }
}

impl AsyncRead for ControlStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ControlStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ControlStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            ControlStream::Closed => Poll::Ready(Err(Self::closed_error())),
        }
    }
}

impl AsyncWrite for ControlStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ControlStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ControlStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            ControlStream::Closed => Poll::Ready(Err(Self::closed_error())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ControlStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ControlStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            ControlStream::Closed => Poll::Ready(Err(Self::closed_error())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ControlStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ControlStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            ControlStream::Closed => Poll::Ready(Ok(())),
        }
    }
}

/// Incremental reply framer over the raw receive buffer
#[derive(Default)]
pub(crate) struct ReplyFramer {
    buffer: Vec<u8>,
    /// `"NNN "` terminator prefix while inside a multi-line reply
    multiline_prefix: Option<String>,
    multiline_lines: Vec<String>,
}

impl ReplyFramer {
    pub(crate) fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Extract the next complete line, if the buffer holds one
    ///
    /// Empty segments (from CRLF pairs or stray terminators) are skipped.
    /// Lines beyond [`MAX_LINE_LEN`] are truncated at the limit.
    pub(crate) fn take_line(&mut self, use_utf8: bool) -> Option<String> {
        loop {
            let pos = self
                .buffer
                .iter()
                .position(|&b| b == b'\r' || b == b'\n' || b == 0)?;
            let mut segment: Vec<u8> = self.buffer.drain(..=pos).collect();
            segment.pop();
            if segment.is_empty() {
                continue;
            }
            segment.truncate(MAX_LINE_LEN);
            return Some(decode_line(&segment, use_utf8));
        }
    }

    /// Keep an unterminated buffer from growing without bound
    pub(crate) fn clamp(&mut self) {
        if self.multiline_prefix.is_none() && self.buffer.len() > MAX_LINE_LEN {
            self.buffer.truncate(MAX_LINE_LEN);
        }
    }

    /// Feed one line into the multi-line state machine
    ///
    /// Returns a complete reply once the (single- or multi-line) response
    /// is finished.
    pub(crate) fn accept_line(&mut self, line: String) -> Option<FtpResponse> {
        if let Some(prefix) = &self.multiline_prefix {
            if line.starts_with(prefix.as_str()) {
                self.multiline_prefix = None;
                let lines = std::mem::take(&mut self.multiline_lines);
                return Some(response_from_line(line, lines));
            }
            self.multiline_lines.push(line);
            return None;
        }

        if line.len() < 3 {
            return None;
        }
        if line.len() > 3 && line.as_bytes()[3] == b'-' && parse_code(&line) != 0 {
            self.multiline_prefix = Some(format!("{} ", &line[..3]));
            self.multiline_lines.push(line);
            return None;
        }
        Some(response_from_line(line, Vec::new()))
    }
}

fn parse_code(line: &str) -> u16 {
    let bytes = line.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(|b| b.is_ascii_digit()) {
        return 0;
    }
    line[..3].parse().unwrap_or(0)
}

fn response_from_line(line: String, lines: Vec<String>) -> FtpResponse {
    let code = parse_code(&line);
    let text = if code == 0 {
        // Malformed reply: keep the whole line, the caller may want to
        // inspect it (SSH banner detection)
        line
    } else if line.len() > 4 {
        line[4..].to_string()
    } else {
        String::new()
    };
    FtpResponse { code, text, lines }
}

/// Decode received bytes per the negotiated charset
fn decode_line(bytes: &[u8], use_utf8: bool) -> String {
    if use_utf8 {
        String::from_utf8_lossy(bytes).into_owned()
    } else {
        bytes.iter().map(|&b| b as char).collect()
    }
}

/// Encode a command line per the negotiated charset
///
/// Latin-1 mode can only carry characters up to U+00FF; anything else is an
/// encoding error rather than silent mojibake.
pub(crate) fn encode_command(text: &str, use_utf8: bool) -> Result<Vec<u8>> {
    if use_utf8 {
        return Ok(text.as_bytes().to_vec());
    }
    let mut out = Vec::with_capacity(text.len());
    for c in text.chars() {
        let code = c as u32;
        if code > 0xFF {
            return Err(FtpError::Encoding);
        }
        out.push(code as u8);
    }
    Ok(out)
}

impl FtpClient {
    /// Send one command line
    ///
    /// Appends CRLF, encodes per the session charset, and counts the
    /// expected reply. With `mask` only the verb appears in the transcript.
    pub(crate) async fn send_command(&mut self, command: &str, mask: bool) -> Result<()> {
        if mask {
            debug!(command = %commands::mask_arguments(command), "> (arguments hidden)");
        } else {
            debug!(command = %command, ">");
        }

        let mut wire = encode_command(command, self.state.use_utf8)?;
        wire.extend_from_slice(b"\r\n");

        self.stream.write_all(&wire).await?;
        self.stream.flush().await?;
        self.state.pending_replies += 1;
        Ok(())
    }

    /// Read the next framed reply without touching the session counters
    pub(crate) async fn read_raw_reply(&mut self) -> Result<FtpResponse> {
        loop {
            while let Some(line) = self.framer.take_line(self.state.use_utf8) {
                trace!(line = %line, "<");
                if let Some(reply) = self.framer.accept_line(line) {
                    return Ok(reply);
                }
            }
            self.framer.clamp();

            let mut buf = [0u8; RECV_CHUNK];
            let n = timeout(REPLY_TIMEOUT, self.stream.read(&mut buf))
                .await
                .map_err(|_| FtpError::Timeout)??;
            if n == 0 {
                return Err(FtpError::ConnectionClosed);
            }
            self.framer.extend(&buf[..n]);
        }
    }

    /// Read the next reply belonging to the running operation
    ///
    /// Final replies owed to cancelled work or keepalives are consumed and
    /// discarded here; intermediate 1xx replies pass through untouched.
    /// Cancellation interrupts the wait.
    pub(crate) async fn read_reply(&mut self) -> Result<FtpResponse> {
        let cancel = self.cancel.clone();
        loop {
            let reply = tokio::select! {
                _ = cancel.cancelled() => return Err(FtpError::Cancelled),
                reply = self.read_raw_reply() => reply?,
            };

            if reply.is_intermediate() {
                if self.state.replies_to_skip > 0 {
                    trace!("Discarding intermediate reply of a skipped command");
                    continue;
                }
                return Ok(reply);
            }

            if self.state.note_final_reply() {
                return Ok(reply);
            }
            debug!("Skipping reply after cancelled operation or keepalive command");
        }
    }

    /// Consume every reply the skip counter still owes
    ///
    /// Runs before the next command goes out, so a queued operation starts
    /// on a quiet wire.
    pub(crate) async fn drain_skipped_replies(&mut self) -> Result<()> {
        while self.state.replies_to_skip > 0 {
            let reply = self.read_raw_reply().await?;
            if !reply.is_intermediate() {
                self.state.note_final_reply();
                debug!("Skipping reply after cancelled operation or keepalive command");
            }
        }
        Ok(())
    }

    /// Read replies until a final (non-1xx) one arrives
    pub(crate) async fn read_final_reply(&mut self) -> Result<FtpResponse> {
        loop {
            let reply = self.read_reply().await?;
            if !reply.is_intermediate() {
                return Ok(reply);
            }
        }
    }

    /// Send a command and wait for its final reply, skipping intermediates
    pub(crate) async fn exchange(&mut self, command: &str, mask: bool) -> Result<FtpResponse> {
        self.send_command(command, mask).await?;
        self.read_final_reply().await
    }
}

//! Half-duplex request/response over one transport.
//!
//! One request is outstanding at a time. A request that carries bulk data is
//! answered first by a transfer ACK, then the bulk bytes go out, then the
//! device sends the reply frame.

use std::io::{self, ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use tracing::{debug, error, trace, warn};

use crate::cancel::CancelToken;
use crate::config::LinkConfig;
use crate::error::{LinkError, Result};
use crate::frame::{self, Direction, Frame, FrameHeader, HEADER_LEN};
use crate::proto::command::Command;
use crate::proto::message::{self, Request, Response};
use crate::proto::status::{self, Outcome};
use crate::transport::Transport;

pub struct Dispatcher<T: Transport> {
    io: T,
    config: LinkConfig,
    cancel: CancelToken,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(io: T, config: LinkConfig) -> Self {
        Self {
            io,
            config,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn transport(&self) -> &T {
        &self.io
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.io
    }

    pub fn into_inner(self) -> T {
        self.io
    }

    /// Sends one request and returns its correlated reply.
    pub fn execute(&mut self, request: &Request<'_>) -> Result<Response> {
        let command = request.command;
        self.send_frame(request)?;

        if let Some(bulk) = request.bulk {
            let ack = self.read_frame(command)?;
            if !ack.is_ack() {
                error!(sent = %command, got = ack.code, "expected transfer ack");
                return Err(LinkError::UnexpectedResponse {
                    sent: command,
                    got: ack.code,
                });
            }
            // A non-zero ack parameter is a NACK carrying the status.
            self.check_status(command, ack.param1)?;
            self.write_bulk(bulk)?;
        }

        let reply = self.read_frame(command)?;
        self.correlate(request, reply)
    }

    /// `execute` with the bounded resend policy for transient failures.
    pub fn execute_with_retry(&mut self, request: &Request<'_>) -> Result<Response> {
        let attempts = self.config.retry.attempts();
        let mut attempt = 1;
        loop {
            match self.execute(request) {
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(command = %request.command, attempt, attempts, "{e}, resending");
                    if let Some(backoff) = self.config.retry.backoff {
                        std::thread::sleep(backoff);
                    }
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    error!(command = %request.command, attempts, "retry budget exhausted: {e}");
                    return Err(e);
                }
                other => return other,
            }
        }
    }

    /// Reads `len` raw bytes that follow a reply.
    pub fn read_bulk(&mut self, len: usize) -> Result<Vec<u8>> {
        let capacity = self.config.max_result_len;
        if len > capacity {
            return Err(LinkError::ResultTooLarge { len, capacity });
        }
        let mut buf = vec![0u8; len];
        let filled = self.fill(&mut buf)?;
        if filled < len {
            return Err(timed_out(format!("bulk read stalled at {filled}/{len} bytes")));
        }
        trace!(len, "bulk in");
        Ok(buf)
    }

    /// Asks the device to push `len` result bytes and reads them.
    pub fn pull(&mut self, addr: u32, len: usize) -> Result<Vec<u8>> {
        let capacity = self.config.max_result_len;
        if len > capacity {
            return Err(LinkError::ResultTooLarge { len, capacity });
        }
        self.send_frame(&message::data_pull(addr, len as u32))?;
        self.read_bulk(len)
    }

    fn send_frame(&mut self, request: &Request<'_>) -> Result<()> {
        if self.cancel.is_forced() {
            return Err(LinkError::Cancelled);
        }
        let bytes = Frame::command(
            request.command,
            request.param1,
            request.param2,
            request.data.clone(),
        )
        .with_crc(self.config.crc)
        .encode()?;
        debug!(
            command = %request.command,
            p1 = request.param1,
            p2 = request.param2,
            data = request.data.len(),
            bulk = request.bulk.map_or(0, <[u8]>::len),
            "send"
        );
        self.io.write_all(&bytes)?;
        self.io.flush()?;
        Ok(())
    }

    fn write_bulk(&mut self, bulk: &[u8]) -> Result<()> {
        for chunk in bulk.chunks(self.config.bulk_chunk.max(1)) {
            if self.cancel.is_forced() {
                return Err(LinkError::Cancelled);
            }
            self.io.write_all(chunk)?;
        }
        self.io.flush()?;
        trace!(len = bulk.len(), "bulk out");
        Ok(())
    }

    /// Reads one whole frame. No bytes at all before the reply deadline means
    /// the device is busy.
    fn read_frame(&mut self, command: Command) -> Result<Frame> {
        let mut header = [0u8; HEADER_LEN];
        match self.fill(&mut header)? {
            0 => {
                let ms = self.config.response_timeout.map_or(0, |d| d.as_millis());
                return Err(LinkError::busy(command, format!("no reply within {ms}ms")));
            }
            n if n < HEADER_LEN => {
                return Err(timed_out(format!("reply header stalled at {n} bytes")));
            }
            _ => {}
        }
        // A bad sentinel stops here; the rest is not interpreted.
        let parsed = FrameHeader::parse(&header).inspect_err(|e| {
            error!(sent = %command, "undecodable reply header: {e}");
        })?;

        let mut bytes = vec![0u8; parsed.frame_len()];
        bytes[..HEADER_LEN].copy_from_slice(&header);
        let filled = self.fill(&mut bytes[HEADER_LEN..])?;
        if HEADER_LEN + filled < bytes.len() {
            return Err(timed_out(format!(
                "reply body stalled at {}/{} bytes",
                HEADER_LEN + filled,
                bytes.len()
            )));
        }
        let frame = frame::decode(&bytes)?;
        trace!(code = frame.code, p1 = frame.param1, p2 = frame.param2, "recv");
        Ok(frame)
    }

    fn correlate(&self, request: &Request<'_>, reply: Frame) -> Result<Response> {
        let command = request.command;
        if reply.direction != Direction::Response || reply.opcode() != command.code() {
            error!(sent = %command, got = reply.code, "reply does not match request");
            return Err(LinkError::UnexpectedResponse {
                sent: command,
                got: reply.code,
            });
        }
        if request.reply_has_status() {
            self.check_status(command, reply.param1)?;
        }
        Ok(Response {
            command,
            status_or_param1: reply.param1,
            param2: reply.param2,
            data: reply.data,
        })
    }

    fn check_status(&self, command: Command, code: u32) -> Result<()> {
        match status::classify(code, &self.config.retry.transient_codes) {
            Outcome::Ok => Ok(()),
            Outcome::Transient => Err(LinkError::busy(command, format!("status {code}"))),
            Outcome::Rejected => {
                warn!(%command, code, "{}", status::describe(code));
                Err(LinkError::rejected(command, code))
            }
        }
    }

    /// Fills `buf` until full, the transport goes idle past the reply
    /// deadline, or a forced stop. Returns the number of bytes filled.
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let idle_limit = self.config.response_timeout;
        let mut last_progress = Instant::now();
        let mut filled = 0;
        while filled < buf.len() {
            match self.io.read(&mut buf[filled..]) {
                Ok(0) => return Err(io::Error::from(ErrorKind::UnexpectedEof).into()),
                Ok(n) => {
                    filled += n;
                    last_progress = Instant::now();
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) =>
                {
                    if self.cancel.is_forced() {
                        return Err(LinkError::Cancelled);
                    }
                    if idle_limit.is_some_and(|d| last_progress.elapsed() >= d) {
                        break;
                    }
                    if e.kind() == ErrorKind::WouldBlock {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }
}

fn timed_out(msg: String) -> LinkError {
    io::Error::new(ErrorKind::TimedOut, msg).into()
}

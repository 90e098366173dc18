use super::Selectable;
use mio::event::Source;
use mio::unix::pipe;
use std::io::{self, ErrorKind, Read};
use std::sync::mpsc::Sender;
use tracing::{info, warn};

const CHUNK_SIZE: usize = 1024;
/// Output without newlines is logged in pieces of this size.
const MAX_LINE_LENGTH: usize = 4096;

/// Drains a pipe, logging each complete line under the stream's name.
///
/// Lines can also be forwarded to a channel for callers that need to react to the
/// output (e.g. waiting for a start marker). End of stream closes the logger, so
/// the multiplexer drops it on the same cycle.
pub struct StreamLogger {
    name: String,
    receiver: Option<pipe::Receiver>,
    buffer: Vec<u8>,
    sink: Option<Sender<String>>,
}

impl StreamLogger {
    pub fn new(name: impl Into<String>, receiver: pipe::Receiver) -> Self {
        Self {
            name: name.into(),
            receiver: Some(receiver),
            buffer: Vec::new(),
            sink: None,
        }
    }

    /// Wraps a child's stdout or stderr, switching it to non-blocking mode.
    pub fn from_pipe(
        name: impl Into<String>,
        stream: impl Into<pipe::Receiver>,
    ) -> io::Result<Self> {
        let receiver = stream.into();
        receiver.set_nonblocking(true)?;
        Ok(Self::new(name, receiver))
    }

    pub fn with_sink(mut self, sink: Sender<String>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn push(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if b == b'\n' {
                self.flush_line();
                continue;
            }
            self.buffer.push(b);
            if self.buffer.len() >= MAX_LINE_LENGTH {
                self.flush_line();
            }
        }
    }

    fn flush_line(&mut self) {
        let line = String::from_utf8_lossy(&self.buffer).trim_end().to_string();
        self.buffer.clear();
        info!("{}: {line}", self.name);
        let delivered = self.sink.as_ref().map(|sink| sink.send(line).is_ok());
        if delivered == Some(false) {
            self.sink = None;
        }
    }
}

impl Selectable for StreamLogger {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&mut self) -> Option<&mut dyn Source> {
        self.receiver.as_mut().map(|r| r as &mut dyn Source)
    }

    fn read(&mut self) {
        let mut chunk = [0u8; CHUNK_SIZE];
        loop {
            let Some(receiver) = self.receiver.as_mut() else {
                return;
            };
            match receiver.read(&mut chunk) {
                Ok(0) => {
                    self.close();
                    return;
                }
                Ok(n) => self.push(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("{}: read failure: {e}", self.name);
                    self.close();
                    return;
                }
            }
        }
    }

    fn close(&mut self) {
        if self.receiver.take().is_some() && !self.buffer.is_empty() {
            self.flush_line();
        }
    }

    fn is_closed(&self) -> bool {
        self.receiver.is_none()
    }
}

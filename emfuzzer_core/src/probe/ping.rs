use super::subprocess::{self, Subprocess};
use super::{FinishConfig, Probe, ProbeResult};
use crate::io::{Multiplexer, ResourceId};
use mio::unix::pipe;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, ErrorKind, Read};
use std::process::{Child, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const STDOUT: Token = Token(0);

/// Sends `count` pings and expects a reply to every one of them.
pub struct PingIsStable {
    inner: Subprocess,
}

impl PingIsStable {
    pub fn new(
        name: impl Into<String>,
        host: &str,
        count: u32,
        interval_s: u32,
        mux: Arc<Multiplexer>,
    ) -> Self {
        let deadline_s = (u64::from(count) + 1) * u64::from(interval_s);
        let args = vec![
            "ping".to_string(),
            "-c".to_string(),
            count.to_string(),
            "-i".to_string(),
            interval_s.to_string(),
            "-w".to_string(),
            deadline_s.to_string(),
            host.to_string(),
        ];
        let finish = FinishConfig::new(Duration::from_secs(deadline_s), None);
        Self {
            inner: Subprocess::new(name, args, false, finish, mux),
        }
    }
}

impl Probe for PingIsStable {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn start(&mut self) -> bool {
        self.inner.start()
    }

    fn finish(&mut self) -> ProbeResult {
        self.inner.finish()
    }
}

/// Flood-pings the host and succeeds on the first reply seen within the timeout.
pub struct PingIsAlive {
    name: String,
    args: Vec<String>,
    timeout: Duration,
    mux: Arc<Multiplexer>,
    running: Option<Running>,
}

struct Running {
    child: Child,
    stdout: pipe::Receiver,
    stderr: ResourceId,
}

impl PingIsAlive {
    pub fn new(
        name: impl Into<String>,
        host: &str,
        interval_s: u32,
        timeout: Duration,
        mux: Arc<Multiplexer>,
    ) -> Self {
        Self {
            name: name.into(),
            args: vec![
                "ping".to_string(),
                "-f".to_string(),
                "-i".to_string(),
                interval_s.to_string(),
                host.to_string(),
            ],
            timeout,
            mux,
            running: None,
        }
    }

    fn spawn(&self) -> io::Result<Running> {
        let mut child = subprocess::build_command(&self.args, false)?
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("STDOUT is not piped"))
            .map(pipe::Receiver::from)
            .and_then(|receiver| receiver.set_nonblocking(true).map(|()| receiver));
        let stdout = match stdout {
            Ok(stdout) => stdout,
            Err(e) => {
                subprocess::terminate(&self.name, &mut child);
                return Err(e);
            }
        };
        let stderr =
            match subprocess::attach_output(&self.mux, &self.name, "STDERR", child.stderr.take()) {
                Ok(id) => id,
                Err(e) => {
                    subprocess::terminate(&self.name, &mut child);
                    return Err(e);
                }
            };
        Ok(Running {
            child,
            stdout,
            stderr,
        })
    }

    fn watch(&self, stdout: &mut pipe::Receiver) -> ProbeResult {
        let mut poll = match Poll::new() {
            Ok(poll) => poll,
            Err(e) => {
                error!("<{}>: Operation error: {e}", self.name);
                return ProbeResult::Error;
            }
        };
        if let Err(e) = poll.registry().register(stdout, STDOUT, Interest::READABLE) {
            error!("<{}>: Operation error: {e}", self.name);
            return ProbeResult::Error;
        }

        let mut scanner = PingScanner::new(&self.name);
        let mut events = Events::with_capacity(4);
        let mut chunk = [0u8; 256];
        let deadline = subprocess::deadline_after(self.timeout);

        // Bytes may already be buffered before the first wait.
        loop {
            match drain(stdout, &mut chunk, &mut scanner) {
                Drained::Alive => return ProbeResult::Success,
                Drained::Pending => {}
                Drained::Closed => {
                    warn!("<{}>: Ping output closed before a reply", self.name);
                    return ProbeResult::Failure;
                }
                Drained::Failed(e) => {
                    warn!("<{}>: Read failure: {e}", self.name);
                    return ProbeResult::Failure;
                }
            }

            let left = subprocess::remaining(deadline);
            if left.is_some_and(|left| left.is_zero()) {
                warn!("<{}>: Ping timeout!", self.name);
                return ProbeResult::Timeout;
            }
            if let Err(e) = poll.poll(&mut events, left) {
                if e.kind() != ErrorKind::Interrupted {
                    warn!("<{}>: Read failure: {e}", self.name);
                    return ProbeResult::Failure;
                }
            }
        }
    }
}

impl Probe for PingIsAlive {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> bool {
        info!("<{}>: Starting ping alive check", self.name);
        match self.spawn() {
            Ok(running) => {
                self.running = Some(running);
                true
            }
            Err(e) => {
                error!("<{}>: Operation error: {e}", self.name);
                false
            }
        }
    }

    fn finish(&mut self) -> ProbeResult {
        let Some(mut running) = self.running.take() else {
            error!("<{}>: Finish requested without a running process", self.name);
            return ProbeResult::Error;
        };

        let result = self.watch(&mut running.stdout);

        subprocess::terminate(&self.name, &mut running.child);
        self.mux.close(running.stderr);
        result
    }
}

impl Drop for PingIsAlive {
    fn drop(&mut self) {
        if let Some(mut running) = self.running.take() {
            subprocess::terminate(&self.name, &mut running.child);
        }
    }
}

enum Drained {
    Alive,
    Pending,
    Closed,
    Failed(io::Error),
}

fn drain(stdout: &mut pipe::Receiver, chunk: &mut [u8], scanner: &mut PingScanner) -> Drained {
    loop {
        match stdout.read(chunk) {
            Ok(0) => return Drained::Closed,
            Ok(n) => {
                if chunk[..n].iter().any(|&b| scanner.feed(b)) {
                    return Drained::Alive;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Drained::Pending,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Drained::Failed(e),
        }
    }
}

/// Reads flood-ping progress output: a header line, then `.` per request sent,
/// a backspace per reply and `E` per error reply.
struct PingScanner<'a> {
    name: &'a str,
    header: Vec<u8>,
    header_done: bool,
    response_received: bool,
}

impl<'a> PingScanner<'a> {
    fn new(name: &'a str) -> Self {
        Self {
            name,
            header: Vec::new(),
            header_done: false,
            response_received: false,
        }
    }

    /// Returns `true` once a request is seen after a reply.
    fn feed(&mut self, byte: u8) -> bool {
        if !self.header_done {
            if byte == b'\n' {
                info!("<{}>: {}", self.name, String::from_utf8_lossy(&self.header));
                self.header_done = true;
            } else {
                self.header.push(byte);
            }
            return false;
        }

        match byte {
            b'\x08' => {
                if !self.response_received {
                    info!("<{}>: Response received", self.name);
                }
                self.response_received = true;
            }
            b'.' => {
                if self.response_received {
                    info!("<{}>: Ping received", self.name);
                    return true;
                }
                info!("<{}>: Ping", self.name);
            }
            b'E' => {
                warn!("<{}>: error response", self.name);
                self.response_received = false;
            }
            _ => {}
        }
        false
    }
}

use super::{FinishConfig, Probe, ProbeResult};
use crate::io::{Multiplexer, ResourceId, StreamLogger};
use mio::unix::pipe;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::io;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long a terminated process is given to exit before it is left to the OS.
const TERMINATE_GRACE: Duration = Duration::from_millis(200);

/// Runs a command between `start` and `finish`, draining its output through the
/// shared [`Multiplexer`].
pub struct Subprocess {
    name: String,
    args: Vec<String>,
    shell: bool,
    finish: FinishConfig,
    mux: Arc<Multiplexer>,
    running: Option<Running>,
}

struct Running {
    child: Child,
    streams: Vec<ResourceId>,
}

impl Subprocess {
    pub fn new(
        name: impl Into<String>,
        args: Vec<String>,
        shell: bool,
        finish: FinishConfig,
        mux: Arc<Multiplexer>,
    ) -> Self {
        Self {
            name: name.into(),
            args,
            shell,
            finish,
            mux,
            running: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn args(&self) -> &[String] {
        &self.args
    }

    #[cfg(test)]
    pub(crate) fn finish_config(&self) -> &FinishConfig {
        &self.finish
    }

    fn spawn(&self) -> io::Result<Running> {
        let mut child = build_command(&self.args, self.shell)?
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut streams = Vec::with_capacity(2);
        let attached = attach_output(&self.mux, &self.name, "STDOUT", child.stdout.take())
            .and_then(|id| {
                streams.push(id);
                attach_output(&self.mux, &self.name, "STDERR", child.stderr.take())
            })
            .map(|id| streams.push(id));

        if let Err(e) = attached {
            terminate(&self.name, &mut child);
            for id in streams {
                self.mux.close(id);
            }
            return Err(e);
        }
        Ok(Running { child, streams })
    }

    fn finish_process(&self, child: &mut Child) -> ProbeResult {
        if let Some(signal) = self.finish.signal {
            info!("<{}>: Sending signal {}", self.name, signal.as_str());
            if let Err(e) = send_signal(child, signal) {
                error!("<{}>: Operation error: {e}", self.name);
                return ProbeResult::Error;
            }
        }

        match wait_timeout(child, self.finish.timeout) {
            Ok(Some(status)) => classify_exit(&self.name, status),
            Ok(None) => {
                warn!("<{}>: Operation timeout", self.name);
                ProbeResult::Timeout
            }
            Err(e) => {
                error!("<{}>: Operation error: {e}", self.name);
                ProbeResult::Error
            }
        }
    }
}

impl Probe for Subprocess {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> bool {
        info!("<{}>: Starting {:?}", self.name, self.args);
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

        let result = self.finish_process(&mut running.child);

        terminate(&self.name, &mut running.child);
        for id in running.streams {
            self.mux.close(id);
        }
        result
    }
}

impl Drop for Subprocess {
    fn drop(&mut self) {
        if let Some(mut running) = self.running.take() {
            terminate(&self.name, &mut running.child);
        }
    }
}

/// `shell` runs the first argument as a `sh -c` script, the rest become its
/// positional parameters.
pub(crate) fn build_command(args: &[String], shell: bool) -> io::Result<Command> {
    let Some((program, rest)) = args.split_first() else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command"));
    };
    let command = if shell {
        let mut command = Command::new("sh");
        command.arg("-c").arg(program).args(rest);
        command
    } else {
        let mut command = Command::new(program);
        command.args(rest);
        command
    };
    Ok(command)
}

/// Registers a child's output pipe with the multiplexer as `<name> - LABEL`.
pub(crate) fn attach_output(
    mux: &Multiplexer,
    name: &str,
    label: &str,
    stream: Option<impl Into<pipe::Receiver>>,
) -> io::Result<ResourceId> {
    let stream = stream.ok_or_else(|| io::Error::other(format!("{label} is not piped")))?;
    let logger = StreamLogger::from_pipe(format!("<{name}> - {label}"), stream)?;
    Ok(mux.register(Box::new(logger)))
}

pub(crate) fn send_signal(child: &Child, signal: Signal) -> io::Result<()> {
    let pid = i32::try_from(child.id()).map_err(io::Error::other)?;
    kill(Pid::from_raw(pid), signal).map_err(io::Error::from)
}

/// Polls `child` until it exits or `timeout` elapses. `Ok(None)` means it is still
/// running.
pub(crate) fn wait_timeout(
    child: &mut Child,
    timeout: Duration,
) -> io::Result<Option<ExitStatus>> {
    let deadline = deadline_after(timeout);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        match remaining(deadline) {
            Some(left) if left.is_zero() => return Ok(None),
            Some(left) => thread::sleep(POLL_INTERVAL.min(left)),
            None => thread::sleep(POLL_INTERVAL),
        }
    }
}

/// `None` when `timeout` reaches past what [`Instant`] can represent, i.e. no
/// deadline at all.
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

/// Time left until `deadline`; `None` for an unbounded wait.
pub(crate) fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
}

/// Sends `SIGTERM` unless the process already exited, then gives it a short grace
/// period to be reaped.
pub(crate) fn terminate(name: &str, child: &mut Child) {
    match child.try_wait() {
        Ok(Some(_)) => return,
        Ok(None) => {}
        Err(e) => {
            warn!("<{name}>: Failed to query process state: {e}");
            return;
        }
    }
    if let Err(e) = send_signal(child, Signal::SIGTERM) {
        warn!("<{name}>: Failed to terminate process: {e}");
        return;
    }
    match wait_timeout(child, TERMINATE_GRACE) {
        Ok(Some(_)) => {}
        Ok(None) => warn!("<{name}>: Process did not exit after SIGTERM"),
        Err(e) => warn!("<{name}>: Failed to reap process: {e}"),
    }
}

fn classify_exit(name: &str, status: ExitStatus) -> ProbeResult {
    if status.success() {
        info!("<{name}>: Operation finished successfully");
        ProbeResult::Success
    } else {
        warn!("<{name}>: Operation returned {status}");
        ProbeResult::Failure
    }
}

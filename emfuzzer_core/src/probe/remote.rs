use super::subprocess;
use super::{Probe, ProbeResult};
use crate::io::{Multiplexer, ResourceId, StreamLogger};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::process::{Child, Stdio};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Bound on the separate `ssh ... kill` round trip.
const SIGNAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum InvokerError {
    #[error("Failed to run ssh client: {0}")]
    Io(#[from] io::Error),
    #[error("Remote command is not running")]
    NotOpen,
    #[error("Remote process id was not reported")]
    MissingPid,
    #[error("Start of the remote command was already awaited")]
    StartAwaited,
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Delivering {signal} failed with {status}")]
    SignalRejected { signal: &'static str, status: String },
    #[error("Remote command ended without an exit status")]
    NoExitStatus,
}

/// Runs one command on a remote host and controls its lifetime.
pub trait Invoker: Send {
    fn open(&mut self) -> Result<(), InvokerError>;

    /// `Ok(false)` when the start marker was not seen in time.
    fn wait_for_start(&mut self, timeout: Duration) -> Result<bool, InvokerError>;

    fn signal(&mut self, signal: Signal) -> Result<(), InvokerError>;

    /// Returns the remote exit status.
    fn wait_for_exit(&mut self, timeout: Duration) -> Result<i32, InvokerError>;

    fn close(&mut self);
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SshConnection {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

fn default_ssh_port() -> u16 {
    22
}

/// [`Invoker`] over the system `ssh` client in batch mode.
///
/// The remote command is wrapped as `echo $$; exec <command>` so the first output
/// line carries the remote PID, which `signal` targets with a second connection.
pub struct SshInvoker {
    name: String,
    command: String,
    start_key: String,
    connection: SshConnection,
    client: Vec<String>,
    mux: Arc<Multiplexer>,
    session: Option<Session>,
}

struct Session {
    child: Child,
    /// Output lines until the start has been awaited; dropped afterwards so the
    /// logger stops forwarding.
    lines: Option<Receiver<String>>,
    streams: Vec<ResourceId>,
    remote_pid: Option<i32>,
}

impl SshInvoker {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        start_key: impl Into<String>,
        connection: SshConnection,
        mux: Arc<Multiplexer>,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            start_key: start_key.into(),
            connection,
            client: vec!["ssh".to_string()],
            mux,
            session: None,
        }
    }

    fn client_args(&self, remote: &str) -> Vec<String> {
        let mut args = self.client.clone();
        args.extend(ssh_args(&self.connection, remote));
        args
    }

    fn session(&mut self) -> Result<&mut Session, InvokerError> {
        self.session.as_mut().ok_or(InvokerError::NotOpen)
    }
}

impl Invoker for SshInvoker {
    fn open(&mut self) -> Result<(), InvokerError> {
        self.close();

        let remote = format!("echo $$; exec {}", self.command);
        info!(
            "<{}>: Invoking '{}' on {}",
            self.name, self.command, self.connection.host
        );
        let mut child = subprocess::build_command(&self.client_args(&remote), false)?
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let (sink, lines) = mpsc::channel();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("STDOUT is not piped"))
            .and_then(|stdout| {
                StreamLogger::from_pipe(format!("<{}> - STDOUT", self.name), stdout)
            });
        let stdout = match stdout {
            Ok(logger) => self.mux.register(Box::new(logger.with_sink(sink))),
            Err(e) => {
                subprocess::terminate(&self.name, &mut child);
                return Err(e.into());
            }
        };
        let mut streams = vec![stdout];
        match subprocess::attach_output(&self.mux, &self.name, "STDERR", child.stderr.take()) {
            Ok(id) => streams.push(id),
            Err(e) => warn!("<{}>: STDERR will not be logged: {e}", self.name),
        }

        self.session = Some(Session {
            child,
            lines: Some(lines),
            streams,
            remote_pid: None,
        });
        Ok(())
    }

    fn wait_for_start(&mut self, timeout: Duration) -> Result<bool, InvokerError> {
        let name = self.name.clone();
        let start_key = self.start_key.clone();
        let session = self.session()?;
        let lines = session.lines.take().ok_or(InvokerError::StartAwaited)?;
        let deadline = subprocess::deadline_after(timeout);

        loop {
            let received = match subprocess::remaining(deadline) {
                Some(left) => lines.recv_timeout(left),
                None => lines.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            let line = match received {
                Ok(line) => line,
                Err(RecvTimeoutError::Timeout) => {
                    warn!("<{name}>: '{start_key}' not seen within {timeout:?}");
                    return Ok(false);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("<{name}>: Remote command ended before start");
                    return Ok(false);
                }
            };

            if session.remote_pid.is_none() {
                match line.trim().parse::<i32>() {
                    Ok(pid) => {
                        info!("<{name}>: Remote process id {pid}");
                        session.remote_pid = Some(pid);
                        if start_key.is_empty() {
                            return Ok(true);
                        }
                        continue;
                    }
                    Err(_) => return Err(InvokerError::MissingPid),
                }
            }
            if line.contains(&start_key) {
                info!("<{name}>: Remote command started");
                return Ok(true);
            }
        }
    }

    fn signal(&mut self, signal: Signal) -> Result<(), InvokerError> {
        let pid = self.session()?.remote_pid.ok_or(InvokerError::MissingPid)?;
        let signal_name = signal.as_str();
        info!("<{}>: Sending signal {signal_name} to remote {pid}", self.name);

        let remote = format!("kill -{} {pid}", signal_name.trim_start_matches("SIG"));
        let mut kill = subprocess::build_command(&self.client_args(&remote), false)?
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        match subprocess::wait_timeout(&mut kill, SIGNAL_TIMEOUT)? {
            Some(status) if status.success() => Ok(()),
            Some(status) => Err(InvokerError::SignalRejected {
                signal: signal_name,
                status: status.to_string(),
            }),
            None => {
                subprocess::terminate(&self.name, &mut kill);
                Err(InvokerError::Timeout(SIGNAL_TIMEOUT))
            }
        }
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> Result<i32, InvokerError> {
        let session = self.session()?;
        match subprocess::wait_timeout(&mut session.child, timeout)? {
            Some(status) => status.code().ok_or(InvokerError::NoExitStatus),
            None => Err(InvokerError::Timeout(timeout)),
        }
    }

    fn close(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        subprocess::terminate(&self.name, &mut session.child);
        for id in session.streams {
            self.mux.close(id);
        }
    }
}

impl Drop for SshInvoker {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) fn ssh_args(connection: &SshConnection, remote: &str) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-p".to_string(),
        connection.port.to_string(),
    ];
    if let Some(identity) = &connection.identity_file {
        args.push("-i".to_string());
        args.push(identity.display().to_string());
    }
    args.push(format!("{}@{}", connection.username, connection.host));
    args.push(remote.to_string());
    args
}

/// Monitor that keeps a remote command running for the duration of a case.
pub struct RemoteMonitor {
    name: String,
    invoker: Box<dyn Invoker>,
    start_timeout: Duration,
    finish_timeout: Duration,
}

impl RemoteMonitor {
    pub fn new(
        name: impl Into<String>,
        invoker: Box<dyn Invoker>,
        start_timeout: Duration,
        finish_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            invoker,
            start_timeout,
            finish_timeout,
        }
    }
}

impl Probe for RemoteMonitor {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> bool {
        let started = self
            .invoker
            .open()
            .and_then(|()| self.invoker.wait_for_start(self.start_timeout));
        match started {
            Ok(true) => true,
            Ok(false) => {
                self.invoker.close();
                false
            }
            Err(e) => {
                error!("Failed to start monitoring <{}>: {e}", self.name);
                self.invoker.close();
                false
            }
        }
    }

    fn finish(&mut self) -> ProbeResult {
        let exited = self
            .invoker
            .signal(Signal::SIGINT)
            .and_then(|()| self.invoker.wait_for_exit(self.finish_timeout));
        self.invoker.close();

        match exited {
            Ok(0) => ProbeResult::Success,
            Ok(code) => {
                warn!("<{}>: Remote command returned {code}", self.name);
                ProbeResult::Failure
            }
            Err(InvokerError::Timeout(after)) => {
                warn!("<{}>: Remote command did not exit within {after:?}", self.name);
                ProbeResult::Timeout
            }
            Err(e) => {
                error!("Failed to finish monitoring <{}>: {e}", self.name);
                ProbeResult::Error
            }
        }
    }
}

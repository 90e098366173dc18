//! Side tasks run around each case: setups, checks and monitors.
//!
//! Every probe folds its failures into [`ProbeResult`]; `start` and `finish` never
//! return errors to the orchestration layer.

pub mod ping;
pub mod registry;
pub mod remote;
pub mod subprocess;

use crate::results::Outcome;
use nix::sys::signal::Signal;
use std::time::Duration;

pub use ping::{PingIsAlive, PingIsStable};
pub use registry::build_probe;
pub use remote::{Invoker, InvokerError, RemoteMonitor, SshInvoker};
pub use subprocess::Subprocess;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Success,
    NotStarted,
    Failure,
    Timeout,
    Error,
}

impl Outcome for ProbeResult {
    const ALL: &'static [Self] = &[
        Self::Success,
        Self::NotStarted,
        Self::Failure,
        Self::Timeout,
        Self::Error,
    ];

    fn tag(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NotStarted => "not_started",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }
}

/// A task with a start/finish lifecycle.
///
/// `finish` is only called after a `start` that returned `true`.
pub trait Probe: Send {
    fn name(&self) -> &str;

    fn start(&mut self) -> bool;

    fn finish(&mut self) -> ProbeResult;
}

/// How a started subprocess is brought to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishConfig {
    pub timeout: Duration,
    pub signal: Option<Signal>,
}

impl FinishConfig {
    pub fn new(timeout: Duration, signal: Option<Signal>) -> Self {
        Self { timeout, signal }
    }
}

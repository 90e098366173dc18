use super::{
    FinishConfig, PingIsAlive, PingIsStable, Probe, RemoteMonitor, SshInvoker, Subprocess,
};
use crate::config::ProbeConfig;
use crate::context::Context;
use std::time::Duration;

/// Builds the probe described by `config`, named `<prefix>.<name>`.
pub fn build_probe(prefix: &str, config: &ProbeConfig, context: &Context) -> Box<dyn Probe> {
    let name = format!("{prefix}.{}", config.name());
    match config {
        ProbeConfig::Subprocess(s) => {
            let finish = FinishConfig::new(
                Duration::from_millis(s.finish.timeout_ms),
                s.finish.signal.0,
            );
            Box::new(Subprocess::new(
                name,
                s.cmd.clone(),
                s.shell,
                finish,
                context.multiplexer(),
            ))
        }
        ProbeConfig::PingStable(s) => Box::new(PingIsStable::new(
            name,
            &s.host,
            s.count,
            s.interval_s,
            context.multiplexer(),
        )),
        ProbeConfig::PingAlive(s) => Box::new(PingIsAlive::new(
            name,
            &s.host,
            s.interval_s,
            Duration::from_millis(s.timeout_ms),
            context.multiplexer(),
        )),
        ProbeConfig::Remote(s) => {
            let invoker = SshInvoker::new(
                name.clone(),
                s.command.clone(),
                s.start_key.clone(),
                s.connection.clone(),
                context.multiplexer(),
            );
            Box::new(RemoteMonitor::new(
                name,
                Box::new(invoker),
                Duration::from_millis(s.start_timeout_ms),
                Duration::from_millis(s.finish_timeout_ms),
            ))
        }
    }
}

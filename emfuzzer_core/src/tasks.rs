//! Ordered probe collections run around each case.

use crate::config::ProbeConfig;
use crate::context::Context;
use crate::probe::{Probe, ProbeResult, build_probe};
use crate::results::{Results, ResultsError};
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use tracing::{error, info, warn};

/// A probe plus whether its last `start` succeeded.
struct Task {
    probe: Box<dyn Probe>,
    started: bool,
}

impl Task {
    fn name(&self) -> &str {
        self.probe.name()
    }

    fn start(&mut self) {
        self.started = self.probe.start();
    }

    /// Records exactly one result for `key`; a probe that did not start is never
    /// finished.
    fn finish_for(&mut self, key: &str, results: &mut Results) {
        let result = if self.started {
            self.probe.finish()
        } else {
            warn!("<{}>: Not started, skipping finish", self.name());
            ProbeResult::NotStarted
        };
        self.started = false;

        if let Err(e) = results.collect(self.name(), key, result) {
            error!("<{}>: Failed to record result for {key}: {e}", self.name());
        }
    }

    fn execute_for(&mut self, key: &str, results: &mut Results) {
        self.start();
        self.finish_for(key, results);
    }
}

/// Probes of one configuration section (e.g. `case.monitoring`), kept in
/// registration order.
pub struct Tasks {
    name: String,
    tasks: Vec<Task>,
}

impl Tasks {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: Vec::new(),
        }
    }

    /// Builds every configured probe and registers a results group for each.
    pub fn from_config(
        name: &str,
        configs: &[ProbeConfig],
        context: &Context,
        results: &mut Results,
    ) -> Result<Self, ResultsError> {
        let mut tasks = Self::new(name);
        for config in configs {
            tasks.register(build_probe(name, config, context), results)?;
        }
        Ok(tasks)
    }

    pub fn register(
        &mut self,
        probe: Box<dyn Probe>,
        results: &mut Results,
    ) -> Result<(), ResultsError> {
        info!("Registering <{}>", probe.name());
        results.register(probe.name(), ProbeResult::Success)?;
        self.tasks.push(Task {
            probe,
            started: false,
        });
        Ok(())
    }

    /// Runs start-then-finish for each probe in turn.
    pub fn execute_for(&mut self, key: &str, results: &mut Results) {
        info!("Start {}", self.name);
        for task in &mut self.tasks {
            info!("Executing {}", task.name());
            task.execute_for(key, results);
        }
        info!("End {}", self.name);
    }

    pub fn start_all(&mut self) {
        info!("Starting {}", self.name);
        for task in &mut self.tasks {
            info!("Starting {}", task.name());
            task.start();
        }
        info!("All {} started", self.name);
    }

    pub fn finish_all_for(&mut self, key: &str, results: &mut Results) {
        info!("Finishing {}", self.name);
        for task in &mut self.tasks {
            info!("Finishing {}", task.name());
            task.finish_for(key, results);
        }
        info!("All {} finished", self.name);
    }

    /// Starts every probe, runs `body`, then finishes every probe for `key`, also
    /// when `body` panics.
    pub fn monitor<T>(
        &mut self,
        key: &str,
        results: &mut Results,
        body: impl FnOnce(&mut Results) -> T,
    ) -> T {
        self.start_all();
        let outcome = catch_unwind(AssertUnwindSafe(|| body(&mut *results)));
        self.finish_all_for(key, results);
        match outcome {
            Ok(value) => value,
            Err(panic) => resume_unwind(panic),
        }
    }
}

use std::thread;
use std::time::Duration;
use tracing::info;

/// A named fixed pause in the case loop, e.g. `case.delays.between_cases`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delay {
    name: String,
    duration: Duration,
}

impl Delay {
    pub fn new(name: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            duration,
        }
    }

    pub fn from_millis(name: impl Into<String>, millis: u64) -> Self {
        Self::new(name, Duration::from_millis(millis))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn wait(&self) {
        info!("Waiting on {} ({:?})", self.name, self.duration);
        thread::sleep(self.duration);
        info!("Wait on {} done", self.name);
    }
}

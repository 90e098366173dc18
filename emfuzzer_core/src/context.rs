use crate::io::{IoLoopError, Multiplexer};
use std::sync::Arc;
use tracing::info;

/// Shared workers built once per run and handed to probe constructors.
pub struct Context {
    multiplexer: Arc<Multiplexer>,
    torn_down: bool,
}

impl Context {
    pub fn start() -> Result<Self, IoLoopError> {
        Ok(Self {
            multiplexer: Arc::new(Multiplexer::start()?),
            torn_down: false,
        })
    }

    pub fn multiplexer(&self) -> Arc<Multiplexer> {
        Arc::clone(&self.multiplexer)
    }

    /// Stops every worker. Later calls are no-ops.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        info!("Tearing down execution context");
        self.multiplexer.stop();
        self.torn_down = true;
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.teardown();
    }
}

pub mod coap;
pub mod config;
pub mod context;
pub mod delay;
pub mod fuzzer;
pub mod input;
pub mod io;
pub mod net;
pub mod probe;
pub mod results;
pub mod tasks;

pub use coap::{Validator, ValidatorResult};
pub use config::{ConfigError, FuzzerConfig, ProbeConfig};
pub use context::Context;
pub use delay::Delay;
pub use fuzzer::{RunArgs, VALIDATOR_GROUP, fuzz};
pub use input::{Case, CaseError};
pub use io::{IoLoopError, Multiplexer, ResourceId, Selectable, StreamLogger};
pub use net::{Address, Consumer, NetError, NetworkReactor};
pub use probe::{Probe, ProbeResult};
pub use results::{Outcome, Results, ResultsError, ResultsGroup};
pub use tasks::Tasks;

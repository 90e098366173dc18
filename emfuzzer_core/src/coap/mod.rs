//! CoAP response classification.

pub mod code;
pub mod validator;

pub use code::Code;
pub use validator::{Validator, ValidatorResult, ValidatorState, ValidatorStats};

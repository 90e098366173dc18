use super::code::Code;
use crate::net::{Address, Consumer};
use crate::results::Outcome;
use serde::Serialize;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

/// Bytes needed before the response code can be decoded.
pub const MIN_HEADER_SIZE: usize = 2;

/// Classification of one exchange. Exactly one is produced per send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorResult {
    Success,
    UnexpectedOrigin,
    TooShortMessage,
    FailedOperation,
    Timedout,
}

impl Outcome for ValidatorResult {
    const ALL: &'static [Self] = &[
        Self::Success,
        Self::UnexpectedOrigin,
        Self::TooShortMessage,
        Self::FailedOperation,
        Self::Timedout,
    ];

    fn tag(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::UnexpectedOrigin => "unexpected_origin",
            Self::TooShortMessage => "too_short_message",
            Self::FailedOperation => "failed_operation",
            Self::Timedout => "timedout",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorState {
    Idle,
    Expecting,
    Resolved(ValidatorResult),
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValidatorStats {
    pub unexpected_messages: u64,
}

struct Exchange {
    state: ValidatorState,
    unexpected_messages: u64,
}

/// Turns the reactor's receive path into one classified result per exchange.
///
/// `Idle -> Expecting` on send, `Expecting -> Resolved` on the first reply,
/// `Resolved -> Idle` when the single waiter consumes the result. Replies arriving
/// outside of `Expecting` (including late replies after a timeout) only bump the
/// unexpected-message counter.
pub struct Validator {
    target: Address,
    timeout: Duration,
    exchange: Mutex<Exchange>,
    resolved: Condvar,
}

impl Validator {
    pub fn new(target: Address, timeout: Duration) -> Self {
        Self {
            target,
            timeout,
            exchange: Mutex::new(Exchange {
                state: ValidatorState::Idle,
                unexpected_messages: 0,
            }),
            resolved: Condvar::new(),
        }
    }

    pub fn target(&self) -> &Address {
        &self.target
    }

    pub fn state(&self) -> ValidatorState {
        self.lock().state
    }

    pub fn classify(&self, addr: &Address, payload: &[u8]) -> ValidatorResult {
        if *addr != self.target {
            warn!(
                "Message received from unexpected origin: {addr} vs {}",
                self.target
            );
            return ValidatorResult::UnexpectedOrigin;
        }
        if payload.len() < MIN_HEADER_SIZE {
            warn!("Too short message ({} bytes)", payload.len());
            return ValidatorResult::TooShortMessage;
        }

        let code = Code::decode(payload[1]);
        info!("Received {code}");
        if !code.reports_success() {
            warn!("Operation reported as failed");
            return ValidatorResult::FailedOperation;
        }
        ValidatorResult::Success
    }

    /// Waits for the configured timeout.
    pub fn wait_for_result(&self) -> ValidatorResult {
        self.wait_for_result_within(self.timeout)
    }

    /// Blocks until the outstanding exchange is resolved or `timeout` elapses.
    /// Only one waiter is supported at a time.
    pub fn wait_for_result_within(&self, timeout: Duration) -> ValidatorResult {
        let guard = self.lock();
        let (mut exchange, _) = self
            .resolved
            .wait_timeout_while(guard, timeout, |exchange| {
                !matches!(exchange.state, ValidatorState::Resolved(_))
            })
            .unwrap_or_else(PoisonError::into_inner);

        let result = match exchange.state {
            ValidatorState::Resolved(result) => result,
            _ => {
                warn!("Operation timed out after {timeout:?}");
                ValidatorResult::Timedout
            }
        };
        exchange.state = ValidatorState::Idle;
        result
    }

    pub fn extra_stats(&self) -> ValidatorStats {
        ValidatorStats {
            unexpected_messages: self.lock().unexpected_messages,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Exchange> {
        self.exchange.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Consumer for Validator {
    fn on_sent(&self, _addr: &Address, _payload: &[u8]) {
        self.lock().state = ValidatorState::Expecting;
    }

    fn on_received(&self, addr: &Address, payload: &[u8]) {
        let mut exchange = self.lock();
        if exchange.state != ValidatorState::Expecting {
            warn!("Message unexpected at this stage");
            exchange.unexpected_messages += 1;
            return;
        }
        exchange.state = ValidatorState::Resolved(self.classify(addr, payload));
        drop(exchange);
        self.resolved.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn target() -> Address {
        Address::new("127.0.0.1", 5683)
    }

    fn validator() -> Validator {
        Validator::new(target(), Duration::from_millis(200))
    }

    #[test]
    fn success_reply_resolves_and_returns_to_idle() {
        let v = validator();
        v.on_sent(&target(), b"\x40\x01\x00\x01");
        assert_eq!(v.state(), ValidatorState::Expecting);
        v.on_received(&target(), b"\x60\x45\x00\x01");
        assert_eq!(v.state(), ValidatorState::Resolved(ValidatorResult::Success));

        assert_eq!(v.wait_for_result(), ValidatorResult::Success);
        assert_eq!(v.state(), ValidatorState::Idle);
    }

    #[test]
    fn result_does_not_leak_into_next_exchange() {
        let v = validator();
        v.on_sent(&target(), b"\x40\x01");
        v.on_received(&target(), b"\x60\x81");
        assert_eq!(v.wait_for_result(), ValidatorResult::FailedOperation);

        v.on_sent(&target(), b"\x40\x01");
        assert_eq!(v.wait_for_result(), ValidatorResult::Timedout);
        assert_eq!(v.state(), ValidatorState::Idle);
    }

    #[test]
    fn origin_mismatch_wins_over_payload() {
        let v = validator();
        let other = Address::new("127.0.0.1", 9999);
        assert_eq!(v.classify(&other, b"\x60\x45"), ValidatorResult::UnexpectedOrigin);
        assert_eq!(v.classify(&other, b""), ValidatorResult::UnexpectedOrigin);
        assert_eq!(
            v.classify(&Address::new("localhost", 5683), b"\x60\x45"),
            ValidatorResult::UnexpectedOrigin
        );
    }

    #[test]
    fn short_payload_is_too_short() {
        let v = validator();
        assert_eq!(v.classify(&target(), b""), ValidatorResult::TooShortMessage);
        assert_eq!(v.classify(&target(), b"\x45"), ValidatorResult::TooShortMessage);
    }

    #[test]
    fn code_class_decides_success() {
        let v = validator();
        assert_eq!(v.classify(&target(), b"\x40\x45"), ValidatorResult::Success);
        assert_eq!(v.classify(&target(), b"\x40\x81"), ValidatorResult::FailedOperation);
        assert_eq!(v.classify(&target(), b"\x40\xa0"), ValidatorResult::FailedOperation);
    }

    #[test]
    fn late_reply_counts_as_unexpected() {
        let v = validator();
        v.on_sent(&target(), b"\x40\x01");
        let started = Instant::now();
        assert_eq!(
            v.wait_for_result_within(Duration::from_millis(100)),
            ValidatorResult::Timedout
        );
        assert!(started.elapsed() >= Duration::from_millis(100));

        v.on_received(&target(), b"\x60\x45");
        assert_eq!(v.state(), ValidatorState::Idle);
        assert_eq!(v.extra_stats().unexpected_messages, 1);
    }

    #[test]
    fn reply_while_idle_does_not_change_state() {
        let v = validator();
        v.on_received(&target(), b"\x60\x45");
        v.on_received(&Address::new("10.0.0.1", 1), b"\x60\x45");
        assert_eq!(v.state(), ValidatorState::Idle);
        assert_eq!(v.extra_stats(), ValidatorStats { unexpected_messages: 2 });
    }

    #[test]
    fn only_first_reply_is_classified() {
        let v = validator();
        v.on_sent(&target(), b"\x40\x01");
        v.on_received(&target(), b"\x60\x45");
        v.on_received(&target(), b"\x60\x81");
        assert_eq!(v.wait_for_result(), ValidatorResult::Success);
        assert_eq!(v.extra_stats().unexpected_messages, 1);
    }

    #[test]
    fn waiter_is_woken_from_another_thread() {
        let v = Arc::new(Validator::new(target(), Duration::from_secs(5)));
        let reactor_side = Arc::clone(&v);
        let handle = thread::spawn(move || {
            reactor_side.on_sent(&target(), b"\x40\x01");
            thread::sleep(Duration::from_millis(50));
            reactor_side.on_received(&target(), b"\x60\x44");
        });

        let started = Instant::now();
        assert_eq!(v.wait_for_result(), ValidatorResult::Success);
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn tags_cover_every_result() {
        let tags: Vec<_> = ValidatorResult::ALL.iter().map(|r| r.tag()).collect();
        assert_eq!(
            tags,
            [
                "success",
                "unexpected_origin",
                "too_short_message",
                "failed_operation",
                "timedout"
            ]
        );
    }
}

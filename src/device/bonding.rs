//! In-progress bonding attempts.
//!
//! At most one bonding runs per device. The record keeps the caller's
//! continuation, the agent handed over for authentication, per-attempt
//! timing for duration measurement, the legacy PIN fallback iterator and
//! the retry deadline after a transient failure.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use super::Reply;
use crate::{agent::Agent, agent::IoCapability, AddressType, Bearer, Result};

/// Backoff before retrying a failed bonding attempt.
pub(crate) const BONDING_RETRY_DELAY: Duration = Duration::from_secs(3);

/// One in-progress bonding attempt.
#[derive(custom_debug::Debug)]
pub struct BondingRequest {
    /// Bearer the bonding runs on.
    pub bearer: Bearer,
    /// Address type used for bond creation.
    pub address_type: AddressType,
    /// Agent acquired from the caller's context.
    #[debug(skip)]
    pub agent: Option<Arc<dyn Agent>>,
    /// Capability announced to the management layer.
    pub io_cap: IoCapability,
    #[debug(skip)]
    reply: Option<Reply>,
    /// When the bonding request was made.
    pub started: Instant,
    /// When the current attempt was started.
    pub attempt_started: Instant,
    /// Attempts made so far, including the current one.
    pub attempts: u32,
    /// PIN fallbacks not yet tried.
    pin_iter: std::vec::IntoIter<String>,
    /// When to retry after a transient failure.
    pub retry_at: Option<Instant>,
    /// Key exchange has been started on the link.
    pub exchange_started: bool,
}

impl BondingRequest {
    pub(crate) fn new(
        bearer: Bearer, address_type: AddressType, agent: Option<Arc<dyn Agent>>, reply: Reply,
        legacy_pins: Vec<String>, now: Instant,
    ) -> Self {
        let io_cap = agent.as_ref().map(|a| a.io_capability()).unwrap_or_default();
        Self {
            bearer,
            address_type,
            agent,
            io_cap,
            reply: Some(reply),
            started: now,
            attempt_started: now,
            attempts: 0,
            pin_iter: legacy_pins.into_iter(),
            retry_at: None,
            exchange_started: false,
        }
    }

    /// Marks the start of a (re)attempt, resetting the attempt timer.
    pub(crate) fn begin_attempt(&mut self, now: Instant) {
        self.attempts += 1;
        self.attempt_started = now;
        self.retry_at = None;
    }

    /// Next PIN fallback for a legacy pairing attempt.
    pub(crate) fn next_pin(&mut self) -> Option<String> {
        self.pin_iter.next()
    }

    /// More attempts may be scheduled under the given limit.
    pub(crate) fn can_retry(&self, max_attempts: u32) -> bool {
        self.attempts < max_attempts
    }

    /// Time spent since the request was made.
    pub(crate) fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    /// Time spent in the current attempt.
    pub(crate) fn attempt_elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.attempt_started)
    }

    /// Walks the caller's continuation with the final outcome.
    ///
    /// Only the first call delivers; the reply slot is consumed.
    pub(crate) fn reply(&mut self, result: Result<()>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use tokio::sync::oneshot;

    fn request(now: Instant) -> (BondingRequest, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        let req = BondingRequest::new(
            Bearer::BrEdr,
            AddressType::BrEdr,
            None,
            tx,
            vec!["0000".into(), "1234".into()],
            now,
        );
        (req, rx)
    }

    #[test]
    fn pin_fallbacks_run_out() {
        let (mut req, _rx) = request(Instant::now());
        assert_eq!(req.next_pin().as_deref(), Some("0000"));
        assert_eq!(req.next_pin().as_deref(), Some("1234"));
        assert_eq!(req.next_pin(), None);
    }

    #[test]
    fn attempts_are_bounded() {
        let now = Instant::now();
        let (mut req, _rx) = request(now);
        req.begin_attempt(now);
        assert!(req.can_retry(3));
        req.begin_attempt(now);
        req.begin_attempt(now);
        assert!(!req.can_retry(3));
    }

    #[test]
    fn retry_resets_attempt_timer() {
        let base = Instant::now();
        let (mut req, _rx) = request(base);
        req.begin_attempt(base);
        let later = base + Duration::from_secs(5);
        req.begin_attempt(later);
        assert_eq!(req.attempt_elapsed(later + Duration::from_secs(1)), Duration::from_secs(1));
        assert_eq!(req.elapsed(later), Duration::from_secs(5));
    }

    #[test]
    fn reply_is_delivered_once() {
        let (mut req, mut rx) = request(Instant::now());
        req.reply(Err(crate::Error::new(ErrorKind::AuthenticationFailed)));
        req.reply(Ok(()));
        let result = rx.try_recv().unwrap();
        assert_eq!(result.unwrap_err().kind, ErrorKind::AuthenticationFailed);
    }
}

//! Per-path bookkeeping for an end-to-end multipath session.
//!
//! Each path (UDP socket pair) belonging to a session gets one `LinkInfo`.
//! It tracks the sequence numbers used for RTT sampling, an EWMA RTT
//! estimate, and the last time anything was received on the path at all —
//! together these feed [`LinkInfo::score`], which the session uses to pick
//! which path to send non-duplicated traffic on.

use crate::time::Timestamp;

/// Number of in-flight send timestamps retained per path for RTT sampling.
/// Matches the reference implementation's fixed-size ring; indices are
/// taken modulo this length.
const SEND_TIMES_LEN: usize = 1024;

/// `last_ping` starts at this sentinel until the first real sample arrives,
/// so a brand-new path scores as the *worst* possible choice rather than
/// the best.
const INITIAL_PING_MS: i64 = 10_000_000;

/// Per-path sequence, RTT, and liveness state.
#[derive(Clone, Debug)]
pub struct LinkInfo {
    sendsn: u64,
    acksn: u64,
    recvsn: u64,

    send_times: Box<[i64; SEND_TIMES_LEN]>,
    /// EWMA round-trip estimate in milliseconds.
    last_ping: i64,
    /// Wall-clock millis of the last datagram received on this path.
    last_recv: i64,
}

impl Default for LinkInfo {
    fn default() -> Self {
        Self {
            sendsn: 0,
            acksn: 0,
            recvsn: 0,
            send_times: Box::new([0; SEND_TIMES_LEN]),
            last_ping: INITIAL_PING_MS,
            last_recv: 0,
        }
    }
}

impl LinkInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recvsn(&self) -> u64 {
        self.recvsn
    }

    /// Allocates the next outgoing sequence number on this path. The send
    /// time is recorded under index `(sn + 1) % SEND_TIMES_LEN` because the
    /// peer's ack of this send will carry `ack == sn + 1` — see
    /// [`LinkInfo::on_recv`].
    pub fn next_send_sn(&mut self, now: Timestamp) -> u64 {
        let sn = self.sendsn;
        self.sendsn += 1;
        self.send_times[((sn + 1) as usize) % SEND_TIMES_LEN] = now.as_millis();
        sn
    }

    /// Processes an inbound packet's `sn`/`ack` fields for this path. A
    /// packet whose `sn` is not newer than what we've already seen updates
    /// nothing (the caller still runs the body through the dedup set
    /// regardless of this return value).
    pub fn on_recv(&mut self, sn: u64, ack: u64, now: Timestamp) {
        if sn < self.recvsn {
            return;
        }
        self.recvsn = sn;
        self.acksn = ack;
        self.last_recv = now.as_millis();

        let sent_at = self.send_times[(ack as usize) % SEND_TIMES_LEN];
        let sample = now.as_millis() - sent_at;
        if sample < 1000 {
            self.last_ping = (self.last_ping * 9 + sample) / 10;
        }
    }

    pub fn last_ping(&self) -> i64 {
        self.last_ping
    }

    pub fn last_recv(&self) -> i64 {
        self.last_recv
    }

    /// Path desirability score: lower is better. Combines how long it has
    /// been since we last heard anything on the path with its RTT, so a
    /// path that has gone quiet is penalized even if its last known RTT was
    /// good.
    pub fn score(&self, now: Timestamp) -> f64 {
        let since = (now.as_millis() - self.last_recv) as f64;
        let ping_floor = (self.last_ping as f64).max(50.0);
        (since * ping_floor).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::testing::Clock as TestClock;
    use crate::time::Clock;
    use std::time::Duration;

    #[test]
    fn ack_within_window_updates_ewma() {
        let mut link = LinkInfo::new();
        let clock = TestClock::new();

        let sn = link.next_send_sn(clock.get_time());
        clock.inc_by(Duration::from_millis(40));
        link.on_recv(0, sn + 1, clock.get_time());

        assert_eq!(link.last_ping(), (INITIAL_PING_MS * 9 + 40) / 10);
    }

    #[test]
    fn huge_sample_is_discarded() {
        let mut link = LinkInfo::new();
        let clock = TestClock::new();

        let sn = link.next_send_sn(clock.get_time());
        clock.inc_by(Duration::from_millis(2000));
        link.on_recv(0, sn + 1, clock.get_time());

        assert_eq!(link.last_ping(), INITIAL_PING_MS);
    }

    #[test]
    fn stale_sn_does_not_rewind_recvsn() {
        let mut link = LinkInfo::new();
        let clock = TestClock::new();
        link.on_recv(10, 1, clock.get_time());
        link.on_recv(3, 1, clock.get_time());
        assert_eq!(link.recvsn(), 10);
    }

    #[test]
    fn score_improves_with_fresh_recv_and_low_ping() {
        let mut link = LinkInfo::new();
        let clock = TestClock::new();

        let sn = link.next_send_sn(clock.get_time());
        clock.inc_by(Duration::from_millis(20));
        link.on_recv(0, sn + 1, clock.get_time());

        let fresh_score = link.score(clock.get_time());

        clock.inc_by(Duration::from_millis(5000));
        let stale_score = link.score(clock.get_time());

        assert!(stale_score > fresh_score);
    }
}

//! The end-to-end multipath session: §4.1 of the design. Stripes one
//! logical payload stream across however many UDP paths a peer session has
//! accrued, suppresses duplicates, and scores paths by recency and RTT.

use std::net::SocketAddr;
use std::sync::Mutex;

use n4_core::dedup::DedupWindow;
use n4_core::time::{Clock, Timestamp};
use n4_core::token_bucket::{dup_rate_limit, TokenBucket};
use n4_core::{highway, E2ePacket, LinkInfo, SessionAddr};
use smallvec::SmallVec;

/// A send older than this no longer "sticks" a subsequent send to the same
/// path.
const STICKY_MS: i64 = 500;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("e2e session has no paths to send on")]
    NoPath,
    #[error("packet addressed to a different session was routed here")]
    WrongSession,
}

struct Inner {
    remote: SmallVec<[SocketAddr; 4]>,
    info: SmallVec<[LinkInfo; 4]>,
    rdqueue: Vec<Vec<u8>>,
    dedup: DedupWindow,
    dup_rate_limit: TokenBucket,
    last_send: Option<Timestamp>,
    last_remid: usize,
}

/// One peer's multipath session. `C` is the clock, injectable for tests.
pub struct E2eSession<C: Clock> {
    sessid: SessionAddr,
    clock: C,
    inner: Mutex<Inner>,
}

/// One outbound datagram plus the address to send it to, produced by
/// [`E2eSession::send`] while the session lock is held and transmitted only
/// after it is released.
pub struct Outgoing {
    pub packet: E2ePacket,
    pub dest: SocketAddr,
}

impl<C: Clock> E2eSession<C> {
    pub fn new(sessid: SessionAddr, clock: C) -> Self {
        let now = clock.get_time();
        Self {
            sessid,
            inner: Mutex::new(Inner {
                remote: SmallVec::new(),
                info: SmallVec::new(),
                rdqueue: Vec::new(),
                dedup: DedupWindow::new(),
                dup_rate_limit: dup_rate_limit(&clock),
                last_send: None,
                last_remid: 0,
            }),
            clock,
        }
    }

    pub fn sessid(&self) -> SessionAddr {
        self.sessid
    }

    /// Adds `addr` as a new path if it isn't already known. Idempotent.
    #[tracing::instrument(skip(self), fields(session = %self.sessid))]
    pub fn add_path(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock().unwrap();
        if inner.remote.contains(&addr) {
            return;
        }
        tracing::debug!(path = %addr, "adding new path");
        inner.remote.push(addr);
        inner.info.push(LinkInfo::new());
    }

    pub fn path_count(&self) -> usize {
        self.inner.lock().unwrap().remote.len()
    }

    /// Processes an already-de-obfuscated, already-decoded packet arriving
    /// from `source`. Panics if `packet.session` doesn't match this
    /// session's id — the caller is expected to have routed by session id
    /// already, so a mismatch here is a bug, not a protocol event.
    #[tracing::instrument(skip(self, packet), fields(session = %self.sessid, sn = packet.sn, ack = packet.ack))]
    pub fn input(&self, packet: E2ePacket, source: SocketAddr) -> Result<(), Error> {
        if packet.session != self.sessid {
            return Err(Error::WrongSession);
        }

        let now = self.clock.get_time();
        let mut inner = self.inner.lock().unwrap();

        let remid = inner.remote.iter().position(|&a| a == source);
        let Some(remid) = remid else {
            tracing::debug!(source = %source, "input: unknown path, dropping");
            return Ok(());
        };

        inner.info[remid].on_recv(packet.sn, packet.ack, now);

        let digest = highway::digest128(&packet.body);
        if !inner.dedup.check_and_insert(digest) {
            inner.rdqueue.push(packet.body);
        }
        Ok(())
    }

    /// Sends `payload`, returning the set of `(packet, dest)` pairs the
    /// caller must transmit. Collected under the lock, transmitted after
    /// it's released — see the design notes on mutex-held callbacks.
    #[tracing::instrument(skip(self, payload), fields(session = %self.sessid, len = payload.len()))]
    pub fn send(&self, payload: &[u8]) -> Result<SmallVec<[Outgoing; 4]>, Error> {
        let now = self.clock.get_time();
        let mut inner = self.inner.lock().unwrap();

        if inner.remote.is_empty() {
            return Err(Error::NoPath);
        }

        let mut out = SmallVec::new();

        if inner.remote.len() > 1 && inner.dup_rate_limit.try_take(now) {
            for remid in 0..inner.remote.len() {
                out.push(self.make_outgoing(&mut inner, remid, payload, now));
            }
            return Ok(out);
        }

        let sticky = inner
            .last_send
            .map(|t| now.as_millis() - t.as_millis() < STICKY_MS)
            .unwrap_or(false);

        let remid = if sticky {
            inner.last_remid
        } else {
            best_path(&inner.info, now).ok_or(Error::NoPath)?
        };

        if remid != inner.last_remid {
            tracing::debug!(path = %inner.remote[remid], "switching active path");
        }
        inner.last_remid = remid;
        inner.last_send = Some(now);

        out.push(self.make_outgoing(&mut inner, remid, payload, now));
        Ok(out)
    }

    fn make_outgoing(&self, inner: &mut Inner, remid: usize, payload: &[u8], now: Timestamp) -> Outgoing {
        let sn = inner.info[remid].next_send_sn(now);
        let packet = E2ePacket {
            session: self.sessid,
            sn,
            ack: inner.info[remid].recvsn() + 1,
            body: payload.to_vec(),
            padding: Vec::new(),
        };
        Outgoing {
            packet,
            dest: inner.remote[remid],
        }
    }

    /// Drains every body queued by `input` calls since the last flush, in
    /// FIFO order.
    pub fn flush_read_queue(&self) -> Vec<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        std::mem::take(&mut inner.rdqueue)
    }
}

fn best_path(info: &[LinkInfo], now: Timestamp) -> Option<usize> {
    info.iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            a.score(now)
                .partial_cmp(&b.score(now))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use n4_core::time::testing::Clock as TestClock;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn deliver<C: Clock + Clone>(sess: &E2eSession<C>, from: SocketAddr, sn: u64, ack: u64, body: &[u8]) {
        sess.input(
            E2ePacket {
                session: sess.sessid(),
                sn,
                ack,
                body: body.to_vec(),
                padding: Vec::new(),
            },
            from,
        )
        .unwrap();
    }

    #[test]
    fn duplicate_body_is_delivered_once() {
        let clock = TestClock::new();
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let sess = E2eSession::new(SessionAddr::random(&mut rng), clock);
        sess.add_path(addr(1));

        deliver(&sess, addr(1), 0, 1, b"hello");
        deliver(&sess, addr(1), 1, 1, b"hello");

        assert_eq!(sess.flush_read_queue(), vec![b"hello".to_vec()]);
    }

    #[test]
    fn wrong_session_is_rejected() {
        let clock = TestClock::new();
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let sess = E2eSession::new(SessionAddr::random(&mut rng), clock);
        sess.add_path(addr(1));

        let foreign = SessionAddr::random(&mut rng);
        let result = sess.input(
            E2ePacket {
                session: foreign,
                sn: 0,
                ack: 1,
                body: vec![],
                padding: vec![],
            },
            addr(1),
        );
        assert!(matches!(result, Err(Error::WrongSession)));
    }

    #[test]
    fn send_with_no_paths_errors() {
        let clock = TestClock::new();
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let sess = E2eSession::new(SessionAddr::random(&mut rng), clock);
        assert!(matches!(sess.send(b"x"), Err(Error::NoPath)));
    }

    #[test]
    fn failover_prefers_the_recently_heard_from_path() {
        let clock = TestClock::new();
        let mut rng = ChaCha20Rng::seed_from_u64(4);
        let sess = E2eSession::new(SessionAddr::random(&mut rng), clock);
        sess.add_path(addr(1));
        sess.add_path(addr(2));

        for _ in 0..100 {
            deliver(&sess, addr(1), 0, 1, b"a");
            clock.inc_by(Duration::from_millis(1));
        }

        clock.inc_by(Duration::from_millis(1500));
        deliver(&sess, addr(2), 0, 1, b"b");

        // drain the duplication budget (burst 10) so `send` falls through to
        // the score-based single-path choice instead of fanning out.
        for _ in 0..10 {
            sess.send(b"warm").unwrap();
        }

        clock.inc_by(Duration::from_millis(600));
        let out = sess.send(b"payload").unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].dest, addr(2));
    }

    #[test]
    fn sends_stick_to_the_same_path_within_window() {
        let clock = TestClock::new();
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let sess = E2eSession::new(SessionAddr::random(&mut rng), clock);
        sess.add_path(addr(1));
        sess.add_path(addr(2));
        deliver(&sess, addr(1), 0, 1, b"a");
        deliver(&sess, addr(2), 0, 1, b"b");

        for _ in 0..10 {
            sess.send(b"warm").unwrap();
        }

        let first = sess.send(b"x").unwrap();
        clock.inc_by(Duration::from_millis(100));
        let second = sess.send(b"y").unwrap();

        assert_eq!(first[0].dest, second[0].dest);
    }
}

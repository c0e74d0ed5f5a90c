//! Obfuscated UDP datagram layer: §4.2. Owns one UDP socket, de-obfuscates
//! and decodes inbound datagrams, routes them to the right end-to-end
//! session (creating one if the session id is new), and discovers new paths
//! automatically whenever a known session speaks from an unfamiliar source
//! address.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use n4_core::cookie::{self, COOKIE_LEN};
use n4_core::random::{DefaultGenerator, Generator};
use n4_core::time::{Clock, StdClock};
use n4_core::SessionAddr;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::e2e::E2eSession;

const MAX_DATAGRAM: usize = 2048;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to de-obfuscate datagram: {0}")]
    Deframe(#[from] n4_core::Error),
    #[error("failed to decode e2e packet: {0}")]
    Decode(#[from] n4_wire::DecoderError),
}

/// Table of live end-to-end sessions keyed by session id, shared between
/// the listener's receive loop and whatever drives sends.
pub struct SessionTable<C: Clock + Clone> {
    cookie: [u8; COOKIE_LEN],
    clock: C,
    sessions: Mutex<HashMap<SessionAddr, Arc<E2eSession<C>>>>,
    new_session_tx: Mutex<Option<mpsc::UnboundedSender<Arc<E2eSession<C>>>>>,
}

impl<C: Clock + Clone> SessionTable<C> {
    pub fn new(cookie: [u8; COOKIE_LEN], clock: C) -> Self {
        Self {
            cookie,
            clock,
            sessions: Mutex::new(HashMap::new()),
            new_session_tx: Mutex::new(None),
        }
    }

    /// Subscribes to freshly created sessions — the bridge/exit accept loop
    /// uses this to learn when to spin up an ARQ connection and mux for a
    /// session it has never seen before. Only one subscriber is supported;
    /// subscribing again replaces the previous receiver.
    pub fn subscribe_new_sessions(&self) -> mpsc::UnboundedReceiver<Arc<E2eSession<C>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.new_session_tx.lock().unwrap() = Some(tx);
        rx
    }

    pub fn get_or_create(&self, sessid: SessionAddr) -> Arc<E2eSession<C>> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(existing) = sessions.get(&sessid) {
            return existing.clone();
        }
        let session = Arc::new(E2eSession::new(sessid, self.clock.clone()));
        sessions.insert(sessid, session.clone());
        if let Some(tx) = self.new_session_tx.lock().unwrap().as_ref() {
            let _ = tx.send(session.clone());
        }
        session
    }

    pub fn get(&self, sessid: &SessionAddr) -> Option<Arc<E2eSession<C>>> {
        self.sessions.lock().unwrap().get(sessid).cloned()
    }

    pub fn insert(&self, sessid: SessionAddr, session: Arc<E2eSession<C>>) {
        self.sessions.lock().unwrap().insert(sessid, session);
    }

    pub fn remove(&self, sessid: &SessionAddr) {
        self.sessions.lock().unwrap().remove(sessid);
    }
}

pub type StdSessionTable = SessionTable<StdClock>;

/// An obfuscated UDP socket bound to a single local address, shared between
/// a receive loop and any number of senders.
pub struct ObfsSocket {
    socket: UdpSocket,
    cookie: [u8; COOKIE_LEN],
    rng: Mutex<DefaultGenerator>,
}

impl ObfsSocket {
    pub fn new(socket: UdpSocket, cookie: [u8; COOKIE_LEN]) -> Self {
        Self {
            socket,
            cookie,
            rng: Mutex::new(DefaultGenerator::new()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Obfuscates and sends an already-encoded `E2ePacket`.
    pub async fn send_plain(&self, plaintext: &[u8], dest: SocketAddr) -> std::io::Result<()> {
        let datagram = {
            let mut rng = self.rng.lock().unwrap();
            cookie::frame(&self.cookie, &mut *rng, plaintext)
        };
        self.socket.send_to(&datagram, dest).await?;
        Ok(())
    }

    /// Receives one datagram and returns its de-obfuscated plaintext plus
    /// source address. Malformed datagrams are reported as an error; the
    /// caller decides whether to log-and-continue or propagate.
    pub async fn recv_plain(&self) -> Result<(Vec<u8>, SocketAddr), Error> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, source) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(n);
        let plaintext = cookie::deframe(&self.cookie, &buf)?;
        Ok((plaintext, source))
    }
}

/// Runs the receive loop forever: de-obfuscates, decodes, routes to the
/// right session (creating it if new), registers new paths, and feeds the
/// packet into the session.
pub async fn run_recv_loop<C: Clock + Clone + Send + Sync + 'static>(
    socket: Arc<ObfsSocket>,
    table: Arc<SessionTable<C>>,
) {
    loop {
        match socket.recv_plain().await {
            Ok((plaintext, source)) => {
                let packet: n4_core::E2ePacket = match n4_wire::decode(&plaintext) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(error = %e, %source, "dropping undecodable e2e packet");
                        continue;
                    }
                };
                let session = table.get_or_create(packet.session);
                session.add_path(source);
                if let Err(e) = session.input(packet, source) {
                    tracing::warn!(error = %e, %source, "dropping packet routed to session incorrectly");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed inbound datagram");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use n4_core::time::testing::Clock as TestClock;

    #[tokio::test]
    async fn two_sockets_roundtrip_a_plaintext() {
        let cookie = cookie::derive_cookie("test-seed");
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_addr = b.local_addr().unwrap();

        let a = ObfsSocket::new(a, cookie);
        let b = ObfsSocket::new(b, cookie);

        a.send_plain(b"hello from a", b_addr).await.unwrap();
        let (got, _source) = b.recv_plain().await.unwrap();
        assert_eq!(got, b"hello from a");
    }

    #[test]
    fn session_table_creates_once_per_id() {
        let clock = TestClock::new();
        let table: SessionTable<TestClock> = SessionTable::new([0u8; COOKIE_LEN], clock);
        let mut rng = n4_core::random::DefaultGenerator::new();
        let sessid = SessionAddr::random(&mut rng);

        let a = table.get_or_create(sessid);
        let b = table.get_or_create(sessid);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn subscribers_are_notified_only_on_first_creation() {
        let clock = TestClock::new();
        let table: SessionTable<TestClock> = SessionTable::new([0u8; COOKIE_LEN], clock);
        let mut rx = table.subscribe_new_sessions();
        let mut rng = n4_core::random::DefaultGenerator::new();
        let sessid = SessionAddr::random(&mut rng);

        let first = table.get_or_create(sessid);
        let _second = table.get_or_create(sessid);

        let notified = rx.try_recv().expect("first creation notifies");
        assert!(Arc::ptr_eq(&notified, &first));
        assert!(rx.try_recv().is_err());
    }
}

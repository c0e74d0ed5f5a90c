//! Reliability layer: §4.3. A KCP-style ARQ built on the `kcp` crate's
//! sans-I/O state machine, driven by a Tokio task that bridges it to an
//! [`E2eSession`] below and an `AsyncRead + AsyncWrite` stream above.
//!
//! `kcp::Kcp` is a pure state machine: you feed it inbound segments via
//! `input`, pull outbound segments via its `Output` writer, and call
//! `update` on a schedule. All of the "is this actually wired to a network"
//! work happens here rather than in the `kcp` crate itself.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use kcp::Kcp;
use n4_core::time::Clock;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

use crate::e2e::E2eSession;
use crate::listener::ObfsSocket;

/// Matches the reference bridge's `kcp.SetWindowSize(10000, 10000)`.
const WND_SIZE: u16 = 10_000;
/// `kcp.SetNoDelay(0, 40, 3, 0)`: no-delay off, 40ms flush interval,
/// fast-retransmit at 3 dup acks, no congestion control.
const NODELAY: bool = false;
const INTERVAL_MS: i32 = 40;
const FAST_RESEND: i32 = 3;
const NO_CONGESTION_CONTROL: bool = true;
/// `kcp.SetMtu(1300)`.
const MTU: usize = 1300;
/// Driver tick granularity; KCP's own `interval` governs ack/flush cadence,
/// this just needs to be at least that fine.
const TICK: Duration = Duration::from_millis(10);

/// Collects bytes `Kcp` wants written to the network; drained by the driver
/// task after each `update`/`input`/`send` call.
struct ChannelOutput(VecDeque<u8>, Vec<Vec<u8>>);

impl ChannelOutput {
    fn new() -> Self {
        Self(VecDeque::new(), Vec::new())
    }

    fn take_segments(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.1)
    }
}

impl io::Write for ChannelOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.1.push(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Telemetry sampled from the underlying `Kcp` state for the stats path
/// (§4.3's Poisson-sampled bandwidth/latency emission).
#[derive(Clone, Copy, Debug)]
pub struct ArqTelemetry {
    pub smoothed_rtt_ms: i32,
    pub send_window_used: u32,
}

enum ToDriver {
    Send(Vec<u8>),
}

/// A reliable, ordered byte stream riding on top of an [`E2eSession`].
pub struct ArqStream {
    to_driver: mpsc::Sender<ToDriver>,
    from_driver: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
    read_buf: AsyncMutex<VecDeque<u8>>,
    telemetry: Arc<std::sync::Mutex<ArqTelemetry>>,
}

impl ArqStream {
    /// Spawns the driver task and returns the stream handle. `conv` is the
    /// KCP conversation id; both sides must agree on it out of band (the
    /// session id doubles as this in practice).
    pub fn spawn<C: Clock + Send + Sync + 'static>(
        conv: u32,
        session: Arc<E2eSession<C>>,
        socket: Arc<ObfsSocket>,
        clock: C,
    ) -> Self {
        let (to_driver_tx, to_driver_rx) = mpsc::channel::<ToDriver>(1024);
        let (from_driver_tx, from_driver_rx) = mpsc::channel::<Vec<u8>>(1024);
        let telemetry = Arc::new(std::sync::Mutex::new(ArqTelemetry {
            smoothed_rtt_ms: 0,
            send_window_used: 0,
        }));

        tokio::spawn(drive(
            conv,
            session,
            socket,
            clock,
            to_driver_rx,
            from_driver_tx,
            telemetry.clone(),
        ));

        Self {
            to_driver: to_driver_tx,
            from_driver: AsyncMutex::new(from_driver_rx),
            read_buf: AsyncMutex::new(VecDeque::new()),
            telemetry,
        }
    }

    pub fn telemetry(&self) -> ArqTelemetry {
        *self.telemetry.lock().unwrap()
    }

    /// A cloneable handle to the live telemetry cell, for samplers that run
    /// independently of (and may outlive the caller's borrow of) the stream
    /// itself — e.g. the bridge's Poisson-interval stats sampler (§4.3).
    pub fn telemetry_handle(&self) -> Arc<std::sync::Mutex<ArqTelemetry>> {
        self.telemetry.clone()
    }
}

async fn drive<C: Clock + Send + Sync + 'static>(
    conv: u32,
    session: Arc<E2eSession<C>>,
    socket: Arc<ObfsSocket>,
    clock: C,
    mut to_driver: mpsc::Receiver<ToDriver>,
    from_driver: mpsc::Sender<Vec<u8>>,
    telemetry: Arc<std::sync::Mutex<ArqTelemetry>>,
) {
    let mut kcp = Kcp::new(conv, ChannelOutput::new());
    kcp.set_nodelay(NODELAY, INTERVAL_MS, FAST_RESEND, NO_CONGESTION_CONTROL);
    kcp.set_wndsize(WND_SIZE, WND_SIZE);
    let _ = kcp.set_mtu(MTU);
    kcp.set_stream(true);

    let mut ticker = tokio::time::interval(TICK);
    let start = clock.get_time().as_millis();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now_ms = (clock.get_time().as_millis() - start).max(0) as u32;
                if kcp.update(now_ms).is_err() {
                    break;
                }
                flush_kcp_output(&mut kcp, &session, &socket).await;
                drain_session_input(&mut kcp, &session);
                if !pump_recv(&mut kcp, &from_driver).await {
                    break;
                }
                update_telemetry(&kcp, &telemetry);
            }
            Some(msg) = to_driver.recv() => {
                match msg {
                    ToDriver::Send(bytes) => {
                        if kcp.send(&bytes).is_err() {
                            break;
                        }
                        flush_kcp_output(&mut kcp, &session, &socket).await;
                    }
                }
            }
            else => break,
        }
    }
}

/// Drains whatever raw KCP segments accumulated in the output buffer,
/// hands each to the session (which decides which path(s) to use), and
/// actually puts the resulting obfuscated datagrams on the wire.
async fn flush_kcp_output<C: Clock>(
    kcp: &mut Kcp<ChannelOutput>,
    session: &E2eSession<C>,
    socket: &ObfsSocket,
) {
    for segment in kcp.output_mut().take_segments() {
        let outgoing = match session.send(&segment) {
            Ok(outgoing) => outgoing,
            Err(e) => {
                tracing::debug!(error = %e, "e2e session has nowhere to send an arq segment yet");
                continue;
            }
        };
        for o in outgoing {
            let encoded = n4_wire::encode(&o.packet);
            if let Err(e) = socket.send_plain(&encoded, o.dest).await {
                tracing::warn!(error = %e, dest = %o.dest, "failed to transmit e2e packet");
            }
        }
    }
}

fn drain_session_input<C: Clock>(kcp: &mut Kcp<ChannelOutput>, session: &E2eSession<C>) {
    for body in session.flush_read_queue() {
        let _ = kcp.input(&body);
    }
}

async fn pump_recv(kcp: &mut Kcp<ChannelOutput>, from_driver: &mpsc::Sender<Vec<u8>>) -> bool {
    let mut buf = vec![0u8; 65536];
    loop {
        match kcp.recv(&mut buf) {
            Ok(n) if n > 0 => {
                if from_driver.send(buf[..n].to_vec()).await.is_err() {
                    return false;
                }
            }
            _ => return true,
        }
    }
}

fn update_telemetry(kcp: &Kcp<ChannelOutput>, telemetry: &Arc<std::sync::Mutex<ArqTelemetry>>) {
    let mut t = telemetry.lock().unwrap();
    t.smoothed_rtt_ms = kcp.rx_srtt();
    t.send_window_used = kcp.wait_snd() as u32;
}

impl AsyncWrite for ArqStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.to_driver.try_send(ToDriver::Send(buf.to_vec())) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(mpsc::error::TrySendError::Full(_)) => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "arq driver gone")))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for ArqStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Ok(mut read_buf) = this.read_buf.try_lock() {
            if !read_buf.is_empty() {
                let n = read_buf.len().min(buf.remaining());
                let chunk: Vec<u8> = read_buf.drain(..n).collect();
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }
        }

        let mut from_driver = match this.from_driver.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
        };

        match from_driver.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..n]);
                if n < chunk.len() {
                    if let Ok(mut read_buf) = this.read_buf.try_lock() {
                        read_buf.extend(chunk[n..].iter().copied());
                    }
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kcp_constants_match_the_bridge_profile() {
        assert_eq!(WND_SIZE, 10_000);
        assert_eq!(INTERVAL_MS, 40);
        assert_eq!(FAST_RESEND, 3);
        assert_eq!(MTU, 1300);
    }
}

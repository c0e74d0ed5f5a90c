//! Stream multiplexer: §4.4. Carries independent, ordered byte streams
//! over one reliable ARQ connection using length-prefixed frames of
//! `{stream_id, kind, payload}`.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Syn = 0,
    Fin = 1,
    Rst = 2,
    Psh = 3,
    Nop = 4,
}

impl FrameKind {
    fn from_u8(b: u8) -> io::Result<Self> {
        Ok(match b {
            0 => FrameKind::Syn,
            1 => FrameKind::Fin,
            2 => FrameKind::Rst,
            3 => FrameKind::Psh,
            4 => FrameKind::Nop,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown mux frame kind {other}"),
                ))
            }
        })
    }
}

struct Frame {
    stream_id: u32,
    kind: FrameKind,
    payload: Vec<u8>,
}

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> io::Result<()> {
    let total_len = 4 + 1 + frame.payload.len();
    w.write_u32(total_len as u32).await?;
    w.write_u32(frame.stream_id).await?;
    w.write_u8(frame.kind as u8).await?;
    w.write_all(&frame.payload).await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Frame> {
    let total_len = r.read_u32().await? as usize;
    if total_len < 5 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "mux frame too short"));
    }
    let stream_id = r.read_u32().await?;
    let kind = FrameKind::from_u8(r.read_u8().await?)?;
    let mut payload = vec![0u8; total_len - 5];
    r.read_exact(&mut payload).await?;
    Ok(Frame {
        stream_id,
        kind,
        payload,
    })
}

struct StreamState {
    to_net: mpsc::Sender<Frame>,
    read_buf: AsyncMutex<Vec<u8>>,
    closed: std::sync::Mutex<bool>,
    read_waker: std::sync::Mutex<Option<Waker>>,
}

impl StreamState {
    fn new(to_net: mpsc::Sender<Frame>) -> Self {
        Self {
            to_net,
            read_buf: AsyncMutex::new(Vec::new()),
            closed: std::sync::Mutex::new(false),
            read_waker: std::sync::Mutex::new(None),
        }
    }

    /// Appends inbound bytes and wakes whatever reader is parked waiting on
    /// them.
    async fn push_inbound(&self, payload: &[u8]) {
        self.read_buf.lock().await.extend_from_slice(payload);
        if let Some(waker) = self.read_waker.lock().unwrap().take() {
            waker.wake();
        }
    }

    /// Marks the stream closed and wakes a parked reader so it observes EOF
    /// instead of hanging.
    fn mark_closed(&self) {
        *self.closed.lock().unwrap() = true;
        if let Some(waker) = self.read_waker.lock().unwrap().take() {
            waker.wake();
        }
    }
}

/// One independent bytestream multiplexed over a [`Mux`].
pub struct MuxStream {
    id: u32,
    state: Arc<StreamState>,
}

impl MuxStream {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let frame = Frame {
            stream_id: self.id,
            kind: FrameKind::Psh,
            payload: buf.to_vec(),
        };
        match self.state.to_net.try_send(frame) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(mpsc::error::TrySendError::Full(_)) => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "mux closed")))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let frame = Frame {
            stream_id: self.id,
            kind: FrameKind::Fin,
            payload: Vec::new(),
        };
        match self.state.to_net.try_send(frame) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => Poll::Ready(Ok(())),
            Err(mpsc::error::TrySendError::Full(_)) => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let state = &self.state;

        let mut read_buf = match state.read_buf.try_lock() {
            Ok(g) => g,
            Err(_) => {
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
        };

        if !read_buf.is_empty() {
            let n = read_buf.len().min(buf.remaining());
            buf.put_slice(&read_buf[..n]);
            read_buf.drain(..n);
            return Poll::Ready(Ok(()));
        }
        drop(read_buf);

        if *state.closed.lock().unwrap() {
            return Poll::Ready(Ok(()));
        }

        *state.read_waker.lock().unwrap() = Some(cx.waker().clone());
        Poll::Pending
    }
}

/// Owns one ARQ connection and demultiplexes/multiplexes streams over it.
pub struct Mux {
    next_stream_id: AtomicU32,
    open_frame_tx: mpsc::Sender<Frame>,
    accept_rx: AsyncMutex<mpsc::Receiver<MuxStream>>,
    streams: Arc<std::sync::Mutex<HashMap<u32, Arc<StreamState>>>>,
    closed: Arc<std::sync::Mutex<bool>>,
    _shutdown: oneshot::Sender<()>,
}

impl Mux {
    /// `is_client` picks the stream-id parity (client odd, server even) so
    /// both sides can open streams without colliding ids.
    pub fn new<IO>(io: IO, is_client: bool) -> Self
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (net_tx, net_rx) = mpsc::channel::<Frame>(256);
        let (accept_tx, accept_rx) = mpsc::channel::<MuxStream>(64);
        let streams: Arc<std::sync::Mutex<HashMap<u32, Arc<StreamState>>>> =
            Arc::new(std::sync::Mutex::new(HashMap::new()));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(drive(
            io,
            net_rx,
            net_tx.clone(),
            accept_tx,
            streams.clone(),
            shutdown_rx,
        ));

        Self {
            next_stream_id: AtomicU32::new(if is_client { 1 } else { 2 }),
            open_frame_tx: net_tx,
            accept_rx: AsyncMutex::new(accept_rx),
            streams,
            closed: Arc::new(std::sync::Mutex::new(false)),
            _shutdown: shutdown_tx,
        }
    }

    /// Opens a new locally-initiated stream.
    pub async fn open(&self) -> io::Result<MuxStream> {
        let id = self.next_stream_id.fetch_add(2, Ordering::SeqCst);
        let stream = self.register(id);

        self.open_frame_tx
            .send(Frame {
                stream_id: id,
                kind: FrameKind::Syn,
                payload: Vec::new(),
            })
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "mux closed"))?;

        Ok(stream)
    }

    /// Accepts the next peer-initiated stream.
    pub async fn accept(&self) -> Option<MuxStream> {
        self.accept_rx.lock().await.recv().await
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }

    fn register(&self, id: u32) -> MuxStream {
        let (to_net, mut to_net_rx) = mpsc::channel::<Frame>(64);
        let state = Arc::new(StreamState::new(to_net));

        self.streams.lock().unwrap().insert(id, state.clone());

        let forward = self.open_frame_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = to_net_rx.recv().await {
                if forward.send(frame).await.is_err() {
                    break;
                }
            }
        });

        MuxStream { id, state }
    }
}

async fn drive<IO>(
    io: IO,
    mut net_rx: mpsc::Receiver<Frame>,
    _net_tx: mpsc::Sender<Frame>,
    accept_tx: mpsc::Sender<MuxStream>,
    streams: Arc<std::sync::Mutex<HashMap<u32, Arc<StreamState>>>>,
    mut shutdown: oneshot::Receiver<()>,
) where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(io);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            frame = net_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if write_frame(&mut writer, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            frame = read_frame(&mut reader) => {
                match frame {
                    Ok(frame) => dispatch_inbound(frame, &streams, &accept_tx).await,
                    Err(_) => break,
                }
            }
        }
    }
}

async fn dispatch_inbound(
    frame: Frame,
    streams: &Arc<std::sync::Mutex<HashMap<u32, Arc<StreamState>>>>,
    accept_tx: &mpsc::Sender<MuxStream>,
) {
    match frame.kind {
        FrameKind::Nop => {}
        FrameKind::Syn => {
            let (to_net, mut to_net_rx) = mpsc::channel::<Frame>(64);
            let state = Arc::new(StreamState::new(to_net));
            streams.lock().unwrap().insert(frame.stream_id, state.clone());
            tokio::spawn(async move { while to_net_rx.recv().await.is_some() {} });
            let _ = accept_tx
                .send(MuxStream {
                    id: frame.stream_id,
                    state,
                })
                .await;
        }
        FrameKind::Fin | FrameKind::Rst => {
            if let Some(state) = streams.lock().unwrap().remove(&frame.stream_id) {
                state.mark_closed();
            }
        }
        FrameKind::Psh => {
            let state = streams.lock().unwrap().get(&frame.stream_id).cloned();
            if let Some(state) = state {
                state.push_inbound(&frame.payload).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_kind_round_trips_through_u8() {
        for kind in [
            FrameKind::Syn,
            FrameKind::Fin,
            FrameKind::Rst,
            FrameKind::Psh,
            FrameKind::Nop,
        ] {
            assert_eq!(FrameKind::from_u8(kind as u8).unwrap(), kind);
        }
    }

    #[test]
    fn unknown_frame_kind_byte_is_rejected() {
        assert!(FrameKind::from_u8(0xff).is_err());
    }
}

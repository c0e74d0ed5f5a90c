//! Server-side command dispatch: §4.5. Shared by the bridge and the exit —
//! both read one command off a freshly opened stream, answer it per the
//! table below, and either close or splice. The two roles differ only in
//! their [`HostPolicy`] regex and in which commands they choose to expose.

use std::net::IpAddr;
use std::sync::Arc;

use rand::RngCore;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::command::{self, Command};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("command protocol error: {0}")]
    Command(#[from] command::Error),
    #[error("host {0:?} rejected by policy")]
    HostRejected(String),
}

/// Validates `host` arguments on `conn`/`conn/feedback`/`proxy` against a
/// configured allow pattern. The bridge matches the exit-domain suffix; the
/// exit matches a destination allowlist/denylist.
#[derive(Clone)]
pub struct HostPolicy {
    allow: Regex,
}

impl HostPolicy {
    pub fn new(allow: Regex) -> Self {
        Self { allow }
    }

    pub fn matches_suffix(suffix: &str) -> Result<Self, regex::Error> {
        Regex::new(&format!(r"^[A-Za-z0-9.-]*{}$", regex::escape(suffix))).map(Self::new)
    }

    pub fn check(&self, host: &str) -> bool {
        self.allow.is_match(host)
    }
}

/// Per-role server configuration consumed by [`dispatch_loop`].
#[derive(Clone)]
pub struct DispatchConfig {
    pub host_policy: HostPolicy,
    pub public_ip: IpAddr,
    /// Port destination hosts are dialed on for the `conn`/`conn/feedback`
    /// commands, i.e. the exit's obfuscated command port (2389, §2).
    pub conn_port: u16,
}

/// Reads and answers one command on `stream`, looping for `ping/repeat` and
/// recursing for `tcp`'s nested side-channel. Runs until the stream closes
/// or a terminal command (everything but `ping/repeat`) completes.
pub async fn dispatch_loop<S>(mut stream: S, config: Arc<DispatchConfig>) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let cmd = match command::read_command(&mut stream).await {
            Ok(cmd) => cmd,
            Err(command::Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(())
            }
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(?cmd, "dispatching command");

        match cmd {
            Command::Ping => {
                n4_wire::write_value(&mut stream, &"ping".to_string()).await?;
                return Ok(());
            }
            Command::PingRepeat => {
                n4_wire::write_value(&mut stream, &"ping".to_string()).await?;
                continue;
            }
            Command::Ip => {
                n4_wire::write_value(&mut stream, &config.public_ip.to_string()).await?;
                return Ok(());
            }
            Command::Proxy { host_port } => {
                let host = host_only(&host_port);
                if !config.host_policy.check(host) {
                    tracing::warn!(host, "proxy host rejected by policy");
                    return Err(Error::HostRejected(host_port));
                }
                let outbound = TcpStream::connect(&host_port).await?;
                splice(stream, outbound).await?;
                return Ok(());
            }
            Command::Conn { host } => {
                if !config.host_policy.check(&host) {
                    tracing::warn!(%host, "conn host rejected by policy");
                    return Err(Error::HostRejected(host));
                }
                let outbound = TcpStream::connect((host.as_str(), config.conn_port)).await?;
                splice(stream, outbound).await?;
                return Ok(());
            }
            Command::ConnFeedback { host } => {
                if !config.host_policy.check(&host) {
                    tracing::warn!(%host, "conn/feedback host rejected by policy");
                    return Err(Error::HostRejected(host));
                }
                let outbound = TcpStream::connect((host.as_str(), config.conn_port)).await?;
                n4_wire::write_value(&mut stream, &0u64).await?;
                splice(stream, outbound).await?;
                return Ok(());
            }
            Command::Tcp => {
                let (port, key) = spawn_tcp_side_channel(config.clone()).await?;
                n4_wire::write_value(&mut stream, &(port as u64)).await?;
                n4_wire::write_value(&mut stream, &key.to_vec()).await?;
                return Ok(());
            }
        }
    }
}

fn host_only(host_port: &str) -> &str {
    host_port.rsplit_once(':').map(|(h, _)| h).unwrap_or(host_port)
}

async fn splice<S>(stream: S, outbound: TcpStream) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    tokio::pin!(stream);
    let mut outbound = outbound;
    tokio::io::copy_bidirectional(&mut stream, &mut outbound).await?;
    Ok(())
}

/// `tcp` command: opens an ephemeral listener, reports its port and a fresh
/// random 32-byte key, then obfuscates the first accepted connection with
/// that key and re-feeds it into dispatch. This gives bridges a
/// side-channel to tunnel to one another without reusing the session's
/// long-lived cookie.
async fn spawn_tcp_side_channel(config: Arc<DispatchConfig>) -> Result<(u16, [u8; 32]), Error> {
    let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
    let port = listener.local_addr()?.port();

    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);

    tokio::spawn(async move {
        if let Ok((socket, peer)) = listener.accept().await {
            tracing::debug!(%peer, "tcp side-channel accepted");
            let obfuscated = ObfsTcpStream::new(socket, key);
            if let Err(e) = dispatch_loop(obfuscated, config).await {
                tracing::warn!(error = %e, "tcp side-channel dispatch failed");
            }
        }
    });

    Ok((port, key))
}

/// Masks a raw TCP byte stream with a ChaCha20 keystream derived from a
/// per-connection key, the same primitive `n4_core::cookie` uses for the
/// UDP obfuscation layer, reused here for the `tcp` command's side-channel.
struct ObfsTcpStream {
    inner: TcpStream,
    read_cipher: chacha20::ChaCha20,
    write_cipher: chacha20::ChaCha20,
}

impl ObfsTcpStream {
    fn new(inner: TcpStream, key: [u8; 32]) -> Self {
        use chacha20::cipher::KeyIvInit;
        let iv = [0u8; 12];
        Self {
            inner,
            read_cipher: chacha20::ChaCha20::new((&key).into(), (&iv).into()),
            write_cipher: chacha20::ChaCha20::new((&key).into(), (&iv).into()),
        }
    }
}

impl AsyncRead for ObfsTcpStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        use chacha20::cipher::StreamCipher;
        let this = self.get_mut();
        let before = buf.filled().len();
        let inner = std::pin::Pin::new(&mut this.inner);
        match inner.poll_read(cx, buf) {
            std::task::Poll::Ready(Ok(())) => {
                this.read_cipher.apply_keystream(&mut buf.filled_mut()[before..]);
                std::task::Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl AsyncWrite for ObfsTcpStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        use chacha20::cipher::StreamCipher;
        let this = self.get_mut();
        let mut masked = buf.to_vec();
        this.write_cipher.apply_keystream(&mut masked);
        std::pin::Pin::new(&mut this.inner).poll_write(cx, &masked)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_only_strips_port() {
        assert_eq!(host_only("example.com:443"), "example.com");
        assert_eq!(host_only("example.com"), "example.com");
    }

    #[test]
    fn suffix_policy_accepts_matching_suffix_and_rejects_others() {
        let policy = HostPolicy::matches_suffix(".exits.example.net").unwrap();
        assert!(policy.check("bridge1.exits.example.net"));
        assert!(!policy.check("evil.example.com"));
    }

    #[tokio::test]
    async fn ping_replies_then_closes() {
        let (mut client, server) = tokio::io::duplex(4096);
        let config = Arc::new(DispatchConfig {
            host_policy: HostPolicy::matches_suffix(".example.net").unwrap(),
            public_ip: "203.0.113.7".parse().unwrap(),
            conn_port: 2389,
        });

        let handle = tokio::spawn(dispatch_loop(server, config));

        command::write_command(&mut client, &Command::Ping).await.unwrap();
        let reply: String = n4_wire::read_value(&mut client).await.unwrap();
        assert_eq!(reply, "ping");

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn ip_command_reports_configured_address() {
        let (mut client, server) = tokio::io::duplex(4096);
        let config = Arc::new(DispatchConfig {
            host_policy: HostPolicy::matches_suffix(".example.net").unwrap(),
            public_ip: "203.0.113.7".parse().unwrap(),
            conn_port: 2389,
        });

        let handle = tokio::spawn(dispatch_loop(server, config));
        command::write_command(&mut client, &Command::Ip).await.unwrap();
        let reply: String = n4_wire::read_value(&mut client).await.unwrap();
        assert_eq!(reply, "203.0.113.7");
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn conn_with_disallowed_host_closes_without_dialing() {
        let (mut client, server) = tokio::io::duplex(4096);
        let config = Arc::new(DispatchConfig {
            host_policy: HostPolicy::matches_suffix(".exits.example.net").unwrap(),
            public_ip: "203.0.113.7".parse().unwrap(),
            conn_port: 2389,
        });

        let handle = tokio::spawn(dispatch_loop(server, config));
        command::write_command(
            &mut client,
            &Command::Conn {
                host: "evil.example.com".to_string(),
            },
        )
        .await
        .unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::HostRejected(_))));
    }
}

//! Bridge binary: terminates obfuscated client sessions on one UDP port and
//! relays `conn`/`conn/feedback`/`proxy` traffic on to an exit, same as the
//! reference `geph-bridge` (§4.8, and `examples/original_source/cmd/geph-bridge`).

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use n4_binder_client::BinderClient;
use n4_core::cookie;
use n4_core::time::StdClock;
use n4_transport::{ArqStream, ArqTelemetry, ObfsSocket, SessionTable};
use n4::{dispatch_loop, DispatchConfig, HostPolicy, Mux};
use rand_distr::{Distribution, Poisson};
use tokio::net::UdpSocket;

#[derive(Parser, Debug)]
#[command(name = "n4-bridge", about = "Obfuscated bridge relay")]
struct Args {
    /// Seed used to derive this bridge's obfuscation cookie.
    #[arg(long, env = "N4_COOKIE_SEED")]
    cookie_seed: String,

    /// Domain-fronting host presented in TLS SNI for binder requests.
    #[arg(long, env = "N4_BINDER_FRONT", default_value = "ajax.aspnetcdn.com")]
    binder_front: String,

    /// Real binder hostname, sent as the HTTP Host header.
    #[arg(long, env = "N4_BINDER_HOST", default_value = "gephbinder.azureedge.net")]
    binder_host: String,

    /// Domain suffix that `conn`/`conn/feedback` hosts must match.
    #[arg(long, env = "N4_EXIT_DOMAIN", default_value = ".exits.geph.io")]
    exit_domain: String,

    /// Binder API key used to self-register.
    #[arg(long, env = "N4_BINDER_KEY")]
    binder_key: String,

    /// Destination port exits listen for obfuscated command connections on.
    #[arg(long, default_value_t = 2389)]
    conn_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let cookie = cookie::derive_cookie(&args.cookie_seed);
    tracing::info!(cookie = %hex_preview(&cookie), "cookie generated");

    let udp = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("binding bridge UDP socket")?;
    let local_port = udp.local_addr()?.port();
    let socket = Arc::new(ObfsSocket::new(udp, cookie));

    let public_ip = guess_ip().await.context("discovering public IP")?;
    let public_addr = format!("{public_ip}:{local_port}");
    tracing::info!(%public_addr, "bridge UDP listening");

    let binder = BinderClient::new(args.binder_front.clone(), args.binder_host.clone());
    spawn_registration_loop(binder, args.binder_key.clone(), cookie, public_addr);

    let table = Arc::new(SessionTable::new(cookie, StdClock::default()));
    let mut new_sessions = table.subscribe_new_sessions();

    tokio::spawn(n4_transport::listener::run_recv_loop(
        socket.clone(),
        table.clone(),
    ));

    let dispatch_config = Arc::new(DispatchConfig {
        host_policy: HostPolicy::matches_suffix(&args.exit_domain)?,
        public_ip,
        conn_port: args.conn_port,
    });

    while let Some(session) = new_sessions.recv().await {
        let socket = socket.clone();
        let dispatch_config = dispatch_config.clone();
        tokio::spawn(async move {
            let sessid = session.sessid();
            tracing::info!(session = %sessid, "accepted client session");
            let conv = conv_from_session(sessid);
            let arq = ArqStream::spawn(conv, session, socket, StdClock::default());
            spawn_telemetry_sampler(arq.telemetry_handle(), sessid);
            let mux = Mux::new(arq, false);
            while let Some(stream) = mux.accept().await {
                let dispatch_config = dispatch_config.clone();
                tokio::spawn(async move {
                    if let Err(e) = dispatch_loop(stream, dispatch_config).await {
                        tracing::debug!(error = %e, "command dispatch ended");
                    }
                });
            }
        });
    }

    Ok(())
}

/// Samples a session's ARQ telemetry at Poisson-distributed intervals (mean
/// ~3s, §4.3) and emits it as a tracing event, standing in for the
/// out-of-scope stats collector.
fn spawn_telemetry_sampler(telemetry: Arc<std::sync::Mutex<ArqTelemetry>>, sessid: n4_core::SessionAddr) {
    tokio::spawn(async move {
        let interval_dist = Poisson::new(3.0).expect("3.0 is a valid Poisson rate");
        let mut rng = rand::thread_rng();
        loop {
            let wait_secs: f64 = interval_dist.sample(&mut rng);
            tokio::time::sleep(Duration::from_secs_f64(wait_secs.max(0.001))).await;
            let sample = *telemetry.lock().unwrap();
            tracing::info!(
                session = %sessid,
                rtt_ms = sample.smoothed_rtt_ms,
                send_window_used = sample.send_window_used,
                "arq telemetry sample"
            );
        }
    });
}

fn conv_from_session(sessid: n4_core::SessionAddr) -> u32 {
    let bytes = sessid.as_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn hex_preview(bytes: &[u8]) -> String {
    bytes.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

async fn guess_ip() -> anyhow::Result<IpAddr> {
    let body = reqwest::get("https://checkip.amazonaws.com")
        .await?
        .text()
        .await?;
    Ok(body.trim().parse()?)
}

fn spawn_registration_loop(
    binder: BinderClient,
    binder_key: String,
    cookie: [u8; 32],
    public_addr: String,
) {
    tokio::spawn(async move {
        loop {
            if let Err(e) = binder.add_bridge(&binder_key, &cookie, &public_addr).await {
                tracing::warn!(error = %e, "bridge self-registration failed");
            } else {
                tracing::debug!("bridge self-registration succeeded");
            }
            tokio::time::sleep(Duration::from_secs(600)).await;
        }
    });
}

//! Exit binary: the far end of the tunnel. Accepts plain TCP connections on
//! its command port (2389, §2/§4.5) — arriving either directly from a client
//! in `direct` mode or spliced through from a bridge's `conn` handler — muxes
//! each connection, and dispatches `proxy`/`ping`/`ip`/`tcp` commands against
//! a destination allow/deny policy.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use n4::{dispatch_loop, DispatchConfig, HostPolicy, Mux};
use regex::Regex;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "n4-exit", about = "Exit relay terminating the command protocol")]
struct Args {
    /// Local address to accept command-protocol TCP connections on.
    #[arg(long, env = "N4_LISTEN_ADDR", default_value = "0.0.0.0:2389")]
    listen_addr: String,

    /// Regex destinations must match for `conn`/`conn/feedback`/`proxy` to
    /// be allowed. Defaults to "allow everything" — operators deploying a
    /// restrictive exit should narrow this.
    #[arg(long, env = "N4_ALLOW_HOSTS", default_value = ".*")]
    allow_hosts: String,

    /// The IP this exit reports in response to the `ip` command. Left unset,
    /// it is discovered the same way the bridge does.
    #[arg(long, env = "N4_PUBLIC_IP")]
    public_ip: Option<IpAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let public_ip = match args.public_ip {
        Some(ip) => ip,
        None => guess_ip().await.context("discovering public IP")?,
    };

    let config = Arc::new(DispatchConfig {
        host_policy: HostPolicy::new(Regex::new(&args.allow_hosts).context("compiling allow_hosts regex")?),
        public_ip,
        conn_port: 2389,
    });

    let listener = TcpListener::bind(&args.listen_addr)
        .await
        .with_context(|| format!("binding exit listener on {}", args.listen_addr))?;
    tracing::info!(addr = %args.listen_addr, %public_ip, "exit listening");

    loop {
        let (socket, peer) = listener.accept().await?;
        let config = config.clone();
        tokio::spawn(async move {
            tracing::debug!(%peer, "accepted command connection");
            let mux = Mux::new(socket, false);
            while let Some(stream) = mux.accept().await {
                let config = config.clone();
                tokio::spawn(async move {
                    if let Err(e) = dispatch_loop(stream, config).await {
                        tracing::debug!(error = %e, "command dispatch ended");
                    }
                });
            }
        });
    }
}

async fn guess_ip() -> anyhow::Result<IpAddr> {
    let body = reqwest::get("https://checkip.amazonaws.com")
        .await?
        .text()
        .await?;
    Ok(body.trim().parse()?)
}

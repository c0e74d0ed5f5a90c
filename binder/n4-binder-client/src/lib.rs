//! HTTP client for the binder directory service (§6): client info probing,
//! blind-signed ticket issuance, bridge discovery, and bridge
//! self-registration — all carried over a domain-fronted HTTPS transport.

pub mod ticket;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use ticket::{PendingTicket, Ticket};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("binder request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("ticket blinding failed: {0}")]
    Ticket(#[from] ticket::Error),
    #[error("binder returned an error response: {0}")]
    BinderError(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Deserialize)]
pub struct ClientInfo {
    pub country: String,
}

#[derive(Debug, Deserialize)]
pub struct Bridge {
    pub host: String,
    pub cookie: String,
}

#[derive(Debug, Serialize)]
struct GetTicketRequest<'a> {
    username: &'a str,
    password: &'a str,
    blinded_msg: &'a [u8],
}

#[derive(Debug, Deserialize)]
struct GetTicketResponse {
    blind_sig: Vec<u8>,
    expiry_unix: u64,
}

#[derive(Debug, Serialize)]
struct AddBridgeRequest<'a> {
    binder_key: &'a str,
    cookie: &'a [u8],
    addr: &'a str,
}

/// One binder endpoint, reached by dialing TLS to `front` while presenting
/// `host` as the HTTP `Host:` header — the domain-fronting split described
/// in §6. `front` and `host` are supplied as a matched pair by the caller
/// (see the client binder race in `n4`, which picks the pair).
pub struct BinderClient {
    front: String,
    host: String,
    client: reqwest::Client,
}

impl BinderClient {
    pub fn new(front: String, host: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .expect("reqwest client construction cannot fail with default TLS config");
        Self { front, host, client }
    }

    fn url(&self, path: &str) -> String {
        format!("https://{}{path}", self.front)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_client_info(&self) -> Result<ClientInfo> {
        let resp = self
            .client
            .get(self.url("/client-info"))
            .header("Host", &self.host)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    /// Redeems `username`/`password` for a blind-signed ticket. The binder
    /// never sees `msg` in the clear — only the blinded value.
    #[tracing::instrument(skip(self, password, pending))]
    pub async fn get_ticket(
        &self,
        username: &str,
        password: &str,
        pending: PendingTicket,
        public_key: &blind_rsa_signatures::PublicKey,
    ) -> Result<Ticket> {
        let blinded_bytes: Vec<u8> = pending.blinded_message().clone().into();
        let req = GetTicketRequest {
            username,
            password,
            blinded_msg: &blinded_bytes,
        };

        let resp = self
            .client
            .post(self.url("/get-ticket"))
            .header("Host", &self.host)
            .json(&req)
            .send()
            .await?
            .error_for_status()?;
        let body: GetTicketResponse = resp.json().await?;

        let blind_sig = blind_rsa_signatures::BlindSignature::from(body.blind_sig);
        Ok(pending.finalize(public_key, blind_sig, body.expiry_unix)?)
    }

    #[tracing::instrument(skip(self, ticket))]
    pub async fn get_bridges(&self, ticket: &Ticket) -> Result<Vec<Bridge>> {
        #[derive(Serialize)]
        struct Req<'a> {
            msg: &'a [u8],
            sig: &'a [u8],
        }

        let resp = self
            .client
            .post(self.url("/get-bridges"))
            .header("Host", &self.host)
            .json(&Req {
                msg: &ticket.msg,
                sig: &ticket.sig,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    /// Bridge self-registration, called every ~10 minutes by each bridge.
    #[tracing::instrument(skip(self, binder_key, cookie))]
    pub async fn add_bridge(&self, binder_key: &str, cookie: &[u8], addr: &str) -> Result<()> {
        self.client
            .post(self.url("/add-bridge"))
            .header("Host", &self.host)
            .json(&AddBridgeRequest {
                binder_key,
                cookie,
                addr,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Races `get_client_info` across every `(front, host)` pair, returning the
/// first `BinderClient` to answer successfully (§4.7). `fronts` and `hosts`
/// must be the same length; mismatched lengths are a configuration error
/// the caller should have rejected at startup.
pub async fn race_binders(fronts: &[String], hosts: &[String]) -> Option<BinderClient> {
    use futures::stream::{FuturesUnordered, StreamExt};

    let mut attempts = FuturesUnordered::new();
    for (front, host) in fronts.iter().zip(hosts.iter()) {
        let front = front.clone();
        let host = host.clone();
        attempts.push(async move {
            let client = BinderClient::new(front, host);
            client.get_client_info().await.map(|_| client)
        });
    }

    while let Some(result) = attempts.next().await {
        if let Ok(client) = result {
            return Some(client);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_uses_front_not_host() {
        let client = BinderClient::new("front.example.com".to_string(), "binder.internal".to_string());
        assert_eq!(client.url("/client-info"), "https://front.example.com/client-info");
    }
}

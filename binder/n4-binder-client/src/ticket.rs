//! Blind-signed access tickets (§6, §9 design notes).
//!
//! The binder never sees the plaintext ticket message it signs — the
//! client blinds a random message, the binder blind-signs the blinded
//! value, and the client unblinds the result locally. Redeeming the
//! resulting `(msg, sig)` pair at a bridge or exit proves authorization
//! without letting the binder link the redemption back to the signing
//! request (and therefore to the account that paid for it).

use blind_rsa_signatures::{BlindSignature, BlindedMessage, Options, PublicKey, Secret};
use rand::RngCore;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("blind signature error: {0}")]
    BlindRsa(#[from] blind_rsa_signatures::Error),
}

/// A redeemable `(msg, sig)` pair plus its expiry, as returned by
/// `POST /get-ticket` once unblinded.
#[derive(Clone, Debug)]
pub struct Ticket {
    pub msg: Vec<u8>,
    pub sig: Vec<u8>,
    pub expiry_unix: u64,
}

impl Ticket {
    pub fn verify(&self, public_key: &PublicKey) -> bool {
        let options = Options::default();
        public_key
            .verify(
                &blind_rsa_signatures::Signature::from(self.sig.clone()),
                None,
                &self.msg,
                &options,
            )
            .is_ok()
    }
}

/// Client-side state for one blind-signature exchange: a random message and
/// the secret blinding factor, kept around between the blind and unblind
/// steps.
pub struct PendingTicket {
    msg: Vec<u8>,
    secret: Secret,
    blinded: BlindedMessage,
}

impl PendingTicket {
    /// Generates a fresh random ticket message and blinds it against
    /// `public_key`, ready to be sent to the binder's `/get-ticket`.
    pub fn new(public_key: &PublicKey) -> Result<Self, Error> {
        let mut msg = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut msg);

        let options = Options::default();
        let blinding_result =
            public_key.blind(&mut rand::thread_rng(), &msg, true, &options)?;

        Ok(Self {
            msg,
            secret: blinding_result.secret,
            blinded: blinding_result.blind_msg,
        })
    }

    pub fn blinded_message(&self) -> &BlindedMessage {
        &self.blinded
    }

    /// Unblinds the binder's blind signature into a redeemable ticket.
    pub fn finalize(
        self,
        public_key: &PublicKey,
        blind_sig: BlindSignature,
        expiry_unix: u64,
    ) -> Result<Ticket, Error> {
        let options = Options::default();
        let sig = public_key.finalize(
            &blind_sig,
            &self.secret,
            None,
            &self.msg,
            &options,
        )?;

        Ok(Ticket {
            msg: self.msg,
            sig: sig.into(),
            expiry_unix,
        })
    }
}

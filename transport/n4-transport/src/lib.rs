//! The obfuscated, reliable, multiplexed transport built on top of
//! `n4-core`'s wire types and path primitives: the end-to-end multipath
//! session (§4.1), the obfuscated UDP datagram layer (§4.2), the KCP-style
//! ARQ reliability layer (§4.3), and the stream multiplexer (§4.4).

pub mod arq;
pub mod e2e;
pub mod listener;
pub mod mux;

pub use arq::{ArqStream, ArqTelemetry};
pub use e2e::E2eSession;
pub use listener::{ObfsSocket, SessionTable};
pub use mux::{Mux, MuxStream};

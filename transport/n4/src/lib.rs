//! Public facade for the niaucchi4 obfuscated multipath transport.
//!
//! Lower layers (`n4-core`'s wire/path primitives, `n4-transport`'s E2E
//! session, obfuscated socket, ARQ, and mux) are composed here into the two
//! things a caller actually wants: the command protocol spoken on every
//! mux stream (§4.5), and the client-side session wrapper that turns
//! "dial this command" into "get me a working stream," rebuilding the
//! entire stack transparently on failure (§4.6).
//!
//! Binaries (`n4-client`, `n4-bridge`, `n4-exit`) own startup, CLI parsing,
//! and the binder interactions; this crate owns the protocol and session
//! machinery shared by all three.

pub mod clientwrap;
pub mod command;
pub mod dispatch;

pub use clientwrap::{ClientSession, StackBuilder};
pub use command::Command;
pub use dispatch::{dispatch_loop, DispatchConfig, HostPolicy};

pub use n4_binder_client::{BinderClient, Bridge, ClientInfo, PendingTicket, Ticket};
pub use n4_transport::{ArqStream, ArqTelemetry, E2eSession, Mux, MuxStream, ObfsSocket, SessionTable};

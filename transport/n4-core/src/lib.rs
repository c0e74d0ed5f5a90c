//! Core types shared by every layer of the niaucchi4 transport: the wire
//! packet format and session addressing for the end-to-end multipath
//! session, per-path RTT/score bookkeeping, the obfuscation cookie/keystream,
//! duplicate-packet detection, and the small clock/random/rate-limiting
//! primitives those all build on.

pub mod cookie;
pub mod dedup;
pub mod error;
pub mod highway;
pub mod link;
pub mod packet;
pub mod random;
pub mod session_addr;
pub mod time;
pub mod token_bucket;

pub use error::{Error, Result};
pub use link::LinkInfo;
pub use packet::E2ePacket;
pub use session_addr::SessionAddr;

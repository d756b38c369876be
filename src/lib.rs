//! Client-side implementation of the AMS/ADS protocol used by industrial
//!  automation controllers: a request / response multiplexer over persistent
//!  TCP connections plus a push channel for device notifications.
//!
//! ## Design
//!
//! * All communication goes through an [`router::AmsRouter`], which owns
//!   * a route table mapping six-byte AMS net ids to host addresses
//!   * one TCP connection per remote host, shared by all routes resolving to
//!      it and reference counted so it closes with its last route
//!   * a pool of local ports - the application opens a port, uses it as the
//!      source of its requests, and closes it when done
//! * Requests are multiplexed over the shared connection via response slots,
//!   one per local port. A port can have at most one request in flight, ports
//!   are independent of each other.
//! * Responses are correlated by the target port and a per-request invoke id.
//!   A request that receives no response within its port's timeout fails and
//!   releases its slot for reuse. The wire format has no resynchronization
//!   marker, so frames that cannot be delivered (unknown invoke id, oversized
//!   payload, unknown command) are drained off the stream by their declared
//!   length and discarded.
//! * Device notifications bypass the request path: a per-subscription
//!   callback is invoked from a dedicated worker task that is fed through a
//!   ring buffer, so a slow callback stalls (and eventually drops)
//!   notifications but never the receive loop.
//! * A UDP side channel ([`udp`]) covers device discovery and remote route
//!   setup, which the data protocol itself cannot express.
//!
//! ## Frame structure
//!
//! Every frame on the TCP stream, in either direction (all integers LE):
//!
//! ```ascii
//! 0:  AMS/TCP header: u16 reserved (zero), u32 length of the rest
//! 6:  AoE header: target address (8), source address (8), command id (u16),
//!      state flags (u16), payload length (u32), error code (u32),
//!      invoke id (u32)
//! 38: command-specific payload
//! ```

pub mod buffers;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod header;
pub mod net_id;
pub mod port;
pub mod router;
pub mod udp;

pub use config::AmsConfig;
pub use error::{AdsError, AdsVersion};
pub use header::{NotificationAttributes, TransmissionMode};
pub use net_id::{AmsAddr, AmsNetId};
pub use router::AmsRouter;

//! A reliable, ordered, message-oriented transport layered over UDP.
//!
//! An [`Endpoint`] either [`Endpoint::listen`]s, demultiplexing datagrams
//! from many peers into per-peer [`Connection`] handles, or
//! [`Endpoint::connect`]s to a single peer. Either way, applications see a
//! sequence of whole messages delivered in order via [`Connection::on_message`],
//! backed by a handshake, cumulative acknowledgement, an adaptive
//! retransmission timer, and an out-of-order receive buffer underneath.

mod codec;
mod config;
mod connection;
mod endpoint;
mod err;
mod rtt;
mod stats;

pub use codec::Flags;
pub use connection::Connection;
pub use endpoint::Endpoint;
pub use err::Error;
pub use stats::Stats;

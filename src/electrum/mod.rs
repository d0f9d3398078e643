//! Chain indexing server integration
//!
//! This module provides the abstract ports the wallet uses to talk to a remote chain-indexing
//! server, and an implementation of them on top of the Electrum protocol. Addresses are queried
//! by script hash, transactions are fetched in verbose form so confirmation counts and block
//! times are available, and raw transactions can be broadcast.

/// Electrum protocol client
mod client;
/// Chain client and previous-output lookup traits
mod ports;
/// Type definitions for chain server responses and errors
mod types;

pub use client::ElectrumChainClient;
pub use ports::*;
pub use types::*;

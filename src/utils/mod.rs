//!
//! Utility module for the wallet.
//!
//! Re-exports formatting helpers used by the binary and by log output.
/// Utility functions for formatting and display
pub mod index;

pub use index::format_btc_amount;

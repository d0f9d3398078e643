/// Broadcast service for wallet transactions
pub mod broadcast;

pub use broadcast::{BroadcastService, TransferError, TransferResult};

pub mod keys;
pub mod sync;
pub mod types;

pub use keys::{AddressDeriver, Bip32AddressDeriver};
pub use types::*;

use rand::Rng;

/// Fresh random seed for a throwaway wallet
pub fn generate_random_seed() -> [u8; 32] {
	let mut seed = [0u8; 32];
	rand::rng().fill(&mut seed);
	seed
}

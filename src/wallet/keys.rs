//!
//! Account key material and address derivation.
//!
//! The wallet only ever needs public derivation for discovery: receiving addresses live under
//! `account/0/i` and change addresses under `account/1/i`.

use crate::config::AddressKind;
use crate::wallet::{Chain, WalletSyncError};

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv, Xpub};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Address, Network};
use std::str::FromStr;

/// Derives chain addresses from wallet public key material
pub trait AddressDeriver: Send + Sync {
	/// Address at `index` on `chain`. Pure, no side effects.
	fn derive(&self, chain: Chain, index: u32) -> Result<String, WalletSyncError>;

	fn network(&self) -> Network;
}

/// BIP32 deriver built from an account-level extended public key
pub struct Bip32AddressDeriver {
	secp: Secp256k1<All>,
	main: Xpub,
	change: Xpub,
	network: Network,
	kind: AddressKind,
}

impl Bip32AddressDeriver {
	/// Build from an account xpub string (`m/44'/coin'/0'`)
	pub fn from_xpub(
		xpub: &str,
		network: Network,
		kind: AddressKind,
	) -> Result<Self, WalletSyncError> {
		let account = Xpub::from_str(xpub)
			.map_err(|e| WalletSyncError::Derivation(format!("Invalid account xpub: {}", e)))?;
		Self::from_account(account, network, kind)
	}

	/// Build from a raw seed, deriving the BIP44 account key first
	pub fn from_seed(
		seed: &[u8],
		network: Network,
		kind: AddressKind,
	) -> Result<Self, WalletSyncError> {
		let secp = Secp256k1::new();
		let master = Xpriv::new_master(network, seed)
			.map_err(|e| WalletSyncError::Derivation(format!("Invalid seed: {}", e)))?;

		let coin_type = if network == Network::Bitcoin { 0 } else { 1 };
		let path = DerivationPath::from_str(&format!("m/44'/{}'/0'", coin_type))
			.map_err(|e| WalletSyncError::Derivation(e.to_string()))?;
		let account = master.derive_priv(&secp, &path).map_err(|e| {
			WalletSyncError::Derivation(format!("Failed to derive account key: {}", e))
		})?;

		Self::from_account(Xpub::from_priv(&secp, &account), network, kind)
	}

	fn from_account(
		account: Xpub,
		network: Network,
		kind: AddressKind,
	) -> Result<Self, WalletSyncError> {
		let secp = Secp256k1::new();
		let chain_key = |chain: Chain| -> Result<Xpub, WalletSyncError> {
			let child = ChildNumber::from_normal_idx(chain.child_index())
				.map_err(|e| WalletSyncError::Derivation(e.to_string()))?;
			account.derive_pub(&secp, &[child]).map_err(|e| {
				WalletSyncError::Derivation(format!("Failed to derive {} chain key: {}", chain, e))
			})
		};
		let main = chain_key(Chain::Main)?;
		let change = chain_key(Chain::Change)?;

		Ok(Self {
			secp,
			main,
			change,
			network,
			kind,
		})
	}
}

impl AddressDeriver for Bip32AddressDeriver {
	fn derive(&self, chain: Chain, index: u32) -> Result<String, WalletSyncError> {
		let parent = match chain {
			Chain::Main => &self.main,
			Chain::Change => &self.change,
		};
		let child = ChildNumber::from_normal_idx(index).map_err(|e| {
			WalletSyncError::Derivation(format!("Invalid address index {}: {}", index, e))
		})?;
		let public_key = parent
			.derive_pub(&self.secp, &[child])
			.map_err(|e| WalletSyncError::Derivation(e.to_string()))?
			.to_pub();

		let address = match self.kind {
			AddressKind::Legacy => Address::p2pkh(public_key.pubkey_hash(), self.network),
			AddressKind::SegwitV0 => Address::p2wpkh(&public_key, self.network),
		};
		Ok(address.to_string())
	}

	fn network(&self) -> Network {
		self.network
	}
}

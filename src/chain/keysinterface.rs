// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! keysinterface provides keys into the channel state machine and defines the signing operations
//! it needs. The state machine itself never sees a private key: it asks an implementation of
//! [`KeysInterface`] for public points and signatures, so the secrets can live in an HSM.

use bitcoin::blockdata::script::Script;
use bitcoin::blockdata::transaction::Transaction;

use bitcoin::hashes::{Hash, HashEngine};
use bitcoin::hashes::sha256::Hash as Sha256;

use bitcoin::secp256k1::{self, Secp256k1};
use bitcoin::secp256k1::{PublicKey, SecretKey};
use bitcoin::secp256k1::ecdsa::Signature;

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::ln::chan_utils::{self, INITIAL_COMMITMENT_NUMBER};
use crate::ln::commitments::{ChannelVersion, LocalParams};
use crate::ln::msgs::DecodeError;
use crate::util::ser::{Readable, Writeable, Writer};

/// A derivation path for per-channel keys, a sequence of child indexes below the node seed.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyPath(pub Vec<u32>);

impl Writeable for KeyPath {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.0.write(w)
	}
}
impl Readable for KeyPath {
	fn read<R: io::Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(KeyPath(Readable::read(r)?))
	}
}

/// Set of lightning keys needed to operate a channel as described in BOLT 3
#[derive(Clone)]
pub struct ChannelKeys {
	/// Private key of anchor tx
	pub funding_key: SecretKey,
	/// Local secret key for blinded revocation pubkey
	pub revocation_base_key: SecretKey,
	/// Local secret key used in commitment tx htlc outputs
	pub payment_base_key: SecretKey,
	/// Local secret key used in HTLC tx
	pub delayed_payment_base_key: SecretKey,
	/// Local htlc secret key used in commitment tx htlc outputs
	pub htlc_base_key: SecretKey,
	/// Commitment seed
	pub commitment_seed: [u8; 32],
}

/// A trait to describe an object which derives per-channel keys and signs channel transactions.
///
/// Implementations must be safe for concurrent use across channels, though each channel only ever
/// calls in synchronously from its own event processing.
pub trait KeysInterface {
	/// The derivation path for a channel's keys, given its immutable parameters. The channel
	/// version participates so that different commitment formats never share keys.
	///
	/// Implementations must return the same path for versions differing only in
	/// [`ChannelVersion::ZERO_RESERVE_BIT`]: that bit is not settled until accept_channel, after
	/// the funder has already derived its open_channel keys.
	fn channel_key_path(&self, local_params: &LocalParams, channel_version: ChannelVersion) -> KeyPath;
	/// The public key, under the 2-of-2 funding output, which is ours.
	fn funding_public_key(&self, channel_key_path: &KeyPath) -> PublicKey;
	/// Our revocation basepoint.
	fn revocation_basepoint(&self, channel_key_path: &KeyPath) -> PublicKey;
	/// Our payment basepoint, which the counterparty's commitment pays our main balance to.
	fn payment_point(&self, channel_key_path: &KeyPath) -> PublicKey;
	/// Our delayed-payment basepoint.
	fn delayed_payment_basepoint(&self, channel_key_path: &KeyPath) -> PublicKey;
	/// Our HTLC basepoint.
	fn htlc_basepoint(&self, channel_key_path: &KeyPath) -> PublicKey;
	/// Our per-commitment point at the given commitment number.
	fn commitment_point(&self, channel_key_path: &KeyPath, index: u64) -> PublicKey;
	/// The secret behind [`KeysInterface::commitment_point`], revealed to revoke the commitment.
	fn commitment_secret(&self, channel_key_path: &KeyPath, index: u64) -> [u8; 32];
	/// Signs a spend of the 2-of-2 funding output (ie a commitment transaction) with our funding
	/// key.
	fn sign_funding_spend(&self, channel_key_path: &KeyPath, tx: &Transaction, input_index: usize, redeem_script: &Script, amount_satoshis: u64) -> Signature;
	/// Signs a second-stage HTLC transaction with our HTLC key derived under the given
	/// per-commitment point.
	fn sign_htlc_tx(&self, channel_key_path: &KeyPath, per_commitment_point: &PublicKey, tx: &Transaction, input_index: usize, redeem_script: &Script, amount_satoshis: u64) -> Signature;
	/// Gets 32 bytes of entropy, unique per call.
	fn get_secure_random_bytes(&self) -> [u8; 32];
}

/// Simple [`KeysInterface`] implementation that takes a 32-byte seed and derives all channel keys
/// from it with SHA256 chains.
///
/// The seed MUST be backed up safely prior to use so that the keys can be re-created on restart;
/// your node_id and every channel key derive from it.
pub struct KeysManager {
	secp_ctx: Secp256k1<secp256k1::All>,
	seed: [u8; 32],
	unique_counter: AtomicUsize,
}

impl KeysManager {
	/// Constructs a KeysManager from a 32-byte seed. If the seed is in some way biased (eg your
	/// RNG is busted) this may panic (but more importantly, you will possibly lose funds).
	pub fn new(seed: &[u8; 32]) -> KeysManager {
		KeysManager {
			secp_ctx: Secp256k1::new(),
			seed: seed.clone(),
			unique_counter: AtomicUsize::new(0),
		}
	}

	/// The node secret derived from the seed; stable across restarts.
	pub fn node_secret(&self) -> SecretKey {
		let mut sha = Sha256::engine();
		sha.input(&self.seed);
		sha.input(&b"node secret"[..]);
		SecretKey::from_slice(&Sha256::from_engine(sha).to_byte_array()).expect("SHA-256 is busted")
	}

	/// Derives the full key set of one channel. Deterministic in the key path, so a restarted
	/// node re-derives the same keys.
	pub fn derive_channel_keys(&self, channel_key_path: &KeyPath) -> ChannelKeys {
		let mut sha = Sha256::engine();
		sha.input(&self.seed);
		for child in channel_key_path.0.iter() {
			sha.input(&child.to_be_bytes());
		}
		let channel_seed = Sha256::from_engine(sha).to_byte_array();

		let commitment_seed = {
			let mut sha = Sha256::engine();
			sha.input(&channel_seed);
			sha.input(&b"commitment seed"[..]);
			Sha256::from_engine(sha).to_byte_array()
		};
		macro_rules! key_step {
			($info: expr, $prev_key: expr) => {{
				let mut sha = Sha256::engine();
				sha.input(&channel_seed);
				sha.input(&$prev_key[..]);
				sha.input(&$info[..]);
				SecretKey::from_slice(&Sha256::from_engine(sha).to_byte_array()).expect("SHA-256 is busted")
			}}
		}
		let funding_key = key_step!(b"funding key", commitment_seed);
		let revocation_base_key = key_step!(b"revocation base key", funding_key.secret_bytes());
		let payment_base_key = key_step!(b"payment base key", revocation_base_key.secret_bytes());
		let delayed_payment_base_key = key_step!(b"delayed payment base key", payment_base_key.secret_bytes());
		let htlc_base_key = key_step!(b"HTLC base key", delayed_payment_base_key.secret_bytes());

		ChannelKeys {
			funding_key,
			revocation_base_key,
			payment_base_key,
			delayed_payment_base_key,
			htlc_base_key,
			commitment_seed,
		}
	}
}

impl KeysInterface for KeysManager {
	fn channel_key_path(&self, local_params: &LocalParams, channel_version: ChannelVersion) -> KeyPath {
		let mut path = local_params.funding_key_path.0.clone();
		// Fork the path on the commitment format so that a format upgrade never reuses keys.
		path.push(if channel_version.has_static_remotekey() { 1 } else { 0 });
		KeyPath(path)
	}

	fn funding_public_key(&self, channel_key_path: &KeyPath) -> PublicKey {
		PublicKey::from_secret_key(&self.secp_ctx, &self.derive_channel_keys(channel_key_path).funding_key)
	}

	fn revocation_basepoint(&self, channel_key_path: &KeyPath) -> PublicKey {
		PublicKey::from_secret_key(&self.secp_ctx, &self.derive_channel_keys(channel_key_path).revocation_base_key)
	}

	fn payment_point(&self, channel_key_path: &KeyPath) -> PublicKey {
		PublicKey::from_secret_key(&self.secp_ctx, &self.derive_channel_keys(channel_key_path).payment_base_key)
	}

	fn delayed_payment_basepoint(&self, channel_key_path: &KeyPath) -> PublicKey {
		PublicKey::from_secret_key(&self.secp_ctx, &self.derive_channel_keys(channel_key_path).delayed_payment_base_key)
	}

	fn htlc_basepoint(&self, channel_key_path: &KeyPath) -> PublicKey {
		PublicKey::from_secret_key(&self.secp_ctx, &self.derive_channel_keys(channel_key_path).htlc_base_key)
	}

	fn commitment_point(&self, channel_key_path: &KeyPath, index: u64) -> PublicKey {
		let secret = self.commitment_secret(channel_key_path, index);
		PublicKey::from_secret_key(&self.secp_ctx, &SecretKey::from_slice(&secret).expect("SHA-256 is busted"))
	}

	fn commitment_secret(&self, channel_key_path: &KeyPath, index: u64) -> [u8; 32] {
		let keys = self.derive_channel_keys(channel_key_path);
		// BOLT 3 secrets count down as the commitment number counts up.
		chan_utils::build_commitment_secret(&keys.commitment_seed, INITIAL_COMMITMENT_NUMBER - index)
	}

	fn sign_funding_spend(&self, channel_key_path: &KeyPath, tx: &Transaction, input_index: usize, redeem_script: &Script, amount_satoshis: u64) -> Signature {
		let keys = self.derive_channel_keys(channel_key_path);
		chan_utils::sign_input(&self.secp_ctx, tx, input_index, redeem_script, amount_satoshis, &keys.funding_key)
	}

	fn sign_htlc_tx(&self, channel_key_path: &KeyPath, per_commitment_point: &PublicKey, tx: &Transaction, input_index: usize, redeem_script: &Script, amount_satoshis: u64) -> Signature {
		let keys = self.derive_channel_keys(channel_key_path);
		let htlc_key = chan_utils::derive_private_key(&self.secp_ctx, per_commitment_point, &keys.htlc_base_key)
			.expect("SHA-256 is busted");
		chan_utils::sign_input(&self.secp_ctx, tx, input_index, redeem_script, amount_satoshis, &htlc_key)
	}

	fn get_secure_random_bytes(&self) -> [u8; 32] {
		// We only seriously intend to rely on the seed for true secure entropy; the counter just
		// ensures uniqueness within a run.
		let count = self.unique_counter.fetch_add(1, Ordering::AcqRel);
		let mut sha = Sha256::engine();
		sha.input(&self.seed);
		sha.input(&(count as u64).to_be_bytes());
		sha.input(&b"unique nonce"[..]);
		Sha256::from_engine(sha).to_byte_array()
	}
}

#[cfg(test)]
mod tests {
	use super::{KeyPath, KeysInterface, KeysManager};

	use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

	#[test]
	fn key_derivation_is_deterministic() {
		let manager = KeysManager::new(&[42; 32]);
		let other = KeysManager::new(&[42; 32]);
		let path = KeyPath(vec![1, 2, 3]);
		assert_eq!(manager.funding_public_key(&path), other.funding_public_key(&path));
		assert_eq!(manager.commitment_point(&path, 7), other.commitment_point(&path, 7));
		assert_ne!(manager.funding_public_key(&path), manager.funding_public_key(&KeyPath(vec![1, 2, 4])));
	}

	#[test]
	fn commitment_secret_matches_point() {
		let secp_ctx = Secp256k1::new();
		let manager = KeysManager::new(&[9; 32]);
		let path = KeyPath(vec![4]);
		for index in 0..5 {
			let secret = SecretKey::from_slice(&manager.commitment_secret(&path, index)).unwrap();
			assert_eq!(PublicKey::from_secret_key(&secp_ctx, &secret), manager.commitment_point(&path, index));
		}
	}

	#[test]
	fn random_bytes_are_unique() {
		let manager = KeysManager::new(&[3; 32]);
		assert_ne!(manager.get_secure_random_bytes(), manager.get_secure_random_bytes());
	}
}

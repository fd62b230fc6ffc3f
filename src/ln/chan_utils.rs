// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Various utilities for building scripts, deriving keys and assembling the transactions that
//! make up a channel commitment, as described in BOLT #3.

use bitcoin::blockdata::locktime::absolute::LockTime;
use bitcoin::blockdata::opcodes;
use bitcoin::blockdata::script::{Builder, Script, ScriptBuf};
use bitcoin::blockdata::transaction::{OutPoint, Transaction, TxIn, TxOut};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{PubkeyHash, Sequence, WPubkeyHash, Witness};

use bitcoin::hashes::{Hash, HashEngine};
use bitcoin::hashes::ripemd160::Hash as Ripemd160;
use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hash_types::Txid;

use bitcoin::secp256k1::{self, Message, Scalar, Secp256k1};
use bitcoin::secp256k1::{PublicKey, SecretKey};
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::Error as SecpError;

use std::io;

use crate::ln::PaymentHash;
use crate::ln::msgs::DecodeError;
use crate::util::errors::ChannelError;
use crate::util::ser::{Readable, Writeable, Writer};

/// Converts a 32-byte hash into a signable secp256k1 message. Hashes are always valid field
/// elements, so this cannot actually fail.
macro_rules! hash_to_message {
	($slice: expr) => {
		Message::from_slice($slice).unwrap()
	}
}

/// The weight of an HTLC-Success transaction.
pub const HTLC_SUCCESS_TX_WEIGHT: u64 = 703;
/// The weight of an HTLC-Timeout transaction.
pub const HTLC_TIMEOUT_TX_WEIGHT: u64 = 663;
/// The weight of a commitment transaction with neither HTLC output nor either main output.
pub const COMMITMENT_TX_BASE_WEIGHT: u64 = 724;
/// The weight each untrimmed HTLC output adds to a commitment transaction.
pub const COMMITMENT_TX_WEIGHT_PER_HTLC: u64 = 172;

/// Commitment numbers are 48 bits; secrets are indexed downward from here as the commitment
/// number counts up.
pub const INITIAL_COMMITMENT_NUMBER: u64 = (1 << 48) - 1;

/// Fee, in satoshis, carried by a transaction of the given weight at the given feerate.
pub fn weight_to_fee_sat(weight: u64, feerate_per_kw: u32) -> u64 {
	weight * feerate_per_kw as u64 / 1000
}

/// Fee of a commitment transaction carrying the given number of untrimmed HTLCs, in satoshis.
pub fn commit_tx_fee_sat(feerate_per_kw: u32, num_untrimmed_htlcs: usize) -> u64 {
	weight_to_fee_sat(COMMITMENT_TX_BASE_WEIGHT + num_untrimmed_htlcs as u64 * COMMITMENT_TX_WEIGHT_PER_HTLC, feerate_per_kw)
}

/// Fee of an HTLC-Timeout transaction, in satoshis.
pub fn htlc_timeout_tx_fee_sat(feerate_per_kw: u32) -> u64 {
	weight_to_fee_sat(HTLC_TIMEOUT_TX_WEIGHT, feerate_per_kw)
}

/// Fee of an HTLC-Success transaction, in satoshis.
pub fn htlc_success_tx_fee_sat(feerate_per_kw: u32) -> u64 {
	weight_to_fee_sat(HTLC_SUCCESS_TX_WEIGHT, feerate_per_kw)
}

/// The value below which an offered (outgoing from the broadcaster) HTLC is trimmed from the
/// commitment transaction, as its second-stage HTLC-Timeout output would be dust.
pub fn offered_htlc_trim_threshold_sat(dust_limit_satoshis: u64, feerate_per_kw: u32) -> u64 {
	dust_limit_satoshis + htlc_timeout_tx_fee_sat(feerate_per_kw)
}

/// The value below which a received (incoming to the broadcaster) HTLC is trimmed from the
/// commitment transaction.
pub fn received_htlc_trim_threshold_sat(dust_limit_satoshis: u64, feerate_per_kw: u32) -> u64 {
	dust_limit_satoshis + htlc_success_tx_fee_sat(feerate_per_kw)
}

/// Build the commitment secret from the seed and the commitment number
pub fn build_commitment_secret(commitment_seed: &[u8; 32], idx: u64) -> [u8; 32] {
	let mut res: [u8; 32] = commitment_seed.clone();
	for i in 0..48 {
		let bitpos = 47 - i;
		if idx & (1 << bitpos) == (1 << bitpos) {
			res[bitpos / 8] ^= 1 << (bitpos & 7);
			res = Sha256::hash(&res).to_byte_array();
		}
	}
	res
}

/// Implements the per-commitment secret storage scheme from
/// [BOLT #3](https://github.com/lightning/bolts/blob/master/03-transactions.md#efficient-per-commitment-secret-storage).
///
/// Allows us to keep track of all of the revocation secrets of our counterparty in just 50*32
/// bytes or so.
#[derive(Clone, PartialEq)]
pub struct CommitmentSecrets {
	old_secrets: [([u8; 32], u64); 49],
}

impl std::fmt::Debug for CommitmentSecrets {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		// Never print secrets; the minimum index identifies the chain position.
		f.debug_struct("CommitmentSecrets")
			.field("min_seen_secret", &self.get_min_seen_secret())
			.finish()
	}
}

impl CommitmentSecrets {
	/// Creates a new, empty, set of secrets
	pub fn new() -> Self {
		Self { old_secrets: [([0; 32], 1 << 48); 49] }
	}

	#[inline]
	fn place_secret(idx: u64) -> u8 {
		for i in 0..48 {
			if idx & (1 << i) == (1 << i) {
				return i;
			}
		}
		48
	}

	/// Returns the minimum index of all stored secrets. Note that indexes start
	/// at 1 << 48 and get decremented by one for each new secret.
	pub fn get_min_seen_secret(&self) -> u64 {
		self.old_secrets.iter().map(|&(_, idx)| idx).min().unwrap_or(1 << 48)
	}

	#[inline]
	fn derive_secret(secret: [u8; 32], bits: u8, idx: u64) -> [u8; 32] {
		let mut res: [u8; 32] = secret;
		for i in 0..bits {
			let bitpos = bits - 1 - i;
			if idx & (1 << bitpos) == (1 << bitpos) {
				res[(bitpos / 8) as usize] ^= 1 << (bitpos & 7);
				res = Sha256::hash(&res).to_byte_array();
			}
		}
		res
	}

	/// Inserts the `secret` at `idx`. Returns `Ok(())` if the secret
	/// was generated in accordance with BOLT 3 and is consistent with previous secrets.
	pub fn provide_secret(&mut self, idx: u64, secret: [u8; 32]) -> Result<(), ()> {
		let pos = Self::place_secret(idx);
		for i in 0..pos {
			let (old_secret, old_idx) = self.old_secrets[i as usize];
			if Self::derive_secret(secret, pos, old_idx) != old_secret {
				return Err(());
			}
		}
		if self.get_min_seen_secret() <= idx {
			return Ok(());
		}
		self.old_secrets[pos as usize] = (secret, idx);
		Ok(())
	}

	/// Returns the secret at `idx`.
	/// Returns `None` if `idx` is < [`CommitmentSecrets::get_min_seen_secret`].
	pub fn get_secret(&self, idx: u64) -> Option<[u8; 32]> {
		for i in 0..self.old_secrets.len() {
			if (idx & (!((1 << i) - 1))) == self.old_secrets[i].1 {
				return Some(Self::derive_secret(self.old_secrets[i].0, i as u8, idx));
			}
		}
		debug_assert!(idx < self.get_min_seen_secret());
		None
	}
}

impl Writeable for CommitmentSecrets {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		for &(ref secret, ref idx) in self.old_secrets.iter() {
			w.write_all(secret)?;
			idx.write(w)?;
		}
		Ok(())
	}
}
impl Readable for CommitmentSecrets {
	fn read<R: io::Read>(r: &mut R) -> Result<Self, DecodeError> {
		let mut old_secrets = [([0; 32], 1 << 48); 49];
		for &mut (ref mut secret, ref mut idx) in old_secrets.iter_mut() {
			*secret = Readable::read(r)?;
			*idx = Readable::read(r)?;
		}
		Ok(Self { old_secrets })
	}
}

/// Derives a per-commitment-transaction public key (eg an htlc key or a delayed_payment key)
/// from the base point and the per_commitment_point. This is the public equivalent of
/// derive_private_key - using only public keys to derive a public key instead of private keys.
///
/// Note that this is infallible iff we trust that at least one of the two input keys are randomly
/// generated (ie our own).
pub fn derive_public_key<T: secp256k1::Signing>(secp_ctx: &Secp256k1<T>, per_commitment_point: &PublicKey, base_point: &PublicKey) -> Result<PublicKey, SecpError> {
	let mut sha = Sha256::engine();
	sha.input(&per_commitment_point.serialize());
	sha.input(&base_point.serialize());
	let res = Sha256::from_engine(sha).to_byte_array();

	let hashkey = PublicKey::from_secret_key(secp_ctx, &SecretKey::from_slice(&res)?);
	base_point.combine(&hashkey)
}

/// Derives a per-commitment-transaction private key (eg an htlc key or delayed_payment key)
/// from the base secret and the per_commitment_point.
///
/// Note that this is infallible iff we trust that at least one of the two input keys are randomly
/// generated (ie our own).
pub fn derive_private_key<T: secp256k1::Signing>(secp_ctx: &Secp256k1<T>, per_commitment_point: &PublicKey, base_secret: &SecretKey) -> Result<SecretKey, SecpError> {
	let mut sha = Sha256::engine();
	sha.input(&per_commitment_point.serialize());
	sha.input(&PublicKey::from_secret_key(secp_ctx, base_secret).serialize());
	let res = Sha256::from_engine(sha).to_byte_array();

	let tweak = Scalar::from_be_bytes(res).map_err(|_| SecpError::InvalidTweak)?;
	base_secret.clone().add_tweak(&tweak)
}

/// Derives a per-commitment-transaction revocation public key from its constituent parts. This is
/// the public equivalent of derive_private_revocation_key - using only public keys to derive a
/// public key instead of private keys.
///
/// Only the cheating participant owns a valid witness to propagate a revoked
/// commitment transaction, thus per_commitment_point always comes from the cheater
/// and revocation_base_point always comes from the punisher, which is the broadcaster
/// of the transaction spending with this key knowledge.
pub fn derive_public_revocation_key<T: secp256k1::Verification>(secp_ctx: &Secp256k1<T>, per_commitment_point: &PublicKey, countersignatory_revocation_base_point: &PublicKey) -> Result<PublicKey, SecpError> {
	let rev_append_commit_hash_key = {
		let mut sha = Sha256::engine();
		sha.input(&countersignatory_revocation_base_point.serialize());
		sha.input(&per_commitment_point.serialize());
		Sha256::from_engine(sha).to_byte_array()
	};
	let commit_append_rev_hash_key = {
		let mut sha = Sha256::engine();
		sha.input(&per_commitment_point.serialize());
		sha.input(&countersignatory_revocation_base_point.serialize());
		Sha256::from_engine(sha).to_byte_array()
	};

	let countersignatory_contrib = countersignatory_revocation_base_point.mul_tweak(secp_ctx,
		&Scalar::from_be_bytes(rev_append_commit_hash_key).map_err(|_| SecpError::InvalidTweak)?)?;
	let broadcaster_contrib = per_commitment_point.mul_tweak(secp_ctx,
		&Scalar::from_be_bytes(commit_append_rev_hash_key).map_err(|_| SecpError::InvalidTweak)?)?;
	countersignatory_contrib.combine(&broadcaster_contrib)
}

/// One counterparty's public keys which do not change over the life of a channel.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelPublicKeys {
	/// The public key which is used to sign all commitment transactions, as it appears in the
	/// on-chain channel lock-in 2-of-2 multisig output.
	pub funding_pubkey: PublicKey,
	/// The base point which is used (with derive_public_revocation_key) to derive per-commitment
	/// revocation keys. This is combined with the per-commitment-secret generated by the
	/// counterparty to create a secret which the counterparty can reveal to revoke previous
	/// states.
	pub revocation_basepoint: PublicKey,
	/// The base point from which the non-broadcaster's main output is derived on the
	/// broadcaster's commitment transaction. With `option_static_remotekey` the output pays to
	/// this point directly, with no per-commitment derivation.
	pub payment_basepoint: PublicKey,
	/// The base point which is used (with derive_public_key) to derive a per-commitment payment
	/// public key which receives non-HTLC-encumbered funds which are only available for spending
	/// after some delay (or can be claimed via the revocation path).
	pub delayed_payment_basepoint: PublicKey,
	/// The base point which is used (with derive_public_key) to derive a per-commitment public key
	/// which is used to encumber HTLC-in-flight outputs.
	pub htlc_basepoint: PublicKey,
}

impl_writeable!(ChannelPublicKeys, {
	funding_pubkey,
	revocation_basepoint,
	payment_basepoint,
	delayed_payment_basepoint,
	htlc_basepoint
});

/// The set of public keys which are used in the creation of one commitment transaction.
/// These are derived from the channel base keys and per-commitment data.
///
/// A broadcaster key is provided from potential broadcaster of the computed transaction.
/// A countersignatory key is coming from a protocol participant unable to broadcast the
/// transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct TxCreationKeys {
	/// The broadcaster's per-commitment public key which was used to derive the other keys.
	pub per_commitment_point: PublicKey,
	/// The revocation key which is used to allow the broadcaster of the commitment
	/// transaction to provide their counterparty the ability to punish them if they broadcast
	/// an old state.
	pub revocation_key: PublicKey,
	/// Broadcaster's HTLC Key
	pub broadcaster_htlc_key: PublicKey,
	/// Countersignatory's HTLC Key
	pub countersignatory_htlc_key: PublicKey,
	/// Broadcaster's Payment Key (which isn't allowed to be spent from for some delay)
	pub broadcaster_delayed_payment_key: PublicKey,
	/// The key the countersignatory's main output pays to. Derived per commitment, or the raw
	/// payment basepoint under `option_static_remotekey`.
	pub countersignatory_payment_key: PublicKey,
}

impl TxCreationKeys {
	/// Create per-commitment keys for a transaction the owner of `broadcaster_pubkeys` would
	/// broadcast, from both parties' channel base points and the broadcaster's per-commitment
	/// point.
	pub fn derive_new<T: secp256k1::Signing + secp256k1::Verification>(
		secp_ctx: &Secp256k1<T>, per_commitment_point: &PublicKey,
		broadcaster_pubkeys: &ChannelPublicKeys, countersignatory_pubkeys: &ChannelPublicKeys,
		static_remotekey: bool,
	) -> Result<TxCreationKeys, SecpError> {
		Ok(TxCreationKeys {
			per_commitment_point: per_commitment_point.clone(),
			revocation_key: derive_public_revocation_key(secp_ctx, per_commitment_point, &countersignatory_pubkeys.revocation_basepoint)?,
			broadcaster_htlc_key: derive_public_key(secp_ctx, per_commitment_point, &broadcaster_pubkeys.htlc_basepoint)?,
			countersignatory_htlc_key: derive_public_key(secp_ctx, per_commitment_point, &countersignatory_pubkeys.htlc_basepoint)?,
			broadcaster_delayed_payment_key: derive_public_key(secp_ctx, per_commitment_point, &broadcaster_pubkeys.delayed_payment_basepoint)?,
			countersignatory_payment_key: if static_remotekey {
				countersignatory_pubkeys.payment_basepoint.clone()
			} else {
				derive_public_key(secp_ctx, per_commitment_point, &countersignatory_pubkeys.payment_basepoint)?
			},
		})
	}
}

/// A script either spendable by the revocation
/// key or the broadcaster_delayed_payment_key and satisfying the relative-locktime OP_CSV constrain.
/// Encumbering a `to_local` output on a commitment transaction or 2nd-stage HTLC transactions.
pub fn get_revokeable_redeemscript(revocation_key: &PublicKey, contest_delay: u16, broadcaster_delayed_payment_key: &PublicKey) -> ScriptBuf {
	Builder::new().push_opcode(opcodes::all::OP_IF)
	              .push_slice(&revocation_key.serialize())
	              .push_opcode(opcodes::all::OP_ELSE)
	              .push_int(contest_delay as i64)
	              .push_opcode(opcodes::all::OP_CSV)
	              .push_opcode(opcodes::all::OP_DROP)
	              .push_slice(&broadcaster_delayed_payment_key.serialize())
	              .push_opcode(opcodes::all::OP_ENDIF)
	              .push_opcode(opcodes::all::OP_CHECKSIG)
	              .into_script()
}

/// Information about an HTLC as it appears in a commitment transaction
#[derive(Clone, Debug, PartialEq)]
pub struct HTLCOutputInCommitment {
	/// Whether the HTLC was "offered" (ie outbound in relation to this commitment transaction).
	/// Note that this is not the same as whether it is outbound *from us*. To determine that you
	/// need to compare this value to whether the commitment transaction in question is that of
	/// the counterparty or our own.
	pub offered: bool,
	/// The value, in msat, of the HTLC. The value as it appears in the commitment transaction is
	/// this divided by 1000.
	pub amount_msat: u64,
	/// The CLTV lock-time at which this HTLC expires.
	pub cltv_expiry: u32,
	/// The hash of the preimage which unlocks this HTLC.
	pub payment_hash: PaymentHash,
	/// The position within the commitment transactions' outputs. This may be None if the value is
	/// below the dust limit (in which case no output appears in the commitment transaction and the
	/// value is spent to additional transaction fees).
	pub transaction_output_index: Option<u32>,
}

impl_writeable!(HTLCOutputInCommitment, {
	offered,
	amount_msat,
	cltv_expiry,
	payment_hash,
	transaction_output_index
});

#[inline]
pub(crate) fn get_htlc_redeemscript_with_explicit_keys(htlc: &HTLCOutputInCommitment, broadcaster_htlc_key: &PublicKey, countersignatory_htlc_key: &PublicKey, revocation_key: &PublicKey) -> ScriptBuf {
	let payment_hash160 = Ripemd160::hash(&htlc.payment_hash.0[..]).to_byte_array();
	if htlc.offered {
		Builder::new().push_opcode(opcodes::all::OP_DUP)
		              .push_opcode(opcodes::all::OP_HASH160)
		              .push_slice(&PubkeyHash::hash(&revocation_key.serialize()).to_byte_array())
		              .push_opcode(opcodes::all::OP_EQUAL)
		              .push_opcode(opcodes::all::OP_IF)
		              .push_opcode(opcodes::all::OP_CHECKSIG)
		              .push_opcode(opcodes::all::OP_ELSE)
		              .push_slice(&countersignatory_htlc_key.serialize())
		              .push_opcode(opcodes::all::OP_SWAP)
		              .push_opcode(opcodes::all::OP_SIZE)
		              .push_int(32)
		              .push_opcode(opcodes::all::OP_EQUAL)
		              .push_opcode(opcodes::all::OP_NOTIF)
		              .push_opcode(opcodes::all::OP_DROP)
		              .push_int(2)
		              .push_opcode(opcodes::all::OP_SWAP)
		              .push_slice(&broadcaster_htlc_key.serialize())
		              .push_int(2)
		              .push_opcode(opcodes::all::OP_CHECKMULTISIG)
		              .push_opcode(opcodes::all::OP_ELSE)
		              .push_opcode(opcodes::all::OP_HASH160)
		              .push_slice(&payment_hash160)
		              .push_opcode(opcodes::all::OP_EQUALVERIFY)
		              .push_opcode(opcodes::all::OP_CHECKSIG)
		              .push_opcode(opcodes::all::OP_ENDIF)
		              .push_opcode(opcodes::all::OP_ENDIF)
		              .into_script()
	} else {
		Builder::new().push_opcode(opcodes::all::OP_DUP)
		              .push_opcode(opcodes::all::OP_HASH160)
		              .push_slice(&PubkeyHash::hash(&revocation_key.serialize()).to_byte_array())
		              .push_opcode(opcodes::all::OP_EQUAL)
		              .push_opcode(opcodes::all::OP_IF)
		              .push_opcode(opcodes::all::OP_CHECKSIG)
		              .push_opcode(opcodes::all::OP_ELSE)
		              .push_slice(&countersignatory_htlc_key.serialize())
		              .push_opcode(opcodes::all::OP_SWAP)
		              .push_opcode(opcodes::all::OP_SIZE)
		              .push_int(32)
		              .push_opcode(opcodes::all::OP_EQUAL)
		              .push_opcode(opcodes::all::OP_IF)
		              .push_opcode(opcodes::all::OP_HASH160)
		              .push_slice(&payment_hash160)
		              .push_opcode(opcodes::all::OP_EQUALVERIFY)
		              .push_int(2)
		              .push_opcode(opcodes::all::OP_SWAP)
		              .push_slice(&broadcaster_htlc_key.serialize())
		              .push_int(2)
		              .push_opcode(opcodes::all::OP_CHECKMULTISIG)
		              .push_opcode(opcodes::all::OP_ELSE)
		              .push_opcode(opcodes::all::OP_DROP)
		              .push_int(htlc.cltv_expiry as i64)
		              .push_opcode(opcodes::all::OP_CLTV)
		              .push_opcode(opcodes::all::OP_DROP)
		              .push_opcode(opcodes::all::OP_CHECKSIG)
		              .push_opcode(opcodes::all::OP_ENDIF)
		              .push_opcode(opcodes::all::OP_ENDIF)
		              .into_script()
	}
}

/// Gets the witness redeemscript for an HTLC output in a commitment transaction. Note that htlc
/// does not need to have its transaction_output_index filled.
#[inline]
pub fn get_htlc_redeemscript(htlc: &HTLCOutputInCommitment, keys: &TxCreationKeys) -> ScriptBuf {
	get_htlc_redeemscript_with_explicit_keys(htlc, &keys.broadcaster_htlc_key, &keys.countersignatory_htlc_key, &keys.revocation_key)
}

/// Gets the redeemscript for a funding output from the two funding public keys.
/// Note that the order of funding public keys does not matter.
pub fn make_funding_redeemscript(broadcaster: &PublicKey, countersignatory: &PublicKey) -> ScriptBuf {
	let broadcaster_funding_key = broadcaster.serialize();
	let countersignatory_funding_key = countersignatory.serialize();

	let builder = Builder::new().push_opcode(opcodes::all::OP_PUSHNUM_2);
	if broadcaster_funding_key[..] < countersignatory_funding_key[..] {
		builder.push_slice(&broadcaster_funding_key)
			.push_slice(&countersignatory_funding_key)
	} else {
		builder.push_slice(&countersignatory_funding_key)
			.push_slice(&broadcaster_funding_key)
	}.push_opcode(opcodes::all::OP_PUSHNUM_2).push_opcode(opcodes::all::OP_CHECKMULTISIG).into_script()
}

/// The funding output both commitment transactions spend, together with what is needed to spend
/// it.
#[derive(Clone, Debug, PartialEq)]
pub struct InputInfo {
	/// The funding outpoint
	pub outpoint: OutPoint,
	/// The funding output itself
	pub txout: TxOut,
	/// The 2-of-2 multisig redeemscript of the funding output
	pub redeem_script: ScriptBuf,
}

impl_writeable!(InputInfo, { outpoint, txout, redeem_script });

/// Gets the obscuring factor which both commitment transaction numbers are XORed with, computed
/// from both parties' payment basepoints, in channel-opening order.
pub fn get_commitment_transaction_number_obscure_factor(funder_payment_basepoint: &PublicKey, fundee_payment_basepoint: &PublicKey) -> u64 {
	let mut sha = Sha256::engine();
	sha.input(&funder_payment_basepoint.serialize());
	sha.input(&fundee_payment_basepoint.serialize());
	let res = Sha256::from_engine(sha).to_byte_array();

	((res[26] as u64) << 5 * 8)
		| ((res[27] as u64) << 4 * 8)
		| ((res[28] as u64) << 3 * 8)
		| ((res[29] as u64) << 2 * 8)
		| ((res[30] as u64) << 1 * 8)
		| ((res[31] as u64) << 0 * 8)
}

/// Everything needed to assemble one side's commitment transaction at one commitment number,
/// besides the HTLCs themselves.
pub struct CommitmentParams<'a> {
	/// The per-commitment transaction keys of the broadcasting side
	pub keys: &'a TxCreationKeys,
	/// The commitment number, counting up from zero
	pub commitment_number: u64,
	/// XOR mask for the commitment number, see [`get_commitment_transaction_number_obscure_factor`]
	pub obscure_factor: u64,
	/// The funding output being spent
	pub input: &'a InputInfo,
	/// The broadcaster's dust limit, below which outputs are trimmed
	pub dust_limit_satoshis: u64,
	/// The feerate of the commitment transaction, per 1000 weight
	pub feerate_per_kw: u32,
	/// The delay, selected by the countersignatory, on the broadcaster's to_local output
	pub contest_delay: u16,
	/// Whether the broadcaster funded the channel and therefore pays the commitment tx fee
	pub broadcaster_is_funder: bool,
}

/// Assembles an unsigned commitment transaction: trims dust HTLCs, subtracts the fee from the
/// funder's main output, and sorts outputs as BIP 69 plus CLTV tie-break require. Returns the
/// transaction along with a copy of the HTLCs annotated with their output index (`None` for
/// trimmed HTLCs, which stay enforceable off-chain but have no output).
///
/// `to_local_msat`/`to_remote_msat` and the offered/received directions in `htlcs` are all from
/// the broadcaster's point of view.
pub fn build_commitment_transaction(
	params: &CommitmentParams, to_local_msat: u64, to_remote_msat: u64, htlcs: &[HTLCOutputInCommitment],
) -> Result<(Transaction, Vec<HTLCOutputInCommitment>), ChannelError> {
	let mut htlcs = htlcs.to_vec();
	let mut num_untrimmed = 0;
	for htlc in htlcs.iter() {
		let threshold = if htlc.offered {
			offered_htlc_trim_threshold_sat(params.dust_limit_satoshis, params.feerate_per_kw)
		} else {
			received_htlc_trim_threshold_sat(params.dust_limit_satoshis, params.feerate_per_kw)
		};
		if htlc.amount_msat / 1000 >= threshold {
			num_untrimmed += 1;
		}
	}

	let fee_sat = commit_tx_fee_sat(params.feerate_per_kw, num_untrimmed);
	let (mut to_local_sat, mut to_remote_sat) = (to_local_msat / 1000, to_remote_msat / 1000);
	if params.broadcaster_is_funder {
		to_local_sat = to_local_sat.checked_sub(fee_sat)
			.ok_or_else(|| ChannelError::Protocol("funder cannot afford commitment tx fee".to_owned()))?;
	} else {
		to_remote_sat = to_remote_sat.checked_sub(fee_sat)
			.ok_or_else(|| ChannelError::Protocol("funder cannot afford commitment tx fee".to_owned()))?;
	}

	// (output, cltv for the htlc tie-break, index into htlcs)
	let mut txouts: Vec<(TxOut, u32, Option<usize>)> = Vec::with_capacity(htlcs.len() + 2);

	for (idx, htlc) in htlcs.iter().enumerate() {
		let threshold = if htlc.offered {
			offered_htlc_trim_threshold_sat(params.dust_limit_satoshis, params.feerate_per_kw)
		} else {
			received_htlc_trim_threshold_sat(params.dust_limit_satoshis, params.feerate_per_kw)
		};
		if htlc.amount_msat / 1000 >= threshold {
			txouts.push((TxOut {
				script_pubkey: get_htlc_redeemscript(htlc, params.keys).to_v0_p2wsh(),
				value: htlc.amount_msat / 1000,
			}, htlc.cltv_expiry, Some(idx)));
		}
	}

	if to_local_sat >= params.dust_limit_satoshis {
		txouts.push((TxOut {
			script_pubkey: get_revokeable_redeemscript(&params.keys.revocation_key, params.contest_delay, &params.keys.broadcaster_delayed_payment_key).to_v0_p2wsh(),
			value: to_local_sat,
		}, 0, None));
	}

	if to_remote_sat >= params.dust_limit_satoshis {
		txouts.push((TxOut {
			script_pubkey: ScriptBuf::new_v0_p2wpkh(&WPubkeyHash::hash(&params.keys.countersignatory_payment_key.serialize())),
			value: to_remote_sat,
		}, 0, None));
	}

	// BIP 69 ordering, with the CLTV expiry breaking ties between otherwise-identical HTLC
	// outputs so that both sides agree which HTLC signature belongs to which output.
	txouts.sort_unstable_by(|a, b| {
		a.0.value.cmp(&b.0.value)
			.then(a.0.script_pubkey.as_bytes().cmp(b.0.script_pubkey.as_bytes()))
			.then(a.1.cmp(&b.1))
	});

	let mut outputs = Vec::with_capacity(txouts.len());
	for (position, (txout, _, htlc_idx)) in txouts.into_iter().enumerate() {
		if let Some(idx) = htlc_idx {
			htlcs[idx].transaction_output_index = Some(position as u32);
		}
		outputs.push(txout);
	}

	let obscured_commitment_number = params.commitment_number ^ params.obscure_factor;
	let tx = Transaction {
		version: 2,
		lock_time: LockTime::from_consensus(((0x20 as u32) << 8 * 3) | ((obscured_commitment_number & 0xffffff) as u32)),
		input: vec![TxIn {
			previous_output: params.input.outpoint,
			script_sig: ScriptBuf::new(),
			sequence: Sequence(((0x80 as u32) << 8 * 3) | ((obscured_commitment_number >> 3 * 8) as u32)),
			witness: Witness::new(),
		}],
		output: outputs,
	};
	Ok((tx, htlcs))
}

/// Builds the second-stage HTLC-Success or HTLC-Timeout transaction for the HTLC at
/// `htlc.transaction_output_index`; panics if that is `None` (a dust HTLC has no output to
/// spend).
pub fn build_htlc_transaction(commitment_txid: &Txid, feerate_per_kw: u32, contest_delay: u16, htlc: &HTLCOutputInCommitment, broadcaster_delayed_payment_key: &PublicKey, revocation_key: &PublicKey) -> Transaction {
	let total_fee = if htlc.offered {
		htlc_timeout_tx_fee_sat(feerate_per_kw)
	} else {
		htlc_success_tx_fee_sat(feerate_per_kw)
	};

	Transaction {
		version: 2,
		lock_time: LockTime::from_consensus(if htlc.offered { htlc.cltv_expiry } else { 0 }),
		input: vec![TxIn {
			previous_output: OutPoint {
				txid: commitment_txid.clone(),
				vout: htlc.transaction_output_index.expect("can't build an HTLC transaction for a dust output"),
			},
			script_sig: ScriptBuf::new(),
			sequence: Sequence::ZERO,
			witness: Witness::new(),
		}],
		output: vec![TxOut {
			script_pubkey: get_revokeable_redeemscript(revocation_key, contest_delay, broadcaster_delayed_payment_key).to_v0_p2wsh(),
			value: htlc.amount_msat / 1000 - total_fee,
		}],
	}
}

/// The BIP 143 sighash of a segwit spend, as a signable message.
pub fn sighash(tx: &Transaction, input_index: usize, redeem_script: &Script, amount_satoshis: u64) -> Message {
	hash_to_message!(&SighashCache::new(tx)
		.segwit_signature_hash(input_index, redeem_script, amount_satoshis, EcdsaSighashType::All)
		.expect("input index out of bounds")[..])
}

/// Signs the given segwit input with `key` under SIGHASH_ALL.
pub fn sign_input<T: secp256k1::Signing>(secp_ctx: &Secp256k1<T>, tx: &Transaction, input_index: usize, redeem_script: &Script, amount_satoshis: u64, key: &SecretKey) -> Signature {
	secp_ctx.sign_ecdsa(&sighash(tx, input_index, redeem_script, amount_satoshis), key)
}

/// Checks a counterparty signature on the given segwit input.
pub fn verify_signature<T: secp256k1::Verification>(secp_ctx: &Secp256k1<T>, tx: &Transaction, input_index: usize, redeem_script: &Script, amount_satoshis: u64, sig: &Signature, key: &PublicKey) -> bool {
	secp_ctx.verify_ecdsa(&sighash(tx, input_index, redeem_script, amount_satoshis), sig, key).is_ok()
}

fn der_with_sighash_all(sig: &Signature) -> Vec<u8> {
	let mut ret = sig.serialize_der().to_vec();
	ret.push(EcdsaSighashType::All as u8);
	ret
}

/// Builds the witness spending the 2-of-2 funding output, ordering the signatures the way the
/// CHECKMULTISIG in [`make_funding_redeemscript`] expects them.
pub fn build_funding_witness(redeem_script: &Script, local_sig: &Signature, local_funding_key: &PublicKey, remote_sig: &Signature, remote_funding_key: &PublicKey) -> Witness {
	let mut witness = Witness::new();
	// Due to BIP147 (NULLDUMMY) the CHECKMULTISIG dummy must be a zero-length element.
	witness.push(Vec::new());
	if local_funding_key.serialize()[..] < remote_funding_key.serialize()[..] {
		witness.push(der_with_sighash_all(local_sig));
		witness.push(der_with_sighash_all(remote_sig));
	} else {
		witness.push(der_with_sighash_all(remote_sig));
		witness.push(der_with_sighash_all(local_sig));
	}
	witness.push(redeem_script.as_bytes().to_vec());
	witness
}

#[cfg(test)]
mod tests {
	use super::*;
	use bitcoin::hashes::hex::FromHex;

	fn secret_from_hex(hex: &str) -> [u8; 32] {
		let mut res = [0; 32];
		res.copy_from_slice(&<Vec<u8>>::from_hex(hex).unwrap());
		res
	}

	#[test]
	fn test_per_commitment_secret_generation() {
		// Test vectors from BOLT 3, "generation tests".
		let seed = [0; 32];
		assert_eq!(build_commitment_secret(&seed, 281474976710655),
			secret_from_hex("02a40c85b6f28da08dfdbe0926c53fab2de6d28c10301f8f7c4073d5e42e3148"));

		let seed = [0xff; 32];
		assert_eq!(build_commitment_secret(&seed, 281474976710655),
			secret_from_hex("7cc854b54e3e0dcdb010d7a3fee464a9687be6e8db3be6854c475621e007a5dc"));
	}

	#[test]
	fn test_per_commitment_storage() {
		// Test vectors from BOLT 3:
		let mut secrets: Vec<[u8; 32]> = Vec::new();
		let mut monitor;

		macro_rules! test_secrets {
			() => {
				let mut idx = 281474976710655;
				for secret in secrets.iter() {
					assert_eq!(monitor.get_secret(idx).unwrap(), *secret);
					idx -= 1;
				}
				assert_eq!(monitor.get_min_seen_secret(), idx + 1);
				assert!(monitor.get_secret(idx).is_none());
			};
		}

		{
			// insert_secret correct sequence
			monitor = CommitmentSecrets::new();
			secrets.clear();

			secrets.push(secret_from_hex("7cc854b54e3e0dcdb010d7a3fee464a9687be6e8db3be6854c475621e007a5dc"));
			monitor.provide_secret(281474976710655, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("c7518c8ae4660ed02894df8976fa1a3659c1a8b4b5bec0c4b872abeba4cb8964"));
			monitor.provide_secret(281474976710654, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("2273e227a5b7449b6e70f1fb4652864038b1cbf9cd7c043a7d6456b7fc275ad8"));
			monitor.provide_secret(281474976710653, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("27cddaa5624534cb6cb9d7da077cf2b22ab21e9b506fd4998a51d54502e99116"));
			monitor.provide_secret(281474976710652, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("c65716add7aa98ba7acb236352d665cab17345fe45b55fb879ff80e6bd0c41dd"));
			monitor.provide_secret(281474976710651, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("969660042a28f32d9be17344e09374b379962d03db1574df5a8a5a47e19ce3f2"));
			monitor.provide_secret(281474976710650, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("a5a64476122ca0925fb344bdc1854c1c0a59fc614298e50a33e331980a220f32"));
			monitor.provide_secret(281474976710649, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("05cde6323d949933f7f7b78776bcc1ea6d9b31447732e3802e1f7ac44b650e17"));
			monitor.provide_secret(281474976710648, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();
		}

		{
			// insert_secret #1 incorrect
			monitor = CommitmentSecrets::new();
			secrets.clear();

			secrets.push(secret_from_hex("02a40c85b6f28da08dfdbe0926c53fab2de6d28c10301f8f7c4073d5e42e3148"));
			monitor.provide_secret(281474976710655, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("c7518c8ae4660ed02894df8976fa1a3659c1a8b4b5bec0c4b872abeba4cb8964"));
			assert!(monitor.provide_secret(281474976710654, secrets.last().unwrap().clone()).is_err());
		}

		{
			// insert_secret #5 incorrect
			monitor = CommitmentSecrets::new();
			secrets.clear();

			secrets.push(secret_from_hex("7cc854b54e3e0dcdb010d7a3fee464a9687be6e8db3be6854c475621e007a5dc"));
			monitor.provide_secret(281474976710655, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("c7518c8ae4660ed02894df8976fa1a3659c1a8b4b5bec0c4b872abeba4cb8964"));
			monitor.provide_secret(281474976710654, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("2273e227a5b7449b6e70f1fb4652864038b1cbf9cd7c043a7d6456b7fc275ad8"));
			monitor.provide_secret(281474976710653, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("27cddaa5624534cb6cb9d7da077cf2b22ab21e9b506fd4998a51d54502e99116"));
			monitor.provide_secret(281474976710652, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("631373ad5f9ef654bb3dade742d09504c567edd24320d2fcd68e3cc47e2ff6a6"));
			monitor.provide_secret(281474976710651, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push(secret_from_hex("969660042a28f32d9be17344e09374b379962d03db1574df5a8a5a47e19ce3f2"));
			assert!(monitor.provide_secret(281474976710650, secrets.last().unwrap().clone()).is_err());
		}
	}

	#[test]
	fn derived_keys_are_consistent() {
		// The public derivation must agree with the private derivation.
		let secp_ctx = Secp256k1::new();
		let base_secret = SecretKey::from_slice(&[3; 32]).unwrap();
		let base_point = PublicKey::from_secret_key(&secp_ctx, &base_secret);
		let per_commitment_point = PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&[5; 32]).unwrap());

		let derived_secret = derive_private_key(&secp_ctx, &per_commitment_point, &base_secret).unwrap();
		let derived_point = derive_public_key(&secp_ctx, &per_commitment_point, &base_point).unwrap();
		assert_eq!(PublicKey::from_secret_key(&secp_ctx, &derived_secret), derived_point);
	}

	#[test]
	fn funding_redeemscript_orders_keys() {
		let secp_ctx = Secp256k1::new();
		let a = PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&[11; 32]).unwrap());
		let b = PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&[12; 32]).unwrap());
		// 2-of-2 multisig: OP_PUSHNUM_2 <33-byte key> <33-byte key> OP_PUSHNUM_2 OP_CHECKMULTISIG
		let script = make_funding_redeemscript(&a, &b);
		assert_eq!(script.len(), 1 + 34 + 34 + 1 + 1);
		assert_eq!(script, make_funding_redeemscript(&b, &a));
	}

	#[test]
	fn obscure_factor_fits_48_bits() {
		let secp_ctx = Secp256k1::new();
		let a = PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&[21; 32]).unwrap());
		let b = PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&[22; 32]).unwrap());
		let factor = get_commitment_transaction_number_obscure_factor(&a, &b);
		assert!(factor <= INITIAL_COMMITMENT_NUMBER);
		// Directional: swapping funder and fundee changes the factor.
		assert_ne!(factor, get_commitment_transaction_number_obscure_factor(&b, &a));
	}
}

// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The two-phase-commit bookkeeping of a live channel: both parties' current commitment
//! transactions, the pending HTLC change logs and the revocation chain.
//!
//! A [`Commitments`] is a plain serializable value; every operation returns a fresh copy (plus
//! whatever message must go to the peer) and leaves `self` untouched, so a failed operation
//! cannot corrupt channel state.

use bitcoin::blockdata::transaction::Transaction;
use bitcoin::hash_types::Txid;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::secp256k1::ecdsa::Signature;

use std::io;

use crate::chain::keysinterface::{KeyPath, KeysInterface};
use crate::ln::PaymentPreimage;
use crate::ln::chan_utils::{
	build_commitment_transaction, build_htlc_transaction, build_funding_witness,
	commit_tx_fee_sat, get_commitment_transaction_number_obscure_factor, get_htlc_redeemscript,
	offered_htlc_trim_threshold_sat, received_htlc_trim_threshold_sat, verify_signature,
	ChannelPublicKeys, CommitmentParams, CommitmentSecrets, HTLCOutputInCommitment, InputInfo,
	TxCreationKeys, INITIAL_COMMITMENT_NUMBER,
};
use crate::ln::channel_id::ChannelId;
use crate::ln::features::Features;
use crate::ln::msgs::{
	self, CommitmentSigned, RevokeAndACK, UpdateAddHTLC, UpdateFailHTLC, UpdateFailMalformedHTLC,
	UpdateFulfillHTLC,
};
use crate::util::errors::ChannelError;
use crate::util::ser::{Readable, Writeable, Writer};

/// The failure code bit which must be set in update_fail_malformed_htlc.
pub const BADONION: u16 = 0x8000;

/// The smallest relative CLTV expiry we allow on an outgoing HTLC.
pub const MIN_CLTV_EXPIRY_DELTA: u16 = 9;
/// The largest relative CLTV expiry we allow on an outgoing HTLC, roughly one week.
pub const MAX_CLTV_EXPIRY_DELTA: u16 = 7 * 144;

/// Bit flags tweaking the commitment format of a channel, fixed at open.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChannelVersion(u32);

impl ChannelVersion {
	/// The original commitment format.
	pub const STANDARD: ChannelVersion = ChannelVersion(0);
	/// Set when both sides advertised `option_static_remotekey`: the to_remote output pays the
	/// counterparty's payment basepoint with no per-commitment tweak.
	pub const USE_STATIC_REMOTEKEY_BIT: u32 = 1 << 0;
	/// Set when the channel was negotiated without reserves; the funding needs no confirmations.
	pub const ZERO_RESERVE_BIT: u32 = 1 << 1;

	/// Returns this version with [`ChannelVersion::USE_STATIC_REMOTEKEY_BIT`] set.
	pub fn with_static_remotekey(self) -> Self {
		ChannelVersion(self.0 | Self::USE_STATIC_REMOTEKEY_BIT)
	}

	/// Returns this version with [`ChannelVersion::ZERO_RESERVE_BIT`] set.
	pub fn with_zero_reserve(self) -> Self {
		ChannelVersion(self.0 | Self::ZERO_RESERVE_BIT)
	}

	/// Whether the to_remote output pays a static key.
	pub fn has_static_remotekey(&self) -> bool {
		self.0 & Self::USE_STATIC_REMOTEKEY_BIT != 0
	}

	/// Whether the channel runs without reserves.
	pub fn is_zero_reserve(&self) -> bool {
		self.0 & Self::ZERO_RESERVE_BIT != 0
	}
}

impl Writeable for ChannelVersion {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.0.write(w)
	}
}
impl Readable for ChannelVersion {
	fn read<R: io::Read>(r: &mut R) -> Result<Self, msgs::DecodeError> {
		Ok(ChannelVersion(Readable::read(r)?))
	}
}

/// Our own channel parameters, negotiated at open and immutable afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalParams {
	/// Below this, outputs on our commitment transaction are trimmed
	pub dust_limit_satoshis: u64,
	/// The most the counterparty may have in-flight towards us, in milli-satoshi
	pub max_htlc_value_in_flight_msat: u64,
	/// The reserve we require the counterparty to keep
	pub channel_reserve_satoshis: u64,
	/// The smallest HTLC we accept, in milli-satoshi
	pub htlc_minimum_msat: u64,
	/// The delay we impose on the counterparty's to_local output
	pub to_self_delay: u16,
	/// The most HTLCs the counterparty may have in-flight towards us
	pub max_accepted_htlcs: u16,
	/// Whether we funded (and therefore pay the on-chain fees of) the channel
	pub is_funder: bool,
	/// The derivation path of this channel's keys
	pub funding_key_path: KeyPath,
}

impl_writeable!(LocalParams, {
	dust_limit_satoshis,
	max_htlc_value_in_flight_msat,
	channel_reserve_satoshis,
	htlc_minimum_msat,
	to_self_delay,
	max_accepted_htlcs,
	is_funder,
	funding_key_path
});

/// The counterparty's channel parameters, taken from its open_channel/accept_channel.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteParams {
	/// Below this, outputs on the counterparty's commitment transaction are trimmed
	pub dust_limit_satoshis: u64,
	/// The most we may have in-flight towards the counterparty, in milli-satoshi
	pub max_htlc_value_in_flight_msat: u64,
	/// The reserve the counterparty requires us to keep
	pub channel_reserve_satoshis: u64,
	/// The smallest HTLC the counterparty accepts, in milli-satoshi
	pub htlc_minimum_msat: u64,
	/// The delay the counterparty imposes on our to_local output
	pub to_self_delay: u16,
	/// The most HTLCs we may have in-flight towards the counterparty
	pub max_accepted_htlcs: u16,
	/// The counterparty's channel basepoints
	pub pubkeys: ChannelPublicKeys,
	/// The feature set the counterparty advertised in its init
	pub features: Features,
}

impl_writeable!(RemoteParams, {
	dust_limit_satoshis,
	max_htlc_value_in_flight_msat,
	channel_reserve_satoshis,
	htlc_minimum_msat,
	to_self_delay,
	max_accepted_htlcs,
	pubkeys,
	features
});

/// The direction of an HTLC relative to the owner of the [`CommitmentSpec`] holding it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HtlcDirection {
	/// Offered to the spec owner; claiming it increases their balance
	Incoming,
	/// Offered by the spec owner
	Outgoing,
}

impl HtlcDirection {
	/// The same HTLC, seen from the other side of the channel.
	pub fn opposite(&self) -> HtlcDirection {
		match self {
			HtlcDirection::Incoming => HtlcDirection::Outgoing,
			HtlcDirection::Outgoing => HtlcDirection::Incoming,
		}
	}
}

impl Writeable for HtlcDirection {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		match self {
			HtlcDirection::Incoming => 0u8.write(w),
			HtlcDirection::Outgoing => 1u8.write(w),
		}
	}
}
impl Readable for HtlcDirection {
	fn read<R: io::Read>(r: &mut R) -> Result<Self, msgs::DecodeError> {
		match <u8 as Readable>::read(r)? {
			0 => Ok(HtlcDirection::Incoming),
			1 => Ok(HtlcDirection::Outgoing),
			_ => Err(msgs::DecodeError::InvalidValue),
		}
	}
}

/// An HTLC tagged with its direction relative to the commitment spec holding it.
#[derive(Clone, Debug, PartialEq)]
pub struct DirectedHtlc {
	/// Which way the HTLC goes
	pub direction: HtlcDirection,
	/// The add which created the HTLC
	pub add: UpdateAddHTLC,
}

impl_writeable!(DirectedHtlc, { direction, add });

/// One update to the channel state, flowing through the proposed/signed/acked logs until both
/// commitment transactions reflect it.
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateMessage {
	/// An update_add_htlc
	AddHtlc(UpdateAddHTLC),
	/// An update_fulfill_htlc
	FulfillHtlc(UpdateFulfillHTLC),
	/// An update_fail_htlc
	FailHtlc(UpdateFailHTLC),
	/// An update_fail_malformed_htlc
	FailMalformedHtlc(UpdateFailMalformedHTLC),
}

impl Writeable for UpdateMessage {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		match self {
			UpdateMessage::AddHtlc(msg) => { 0u8.write(w)?; msg.write(w) },
			UpdateMessage::FulfillHtlc(msg) => { 1u8.write(w)?; msg.write(w) },
			UpdateMessage::FailHtlc(msg) => { 2u8.write(w)?; msg.write(w) },
			UpdateMessage::FailMalformedHtlc(msg) => { 3u8.write(w)?; msg.write(w) },
		}
	}
}
impl Readable for UpdateMessage {
	fn read<R: io::Read>(r: &mut R) -> Result<Self, msgs::DecodeError> {
		match <u8 as Readable>::read(r)? {
			0 => Ok(UpdateMessage::AddHtlc(Readable::read(r)?)),
			1 => Ok(UpdateMessage::FulfillHtlc(Readable::read(r)?)),
			2 => Ok(UpdateMessage::FailHtlc(Readable::read(r)?)),
			3 => Ok(UpdateMessage::FailMalformedHtlc(Readable::read(r)?)),
			_ => Err(msgs::DecodeError::InvalidValue),
		}
	}
}

/// The balance allocation behind one commitment transaction, from its owner's point of view.
#[derive(Clone, Debug, PartialEq)]
pub struct CommitmentSpec {
	/// The pending HTLCs
	pub htlcs: Vec<DirectedHtlc>,
	/// The feerate of the commitment transaction, per 1000 weight
	pub feerate_per_kw: u32,
	/// The owner's balance, in milli-satoshi, before fees
	pub to_local_msat: u64,
	/// The counterparty's balance, in milli-satoshi, before fees
	pub to_remote_msat: u64,
}

impl_writeable!(CommitmentSpec, { htlcs, feerate_per_kw, to_local_msat, to_remote_msat });

impl CommitmentSpec {
	/// Finds the pending HTLC with the given direction and id.
	pub fn find_htlc(&self, direction: HtlcDirection, htlc_id: u64) -> Option<&DirectedHtlc> {
		self.htlcs.iter().find(|htlc| htlc.direction == direction && htlc.add.htlc_id == htlc_id)
	}

	/// The total channel value tracked by this spec: both balances plus everything in flight.
	pub fn total_msat(&self) -> u64 {
		self.to_local_msat + self.to_remote_msat
			+ self.htlcs.iter().map(|htlc| htlc.add.amount_msat).sum::<u64>()
	}

	fn add_htlc(&mut self, direction: HtlcDirection, add: &UpdateAddHTLC) -> Result<(), ChannelError> {
		match direction {
			HtlcDirection::Outgoing => {
				self.to_local_msat = self.to_local_msat.checked_sub(add.amount_msat)
					.ok_or_else(|| ChannelError::Protocol(format!("htlc {} overdraws the sender balance", add.htlc_id)))?;
			},
			HtlcDirection::Incoming => {
				self.to_remote_msat = self.to_remote_msat.checked_sub(add.amount_msat)
					.ok_or_else(|| ChannelError::Protocol(format!("htlc {} overdraws the sender balance", add.htlc_id)))?;
			},
		}
		self.htlcs.push(DirectedHtlc { direction, add: add.clone() });
		Ok(())
	}

	fn settle_htlc(&mut self, direction: HtlcDirection, htlc_id: u64, fulfilled: bool) -> Result<(), ChannelError> {
		let position = self.htlcs.iter().position(|htlc| htlc.direction == direction && htlc.add.htlc_id == htlc_id)
			.ok_or_else(|| ChannelError::Protocol(format!("settlement of unknown htlc {}", htlc_id)))?;
		let htlc = self.htlcs.remove(position);
		// A fulfilled HTLC pays its receiver, a failed one refunds its sender.
		match (htlc.direction, fulfilled) {
			(HtlcDirection::Incoming, true) => self.to_local_msat += htlc.add.amount_msat,
			(HtlcDirection::Incoming, false) => self.to_remote_msat += htlc.add.amount_msat,
			(HtlcDirection::Outgoing, true) => self.to_remote_msat += htlc.add.amount_msat,
			(HtlcDirection::Outgoing, false) => self.to_local_msat += htlc.add.amount_msat,
		}
		Ok(())
	}

	/// Applies pending change lists to this spec, producing the spec of the owner's next
	/// commitment transaction. `owner_changes` are updates sent by the owner of this spec,
	/// `counterparty_changes` the ones it received.
	pub fn reduce(&self, owner_changes: &[UpdateMessage], counterparty_changes: &[UpdateMessage]) -> Result<CommitmentSpec, ChannelError> {
		let mut spec = self.clone();
		for change in owner_changes.iter() {
			if let UpdateMessage::AddHtlc(add) = change {
				spec.add_htlc(HtlcDirection::Outgoing, add)?;
			}
		}
		for change in counterparty_changes.iter() {
			if let UpdateMessage::AddHtlc(add) = change {
				spec.add_htlc(HtlcDirection::Incoming, add)?;
			}
		}
		for change in owner_changes.iter() {
			match change {
				UpdateMessage::AddHtlc(_) => {},
				UpdateMessage::FulfillHtlc(msg) => spec.settle_htlc(HtlcDirection::Incoming, msg.htlc_id, true)?,
				UpdateMessage::FailHtlc(msg) => spec.settle_htlc(HtlcDirection::Incoming, msg.htlc_id, false)?,
				UpdateMessage::FailMalformedHtlc(msg) => spec.settle_htlc(HtlcDirection::Incoming, msg.htlc_id, false)?,
			}
		}
		for change in counterparty_changes.iter() {
			match change {
				UpdateMessage::AddHtlc(_) => {},
				UpdateMessage::FulfillHtlc(msg) => spec.settle_htlc(HtlcDirection::Outgoing, msg.htlc_id, true)?,
				UpdateMessage::FailHtlc(msg) => spec.settle_htlc(HtlcDirection::Outgoing, msg.htlc_id, false)?,
				UpdateMessage::FailMalformedHtlc(msg) => spec.settle_htlc(HtlcDirection::Outgoing, msg.htlc_id, false)?,
			}
		}
		Ok(spec)
	}

	/// The number of HTLCs which would actually appear as outputs on a commitment transaction
	/// built from this spec, given the broadcaster's dust limit.
	pub fn untrimmed_htlc_count(&self, dust_limit_satoshis: u64) -> usize {
		self.htlcs.iter().filter(|htlc| {
			let threshold = match htlc.direction {
				HtlcDirection::Outgoing => offered_htlc_trim_threshold_sat(dust_limit_satoshis, self.feerate_per_kw),
				HtlcDirection::Incoming => received_htlc_trim_threshold_sat(dust_limit_satoshis, self.feerate_per_kw),
			};
			htlc.add.amount_msat / 1000 >= threshold
		}).count()
	}

	/// The commitment transaction fee a funder pays on a commitment built from this spec, in
	/// milli-satoshi.
	pub fn commit_tx_fee_msat(&self, dust_limit_satoshis: u64) -> u64 {
		commit_tx_fee_sat(self.feerate_per_kw, self.untrimmed_htlc_count(dust_limit_satoshis)) * 1000
	}
}

/// Our current, fully signed commitment transaction and its HTLC transactions, ready to hit the
/// chain if the channel goes bad.
#[derive(Clone, Debug, PartialEq)]
pub struct PublishableTxs {
	/// Our commitment transaction, witness included
	pub commit_tx: Transaction,
	/// Its second-stage HTLC transactions and their signatures
	pub htlc_txs_and_sigs: Vec<HtlcTxAndSigs>,
}

impl_writeable!(PublishableTxs, { commit_tx, htlc_txs_and_sigs });

/// A second-stage HTLC transaction on our commitment, with both signatures needed to publish it.
#[derive(Clone, Debug, PartialEq)]
pub struct HtlcTxAndSigs {
	/// The unsigned HTLC-Success or HTLC-Timeout transaction
	pub tx: Transaction,
	/// Our signature
	pub local_sig: Signature,
	/// The counterparty's signature, received in its commitment_signed
	pub remote_sig: Signature,
}

impl_writeable!(HtlcTxAndSigs, { tx, local_sig, remote_sig });

/// Our side's current commitment.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalCommit {
	/// The commitment number, counting up from zero
	pub index: u64,
	/// The balance allocation, from our point of view
	pub spec: CommitmentSpec,
	/// The signed transactions we could publish now
	pub publishable_txs: PublishableTxs,
}

impl_writeable!(LocalCommit, { index, spec, publishable_txs });

/// The counterparty's current commitment. We never hold their fully signed transaction, just
/// enough to recognize it on-chain and to rebuild it for signing.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteCommit {
	/// The commitment number, counting up from zero
	pub index: u64,
	/// The balance allocation, from the counterparty's point of view
	pub spec: CommitmentSpec,
	/// The txid of the counterparty's commitment transaction
	pub txid: Txid,
	/// The per-commitment point the counterparty used for it
	pub remote_per_commitment_point: PublicKey,
}

impl_writeable!(RemoteCommit, { index, spec, txid, remote_per_commitment_point });

/// Updates we sent which the counterparty has not yet irrevocably committed to.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalChanges {
	/// Sent, but not yet included in one of our commitment_signed
	pub proposed: Vec<UpdateMessage>,
	/// Included in our latest commitment_signed, awaiting the counterparty's revocation
	pub signed: Vec<UpdateMessage>,
	/// Revoked by the counterparty, waiting to enter our own commitment
	pub acked: Vec<UpdateMessage>,
}

impl_writeable!(LocalChanges, { proposed, signed, acked });

impl LocalChanges {
	/// No changes at all.
	pub fn new() -> Self {
		LocalChanges { proposed: Vec::new(), signed: Vec::new(), acked: Vec::new() }
	}

	/// Every change, in proposal order.
	pub fn all(&self) -> Vec<UpdateMessage> {
		let mut ret = self.proposed.clone();
		ret.extend_from_slice(&self.signed);
		ret.extend_from_slice(&self.acked);
		ret
	}
}

/// Updates the counterparty sent us which are not yet irrevocably committed on both sides.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteChanges {
	/// Received, but not yet included in one of the counterparty's commitment_signed
	pub proposed: Vec<UpdateMessage>,
	/// Acknowledged by our revoke_and_ack, waiting to enter the counterparty's commitment
	pub acked: Vec<UpdateMessage>,
	/// Included in our latest commitment_signed to them, awaiting their revocation
	pub signed: Vec<UpdateMessage>,
}

impl_writeable!(RemoteChanges, { proposed, acked, signed });

impl RemoteChanges {
	/// No changes at all.
	pub fn new() -> Self {
		RemoteChanges { proposed: Vec::new(), acked: Vec::new(), signed: Vec::new() }
	}
}

/// The counterparty commitment we signed but which is not yet revoked, ie the state in the
/// middle of a commitment dance.
#[derive(Clone, Debug, PartialEq)]
pub struct WaitingForRevocation {
	/// The counterparty commitment our last commitment_signed signed off on
	pub next_remote_commit: RemoteCommit,
	/// Our own commitment index at the time we sent that commitment_signed
	pub sent_after_local_commit_index: u64,
	/// Set when a sign command arrived while this dance was in flight; we sign again as soon as
	/// the revocation comes in
	pub re_sign_asap: bool,
}

impl_writeable!(WaitingForRevocation, { next_remote_commit, sent_after_local_commit_index, re_sign_asap });

/// Either the commitment dance in flight, or the counterparty's next per-commitment point with
/// which we may start one.
#[derive(Clone, Debug, PartialEq)]
pub enum RemoteNextCommitInfo {
	/// We signed the counterparty's next commitment and await their revoke_and_ack
	WaitingForRevocation(WaitingForRevocation),
	/// Idle; the point to use for the counterparty's next commitment
	NextPoint(PublicKey),
}

impl RemoteNextCommitInfo {
	/// The counterparty's next per-commitment point, unless a dance is in flight.
	pub fn next_point(&self) -> Option<&PublicKey> {
		match self {
			RemoteNextCommitInfo::WaitingForRevocation(_) => None,
			RemoteNextCommitInfo::NextPoint(point) => Some(point),
		}
	}
}

impl Writeable for RemoteNextCommitInfo {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		match self {
			RemoteNextCommitInfo::WaitingForRevocation(waiting) => { 0u8.write(w)?; waiting.write(w) },
			RemoteNextCommitInfo::NextPoint(point) => { 1u8.write(w)?; point.write(w) },
		}
	}
}
impl Readable for RemoteNextCommitInfo {
	fn read<R: io::Read>(r: &mut R) -> Result<Self, msgs::DecodeError> {
		match <u8 as Readable>::read(r)? {
			0 => Ok(RemoteNextCommitInfo::WaitingForRevocation(Readable::read(r)?)),
			1 => Ok(RemoteNextCommitInfo::NextPoint(Readable::read(r)?)),
			_ => Err(msgs::DecodeError::InvalidValue),
		}
	}
}

/// Where an incoming HTLC came from, for relaying nodes. We are a leaf endpoint, so this stays
/// empty, but it is part of the persisted layout.
#[derive(Clone, Debug, PartialEq)]
pub struct HtlcOrigin {
	/// The id of the outgoing HTLC
	pub htlc_id: u64,
	/// The channel the matching incoming HTLC lives on
	pub origin_channel_id: ChannelId,
}

impl_writeable!(HtlcOrigin, { htlc_id, origin_channel_id });

/// An HTLC which may appear on a counterparty commitment transaction, recorded so that a watcher
/// can claim it should a revoked commitment hit the chain.
#[derive(Clone, Debug, PartialEq)]
pub struct HtlcInfo {
	/// The HTLC's payment hash
	pub payment_hash: crate::ln::PaymentHash,
	/// The HTLC's absolute expiry height
	pub cltv_expiry: u32,
}

impl_writeable!(HtlcInfo, { payment_hash, cltv_expiry });

/// Everything the channel knows once the funding transaction exists: parameters, both current
/// commitments, pending changes and the revocation chain.
#[derive(Clone, Debug, PartialEq)]
pub struct Commitments {
	/// The negotiated commitment format
	pub channel_version: ChannelVersion,
	/// Our parameters
	pub local_params: LocalParams,
	/// The counterparty's parameters
	pub remote_params: RemoteParams,
	/// The channel_flags byte from open_channel; bit 0 requests a public channel
	pub channel_flags: u8,
	/// Our current commitment
	pub local_commit: LocalCommit,
	/// The counterparty's current commitment
	pub remote_commit: RemoteCommit,
	/// Updates we sent, by phase
	pub local_changes: LocalChanges,
	/// Updates we received, by phase
	pub remote_changes: RemoteChanges,
	/// The id our next outgoing HTLC will carry
	pub local_next_htlc_id: u64,
	/// The id we expect on the counterparty's next HTLC
	pub remote_next_htlc_id: u64,
	/// The commitment dance state
	pub remote_next_commit_info: RemoteNextCommitInfo,
	/// The funding output
	pub commit_input: InputInfo,
	/// Every revocation secret the counterparty has revealed
	pub remote_per_commitment_secrets: CommitmentSecrets,
	/// Origins of relayed HTLCs; always empty on a leaf endpoint
	pub origin_channels: Vec<HtlcOrigin>,
	/// The channel id, derived from the funding outpoint
	pub channel_id: ChannelId,
}

impl_writeable!(Commitments, {
	channel_version,
	local_params,
	remote_params,
	channel_flags,
	local_commit,
	remote_commit,
	local_changes,
	remote_changes,
	local_next_htlc_id,
	remote_next_htlc_id,
	remote_next_commit_info,
	commit_input,
	remote_per_commitment_secrets,
	origin_channels,
	channel_id
});

/// The pieces of a freshly built commitment transaction.
pub(crate) struct CommitTxParts {
	/// The unsigned commitment transaction
	pub tx: Transaction,
	/// The spec's HTLCs annotated with their output indexes
	pub htlcs: Vec<HTLCOutputInCommitment>,
	/// The per-commitment keys the transaction was built for
	pub keys: TxCreationKeys,
}

/// Derives our channel basepoints from the key manager.
pub(crate) fn local_channel_pubkeys<K: KeysInterface>(keys: &K, key_path: &KeyPath) -> ChannelPublicKeys {
	ChannelPublicKeys {
		funding_pubkey: keys.funding_public_key(key_path),
		revocation_basepoint: keys.revocation_basepoint(key_path),
		payment_basepoint: keys.payment_point(key_path),
		delayed_payment_basepoint: keys.delayed_payment_basepoint(key_path),
		htlc_basepoint: keys.htlc_basepoint(key_path),
	}
}

/// Builds one side's commitment transaction. `spec` and `per_commitment_point` belong to the
/// broadcasting side, selected by `local_commit`.
pub(crate) fn make_commit_tx<K: KeysInterface>(
	keys: &K, local_commit: bool, commitment_number: u64, spec: &CommitmentSpec,
	per_commitment_point: &PublicKey, local_params: &LocalParams, remote_params: &RemoteParams,
	channel_version: ChannelVersion, commit_input: &InputInfo,
) -> Result<CommitTxParts, ChannelError> {
	let secp_ctx = Secp256k1::new();
	let key_path = keys.channel_key_path(local_params, channel_version);
	let local_pubkeys = local_channel_pubkeys(keys, &key_path);

	let (broadcaster_pubkeys, countersignatory_pubkeys, contest_delay, dust_limit_satoshis, broadcaster_is_funder) =
		if local_commit {
			(&local_pubkeys, &remote_params.pubkeys, remote_params.to_self_delay, local_params.dust_limit_satoshis, local_params.is_funder)
		} else {
			(&remote_params.pubkeys, &local_pubkeys, local_params.to_self_delay, remote_params.dust_limit_satoshis, !local_params.is_funder)
		};

	let tx_keys = TxCreationKeys::derive_new(&secp_ctx, per_commitment_point, broadcaster_pubkeys,
			countersignatory_pubkeys, channel_version.has_static_remotekey())
		.map_err(|_| ChannelError::Protocol("could not derive commitment keys".to_owned()))?;

	let (funder_payment_basepoint, fundee_payment_basepoint) = if local_params.is_funder {
		(&local_pubkeys.payment_basepoint, &remote_params.pubkeys.payment_basepoint)
	} else {
		(&remote_params.pubkeys.payment_basepoint, &local_pubkeys.payment_basepoint)
	};
	let obscure_factor = get_commitment_transaction_number_obscure_factor(funder_payment_basepoint, fundee_payment_basepoint);

	let htlcs: Vec<HTLCOutputInCommitment> = spec.htlcs.iter().map(|htlc| HTLCOutputInCommitment {
		offered: htlc.direction == HtlcDirection::Outgoing,
		amount_msat: htlc.add.amount_msat,
		cltv_expiry: htlc.add.cltv_expiry,
		payment_hash: htlc.add.payment_hash,
		transaction_output_index: None,
	}).collect();

	let params = CommitmentParams {
		keys: &tx_keys,
		commitment_number,
		obscure_factor,
		input: commit_input,
		dust_limit_satoshis,
		feerate_per_kw: spec.feerate_per_kw,
		contest_delay,
		broadcaster_is_funder,
	};
	let (tx, htlcs) = build_commitment_transaction(&params, spec.to_local_msat, spec.to_remote_msat, &htlcs)?;
	Ok(CommitTxParts { tx, htlcs, keys: tx_keys })
}

/// The initial commitment specs of a channel, local first, remote second.
pub(crate) fn make_first_commitment_specs(funding_satoshis: u64, push_msat: u64, feerate_per_kw: u32, local_is_funder: bool) -> (CommitmentSpec, CommitmentSpec) {
	let funding_msat = funding_satoshis * 1000;
	let to_funder_msat = funding_msat - push_msat;
	let (to_local_msat, to_remote_msat) = if local_is_funder {
		(to_funder_msat, push_msat)
	} else {
		(push_msat, to_funder_msat)
	};
	let local_spec = CommitmentSpec { htlcs: Vec::new(), feerate_per_kw, to_local_msat, to_remote_msat };
	let remote_spec = CommitmentSpec { htlcs: Vec::new(), feerate_per_kw, to_local_msat: to_remote_msat, to_remote_msat: to_local_msat };
	(local_spec, remote_spec)
}

impl Commitments {
	/// Whether we have changes which a commitment_signed of ours could pick up.
	pub fn local_has_changes(&self) -> bool {
		!self.remote_changes.acked.is_empty() || !self.local_changes.proposed.is_empty()
	}

	/// Whether the counterparty has changes which a commitment_signed of theirs could pick up.
	pub fn remote_has_changes(&self) -> bool {
		!self.local_changes.acked.is_empty() || !self.remote_changes.proposed.is_empty()
	}

	fn key_path<K: KeysInterface>(&self, keys: &K) -> KeyPath {
		keys.channel_key_path(&self.local_params, self.channel_version)
	}

	/// An HTLC which both commitments currently contain, looked up by its direction relative to
	/// us. Only such HTLCs may be settled.
	fn find_htlc_cross_signed(&self, direction: HtlcDirection, htlc_id: u64) -> Option<&UpdateAddHTLC> {
		let remote_commit = match &self.remote_next_commit_info {
			RemoteNextCommitInfo::WaitingForRevocation(waiting) => &waiting.next_remote_commit,
			RemoteNextCommitInfo::NextPoint(_) => &self.remote_commit,
		};
		let signed_by_remote = self.local_commit.spec.find_htlc(direction, htlc_id)?;
		remote_commit.spec.find_htlc(direction.opposite(), htlc_id)?;
		Some(&signed_by_remote.add)
	}

	/// Whether we already sent a settlement for the given incoming HTLC.
	fn settlement_pending(&self, htlc_id: u64) -> bool {
		self.local_changes.proposed.iter().chain(self.local_changes.signed.iter()).any(|change| match change {
			UpdateMessage::FulfillHtlc(msg) => msg.htlc_id == htlc_id,
			UpdateMessage::FailHtlc(msg) => msg.htlc_id == htlc_id,
			UpdateMessage::FailMalformedHtlc(msg) => msg.htlc_id == htlc_id,
			UpdateMessage::AddHtlc(_) => false,
		})
	}

	/// Adds a new outgoing HTLC, checking it against the counterparty's limits on the commitment
	/// transaction it will first appear in (their next one).
	pub fn send_add(&self, amount_msat: u64, payment_hash: crate::ln::PaymentHash, cltv_expiry: u32, onion_routing_packet: msgs::OnionPacket, block_height: u32) -> Result<(Commitments, UpdateAddHTLC), ChannelError> {
		if cltv_expiry <= block_height + MIN_CLTV_EXPIRY_DELTA as u32 {
			return Err(ChannelError::Protocol(format!("htlc expiry {} too close to the chain tip {}", cltv_expiry, block_height)));
		}
		if cltv_expiry > block_height + MAX_CLTV_EXPIRY_DELTA as u32 {
			return Err(ChannelError::Protocol(format!("htlc expiry {} too far in the future", cltv_expiry)));
		}
		if amount_msat < self.remote_params.htlc_minimum_msat {
			return Err(ChannelError::Protocol(format!("htlc value {} below the counterparty minimum", amount_msat)));
		}

		let add = UpdateAddHTLC {
			channel_id: self.channel_id,
			htlc_id: self.local_next_htlc_id,
			amount_msat,
			payment_hash,
			cltv_expiry,
			onion_routing_packet,
		};
		let mut commitments = self.clone();
		commitments.local_changes.proposed.push(UpdateMessage::AddHtlc(add.clone()));
		commitments.local_next_htlc_id += 1;

		// The new HTLC first appears on the counterparty's next commitment; enforce their limits
		// against that spec, with the whole unacked local backlog applied.
		let mut counterparty_changes = commitments.local_changes.proposed.clone();
		counterparty_changes.extend_from_slice(&commitments.local_changes.signed);
		let reduced = commitments.remote_commit.spec.reduce(&commitments.remote_changes.acked, &counterparty_changes)?;

		let in_flight_msat: u64 = reduced.htlcs.iter()
			.filter(|htlc| htlc.direction == HtlcDirection::Incoming)
			.map(|htlc| htlc.add.amount_msat).sum();
		if in_flight_msat > self.remote_params.max_htlc_value_in_flight_msat {
			return Err(ChannelError::Protocol(format!("in-flight htlcs of {} msat exceed the counterparty limit", in_flight_msat)));
		}
		let accepted = reduced.htlcs.iter().filter(|htlc| htlc.direction == HtlcDirection::Incoming).count();
		if accepted > self.remote_params.max_accepted_htlcs as usize {
			return Err(ChannelError::Protocol(format!("{} in-flight htlcs exceed the counterparty count limit", accepted)));
		}

		// In the counterparty's spec our balance is to_remote; it must cover the reserve they
		// imposed on us plus, if we are the funder, the commitment fee. If instead *they* fund
		// the channel, the growing fee of the new HTLC must not overdraw their side.
		let fees_msat = reduced.commit_tx_fee_msat(self.remote_params.dust_limit_satoshis);
		let sender_required_msat = self.remote_params.channel_reserve_satoshis * 1000
			+ if self.local_params.is_funder { fees_msat } else { 0 };
		if reduced.to_remote_msat < sender_required_msat {
			return Err(ChannelError::Protocol(format!(
				"insufficient funds: balance would drop to {} msat of {} msat required", reduced.to_remote_msat, sender_required_msat)));
		}
		if !self.local_params.is_funder {
			let receiver_required_msat = self.local_params.channel_reserve_satoshis * 1000 + fees_msat;
			if reduced.to_local_msat < receiver_required_msat {
				return Err(ChannelError::Protocol(
					"the funding counterparty cannot afford the fee of an additional htlc".to_owned()));
			}
		}

		Ok((commitments, add))
	}

	/// Takes in a counterparty HTLC, enforcing our limits on our own next commitment.
	pub fn receive_add(&self, msg: &UpdateAddHTLC) -> Result<Commitments, ChannelError> {
		if msg.htlc_id != self.remote_next_htlc_id {
			return Err(ChannelError::Protocol(format!("unexpected htlc id {}, expected {}", msg.htlc_id, self.remote_next_htlc_id)));
		}
		if msg.amount_msat < self.local_params.htlc_minimum_msat {
			return Err(ChannelError::Protocol(format!("htlc value {} below our minimum", msg.amount_msat)));
		}

		let mut commitments = self.clone();
		commitments.remote_changes.proposed.push(UpdateMessage::AddHtlc(msg.clone()));
		commitments.remote_next_htlc_id += 1;

		let reduced = commitments.local_commit.spec.reduce(&commitments.local_changes.acked, &commitments.remote_changes.proposed)?;

		let in_flight_msat: u64 = reduced.htlcs.iter()
			.filter(|htlc| htlc.direction == HtlcDirection::Incoming)
			.map(|htlc| htlc.add.amount_msat).sum();
		if in_flight_msat > self.local_params.max_htlc_value_in_flight_msat {
			return Err(ChannelError::Protocol(format!("in-flight htlcs of {} msat exceed our limit", in_flight_msat)));
		}
		let accepted = reduced.htlcs.iter().filter(|htlc| htlc.direction == HtlcDirection::Incoming).count();
		if accepted > self.local_params.max_accepted_htlcs as usize {
			return Err(ChannelError::Protocol(format!("{} in-flight htlcs exceed our count limit", accepted)));
		}

		let fees_msat = reduced.commit_tx_fee_msat(self.local_params.dust_limit_satoshis);
		let sender_required_msat = self.local_params.channel_reserve_satoshis * 1000
			+ if self.local_params.is_funder { 0 } else { fees_msat };
		if reduced.to_remote_msat < sender_required_msat {
			return Err(ChannelError::Protocol(format!(
				"insufficient remote funds: balance would drop to {} msat of {} msat required", reduced.to_remote_msat, sender_required_msat)));
		}
		if self.local_params.is_funder {
			let receiver_required_msat = self.remote_params.channel_reserve_satoshis * 1000 + fees_msat;
			if reduced.to_local_msat < receiver_required_msat {
				return Err(ChannelError::Protocol(
					"we cannot afford the fee of an additional incoming htlc".to_owned()));
			}
		}

		Ok(commitments)
	}

	/// Fulfills an incoming HTLC we have the preimage for.
	pub fn send_fulfill(&self, htlc_id: u64, payment_preimage: PaymentPreimage) -> Result<(Commitments, UpdateFulfillHTLC), ChannelError> {
		let htlc = self.find_htlc_cross_signed(HtlcDirection::Incoming, htlc_id)
			.ok_or_else(|| ChannelError::Protocol(format!("cannot settle unknown htlc {}", htlc_id)))?;
		if self.settlement_pending(htlc_id) {
			return Err(ChannelError::Protocol(format!("htlc {} is already being settled", htlc_id)));
		}
		if payment_preimage.payment_hash() != htlc.payment_hash {
			return Err(ChannelError::Protocol(format!("invalid preimage for htlc {}", htlc_id)));
		}
		let fulfill = UpdateFulfillHTLC { channel_id: self.channel_id, htlc_id, payment_preimage };
		let mut commitments = self.clone();
		commitments.local_changes.proposed.push(UpdateMessage::FulfillHtlc(fulfill.clone()));
		Ok((commitments, fulfill))
	}

	/// Takes in the counterparty's fulfillment of one of our outgoing HTLCs, returning the
	/// original add so the payment can be resolved.
	pub fn receive_fulfill(&self, msg: &UpdateFulfillHTLC) -> Result<(Commitments, UpdateAddHTLC), ChannelError> {
		let htlc = self.find_htlc_cross_signed(HtlcDirection::Outgoing, msg.htlc_id)
			.ok_or_else(|| ChannelError::Protocol(format!("fulfillment of unknown htlc {}", msg.htlc_id)))?
			.clone();
		if msg.payment_preimage.payment_hash() != htlc.payment_hash {
			return Err(ChannelError::Protocol(format!("invalid preimage for htlc {}", msg.htlc_id)));
		}
		let mut commitments = self.clone();
		commitments.remote_changes.proposed.push(UpdateMessage::FulfillHtlc(msg.clone()));
		Ok((commitments, htlc))
	}

	/// Fails an incoming HTLC.
	pub fn send_fail(&self, htlc_id: u64, reason: msgs::OnionErrorPacket) -> Result<(Commitments, UpdateFailHTLC), ChannelError> {
		self.find_htlc_cross_signed(HtlcDirection::Incoming, htlc_id)
			.ok_or_else(|| ChannelError::Protocol(format!("cannot settle unknown htlc {}", htlc_id)))?;
		if self.settlement_pending(htlc_id) {
			return Err(ChannelError::Protocol(format!("htlc {} is already being settled", htlc_id)));
		}
		let fail = UpdateFailHTLC { channel_id: self.channel_id, htlc_id, reason };
		let mut commitments = self.clone();
		commitments.local_changes.proposed.push(UpdateMessage::FailHtlc(fail.clone()));
		Ok((commitments, fail))
	}

	/// Takes in the counterparty's failure of one of our outgoing HTLCs.
	pub fn receive_fail(&self, msg: &UpdateFailHTLC) -> Result<(Commitments, UpdateAddHTLC), ChannelError> {
		let htlc = self.find_htlc_cross_signed(HtlcDirection::Outgoing, msg.htlc_id)
			.ok_or_else(|| ChannelError::Protocol(format!("failure of unknown htlc {}", msg.htlc_id)))?
			.clone();
		let mut commitments = self.clone();
		commitments.remote_changes.proposed.push(UpdateMessage::FailHtlc(msg.clone()));
		Ok((commitments, htlc))
	}

	/// Fails an incoming HTLC whose onion we could not even parse.
	pub fn send_fail_malformed(&self, htlc_id: u64, sha256_of_onion: [u8; 32], failure_code: u16) -> Result<(Commitments, UpdateFailMalformedHTLC), ChannelError> {
		if failure_code & BADONION == 0 {
			return Err(ChannelError::Protocol(format!("invalid failure code {} for a malformed htlc", failure_code)));
		}
		self.find_htlc_cross_signed(HtlcDirection::Incoming, htlc_id)
			.ok_or_else(|| ChannelError::Protocol(format!("cannot settle unknown htlc {}", htlc_id)))?;
		if self.settlement_pending(htlc_id) {
			return Err(ChannelError::Protocol(format!("htlc {} is already being settled", htlc_id)));
		}
		let fail = UpdateFailMalformedHTLC { channel_id: self.channel_id, htlc_id, sha256_of_onion, failure_code };
		let mut commitments = self.clone();
		commitments.local_changes.proposed.push(UpdateMessage::FailMalformedHtlc(fail.clone()));
		Ok((commitments, fail))
	}

	/// Takes in the counterparty's malformed-failure of one of our outgoing HTLCs.
	pub fn receive_fail_malformed(&self, msg: &UpdateFailMalformedHTLC) -> Result<(Commitments, UpdateAddHTLC), ChannelError> {
		if msg.failure_code & BADONION == 0 {
			return Err(ChannelError::Protocol(format!("invalid failure code {} for a malformed htlc", msg.failure_code)));
		}
		let htlc = self.find_htlc_cross_signed(HtlcDirection::Outgoing, msg.htlc_id)
			.ok_or_else(|| ChannelError::Protocol(format!("failure of unknown htlc {}", msg.htlc_id)))?
			.clone();
		let mut commitments = self.clone();
		commitments.remote_changes.proposed.push(UpdateMessage::FailMalformedHtlc(msg.clone()));
		Ok((commitments, htlc))
	}

	/// Signs the counterparty's next commitment transaction, picking up every pending change we
	/// sent and every change of theirs we acknowledged.
	pub fn send_commit<K: KeysInterface>(&self, keys: &K) -> Result<(Commitments, CommitmentSigned), ChannelError> {
		let remote_next_point = match &self.remote_next_commit_info {
			RemoteNextCommitInfo::NextPoint(point) => point.clone(),
			RemoteNextCommitInfo::WaitingForRevocation(_) =>
				return Err(ChannelError::Protocol("cannot sign until the previous commitment is revoked".to_owned())),
		};
		if !self.local_has_changes() {
			return Err(ChannelError::Protocol("cannot sign when there are no changes".to_owned()));
		}

		let mut counterparty_changes = self.local_changes.proposed.clone();
		counterparty_changes.extend_from_slice(&self.local_changes.signed);
		let spec = self.remote_commit.spec.reduce(&self.remote_changes.acked, &counterparty_changes)?;

		let parts = make_commit_tx(keys, false, self.remote_commit.index + 1, &spec, &remote_next_point,
			&self.local_params, &self.remote_params, self.channel_version, &self.commit_input)?;
		let key_path = self.key_path(keys);
		let signature = keys.sign_funding_spend(&key_path, &parts.tx, 0, &self.commit_input.redeem_script, self.commit_input.txout.value);

		let txid = parts.tx.txid();
		let mut htlc_signatures = Vec::new();
		for htlc in sorted_htlcs_in_tx_order(&parts.htlcs) {
			// Their to_local is delayed by the delay *we* chose.
			let htlc_tx = build_htlc_transaction(&txid, spec.feerate_per_kw, self.local_params.to_self_delay,
				htlc, &parts.keys.broadcaster_delayed_payment_key, &parts.keys.revocation_key);
			let redeem_script = get_htlc_redeemscript(htlc, &parts.keys);
			htlc_signatures.push(keys.sign_htlc_tx(&key_path, &remote_next_point, &htlc_tx, 0, &redeem_script, htlc.amount_msat / 1000));
		}

		let commit_sig = CommitmentSigned { channel_id: self.channel_id, signature, htlc_signatures };

		let mut commitments = self.clone();
		debug_assert!(commitments.local_changes.signed.is_empty());
		debug_assert!(commitments.remote_changes.signed.is_empty());
		commitments.local_changes.signed = core::mem::replace(&mut commitments.local_changes.proposed, Vec::new());
		commitments.remote_changes.signed = core::mem::replace(&mut commitments.remote_changes.acked, Vec::new());
		commitments.remote_next_commit_info = RemoteNextCommitInfo::WaitingForRevocation(WaitingForRevocation {
			next_remote_commit: RemoteCommit {
				index: self.remote_commit.index + 1,
				spec,
				txid,
				remote_per_commitment_point: remote_next_point,
			},
			sent_after_local_commit_index: self.local_commit.index,
			re_sign_asap: false,
		});
		Ok((commitments, commit_sig))
	}

	/// Verifies the counterparty's signatures on our next commitment transaction, adopts it, and
	/// revokes the previous one.
	pub fn receive_commit<K: KeysInterface>(&self, msg: &CommitmentSigned, keys: &K) -> Result<(Commitments, RevokeAndACK), ChannelError> {
		if !self.remote_has_changes() {
			return Err(ChannelError::Protocol("received a commitment signature with no pending changes".to_owned()));
		}

		let secp_ctx = Secp256k1::new();
		let key_path = self.key_path(keys);
		let spec = self.local_commit.spec.reduce(&self.local_changes.acked, &self.remote_changes.proposed)?;
		let next_index = self.local_commit.index + 1;
		let per_commitment_point = keys.commitment_point(&key_path, next_index);

		let parts = make_commit_tx(keys, true, next_index, &spec, &per_commitment_point,
			&self.local_params, &self.remote_params, self.channel_version, &self.commit_input)?;

		if !verify_signature(&secp_ctx, &parts.tx, 0, &self.commit_input.redeem_script,
				self.commit_input.txout.value, &msg.signature, &self.remote_params.pubkeys.funding_pubkey) {
			return Err(ChannelError::InvalidCommitmentSignature);
		}

		let local_sig = keys.sign_funding_spend(&key_path, &parts.tx, 0, &self.commit_input.redeem_script, self.commit_input.txout.value);
		let mut commit_tx = parts.tx.clone();
		commit_tx.input[0].witness = build_funding_witness(&self.commit_input.redeem_script,
			&local_sig, &local_channel_pubkeys(keys, &key_path).funding_pubkey,
			&msg.signature, &self.remote_params.pubkeys.funding_pubkey);

		let txid = parts.tx.txid();
		let sorted_htlcs = sorted_htlcs_in_tx_order(&parts.htlcs);
		if msg.htlc_signatures.len() != sorted_htlcs.len() {
			return Err(ChannelError::Protocol(format!(
				"got {} htlc signatures for {} htlc outputs", msg.htlc_signatures.len(), sorted_htlcs.len())));
		}
		let mut htlc_txs_and_sigs = Vec::with_capacity(sorted_htlcs.len());
		for (htlc, remote_sig) in sorted_htlcs.into_iter().zip(msg.htlc_signatures.iter()) {
			// Our to_local is delayed by the delay *they* chose.
			let htlc_tx = build_htlc_transaction(&txid, spec.feerate_per_kw, self.remote_params.to_self_delay,
				htlc, &parts.keys.broadcaster_delayed_payment_key, &parts.keys.revocation_key);
			let redeem_script = get_htlc_redeemscript(htlc, &parts.keys);
			if !verify_signature(&secp_ctx, &htlc_tx, 0, &redeem_script, htlc.amount_msat / 1000,
					remote_sig, &parts.keys.countersignatory_htlc_key) {
				return Err(ChannelError::InvalidCommitmentSignature);
			}
			let local_sig = keys.sign_htlc_tx(&key_path, &per_commitment_point, &htlc_tx, 0, &redeem_script, htlc.amount_msat / 1000);
			htlc_txs_and_sigs.push(HtlcTxAndSigs { tx: htlc_tx, local_sig, remote_sig: *remote_sig });
		}

		// Revoking the old commitment means handing over its secret and committing to the point
		// two steps ahead.
		let revocation = RevokeAndACK {
			channel_id: self.channel_id,
			per_commitment_secret: keys.commitment_secret(&key_path, self.local_commit.index),
			next_per_commitment_point: keys.commitment_point(&key_path, self.local_commit.index + 2),
		};

		let mut commitments = self.clone();
		commitments.local_commit = LocalCommit {
			index: next_index,
			spec,
			publishable_txs: PublishableTxs { commit_tx, htlc_txs_and_sigs },
		};
		commitments.local_changes.acked = Vec::new();
		let newly_acked = core::mem::replace(&mut commitments.remote_changes.proposed, Vec::new());
		commitments.remote_changes.acked.extend(newly_acked);
		Ok((commitments, revocation))
	}

	/// Takes in the counterparty's revocation of its previous commitment, completing one
	/// commitment dance. Returns the counterparty changes which just became irrevocable and
	/// should now be acted upon.
	pub fn receive_revocation(&self, msg: &RevokeAndACK) -> Result<(Commitments, Vec<UpdateMessage>), ChannelError> {
		let secp_ctx = Secp256k1::new();
		let waiting = match &self.remote_next_commit_info {
			RemoteNextCommitInfo::WaitingForRevocation(waiting) => waiting.clone(),
			RemoteNextCommitInfo::NextPoint(_) =>
				return Err(ChannelError::Protocol("received a revocation with no commitment outstanding".to_owned())),
		};

		let secret = SecretKey::from_slice(&msg.per_commitment_secret)
			.map_err(|_| ChannelError::InvalidRevocationSecret)?;
		if PublicKey::from_secret_key(&secp_ctx, &secret) != self.remote_commit.remote_per_commitment_point {
			return Err(ChannelError::InvalidRevocationSecret);
		}
		let mut remote_per_commitment_secrets = self.remote_per_commitment_secrets.clone();
		remote_per_commitment_secrets
			.provide_secret(INITIAL_COMMITMENT_NUMBER - self.remote_commit.index, msg.per_commitment_secret)
			.map_err(|_| ChannelError::InvalidRevocationSecret)?;

		// Counterparty updates we signed into their new commitment are now present in both
		// commitments and past revocation: time to act on them.
		let newly_committed: Vec<UpdateMessage> = self.remote_changes.signed.iter().filter(|change| match change {
			UpdateMessage::AddHtlc(_) => true,
			UpdateMessage::FailHtlc(_) => true,
			UpdateMessage::FailMalformedHtlc(_) => true,
			// Fulfillments were already acted upon when they arrived.
			UpdateMessage::FulfillHtlc(_) => false,
		}).cloned().collect();

		let mut commitments = self.clone();
		commitments.remote_per_commitment_secrets = remote_per_commitment_secrets;
		commitments.remote_commit = waiting.next_remote_commit;
		commitments.remote_next_commit_info = RemoteNextCommitInfo::NextPoint(msg.next_per_commitment_point);
		let newly_acked = core::mem::replace(&mut commitments.local_changes.signed, Vec::new());
		commitments.local_changes.acked.extend(newly_acked);
		commitments.remote_changes.signed = Vec::new();
		Ok((commitments, newly_committed))
	}

	/// The amount we could send the counterparty in a single fresh HTLC right now, after
	/// reserves and, if we are the funder, commitment fees.
	pub fn available_balance_for_send_msat(&self) -> u64 {
		let remote_commit = match &self.remote_next_commit_info {
			RemoteNextCommitInfo::WaitingForRevocation(waiting) => &waiting.next_remote_commit,
			RemoteNextCommitInfo::NextPoint(_) => &self.remote_commit,
		};
		let mut counterparty_changes = self.local_changes.proposed.clone();
		counterparty_changes.extend_from_slice(&self.local_changes.signed);
		let reduced = match remote_commit.spec.reduce(&self.remote_changes.acked, &counterparty_changes) {
			Ok(spec) => spec,
			Err(_) => return 0,
		};
		let mut balance_msat = reduced.to_remote_msat.saturating_sub(self.remote_params.channel_reserve_satoshis * 1000);
		if self.local_params.is_funder {
			balance_msat = balance_msat.saturating_sub(reduced.commit_tx_fee_msat(self.remote_params.dust_limit_satoshis));
		}
		balance_msat
	}

	/// The amount the counterparty could send us in a single fresh HTLC right now; the mirror of
	/// [`Commitments::available_balance_for_send_msat`].
	pub fn available_balance_for_receive_msat(&self) -> u64 {
		let reduced = match self.local_commit.spec.reduce(&self.local_changes.acked, &self.remote_changes.proposed) {
			Ok(spec) => spec,
			Err(_) => return 0,
		};
		let mut balance_msat = reduced.to_remote_msat.saturating_sub(self.local_params.channel_reserve_satoshis * 1000);
		if !self.local_params.is_funder {
			balance_msat = balance_msat.saturating_sub(reduced.commit_tx_fee_msat(self.local_params.dust_limit_satoshis));
		}
		balance_msat
	}
}

/// The HTLCs which made it into a commitment transaction, ordered by output index; the order
/// htlc_signatures must follow.
fn sorted_htlcs_in_tx_order(htlcs: &[HTLCOutputInCommitment]) -> Vec<&HTLCOutputInCommitment> {
	let mut ret: Vec<&HTLCOutputInCommitment> = htlcs.iter()
		.filter(|htlc| htlc.transaction_output_index.is_some())
		.collect();
	ret.sort_unstable_by_key(|htlc| htlc.transaction_output_index.unwrap());
	ret
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ln::PaymentHash;
	use crate::ln::msgs::OnionPacket;

	use bitcoin::secp256k1::{Secp256k1, SecretKey};

	fn test_onion() -> OnionPacket {
		let secp_ctx = Secp256k1::new();
		OnionPacket {
			version: 0,
			public_key: PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&[99; 32]).unwrap()),
			hop_data: [0; 1300],
			hmac: [0; 32],
		}
	}

	fn add(htlc_id: u64, amount_msat: u64) -> UpdateAddHTLC {
		UpdateAddHTLC {
			channel_id: ChannelId([1; 32]),
			htlc_id,
			amount_msat,
			payment_hash: PaymentHash([0; 32]),
			cltv_expiry: 500_000,
			onion_routing_packet: test_onion(),
		}
	}

	fn spec() -> CommitmentSpec {
		CommitmentSpec {
			htlcs: Vec::new(),
			feerate_per_kw: 1000,
			to_local_msat: 600_000_000,
			to_remote_msat: 400_000_000,
		}
	}

	#[test]
	fn reduce_moves_add_amounts_into_flight() {
		let spec = spec();
		let total = spec.total_msat();
		let reduced = spec.reduce(
			&[UpdateMessage::AddHtlc(add(0, 10_000_000))],
			&[UpdateMessage::AddHtlc(add(0, 5_000_000))],
		).unwrap();
		assert_eq!(reduced.to_local_msat, 590_000_000);
		assert_eq!(reduced.to_remote_msat, 395_000_000);
		assert_eq!(reduced.htlcs.len(), 2);
		assert_eq!(reduced.total_msat(), total);
	}

	#[test]
	fn reduce_settles_in_both_directions() {
		let spec = spec().reduce(
			&[UpdateMessage::AddHtlc(add(7, 10_000_000))],
			&[UpdateMessage::AddHtlc(add(3, 5_000_000))],
		).unwrap();

		// We fulfill their incoming HTLC: its value becomes ours.
		let fulfilled = spec.reduce(&[UpdateMessage::FulfillHtlc(UpdateFulfillHTLC {
			channel_id: ChannelId([1; 32]), htlc_id: 3, payment_preimage: PaymentPreimage([0; 32]),
		})], &[]).unwrap();
		assert_eq!(fulfilled.to_local_msat, 595_000_000);
		assert_eq!(fulfilled.htlcs.len(), 1);

		// They fail our outgoing HTLC: its value comes back to us.
		let failed = spec.reduce(&[], &[UpdateMessage::FailHtlc(UpdateFailHTLC {
			channel_id: ChannelId([1; 32]), htlc_id: 7, reason: msgs::OnionErrorPacket { data: vec![] },
		})]).unwrap();
		assert_eq!(failed.to_local_msat, 600_000_000);
		assert_eq!(failed.to_remote_msat, 395_000_000);
	}

	#[test]
	fn reduce_rejects_unknown_settlements() {
		assert!(spec().reduce(&[UpdateMessage::FulfillHtlc(UpdateFulfillHTLC {
			channel_id: ChannelId([1; 32]), htlc_id: 42, payment_preimage: PaymentPreimage([0; 32]),
		})], &[]).is_err());
	}

	#[test]
	fn reduce_rejects_overdraws() {
		assert!(spec().reduce(&[UpdateMessage::AddHtlc(add(0, 600_000_001))], &[]).is_err());
	}

	#[test]
	fn trimming_follows_the_dust_limit() {
		let mut spec = spec();
		spec.htlcs.push(DirectedHtlc { direction: HtlcDirection::Outgoing, add: add(0, 3_000_000) });
		spec.htlcs.push(DirectedHtlc { direction: HtlcDirection::Incoming, add: add(0, 2_000_000) });
		// At 1000 sat/kw the timeout fee is 663 sat and the success fee 703 sat.
		assert_eq!(spec.untrimmed_htlc_count(546), 2);
		assert_eq!(spec.untrimmed_htlc_count(2000), 1);
		assert_eq!(spec.untrimmed_htlc_count(3000), 0);
	}
}

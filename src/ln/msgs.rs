// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Wire messages, traits representing wire message handlers, and a few error types live here.
//!
//! These messages are serialized bit-exactly as defined in BOLT #1 and BOLT #2; transport
//! encryption and the outer message framing are the caller's business.

use bitcoin::blockdata::script::ScriptBuf;
use bitcoin::hash_types::BlockHash;
use bitcoin::secp256k1::PublicKey;
use bitcoin::secp256k1::ecdsa::Signature;

use std::fmt;
use std::io::{self, Read};

use crate::ln::{PaymentHash, PaymentPreimage};
use crate::ln::channel_id::ChannelId;
use crate::ln::features::Features;
use crate::util::ser::{Readable, Writeable, Writer};

/// An error in decoding a message or struct.
#[derive(Clone, Debug, PartialEq)]
pub enum DecodeError {
	/// A version byte specified something we don't know how to handle.
	UnknownVersion,
	/// Unknown feature mandating we fail to parse message (e.g., TLV with an even, unknown type)
	UnknownRequiredFeature,
	/// Value was invalid, eg a byte which was supposed to be a bool was something other than a 0
	/// or 1, a public key/private key/signature was invalid, text wasn't UTF-8, etc
	InvalidValue,
	/// Buffer too short
	ShortRead,
	/// A length descriptor in the packet didn't describe the later data correctly
	BadLengthDescriptor,
	/// Error from std::io
	Io(io::ErrorKind),
}

impl fmt::Display for DecodeError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			DecodeError::UnknownVersion => f.write_str("Unknown realm byte in packet"),
			DecodeError::UnknownRequiredFeature => f.write_str("Unknown required feature preventing decode"),
			DecodeError::InvalidValue => f.write_str("Nonsense bytes didn't map to the type they were interpreted as"),
			DecodeError::ShortRead => f.write_str("Packet extended beyond the provided bytes"),
			DecodeError::BadLengthDescriptor => f.write_str("A length descriptor in the packet didn't describe the later data correctly"),
			DecodeError::Io(ref e) => fmt::Debug::fmt(e, f),
		}
	}
}

impl std::error::Error for DecodeError {}

impl From<io::Error> for DecodeError {
	fn from(e: io::Error) -> Self {
		if e.kind() == io::ErrorKind::UnexpectedEof {
			DecodeError::ShortRead
		} else {
			DecodeError::Io(e.kind())
		}
	}
}

/// An init message to be sent or received from a peer.
///
/// On the wire the features are split in a legacy "global" field and a "local" field; we merge
/// the two on read, as the distinction carries no meaning anymore.
#[derive(Clone, Debug, PartialEq)]
pub struct Init {
	/// The features the sending node advertises, global and local merged.
	pub features: Features,
}

/// An error message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorMessage {
	/// The channel ID involved in the error; all-zero to refer to all channels
	pub channel_id: ChannelId,
	/// A possibly printable error description.
	/// Should be sanitized before it is printed anywhere.
	pub data: String,
}

/// An open_channel message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct OpenChannel {
	/// The genesis hash of the blockchain where the channel is to be opened
	pub chain_hash: BlockHash,
	/// A temporary channel ID, until the funding outpoint is announced
	pub temporary_channel_id: ChannelId,
	/// The channel value
	pub funding_satoshis: u64,
	/// The amount to push to the counterparty as part of the open, in milli-satoshi
	pub push_msat: u64,
	/// The threshold below which outputs on transactions broadcast by sender will be omitted
	pub dust_limit_satoshis: u64,
	/// The maximum inbound HTLC value in flight towards sender, in milli-satoshi
	pub max_htlc_value_in_flight_msat: u64,
	/// The minimum value unencumbered by HTLCs for the counterparty to keep in the channel
	pub channel_reserve_satoshis: u64,
	/// The minimum HTLC size incoming to sender, in milli-satoshi
	pub htlc_minimum_msat: u64,
	/// The feerate per 1000-weight of sender generated transactions, until updated by update_fee
	pub feerate_per_kw: u32,
	/// The number of blocks which the counterparty will have to wait to claim on-chain funds if
	/// they broadcast a commitment transaction
	pub to_self_delay: u16,
	/// The maximum number of inbound HTLCs towards sender
	pub max_accepted_htlcs: u16,
	/// The sender's key controlling the funding transaction
	pub funding_pubkey: PublicKey,
	/// Used to derive a revocation key for transactions broadcast by counterparty
	pub revocation_basepoint: PublicKey,
	/// A payment key to sender of transactions broadcast by counterparty
	pub payment_basepoint: PublicKey,
	/// Used to derive a payment key to sender for transactions broadcast by sender
	pub delayed_payment_basepoint: PublicKey,
	/// Used to derive an HTLC payment key to sender
	pub htlc_basepoint: PublicKey,
	/// The first to-be-broadcast-by-sender transaction's per commitment point
	pub first_per_commitment_point: PublicKey,
	/// Channel flags; only the low bit is defined, requesting public announcement of the channel
	pub channel_flags: u8,
}

/// An accept_channel message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct AcceptChannel {
	/// The same temporary channel ID as given in the open_channel
	pub temporary_channel_id: ChannelId,
	/// The threshold below which outputs on transactions broadcast by sender will be omitted
	pub dust_limit_satoshis: u64,
	/// The maximum inbound HTLC value in flight towards sender, in milli-satoshi
	pub max_htlc_value_in_flight_msat: u64,
	/// The minimum value unencumbered by HTLCs for the counterparty to keep in the channel
	pub channel_reserve_satoshis: u64,
	/// The minimum HTLC size incoming to sender, in milli-satoshi
	pub htlc_minimum_msat: u64,
	/// Minimum depth of the funding transaction before the channel is considered open
	pub minimum_depth: u32,
	/// The number of blocks which the counterparty will have to wait to claim on-chain funds if
	/// they broadcast a commitment transaction
	pub to_self_delay: u16,
	/// The maximum number of inbound HTLCs towards sender
	pub max_accepted_htlcs: u16,
	/// The sender's key controlling the funding transaction
	pub funding_pubkey: PublicKey,
	/// Used to derive a revocation key for transactions broadcast by counterparty
	pub revocation_basepoint: PublicKey,
	/// A payment key to sender of transactions broadcast by counterparty
	pub payment_basepoint: PublicKey,
	/// Used to derive a payment key to sender for transactions broadcast by sender
	pub delayed_payment_basepoint: PublicKey,
	/// Used to derive an HTLC payment key to sender
	pub htlc_basepoint: PublicKey,
	/// The first to-be-broadcast-by-sender transaction's per commitment point
	pub first_per_commitment_point: PublicKey,
}

/// A funding_created message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct FundingCreated {
	/// The same temporary channel ID as given in the open_channel
	pub temporary_channel_id: ChannelId,
	/// The funding transaction ID
	pub funding_txid: bitcoin::hash_types::Txid,
	/// The specific output index funding this channel
	pub funding_output_index: u16,
	/// The signature of the channel initiator on the initial commitment transaction to be
	/// broadcast by the channel acceptor
	pub signature: Signature,
}

/// A funding_signed message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct FundingSigned {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The signature of the channel acceptor on the initial commitment transaction to be
	/// broadcast by the channel initiator
	pub signature: Signature,
}

/// A funding_locked message to be sent or received from a peer; informs the peer that the funding
/// transaction is confirmed to the negotiated depth
#[derive(Clone, Debug, PartialEq)]
pub struct FundingLocked {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The per-commitment point of the second commitment transaction
	pub next_per_commitment_point: PublicKey,
}

/// A shutdown message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct Shutdown {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The destination of this peer's funds on closing.
	/// Must be in one of these forms: p2pkh, p2sh, p2wpkh, p2wsh.
	pub scriptpubkey: ScriptBuf,
}

/// An onion packet carrying forwarding instructions, opaque to this crate.
#[derive(Clone, PartialEq, Eq)]
pub struct OnionPacket {
	/// The version byte, must be 0
	pub version: u8,
	/// The ephemeral public key used to derive the shared secrets for this hop
	pub public_key: PublicKey,
	/// 1300 bytes encrypted payload for the next hop
	pub hop_data: [u8; 1300],
	/// HMAC to verify the integrity of hop_data
	pub hmac: [u8; 32],
}

impl fmt::Debug for OnionPacket {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_fmt(format_args!("onion packet version {} with hmac {:?}", self.version, &self.hmac[..]))
	}
}

/// An encrypted failure blob returned for a failed HTLC, opaque to everybody but the payer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OnionErrorPacket {
	/// Encrypted error data, to be peeled by the origin node
	pub data: Vec<u8>,
}

/// An update_add_htlc message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateAddHTLC {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The HTLC ID
	pub htlc_id: u64,
	/// The HTLC value in milli-satoshi
	pub amount_msat: u64,
	/// The payment hash, the pre-image of which controls HTLC redemption
	pub payment_hash: PaymentHash,
	/// The expiry height of the HTLC
	pub cltv_expiry: u32,
	/// The onion routing packet with encrypted data for the next hop.
	pub onion_routing_packet: OnionPacket,
}

/// An update_fulfill_htlc message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateFulfillHTLC {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The HTLC ID
	pub htlc_id: u64,
	/// The pre-image of the payment hash, allowing HTLC redemption
	pub payment_preimage: PaymentPreimage,
}

/// An update_fail_htlc message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateFailHTLC {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The HTLC ID
	pub htlc_id: u64,
	/// The reason for the HTLC failure, encrypted for the payer
	pub reason: OnionErrorPacket,
}

/// An update_fail_malformed_htlc message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateFailMalformedHTLC {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The HTLC ID
	pub htlc_id: u64,
	/// The SHA256 of the onion blob we received, to allow the payer to diagnose the error
	pub sha256_of_onion: [u8; 32],
	/// The failure code, which must include the BADONION bit
	pub failure_code: u16,
}

/// A commitment_signed message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct CommitmentSigned {
	/// The channel ID
	pub channel_id: ChannelId,
	/// A signature on the commitment transaction
	pub signature: Signature,
	/// Signatures on the HTLC transactions, in the order of the HTLC outputs in the commitment
	pub htlc_signatures: Vec<Signature>,
}

/// A revoke_and_ack message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct RevokeAndACK {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The secret corresponding to the per-commitment point of the revoked commitment
	pub per_commitment_secret: [u8; 32],
	/// The next sender-broadcast commitment transaction's per-commitment point
	pub next_per_commitment_point: PublicKey,
}

/// A channel_announcement message to be sent or received from a peer
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelAnnouncement {
	/// Signature by the first node's node key
	pub node_signature_1: Signature,
	/// Signature by the second node's node key
	pub node_signature_2: Signature,
	/// Signature by the first node's funding key
	pub bitcoin_signature_1: Signature,
	/// Signature by the second node's funding key
	pub bitcoin_signature_2: Signature,
	/// The channel-level features advertised for this channel
	pub features: Features,
	/// The genesis hash of the blockchain where the channel lives
	pub chain_hash: BlockHash,
	/// The location of the funding output in the chain
	pub short_channel_id: u64,
	/// The node id of the lexicographically lesser of the two endpoints
	pub node_id_1: PublicKey,
	/// The node id of the lexicographically greater of the two endpoints
	pub node_id_2: PublicKey,
	/// The funding key of the first node
	pub bitcoin_key_1: PublicKey,
	/// The funding key of the second node
	pub bitcoin_key_2: PublicKey,
}

/// A channel_update message to be sent or received from a peer, advertising relay parameters for
/// one direction of a channel
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelUpdate {
	/// A signature of the channel update by the sending node's node key
	pub signature: Signature,
	/// The genesis hash of the blockchain where the channel lives
	pub chain_hash: BlockHash,
	/// The location of the funding output in the chain
	pub short_channel_id: u64,
	/// A strictly monotonic announcement counter
	pub timestamp: u32,
	/// Bit 0 indicates the presence of htlc_maximum_msat (always set here)
	pub message_flags: u8,
	/// Bit 0 is the direction, bit 1 disables the channel
	pub channel_flags: u8,
	/// The number of blocks the sender will subtract from an incoming HTLC's cltv_expiry when
	/// relaying over this channel
	pub cltv_expiry_delta: u16,
	/// The minimum HTLC size the sender will relay, in milli-satoshi
	pub htlc_minimum_msat: u64,
	/// The base relay fee, in milli-satoshi
	pub fee_base_msat: u32,
	/// The proportional relay fee, in millionths of a satoshi
	pub fee_proportional_millionths: u32,
	/// The maximum HTLC size the sender will relay, in milli-satoshi
	pub htlc_maximum_msat: u64,
}

impl Writeable for Init {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		// The global feature field is a relic; we always leave it empty.
		Features::empty().write(w)?;
		self.features.write(w)
	}
}
impl Readable for Init {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let global_features: Features = Readable::read(r)?;
		let features: Features = Readable::read(r)?;
		Ok(Init { features: global_features.or(features) })
	}
}

impl_writeable!(ErrorMessage, { channel_id, data });
impl_writeable!(OpenChannel, {
	chain_hash,
	temporary_channel_id,
	funding_satoshis,
	push_msat,
	dust_limit_satoshis,
	max_htlc_value_in_flight_msat,
	channel_reserve_satoshis,
	htlc_minimum_msat,
	feerate_per_kw,
	to_self_delay,
	max_accepted_htlcs,
	funding_pubkey,
	revocation_basepoint,
	payment_basepoint,
	delayed_payment_basepoint,
	htlc_basepoint,
	first_per_commitment_point,
	channel_flags
});
impl_writeable!(AcceptChannel, {
	temporary_channel_id,
	dust_limit_satoshis,
	max_htlc_value_in_flight_msat,
	channel_reserve_satoshis,
	htlc_minimum_msat,
	minimum_depth,
	to_self_delay,
	max_accepted_htlcs,
	funding_pubkey,
	revocation_basepoint,
	payment_basepoint,
	delayed_payment_basepoint,
	htlc_basepoint,
	first_per_commitment_point
});
impl_writeable!(FundingCreated, { temporary_channel_id, funding_txid, funding_output_index, signature });
impl_writeable!(FundingSigned, { channel_id, signature });
impl_writeable!(FundingLocked, { channel_id, next_per_commitment_point });
impl_writeable!(Shutdown, { channel_id, scriptpubkey });
impl_writeable!(OnionErrorPacket, { data });
impl_writeable!(OnionPacket, { version, public_key, hop_data, hmac });
impl_writeable!(UpdateAddHTLC, { channel_id, htlc_id, amount_msat, payment_hash, cltv_expiry, onion_routing_packet });
impl_writeable!(UpdateFulfillHTLC, { channel_id, htlc_id, payment_preimage });
impl_writeable!(UpdateFailHTLC, { channel_id, htlc_id, reason });
impl_writeable!(UpdateFailMalformedHTLC, { channel_id, htlc_id, sha256_of_onion, failure_code });
impl_writeable!(CommitmentSigned, { channel_id, signature, htlc_signatures });
impl_writeable!(RevokeAndACK, { channel_id, per_commitment_secret, next_per_commitment_point });
impl_writeable!(ChannelAnnouncement, {
	node_signature_1,
	node_signature_2,
	bitcoin_signature_1,
	bitcoin_signature_2,
	features,
	chain_hash,
	short_channel_id,
	node_id_1,
	node_id_2,
	bitcoin_key_1,
	bitcoin_key_2
});
impl_writeable!(ChannelUpdate, {
	signature,
	chain_hash,
	short_channel_id,
	timestamp,
	message_flags,
	channel_flags,
	cltv_expiry_delta,
	htlc_minimum_msat,
	fee_base_msat,
	fee_proportional_millionths,
	htlc_maximum_msat
});

/// A dispatch enum over every message we can put on or take off the wire, tagged with the BOLT #1
/// message type number.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
	/// An init message
	Init(Init),
	/// An error message
	Error(ErrorMessage),
	/// An open_channel message
	OpenChannel(OpenChannel),
	/// An accept_channel message
	AcceptChannel(AcceptChannel),
	/// A funding_created message
	FundingCreated(FundingCreated),
	/// A funding_signed message
	FundingSigned(FundingSigned),
	/// A funding_locked message
	FundingLocked(FundingLocked),
	/// A shutdown message
	Shutdown(Shutdown),
	/// An update_add_htlc message
	UpdateAddHTLC(UpdateAddHTLC),
	/// An update_fulfill_htlc message
	UpdateFulfillHTLC(UpdateFulfillHTLC),
	/// An update_fail_htlc message
	UpdateFailHTLC(UpdateFailHTLC),
	/// An update_fail_malformed_htlc message
	UpdateFailMalformedHTLC(UpdateFailMalformedHTLC),
	/// A commitment_signed message
	CommitmentSigned(CommitmentSigned),
	/// A revoke_and_ack message
	RevokeAndACK(RevokeAndACK),
	/// A channel_announcement message
	ChannelAnnouncement(ChannelAnnouncement),
	/// A channel_update message
	ChannelUpdate(ChannelUpdate),
	/// A message of unknown, odd (and therefore ignorable) type
	Unknown(u16),
}

impl Message {
	/// The BOLT #1 type number for this message.
	pub fn type_id(&self) -> u16 {
		match self {
			Message::Init(_) => 16,
			Message::Error(_) => 17,
			Message::OpenChannel(_) => 32,
			Message::AcceptChannel(_) => 33,
			Message::FundingCreated(_) => 34,
			Message::FundingSigned(_) => 35,
			Message::FundingLocked(_) => 36,
			Message::Shutdown(_) => 38,
			Message::UpdateAddHTLC(_) => 128,
			Message::UpdateFulfillHTLC(_) => 130,
			Message::UpdateFailHTLC(_) => 131,
			Message::CommitmentSigned(_) => 132,
			Message::RevokeAndACK(_) => 133,
			Message::UpdateFailMalformedHTLC(_) => 135,
			Message::ChannelAnnouncement(_) => 256,
			Message::ChannelUpdate(_) => 258,
			Message::Unknown(type_id) => *type_id,
		}
	}
}

impl Writeable for Message {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.type_id().write(w)?;
		match self {
			Message::Init(msg) => msg.write(w),
			Message::Error(msg) => msg.write(w),
			Message::OpenChannel(msg) => msg.write(w),
			Message::AcceptChannel(msg) => msg.write(w),
			Message::FundingCreated(msg) => msg.write(w),
			Message::FundingSigned(msg) => msg.write(w),
			Message::FundingLocked(msg) => msg.write(w),
			Message::Shutdown(msg) => msg.write(w),
			Message::UpdateAddHTLC(msg) => msg.write(w),
			Message::UpdateFulfillHTLC(msg) => msg.write(w),
			Message::UpdateFailHTLC(msg) => msg.write(w),
			Message::UpdateFailMalformedHTLC(msg) => msg.write(w),
			Message::CommitmentSigned(msg) => msg.write(w),
			Message::RevokeAndACK(msg) => msg.write(w),
			Message::ChannelAnnouncement(msg) => msg.write(w),
			Message::ChannelUpdate(msg) => msg.write(w),
			Message::Unknown(_) => Err(io::Error::new(io::ErrorKind::InvalidInput, "cannot serialize an unknown message")),
		}
	}
}

impl Readable for Message {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let type_id: u16 = Readable::read(r)?;
		match type_id {
			16 => Ok(Message::Init(Readable::read(r)?)),
			17 => Ok(Message::Error(Readable::read(r)?)),
			32 => Ok(Message::OpenChannel(Readable::read(r)?)),
			33 => Ok(Message::AcceptChannel(Readable::read(r)?)),
			34 => Ok(Message::FundingCreated(Readable::read(r)?)),
			35 => Ok(Message::FundingSigned(Readable::read(r)?)),
			36 => Ok(Message::FundingLocked(Readable::read(r)?)),
			38 => Ok(Message::Shutdown(Readable::read(r)?)),
			128 => Ok(Message::UpdateAddHTLC(Readable::read(r)?)),
			130 => Ok(Message::UpdateFulfillHTLC(Readable::read(r)?)),
			131 => Ok(Message::UpdateFailHTLC(Readable::read(r)?)),
			132 => Ok(Message::CommitmentSigned(Readable::read(r)?)),
			133 => Ok(Message::RevokeAndACK(Readable::read(r)?)),
			135 => Ok(Message::UpdateFailMalformedHTLC(Readable::read(r)?)),
			256 => Ok(Message::ChannelAnnouncement(Readable::read(r)?)),
			258 => Ok(Message::ChannelUpdate(Readable::read(r)?)),
			// "it's ok to be odd": unknown odd types are ignored by the caller, unknown even
			// types mean we're missing a required feature.
			t if t % 2 == 1 => Ok(Message::Unknown(t)),
			_ => Err(DecodeError::UnknownRequiredFeature),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ln::features::{Feature, FeatureSupport, Features};

	use bitcoin::hashes::Hash;
	use bitcoin::hash_types::Txid;
	use bitcoin::secp256k1::{Secp256k1, SecretKey, Message as SecpMessage};

	fn pubkey(byte: u8) -> PublicKey {
		let secp_ctx = Secp256k1::new();
		PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&[byte; 32]).unwrap())
	}

	fn sig() -> Signature {
		let secp_ctx = Secp256k1::new();
		let sk = SecretKey::from_slice(&[42; 32]).unwrap();
		secp_ctx.sign_ecdsa(&SecpMessage::from_slice(&[7; 32]).unwrap(), &sk)
	}

	fn roundtrip(msg: Message) {
		let encoded = msg.encode();
		assert_eq!(u16::from_be_bytes([encoded[0], encoded[1]]), msg.type_id());
		let decoded: Message = Readable::read(&mut &encoded[..]).unwrap();
		assert_eq!(decoded, msg);
	}

	#[test]
	fn roundtrip_init() {
		let mut features = Features::recommended();
		features.set(Feature::Wumbo, FeatureSupport::Optional);
		roundtrip(Message::Init(Init { features }));
	}

	#[test]
	fn roundtrip_open_channel() {
		roundtrip(Message::OpenChannel(OpenChannel {
			chain_hash: BlockHash::all_zeros(),
			temporary_channel_id: ChannelId([2; 32]),
			funding_satoshis: 1_000_000,
			push_msat: 50_000_000,
			dust_limit_satoshis: 546,
			max_htlc_value_in_flight_msat: 100_000_000,
			channel_reserve_satoshis: 10_000,
			htlc_minimum_msat: 1,
			feerate_per_kw: 2500,
			to_self_delay: 144,
			max_accepted_htlcs: 30,
			funding_pubkey: pubkey(1),
			revocation_basepoint: pubkey(2),
			payment_basepoint: pubkey(3),
			delayed_payment_basepoint: pubkey(4),
			htlc_basepoint: pubkey(5),
			first_per_commitment_point: pubkey(6),
			channel_flags: 1,
		}));
	}

	#[test]
	fn roundtrip_funding_flow_messages() {
		roundtrip(Message::FundingCreated(FundingCreated {
			temporary_channel_id: ChannelId([2; 32]),
			funding_txid: Txid::all_zeros(),
			funding_output_index: 3,
			signature: sig(),
		}));
		roundtrip(Message::FundingSigned(FundingSigned {
			channel_id: ChannelId([3; 32]),
			signature: sig(),
		}));
		roundtrip(Message::FundingLocked(FundingLocked {
			channel_id: ChannelId([3; 32]),
			next_per_commitment_point: pubkey(9),
		}));
	}

	#[test]
	fn roundtrip_htlc_messages() {
		roundtrip(Message::UpdateAddHTLC(UpdateAddHTLC {
			channel_id: ChannelId([3; 32]),
			htlc_id: 0,
			amount_msat: 42_000,
			payment_hash: PaymentHash([11; 32]),
			cltv_expiry: 500_000,
			onion_routing_packet: OnionPacket {
				version: 0,
				public_key: pubkey(13),
				hop_data: [0x42; 1300],
				hmac: [0x17; 32],
			},
		}));
		roundtrip(Message::UpdateFulfillHTLC(UpdateFulfillHTLC {
			channel_id: ChannelId([3; 32]),
			htlc_id: 0,
			payment_preimage: PaymentPreimage([9; 32]),
		}));
		roundtrip(Message::UpdateFailHTLC(UpdateFailHTLC {
			channel_id: ChannelId([3; 32]),
			htlc_id: 1,
			reason: OnionErrorPacket { data: vec![1, 2, 3, 4] },
		}));
		roundtrip(Message::UpdateFailMalformedHTLC(UpdateFailMalformedHTLC {
			channel_id: ChannelId([3; 32]),
			htlc_id: 2,
			sha256_of_onion: [5; 32],
			failure_code: 0x8000 | 6,
		}));
		roundtrip(Message::CommitmentSigned(CommitmentSigned {
			channel_id: ChannelId([3; 32]),
			signature: sig(),
			htlc_signatures: vec![sig(), sig()],
		}));
		roundtrip(Message::RevokeAndACK(RevokeAndACK {
			channel_id: ChannelId([3; 32]),
			per_commitment_secret: [8; 32],
			next_per_commitment_point: pubkey(10),
		}));
	}

	#[test]
	fn unknown_odd_type_is_ignored_even_is_required() {
		let mut odd = Vec::new();
		odd.extend_from_slice(&1001u16.to_be_bytes());
		odd.extend_from_slice(&[0xde, 0xad]);
		assert_eq!(<Message as Readable>::read(&mut &odd[..]).unwrap(), Message::Unknown(1001));

		let mut even = Vec::new();
		even.extend_from_slice(&1000u16.to_be_bytes());
		assert_eq!(<Message as Readable>::read(&mut &even[..]).unwrap_err(),
			DecodeError::UnknownRequiredFeature);
	}

	#[test]
	fn error_message_data_is_length_prefixed() {
		let msg = ErrorMessage { channel_id: ChannelId([0xff; 32]), data: "hi".to_owned() };
		let encoded = msg.encode();
		assert_eq!(encoded.len(), 32 + 2 + 2);
		assert_eq!(&encoded[32..], &[0, 2, b'h', b'i']);
		let decoded: ErrorMessage = Readable::read(&mut &encoded[..]).unwrap();
		assert_eq!(decoded, msg);
	}
}

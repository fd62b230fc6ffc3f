// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The channel state machine.
//!
//! A channel is a [`ChannelState`] value; [`ChannelState::process`] consumes it together with one
//! [`Event`] and returns the successor state and the [`Action`]s the caller must dispatch, in
//! order. The function is pure: peer messages go out, transactions get published and state gets
//! persisted only by whoever runs the returned actions (see [`crate::ln::driver`]).

use bitcoin::blockdata::constants::genesis_block;
use bitcoin::blockdata::transaction::{OutPoint, Transaction, TxOut};
use bitcoin::hashes::Hash;
use bitcoin::hashes::sha256d::Hash as Sha256d;
use bitcoin::hash_types::BlockHash;
use bitcoin::network::constants::Network;
use bitcoin::secp256k1::{Message as SecpMessage, PublicKey, Secp256k1, SecretKey};

use std::io;
use std::ops::Deref;

use crate::chain::{BestBlock, MakeFundingTx, MakeFundingTxResponse, WatchEvent, WatchRequest};
use crate::chain::chaininterface::FEERATE_FLOOR_SATS_PER_KW;
use crate::chain::keysinterface::KeysInterface;
use crate::ln::{PaymentHash, PaymentPreimage};
use crate::ln::chan_utils::{build_funding_witness, make_funding_redeemscript, verify_signature, InputInfo, CommitmentSecrets, offered_htlc_trim_threshold_sat, received_htlc_trim_threshold_sat};
use crate::ln::channel_id::ChannelId;
use crate::ln::commitments::{
	local_channel_pubkeys, make_commit_tx, make_first_commitment_specs, ChannelVersion,
	Commitments, CommitmentSpec, HtlcDirection, HtlcInfo, LocalChanges, LocalCommit, LocalParams,
	PublishableTxs, RemoteChanges, RemoteCommit, RemoteNextCommitInfo, RemoteParams,
	UpdateMessage,
};
use crate::ln::features::{Feature, Features};
use crate::ln::msgs;
use crate::util::config::NodeConfig;
use crate::util::errors::ChannelError;
use crate::util::logger::Logger;
use crate::util::scid_utils::scid_from_parts;
use crate::util::ser::{Readable, ReadableArgs, VecWriter, Writeable, Writer};

/// Confirmations required before a channel is announceable.
pub const ANNOUNCEMENTS_MINCONF: u32 = 6;
/// The largest channel we allow, without `option_support_large_channel`: 10 BTC.
pub const MAX_FUNDING_SATOSHIS: u64 = 1_000_000_000;
/// The protocol limit on concurrent HTLCs per side.
pub const MAX_ACCEPTED_HTLCS: u16 = 483;
/// The smallest dust limit we accept: the default P2WSH dust threshold.
pub const MIN_DUST_LIMIT_SATOSHIS: u64 = 546;
/// The longest contest delay either side may impose, roughly two weeks.
pub const MAX_TO_SELF_DELAY: u16 = 2016;
/// An upper bound on fee-negotiation rounds when closing a channel cooperatively.
pub const MAX_NEGOTIATION_ITERATIONS: u32 = 20;
/// How long the fundee waits for the funding transaction to confirm before giving up, in
/// seconds: 5 days.
pub const FUNDING_TIMEOUT_FUNDEE: u64 = 5 * 24 * 3600;

/// The per-channel parameters which never change over the channel's lifetime.
#[derive(Clone)]
pub struct StaticParams {
	/// The hash identifying the chain the channel lives on
	pub chain_hash: BlockHash,
	/// The network the channel lives on
	pub network: Network,
	/// Our node's private key, used to sign channel updates
	pub node_secret: SecretKey,
	/// Our node's id
	pub node_id: PublicKey,
	/// The counterparty's node id
	pub remote_node_id: PublicKey,
	/// Our policy configuration
	pub config: NodeConfig,
}

impl StaticParams {
	/// Builds the static parameters of one channel towards `remote_node_id`.
	pub fn new(network: Network, node_secret: SecretKey, remote_node_id: PublicKey, config: NodeConfig) -> StaticParams {
		let secp_ctx = Secp256k1::new();
		StaticParams {
			chain_hash: genesis_block(network).block_hash(),
			network,
			node_id: PublicKey::from_secret_key(&secp_ctx, &node_secret),
			node_secret,
			remote_node_id,
			config,
		}
	}
}

/// A command from the local application.
#[derive(Clone, Debug)]
pub enum Command {
	/// Send a payment (or a part of one) over the channel.
	AddHtlc {
		/// The HTLC value, in milli-satoshi
		amount_msat: u64,
		/// The payment hash
		payment_hash: PaymentHash,
		/// The absolute expiry height
		cltv_expiry: u32,
		/// The onion for the counterparty
		onion_routing_packet: msgs::OnionPacket,
		/// Whether to immediately follow up with a signature
		commit: bool,
	},
	/// Claim an incoming HTLC for which we know the preimage.
	FulfillHtlc {
		/// The id of the HTLC to fulfill
		htlc_id: u64,
		/// Its preimage
		payment_preimage: PaymentPreimage,
		/// Whether to immediately follow up with a signature
		commit: bool,
	},
	/// Reject an incoming HTLC.
	FailHtlc {
		/// The id of the HTLC to fail
		htlc_id: u64,
		/// The encrypted failure reason for the payer
		reason: msgs::OnionErrorPacket,
		/// Whether to immediately follow up with a signature
		commit: bool,
	},
	/// Reject an incoming HTLC whose onion we could not parse.
	FailMalformedHtlc {
		/// The id of the HTLC to fail
		htlc_id: u64,
		/// The hash of the onion we received
		sha256_of_onion: [u8; 32],
		/// A BADONION failure code
		failure_code: u16,
		/// Whether to immediately follow up with a signature
		commit: bool,
	},
	/// Sign all pending changes into a new counterparty commitment.
	Sign,
}

/// The application's request to open (fund) a channel.
#[derive(Clone, Debug)]
pub struct InitFunder {
	/// The channel id to use until the funding outpoint exists
	pub temporary_channel_id: ChannelId,
	/// The channel value we will fund
	pub funding_satoshis: u64,
	/// An amount to gift the counterparty at open, in milli-satoshi
	pub push_msat: u64,
	/// The initial commitment feerate, per 1000 weight
	pub initial_feerate_per_kw: u32,
	/// The feerate of the funding transaction itself, per 1000 weight
	pub funding_tx_feerate_per_kw: u32,
	/// Our channel parameters
	pub local_params: LocalParams,
	/// The init message the counterparty sent on connection
	pub remote_init: msgs::Init,
	/// The channel flags to propose; bit 0 requests a public channel
	pub channel_flags: u8,
}

/// The application's consent to accept a channel open from this peer.
#[derive(Clone, Debug)]
pub struct InitFundee {
	/// The temporary channel id the counterparty will use in its open_channel
	pub temporary_channel_id: ChannelId,
	/// Our channel parameters
	pub local_params: LocalParams,
	/// The init message the counterparty sent on connection
	pub remote_init: msgs::Init,
}

/// Anything that can happen to a channel. Events are fed to [`ChannelState::process`] one at a
/// time, in arrival order.
#[derive(Clone, Debug)]
pub enum Event {
	/// The application wants to fund a channel.
	InitFunder(InitFunder),
	/// The application will accept a channel from this peer.
	InitFundee(InitFundee),
	/// The peer sent us a message.
	MessageReceived(msgs::Message),
	/// The application asks for a channel operation.
	ExecuteCommand(Command),
	/// The chain watcher observed something we asked it to watch.
	WatchReceived(WatchEvent),
	/// The wallet built the funding transaction we asked for.
	MakeFundingTxResponse(MakeFundingTxResponse),
	/// Periodic prompt to check whether the funding transaction is taking too long.
	CheckFundingTimeout,
	/// A new chain tip.
	NewBlock(BestBlock),
}

/// A side effect of a transition, to be dispatched by the driver in list order.
///
/// [`Action::StoreState`] always precedes any action whose effect cannot be rolled back
/// (publishing the funding transaction, sending commitment_signed or revoke_and_ack), so a crash
/// between persistence and dispatch never loses a commitment we are bound to.
#[derive(Clone, Debug)]
pub enum Action {
	/// Send this message to the peer.
	SendMessage(msgs::Message),
	/// Register this watch with the chain watcher.
	SendWatch(WatchRequest),
	/// Broadcast this (funding) transaction.
	PublishTx(Transaction),
	/// Ask the wallet to construct the funding transaction.
	MakeFundingTx(MakeFundingTx),
	/// The channel graduated from its temporary id to its funding-derived one.
	ChannelIdAssigned {
		/// The id used so far
		temporary_channel_id: ChannelId,
		/// The definitive id
		channel_id: ChannelId,
	},
	/// Persist the current channel state, atomically, before dispatching anything further.
	StoreState,
	/// Persist the HTLCs of the counterparty commitment we just signed, so a watcher can claim
	/// them if a revoked version ever confirms.
	StoreHtlcInfos {
		/// The commitment number the HTLCs appear in
		commitment_number: u64,
		/// The HTLCs themselves
		htlcs: Vec<HtlcInfo>,
	},
	/// Feed this command back into the state machine as a fresh event.
	ProcessCommand(Command),
	/// An incoming HTLC became irrevocably committed; hand it to the application.
	ProcessAdd(msgs::UpdateAddHTLC),
	/// An outgoing HTLC was irrevocably failed; hand the failure to the application.
	ProcessFail(msgs::UpdateFailHTLC),
	/// An outgoing HTLC was irrevocably failed as malformed.
	ProcessFailMalformed(msgs::UpdateFailMalformedHTLC),
	/// Something went wrong; the driver decides whether to warn, disconnect or close.
	HandleError(ChannelError),
}

/// Waiting for the application to say whether we are funder or fundee.
#[derive(Clone)]
pub struct WaitForInit {
	/// The immutable channel parameters
	pub static_params: StaticParams,
	/// The current chain tip
	pub current_tip: BestBlock,
}

/// Fundee, waiting for the counterparty's open_channel.
#[derive(Clone)]
pub struct WaitForOpenChannel {
	/// The immutable channel parameters
	pub static_params: StaticParams,
	/// The current chain tip
	pub current_tip: BestBlock,
	/// The channel id until the funding outpoint exists
	pub temporary_channel_id: ChannelId,
	/// Our channel parameters
	pub local_params: LocalParams,
	/// The counterparty's init message
	pub remote_init: msgs::Init,
}

/// Funder, waiting for the counterparty's accept_channel.
#[derive(Clone)]
pub struct WaitForAcceptChannel {
	/// The immutable channel parameters
	pub static_params: StaticParams,
	/// The current chain tip
	pub current_tip: BestBlock,
	/// The open request this channel started from
	pub init_funder: InitFunder,
	/// The commitment format negotiated from the init features; the zero-reserve bit is still
	/// outstanding until accept_channel tells us the counterparty's reserve
	pub channel_version: ChannelVersion,
	/// The open_channel we sent
	pub last_sent: msgs::OpenChannel,
}

/// Funder, waiting for the wallet to build the funding transaction.
#[derive(Clone)]
pub struct WaitForFundingInternal {
	/// The immutable channel parameters
	pub static_params: StaticParams,
	/// The current chain tip
	pub current_tip: BestBlock,
	/// The channel id until the funding outpoint exists
	pub temporary_channel_id: ChannelId,
	/// Our channel parameters
	pub local_params: LocalParams,
	/// The counterparty's channel parameters
	pub remote_params: RemoteParams,
	/// The channel value
	pub funding_satoshis: u64,
	/// The amount gifted to the counterparty, in milli-satoshi
	pub push_msat: u64,
	/// The initial commitment feerate
	pub initial_feerate_per_kw: u32,
	/// The confirmation depth the counterparty asked for
	pub minimum_depth: u32,
	/// The counterparty's first per-commitment point
	pub remote_first_per_commitment_point: PublicKey,
	/// The channel flags from our open_channel
	pub channel_flags: u8,
	/// The negotiated commitment format
	pub channel_version: ChannelVersion,
	/// The open_channel we sent
	pub last_sent: msgs::OpenChannel,
}

/// Fundee, waiting for the counterparty's funding_created.
#[derive(Clone)]
pub struct WaitForFundingCreated {
	/// The immutable channel parameters
	pub static_params: StaticParams,
	/// The current chain tip
	pub current_tip: BestBlock,
	/// The channel id until the funding outpoint exists
	pub temporary_channel_id: ChannelId,
	/// Our channel parameters
	pub local_params: LocalParams,
	/// The counterparty's channel parameters
	pub remote_params: RemoteParams,
	/// The channel value
	pub funding_satoshis: u64,
	/// The amount gifted to us, in milli-satoshi
	pub push_msat: u64,
	/// The initial commitment feerate
	pub initial_feerate_per_kw: u32,
	/// The confirmation depth we asked for
	pub minimum_depth: u32,
	/// The counterparty's first per-commitment point
	pub remote_first_per_commitment_point: PublicKey,
	/// The channel flags from the counterparty's open_channel
	pub channel_flags: u8,
	/// The negotiated commitment format
	pub channel_version: ChannelVersion,
	/// The accept_channel we sent
	pub last_sent: msgs::AcceptChannel,
}

/// Funder, waiting for the counterparty's signature on our first commitment.
#[derive(Clone)]
pub struct WaitForFundingSigned {
	/// The immutable channel parameters
	pub static_params: StaticParams,
	/// The current chain tip
	pub current_tip: BestBlock,
	/// The definitive channel id
	pub channel_id: ChannelId,
	/// Our channel parameters
	pub local_params: LocalParams,
	/// The counterparty's channel parameters
	pub remote_params: RemoteParams,
	/// The funding transaction, not yet published
	pub funding_tx: Transaction,
	/// The fee the funding transaction pays
	pub funding_tx_fee_satoshis: u64,
	/// The confirmation depth the counterparty asked for
	pub minimum_depth: u32,
	/// The spec of our first commitment
	pub local_spec: CommitmentSpec,
	/// Our first commitment transaction, unsigned
	pub local_commit_tx: Transaction,
	/// The funding output
	pub commit_input: InputInfo,
	/// The counterparty's first commitment
	pub remote_commit: RemoteCommit,
	/// The channel flags from our open_channel
	pub channel_flags: u8,
	/// The negotiated commitment format
	pub channel_version: ChannelVersion,
	/// The funding_created we sent
	pub last_sent: msgs::FundingCreated,
}

/// The last message either side sends in the funding flow, identifying our role.
#[derive(Clone, Debug)]
pub enum LastSent {
	/// We are the funder and sent funding_created
	FundingCreated(msgs::FundingCreated),
	/// We are the fundee and sent funding_signed
	FundingSigned(msgs::FundingSigned),
}

impl Writeable for LastSent {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		match self {
			LastSent::FundingCreated(msg) => { 0u8.write(w)?; msg.write(w) },
			LastSent::FundingSigned(msg) => { 1u8.write(w)?; msg.write(w) },
		}
	}
}
impl Readable for LastSent {
	fn read<R: io::Read>(r: &mut R) -> Result<Self, msgs::DecodeError> {
		match <u8 as Readable>::read(r)? {
			0 => Ok(LastSent::FundingCreated(Readable::read(r)?)),
			1 => Ok(LastSent::FundingSigned(Readable::read(r)?)),
			_ => Err(msgs::DecodeError::InvalidValue),
		}
	}
}

/// Both first commitments signed; waiting for the funding transaction to confirm.
#[derive(Clone)]
pub struct WaitForFundingConfirmed {
	/// The immutable channel parameters
	pub static_params: StaticParams,
	/// The current chain tip
	pub current_tip: BestBlock,
	/// The channel state proper
	pub commitments: Commitments,
	/// The funding transaction; only the funder holds it
	pub funding_tx: Option<Transaction>,
	/// When we entered this state, as a unix timestamp
	pub waiting_since: u64,
	/// A funding_locked which arrived before our own funding depth was reached
	pub deferred: Option<msgs::FundingLocked>,
	/// The message that concluded the funding flow for us
	pub last_sent: LastSent,
}

/// Funding is buried deep enough for us; waiting for the counterparty to agree.
#[derive(Clone)]
pub struct WaitForFundingLocked {
	/// The immutable channel parameters
	pub static_params: StaticParams,
	/// The current chain tip
	pub current_tip: BestBlock,
	/// The channel state proper
	pub commitments: Commitments,
	/// The channel's location in the chain
	pub short_channel_id: u64,
	/// The funding_locked we sent
	pub last_sent: msgs::FundingLocked,
}

/// The operating state: HTLCs flow and commitments advance.
#[derive(Clone)]
pub struct Normal {
	/// The immutable channel parameters
	pub static_params: StaticParams,
	/// The current chain tip
	pub current_tip: BestBlock,
	/// The channel state proper
	pub commitments: Commitments,
	/// The channel's location in the chain
	pub short_channel_id: u64,
	/// Whether the funding transaction reached announcement depth
	pub buried: bool,
	/// Our half of the channel announcement, once signed (never, on this leaf implementation)
	pub channel_announcement: Option<msgs::ChannelAnnouncement>,
	/// The channel_update describing our relay parameters
	pub channel_update: msgs::ChannelUpdate,
	/// Our shutdown message, if we initiated a close
	pub local_shutdown: Option<msgs::Shutdown>,
	/// The counterparty's shutdown message, if they initiated a close
	pub remote_shutdown: Option<msgs::Shutdown>,
}

/// A channel, as a value: the tagged union of every state it can be in, each carrying exactly
/// the data that state needs.
#[derive(Clone)]
pub enum ChannelState {
	/// See [`WaitForInit`]
	WaitForInit(WaitForInit),
	/// See [`WaitForOpenChannel`]
	WaitForOpenChannel(WaitForOpenChannel),
	/// See [`WaitForAcceptChannel`]
	WaitForAcceptChannel(WaitForAcceptChannel),
	/// See [`WaitForFundingInternal`]
	WaitForFundingInternal(WaitForFundingInternal),
	/// See [`WaitForFundingCreated`]
	WaitForFundingCreated(WaitForFundingCreated),
	/// See [`WaitForFundingSigned`]
	WaitForFundingSigned(WaitForFundingSigned),
	/// See [`WaitForFundingConfirmed`]
	WaitForFundingConfirmed(WaitForFundingConfirmed),
	/// See [`WaitForFundingLocked`]
	WaitForFundingLocked(WaitForFundingLocked),
	/// See [`Normal`]
	Normal(Normal),
}

impl ChannelState {
	/// A fresh channel, before we know our role.
	pub fn new(static_params: StaticParams, current_tip: BestBlock) -> ChannelState {
		ChannelState::WaitForInit(WaitForInit { static_params, current_tip })
	}

	/// The name of the current state, for logging.
	pub fn name(&self) -> &'static str {
		match self {
			ChannelState::WaitForInit(_) => "WaitForInit",
			ChannelState::WaitForOpenChannel(_) => "WaitForOpenChannel",
			ChannelState::WaitForAcceptChannel(_) => "WaitForAcceptChannel",
			ChannelState::WaitForFundingInternal(_) => "WaitForFundingInternal",
			ChannelState::WaitForFundingCreated(_) => "WaitForFundingCreated",
			ChannelState::WaitForFundingSigned(_) => "WaitForFundingSigned",
			ChannelState::WaitForFundingConfirmed(_) => "WaitForFundingConfirmed",
			ChannelState::WaitForFundingLocked(_) => "WaitForFundingLocked",
			ChannelState::Normal(_) => "Normal",
		}
	}

	/// The channel's current id: temporary before the funding outpoint exists, definitive after.
	pub fn channel_id(&self) -> ChannelId {
		match self {
			ChannelState::WaitForInit(_) => ChannelId([0; 32]),
			ChannelState::WaitForOpenChannel(state) => state.temporary_channel_id,
			ChannelState::WaitForAcceptChannel(state) => state.init_funder.temporary_channel_id,
			ChannelState::WaitForFundingInternal(state) => state.temporary_channel_id,
			ChannelState::WaitForFundingCreated(state) => state.temporary_channel_id,
			ChannelState::WaitForFundingSigned(state) => state.channel_id,
			ChannelState::WaitForFundingConfirmed(state) => state.commitments.channel_id,
			ChannelState::WaitForFundingLocked(state) => state.commitments.channel_id,
			ChannelState::Normal(state) => state.commitments.channel_id,
		}
	}

	/// The commitments, for states which have any.
	pub fn commitments(&self) -> Option<&Commitments> {
		match self {
			ChannelState::WaitForFundingConfirmed(state) => Some(&state.commitments),
			ChannelState::WaitForFundingLocked(state) => Some(&state.commitments),
			ChannelState::Normal(state) => Some(&state.commitments),
			_ => None,
		}
	}

	fn with_tip(self, tip: BestBlock) -> ChannelState {
		macro_rules! set_tip {
			($variant: ident, $state: expr) => { {
				let mut state = $state;
				state.current_tip = tip;
				ChannelState::$variant(state)
			} }
		}
		match self {
			ChannelState::WaitForInit(state) => set_tip!(WaitForInit, state),
			ChannelState::WaitForOpenChannel(state) => set_tip!(WaitForOpenChannel, state),
			ChannelState::WaitForAcceptChannel(state) => set_tip!(WaitForAcceptChannel, state),
			ChannelState::WaitForFundingInternal(state) => set_tip!(WaitForFundingInternal, state),
			ChannelState::WaitForFundingCreated(state) => set_tip!(WaitForFundingCreated, state),
			ChannelState::WaitForFundingSigned(state) => set_tip!(WaitForFundingSigned, state),
			ChannelState::WaitForFundingConfirmed(state) => set_tip!(WaitForFundingConfirmed, state),
			ChannelState::WaitForFundingLocked(state) => set_tip!(WaitForFundingLocked, state),
			ChannelState::Normal(state) => set_tip!(Normal, state),
		}
	}

	/// Runs one event through the state machine. Never fails: protocol violations surface as
	/// [`Action::HandleError`] and unhandled (state, event) pairs are logged and ignored.
	pub fn process<K: KeysInterface, L: Deref>(self, event: Event, keys: &K, logger: &L, now_seconds: u64) -> (ChannelState, Vec<Action>)
		where L::Target: Logger
	{
		match (self, event) {
			(state, Event::NewBlock(tip)) => (state.with_tip(tip), Vec::new()),

			(ChannelState::WaitForInit(state), Event::InitFunder(init)) =>
				state.init_funder(init, keys, logger),
			(ChannelState::WaitForInit(state), Event::InitFundee(init)) =>
				state.init_fundee(init, logger),

			(ChannelState::WaitForOpenChannel(state), Event::MessageReceived(msgs::Message::OpenChannel(msg))) =>
				state.open_channel(msg, keys, logger),

			(ChannelState::WaitForAcceptChannel(state), Event::MessageReceived(msgs::Message::AcceptChannel(msg))) =>
				state.accept_channel(msg, keys, logger),

			(ChannelState::WaitForFundingInternal(state), Event::MakeFundingTxResponse(resp)) =>
				state.funding_tx_response(resp, keys, logger),

			(ChannelState::WaitForFundingCreated(state), Event::MessageReceived(msgs::Message::FundingCreated(msg))) =>
				state.funding_created(msg, keys, logger, now_seconds),

			(ChannelState::WaitForFundingSigned(state), Event::MessageReceived(msgs::Message::FundingSigned(msg))) =>
				state.funding_signed(msg, keys, logger, now_seconds),

			(ChannelState::WaitForFundingConfirmed(state), Event::MessageReceived(msgs::Message::FundingLocked(msg))) => {
				// Their end confirmed before ours; keep the message for when ours does.
				log_debug!(logger, "received early funding_locked for channel {}, deferring", state.commitments.channel_id);
				let deferred = Some(msg);
				(ChannelState::WaitForFundingConfirmed(WaitForFundingConfirmed { deferred, ..state }), Vec::new())
			},
			(ChannelState::WaitForFundingConfirmed(state), Event::WatchReceived(WatchEvent::Confirmed { tx, block_height, tx_index })) =>
				state.funding_confirmed(tx, block_height, tx_index, keys, logger, now_seconds),
			(ChannelState::WaitForFundingConfirmed(state), Event::CheckFundingTimeout) =>
				state.check_funding_timeout(logger, now_seconds),

			(ChannelState::WaitForFundingLocked(state), Event::MessageReceived(msgs::Message::FundingLocked(msg))) =>
				state.funding_locked(msg, logger, now_seconds),

			(ChannelState::Normal(state), Event::ExecuteCommand(command)) =>
				state.execute_command(command, keys, logger),
			(ChannelState::Normal(state), Event::MessageReceived(message)) =>
				state.message_received(message, keys, logger),
			(ChannelState::Normal(state), Event::WatchReceived(WatchEvent::Confirmed { .. })) => {
				// The funding transaction reached announcement depth.
				let state = Normal { buried: true, ..state };
				(ChannelState::Normal(state), vec![Action::StoreState])
			},

			(state, Event::MessageReceived(msgs::Message::Error(msg))) => {
				let error = ChannelError::Protocol(format!("peer sent error: {}", sanitize(&msg.data)));
				(state, vec![Action::HandleError(error)])
			},

			(state, event) => {
				log_warn!(logger, "unhandled event {:?} in state {}", event, state.name());
				(state, Vec::new())
			},
		}
	}
}

/// Strips control characters from a peer-provided string before it can reach a terminal.
fn sanitize(data: &str) -> String {
	data.chars().map(|c| if c.is_control() { '?' } else { c }).collect()
}

/// The commitment format both init feature sets agree on. The zero-reserve bit is not known yet
/// at this point; it is settled by [`settle_zero_reserve`] once both sides' reserves are on the
/// table.
fn negotiate_channel_version(local_features: &Features, remote_init: &msgs::Init) -> ChannelVersion {
	let mut version = ChannelVersion::STANDARD;
	if Features::can_use_feature(local_features, &remote_init.features, Feature::StaticRemoteKey) {
		version = version.with_static_remotekey();
	}
	version
}

/// Sets [`ChannelVersion::ZERO_RESERVE_BIT`] when both parties declared a zero channel reserve.
/// Each end calls this with the same two numbers (its own parameters and the peer's
/// open_channel/accept_channel), so funder and fundee settle on the same channel version.
fn settle_zero_reserve(version: ChannelVersion, local_reserve_satoshis: u64, remote_reserve_satoshis: u64) -> ChannelVersion {
	if local_reserve_satoshis == 0 && remote_reserve_satoshis == 0 {
		version.with_zero_reserve()
	} else {
		version
	}
}

impl WaitForInit {
	fn init_funder<K: KeysInterface, L: Deref>(self, init: InitFunder, keys: &K, logger: &L) -> (ChannelState, Vec<Action>)
		where L::Target: Logger
	{
		let channel_version = negotiate_channel_version(&self.static_params.config.handshake.features, &init.remote_init);
		let key_path = keys.channel_key_path(&init.local_params, channel_version);
		let local_pubkeys = local_channel_pubkeys(keys, &key_path);
		let open = msgs::OpenChannel {
			chain_hash: self.static_params.chain_hash,
			temporary_channel_id: init.temporary_channel_id,
			funding_satoshis: init.funding_satoshis,
			push_msat: init.push_msat,
			dust_limit_satoshis: init.local_params.dust_limit_satoshis,
			max_htlc_value_in_flight_msat: init.local_params.max_htlc_value_in_flight_msat,
			channel_reserve_satoshis: init.local_params.channel_reserve_satoshis,
			htlc_minimum_msat: init.local_params.htlc_minimum_msat,
			feerate_per_kw: init.initial_feerate_per_kw,
			to_self_delay: init.local_params.to_self_delay,
			max_accepted_htlcs: init.local_params.max_accepted_htlcs,
			funding_pubkey: local_pubkeys.funding_pubkey,
			revocation_basepoint: local_pubkeys.revocation_basepoint,
			payment_basepoint: local_pubkeys.payment_basepoint,
			delayed_payment_basepoint: local_pubkeys.delayed_payment_basepoint,
			htlc_basepoint: local_pubkeys.htlc_basepoint,
			first_per_commitment_point: keys.commitment_point(&key_path, 0),
			channel_flags: init.channel_flags,
		};
		log_info!(logger, "funding a {} sat channel to {} with temporary id {}",
			init.funding_satoshis, log_pubkey!(self.static_params.remote_node_id), init.temporary_channel_id);
		let actions = vec![Action::SendMessage(msgs::Message::OpenChannel(open.clone()))];
		(ChannelState::WaitForAcceptChannel(WaitForAcceptChannel {
			static_params: self.static_params,
			current_tip: self.current_tip,
			init_funder: init,
			channel_version,
			last_sent: open,
		}), actions)
	}

	fn init_fundee<L: Deref>(self, init: InitFundee, logger: &L) -> (ChannelState, Vec<Action>)
		where L::Target: Logger
	{
		log_info!(logger, "accepting an inbound channel from {}", log_pubkey!(self.static_params.remote_node_id));
		(ChannelState::WaitForOpenChannel(WaitForOpenChannel {
			static_params: self.static_params,
			current_tip: self.current_tip,
			temporary_channel_id: init.temporary_channel_id,
			local_params: init.local_params,
			remote_init: init.remote_init,
		}), Vec::new())
	}
}

fn validate_open_channel(static_params: &StaticParams, msg: &msgs::OpenChannel) -> Result<(), ChannelError> {
	let limits = &static_params.config.limits;
	if msg.chain_hash != static_params.chain_hash {
		return Err(ChannelError::InvalidParameters(format!("open_channel for foreign chain {}", msg.chain_hash)));
	}
	if msg.funding_satoshis < limits.min_funding_satoshis || msg.funding_satoshis > limits.max_funding_satoshis.min(MAX_FUNDING_SATOSHIS) {
		return Err(ChannelError::InvalidParameters(format!("funding of {} sat is outside our limits", msg.funding_satoshis)));
	}
	if msg.push_msat > msg.funding_satoshis * 1000 {
		return Err(ChannelError::InvalidParameters("push_msat larger than funding".to_owned()));
	}
	if msg.dust_limit_satoshis < MIN_DUST_LIMIT_SATOSHIS.max(limits.min_dust_limit_satoshis)
		|| msg.dust_limit_satoshis > limits.max_dust_limit_satoshis {
		return Err(ChannelError::InvalidParameters(format!("dust limit of {} sat is outside our limits", msg.dust_limit_satoshis)));
	}
	if msg.dust_limit_satoshis > msg.channel_reserve_satoshis && msg.channel_reserve_satoshis != 0 {
		return Err(ChannelError::InvalidParameters("dust limit larger than the channel reserve".to_owned()));
	}
	if msg.channel_reserve_satoshis > msg.funding_satoshis / 10 {
		return Err(ChannelError::InvalidParameters("channel reserve larger than 10% of the funding".to_owned()));
	}
	if msg.to_self_delay > MAX_TO_SELF_DELAY.min(limits.max_to_self_delay) {
		return Err(ChannelError::InvalidParameters(format!("to_self_delay of {} blocks is too long", msg.to_self_delay)));
	}
	if msg.max_accepted_htlcs > MAX_ACCEPTED_HTLCS {
		return Err(ChannelError::InvalidParameters(format!("max_accepted_htlcs of {} exceeds the protocol limit", msg.max_accepted_htlcs)));
	}
	if msg.htlc_minimum_msat > limits.max_htlc_minimum_msat {
		return Err(ChannelError::InvalidParameters("htlc_minimum_msat too high".to_owned()));
	}
	if msg.feerate_per_kw < FEERATE_FLOOR_SATS_PER_KW {
		return Err(ChannelError::InvalidParameters(format!("feerate of {} is below the floor", msg.feerate_per_kw)));
	}
	Ok(())
}

fn validate_accept_channel(static_params: &StaticParams, init: &InitFunder, msg: &msgs::AcceptChannel) -> Result<(), ChannelError> {
	let limits = &static_params.config.limits;
	if msg.minimum_depth > limits.max_minimum_depth {
		return Err(ChannelError::InvalidParameters(format!("minimum depth of {} is too high", msg.minimum_depth)));
	}
	if msg.dust_limit_satoshis < MIN_DUST_LIMIT_SATOSHIS.max(limits.min_dust_limit_satoshis)
		|| msg.dust_limit_satoshis > limits.max_dust_limit_satoshis {
		return Err(ChannelError::InvalidParameters(format!("dust limit of {} sat is outside our limits", msg.dust_limit_satoshis)));
	}
	if msg.channel_reserve_satoshis > limits.max_channel_reserve_satoshis.min(init.funding_satoshis / 10) {
		return Err(ChannelError::InvalidParameters(format!("channel reserve of {} sat is too high", msg.channel_reserve_satoshis)));
	}
	if msg.dust_limit_satoshis > msg.channel_reserve_satoshis && msg.channel_reserve_satoshis != 0 {
		return Err(ChannelError::InvalidParameters("dust limit larger than the channel reserve".to_owned()));
	}
	if msg.to_self_delay > MAX_TO_SELF_DELAY.min(limits.max_to_self_delay) {
		return Err(ChannelError::InvalidParameters(format!("to_self_delay of {} blocks is too long", msg.to_self_delay)));
	}
	if msg.max_accepted_htlcs > MAX_ACCEPTED_HTLCS || msg.max_accepted_htlcs < limits.min_max_accepted_htlcs {
		return Err(ChannelError::InvalidParameters(format!("max_accepted_htlcs of {} is outside our limits", msg.max_accepted_htlcs)));
	}
	if msg.htlc_minimum_msat > limits.max_htlc_minimum_msat {
		return Err(ChannelError::InvalidParameters("htlc_minimum_msat too high".to_owned()));
	}
	if msg.max_htlc_value_in_flight_msat < limits.min_max_htlc_value_in_flight_msat {
		return Err(ChannelError::InvalidParameters("max_htlc_value_in_flight_msat too low".to_owned()));
	}
	Ok(())
}

impl WaitForOpenChannel {
	fn open_channel<K: KeysInterface, L: Deref>(self, msg: msgs::OpenChannel, keys: &K, logger: &L) -> (ChannelState, Vec<Action>)
		where L::Target: Logger
	{
		if let Err(error) = validate_open_channel(&self.static_params, &msg) {
			log_warn!(logger, "rejecting open_channel: {}", error);
			return (ChannelState::WaitForOpenChannel(self), vec![Action::HandleError(error)]);
		}

		let channel_version = settle_zero_reserve(
			negotiate_channel_version(&self.static_params.config.handshake.features, &self.remote_init),
			self.local_params.channel_reserve_satoshis, msg.channel_reserve_satoshis);
		// A zero-reserve counterparty trusts us; no point making them wait for confirmations.
		let minimum_depth = if channel_version.is_zero_reserve() { 0 } else { self.static_params.config.handshake.minimum_depth };

		let key_path = keys.channel_key_path(&self.local_params, channel_version);
		let local_pubkeys = local_channel_pubkeys(keys, &key_path);
		let accept = msgs::AcceptChannel {
			temporary_channel_id: msg.temporary_channel_id,
			dust_limit_satoshis: self.local_params.dust_limit_satoshis,
			max_htlc_value_in_flight_msat: self.local_params.max_htlc_value_in_flight_msat,
			channel_reserve_satoshis: self.local_params.channel_reserve_satoshis,
			htlc_minimum_msat: self.local_params.htlc_minimum_msat,
			minimum_depth,
			to_self_delay: self.local_params.to_self_delay,
			max_accepted_htlcs: self.local_params.max_accepted_htlcs,
			funding_pubkey: local_pubkeys.funding_pubkey,
			revocation_basepoint: local_pubkeys.revocation_basepoint,
			payment_basepoint: local_pubkeys.payment_basepoint,
			delayed_payment_basepoint: local_pubkeys.delayed_payment_basepoint,
			htlc_basepoint: local_pubkeys.htlc_basepoint,
			first_per_commitment_point: keys.commitment_point(&key_path, 0),
		};
		let remote_params = RemoteParams {
			dust_limit_satoshis: msg.dust_limit_satoshis,
			max_htlc_value_in_flight_msat: msg.max_htlc_value_in_flight_msat,
			channel_reserve_satoshis: msg.channel_reserve_satoshis,
			htlc_minimum_msat: msg.htlc_minimum_msat,
			to_self_delay: msg.to_self_delay,
			max_accepted_htlcs: msg.max_accepted_htlcs,
			pubkeys: crate::ln::chan_utils::ChannelPublicKeys {
				funding_pubkey: msg.funding_pubkey,
				revocation_basepoint: msg.revocation_basepoint,
				payment_basepoint: msg.payment_basepoint,
				delayed_payment_basepoint: msg.delayed_payment_basepoint,
				htlc_basepoint: msg.htlc_basepoint,
			},
			features: self.remote_init.features.clone(),
		};
		log_info!(logger, "accepting a {} sat channel with temporary id {}", msg.funding_satoshis, msg.temporary_channel_id);
		let actions = vec![Action::SendMessage(msgs::Message::AcceptChannel(accept.clone()))];
		(ChannelState::WaitForFundingCreated(WaitForFundingCreated {
			static_params: self.static_params,
			current_tip: self.current_tip,
			temporary_channel_id: msg.temporary_channel_id,
			local_params: self.local_params,
			remote_params,
			funding_satoshis: msg.funding_satoshis,
			push_msat: msg.push_msat,
			initial_feerate_per_kw: msg.feerate_per_kw,
			minimum_depth,
			remote_first_per_commitment_point: msg.first_per_commitment_point,
			channel_flags: msg.channel_flags,
			channel_version,
			last_sent: accept,
		}), actions)
	}
}

impl WaitForAcceptChannel {
	fn accept_channel<K: KeysInterface, L: Deref>(self, msg: msgs::AcceptChannel, keys: &K, logger: &L) -> (ChannelState, Vec<Action>)
		where L::Target: Logger
	{
		if let Err(error) = validate_accept_channel(&self.static_params, &self.init_funder, &msg) {
			log_warn!(logger, "rejecting accept_channel: {}", error);
			return (ChannelState::WaitForAcceptChannel(self), vec![Action::HandleError(error)]);
		}

		// With the counterparty's reserve now on the table, the channel version is final. The
		// fundee ran the same computation on our open_channel.
		let channel_version = settle_zero_reserve(self.channel_version,
			self.init_funder.local_params.channel_reserve_satoshis, msg.channel_reserve_satoshis);

		let key_path = keys.channel_key_path(&self.init_funder.local_params, channel_version);
		let local_funding_pubkey = keys.funding_public_key(&key_path);
		let funding_script = make_funding_redeemscript(&local_funding_pubkey, &msg.funding_pubkey).to_v0_p2wsh();

		let remote_params = RemoteParams {
			dust_limit_satoshis: msg.dust_limit_satoshis,
			max_htlc_value_in_flight_msat: msg.max_htlc_value_in_flight_msat,
			channel_reserve_satoshis: msg.channel_reserve_satoshis,
			htlc_minimum_msat: msg.htlc_minimum_msat,
			to_self_delay: msg.to_self_delay,
			max_accepted_htlcs: msg.max_accepted_htlcs,
			pubkeys: crate::ln::chan_utils::ChannelPublicKeys {
				funding_pubkey: msg.funding_pubkey,
				revocation_basepoint: msg.revocation_basepoint,
				payment_basepoint: msg.payment_basepoint,
				delayed_payment_basepoint: msg.delayed_payment_basepoint,
				htlc_basepoint: msg.htlc_basepoint,
			},
			features: self.init_funder.remote_init.features.clone(),
		};
		log_debug!(logger, "channel {} accepted, requesting a funding tx", self.init_funder.temporary_channel_id);
		let actions = vec![Action::MakeFundingTx(MakeFundingTx {
			script_pubkey: funding_script,
			amount_satoshis: self.init_funder.funding_satoshis,
			feerate_per_kw: self.init_funder.funding_tx_feerate_per_kw,
		})];
		(ChannelState::WaitForFundingInternal(WaitForFundingInternal {
			static_params: self.static_params,
			current_tip: self.current_tip,
			temporary_channel_id: self.init_funder.temporary_channel_id,
			local_params: self.init_funder.local_params,
			remote_params,
			funding_satoshis: self.init_funder.funding_satoshis,
			push_msat: self.init_funder.push_msat,
			initial_feerate_per_kw: self.init_funder.initial_feerate_per_kw,
			minimum_depth: msg.minimum_depth,
			remote_first_per_commitment_point: msg.first_per_commitment_point,
			channel_flags: self.init_funder.channel_flags,
			channel_version,
			last_sent: self.last_sent,
		}), actions)
	}
}

impl WaitForFundingInternal {
	fn funding_tx_response<K: KeysInterface, L: Deref>(self, resp: MakeFundingTxResponse, keys: &K, logger: &L) -> (ChannelState, Vec<Action>)
		where L::Target: Logger
	{
		let key_path = keys.channel_key_path(&self.local_params, self.channel_version);
		let local_funding_pubkey = keys.funding_public_key(&key_path);
		let redeem_script = make_funding_redeemscript(&local_funding_pubkey, &self.remote_params.pubkeys.funding_pubkey);
		let expected_script = redeem_script.to_v0_p2wsh();

		match resp.funding_tx.output.get(resp.output_index as usize) {
			Some(output) if output.script_pubkey == expected_script && output.value == self.funding_satoshis => {},
			_ => {
				log_error!(logger, "wallet built a funding tx which does not pay the funding script");
				return (ChannelState::WaitForFundingInternal(self), vec![Action::HandleError(ChannelError::InvalidFundingTx)]);
			},
		}

		let funding_txid = resp.funding_tx.txid();
		let commit_input = InputInfo {
			outpoint: OutPoint { txid: funding_txid, vout: resp.output_index as u32 },
			txout: TxOut { value: self.funding_satoshis, script_pubkey: expected_script },
			redeem_script,
		};
		let (local_spec, remote_spec) = make_first_commitment_specs(
			self.funding_satoshis, self.push_msat, self.initial_feerate_per_kw, true);

		let remote_parts = match make_commit_tx(keys, false, 0, &remote_spec, &self.remote_first_per_commitment_point,
				&self.local_params, &self.remote_params, self.channel_version, &commit_input) {
			Ok(parts) => parts,
			Err(error) => {
				log_error!(logger, "cannot build the first commitment: {}", error);
				return (ChannelState::WaitForFundingInternal(self), vec![Action::HandleError(error)]);
			},
		};
		let local_parts = match make_commit_tx(keys, true, 0, &local_spec, &keys.commitment_point(&key_path, 0),
				&self.local_params, &self.remote_params, self.channel_version, &commit_input) {
			Ok(parts) => parts,
			Err(error) => {
				log_error!(logger, "cannot build the first commitment: {}", error);
				return (ChannelState::WaitForFundingInternal(self), vec![Action::HandleError(error)]);
			},
		};

		let signature = keys.sign_funding_spend(&key_path, &remote_parts.tx, 0, &commit_input.redeem_script, commit_input.txout.value);
		let funding_created = msgs::FundingCreated {
			temporary_channel_id: self.temporary_channel_id,
			funding_txid,
			funding_output_index: resp.output_index,
			signature,
		};
		let channel_id = ChannelId::v1_from_funding_txid(&funding_txid, resp.output_index);
		log_info!(logger, "funding tx built for channel {}, now known as {}", self.temporary_channel_id, channel_id);

		let actions = vec![
			Action::ChannelIdAssigned { temporary_channel_id: self.temporary_channel_id, channel_id },
			Action::SendMessage(msgs::Message::FundingCreated(funding_created.clone())),
		];
		(ChannelState::WaitForFundingSigned(WaitForFundingSigned {
			static_params: self.static_params,
			current_tip: self.current_tip,
			channel_id,
			local_params: self.local_params,
			remote_params: self.remote_params,
			funding_tx: resp.funding_tx,
			funding_tx_fee_satoshis: resp.fee_satoshis,
			minimum_depth: self.minimum_depth,
			local_spec,
			local_commit_tx: local_parts.tx,
			commit_input,
			remote_commit: RemoteCommit {
				index: 0,
				spec: remote_spec,
				txid: remote_parts.tx.txid(),
				remote_per_commitment_point: self.remote_first_per_commitment_point,
			},
			channel_flags: self.channel_flags,
			channel_version: self.channel_version,
			last_sent: funding_created,
		}), actions)
	}
}

/// A placeholder for the counterparty's next per-commitment point, used until their
/// funding_locked supplies the real one. Must be a valid point so the state serializes.
fn random_point_placeholder<K: KeysInterface>(keys: &K) -> PublicKey {
	let secp_ctx = Secp256k1::new();
	let secret = SecretKey::from_slice(&keys.get_secure_random_bytes()).expect("RNG is busted");
	PublicKey::from_secret_key(&secp_ctx, &secret)
}

impl WaitForFundingCreated {
	fn funding_created<K: KeysInterface, L: Deref>(self, msg: msgs::FundingCreated, keys: &K, logger: &L, now_seconds: u64) -> (ChannelState, Vec<Action>)
		where L::Target: Logger
	{
		let secp_ctx = Secp256k1::new();
		let key_path = keys.channel_key_path(&self.local_params, self.channel_version);
		let local_pubkeys = local_channel_pubkeys(keys, &key_path);
		let redeem_script = make_funding_redeemscript(&local_pubkeys.funding_pubkey, &self.remote_params.pubkeys.funding_pubkey);
		let commit_input = InputInfo {
			outpoint: OutPoint { txid: msg.funding_txid, vout: msg.funding_output_index as u32 },
			txout: TxOut { value: self.funding_satoshis, script_pubkey: redeem_script.to_v0_p2wsh() },
			redeem_script,
		};
		let (local_spec, remote_spec) = make_first_commitment_specs(
			self.funding_satoshis, self.push_msat, self.initial_feerate_per_kw, false);

		let local_parts = match make_commit_tx(keys, true, 0, &local_spec, &keys.commitment_point(&key_path, 0),
				&self.local_params, &self.remote_params, self.channel_version, &commit_input) {
			Ok(parts) => parts,
			Err(error) => {
				log_error!(logger, "cannot build the first commitment: {}", error);
				return (ChannelState::WaitForFundingCreated(self), vec![Action::HandleError(error)]);
			},
		};
		if !verify_signature(&secp_ctx, &local_parts.tx, 0, &commit_input.redeem_script,
				commit_input.txout.value, &msg.signature, &self.remote_params.pubkeys.funding_pubkey) {
			log_error!(logger, "invalid funding_created signature for channel {}", self.temporary_channel_id);
			return (ChannelState::WaitForFundingCreated(self), vec![Action::HandleError(ChannelError::InvalidCommitmentSignature)]);
		}
		let local_sig = keys.sign_funding_spend(&key_path, &local_parts.tx, 0, &commit_input.redeem_script, commit_input.txout.value);
		let mut local_commit_tx = local_parts.tx.clone();
		local_commit_tx.input[0].witness = build_funding_witness(&commit_input.redeem_script,
			&local_sig, &local_pubkeys.funding_pubkey, &msg.signature, &self.remote_params.pubkeys.funding_pubkey);

		let remote_parts = match make_commit_tx(keys, false, 0, &remote_spec, &self.remote_first_per_commitment_point,
				&self.local_params, &self.remote_params, self.channel_version, &commit_input) {
			Ok(parts) => parts,
			Err(error) => {
				log_error!(logger, "cannot build the first commitment: {}", error);
				return (ChannelState::WaitForFundingCreated(self), vec![Action::HandleError(error)]);
			},
		};
		let remote_sig = keys.sign_funding_spend(&key_path, &remote_parts.tx, 0, &commit_input.redeem_script, commit_input.txout.value);

		let channel_id = ChannelId::v1_from_funding_txid(&msg.funding_txid, msg.funding_output_index);
		let funding_signed = msgs::FundingSigned { channel_id, signature: remote_sig };
		log_info!(logger, "funding created for channel {}, now known as {}", self.temporary_channel_id, channel_id);

		let commitments = Commitments {
			channel_version: self.channel_version,
			local_params: self.local_params,
			remote_params: self.remote_params,
			channel_flags: self.channel_flags,
			local_commit: LocalCommit {
				index: 0,
				spec: local_spec,
				publishable_txs: PublishableTxs { commit_tx: local_commit_tx, htlc_txs_and_sigs: Vec::new() },
			},
			remote_commit: RemoteCommit {
				index: 0,
				spec: remote_spec,
				txid: remote_parts.tx.txid(),
				remote_per_commitment_point: self.remote_first_per_commitment_point,
			},
			local_changes: LocalChanges::new(),
			remote_changes: RemoteChanges::new(),
			local_next_htlc_id: 0,
			remote_next_htlc_id: 0,
			remote_next_commit_info: RemoteNextCommitInfo::NextPoint(random_point_placeholder(keys)),
			commit_input,
			remote_per_commitment_secrets: CommitmentSecrets::new(),
			origin_channels: Vec::new(),
			channel_id,
		};

		let actions = vec![
			Action::SendWatch(WatchRequest::Spent { outpoint: commitments.commit_input.outpoint }),
			Action::SendWatch(WatchRequest::Confirmed { txid: msg.funding_txid, min_depth: self.minimum_depth }),
			Action::SendMessage(msgs::Message::FundingSigned(funding_signed.clone())),
			Action::ChannelIdAssigned { temporary_channel_id: self.temporary_channel_id, channel_id },
			Action::StoreState,
		];
		(ChannelState::WaitForFundingConfirmed(WaitForFundingConfirmed {
			static_params: self.static_params,
			current_tip: self.current_tip,
			commitments,
			funding_tx: None,
			waiting_since: now_seconds,
			deferred: None,
			last_sent: LastSent::FundingSigned(funding_signed),
		}), actions)
	}
}

impl WaitForFundingSigned {
	fn funding_signed<K: KeysInterface, L: Deref>(self, msg: msgs::FundingSigned, keys: &K, logger: &L, now_seconds: u64) -> (ChannelState, Vec<Action>)
		where L::Target: Logger
	{
		let secp_ctx = Secp256k1::new();
		let key_path = keys.channel_key_path(&self.local_params, self.channel_version);
		let local_pubkeys = local_channel_pubkeys(keys, &key_path);

		if !verify_signature(&secp_ctx, &self.local_commit_tx, 0, &self.commit_input.redeem_script,
				self.commit_input.txout.value, &msg.signature, &self.remote_params.pubkeys.funding_pubkey) {
			log_error!(logger, "invalid funding_signed signature for channel {}", self.channel_id);
			return (ChannelState::WaitForFundingSigned(self), vec![Action::HandleError(ChannelError::InvalidCommitmentSignature)]);
		}
		let local_sig = keys.sign_funding_spend(&key_path, &self.local_commit_tx, 0, &self.commit_input.redeem_script, self.commit_input.txout.value);
		let mut local_commit_tx = self.local_commit_tx.clone();
		local_commit_tx.input[0].witness = build_funding_witness(&self.commit_input.redeem_script,
			&local_sig, &local_pubkeys.funding_pubkey, &msg.signature, &self.remote_params.pubkeys.funding_pubkey);

		let commitments = Commitments {
			channel_version: self.channel_version,
			local_params: self.local_params,
			remote_params: self.remote_params,
			channel_flags: self.channel_flags,
			local_commit: LocalCommit {
				index: 0,
				spec: self.local_spec,
				publishable_txs: PublishableTxs { commit_tx: local_commit_tx, htlc_txs_and_sigs: Vec::new() },
			},
			remote_commit: self.remote_commit,
			local_changes: LocalChanges::new(),
			remote_changes: RemoteChanges::new(),
			local_next_htlc_id: 0,
			remote_next_htlc_id: 0,
			remote_next_commit_info: RemoteNextCommitInfo::NextPoint(random_point_placeholder(keys)),
			commit_input: self.commit_input,
			remote_per_commitment_secrets: CommitmentSecrets::new(),
			origin_channels: Vec::new(),
			channel_id: self.channel_id,
		};
		log_info!(logger, "publishing funding tx for channel {}", self.channel_id);

		let actions = vec![
			Action::SendWatch(WatchRequest::Spent { outpoint: commitments.commit_input.outpoint }),
			Action::SendWatch(WatchRequest::Confirmed { txid: commitments.commit_input.outpoint.txid, min_depth: self.minimum_depth }),
			Action::StoreState,
			Action::PublishTx(self.funding_tx.clone()),
		];
		(ChannelState::WaitForFundingConfirmed(WaitForFundingConfirmed {
			static_params: self.static_params,
			current_tip: self.current_tip,
			commitments,
			funding_tx: Some(self.funding_tx),
			waiting_since: now_seconds,
			deferred: None,
			last_sent: LastSent::FundingCreated(self.last_sent),
		}), actions)
	}
}

impl WaitForFundingConfirmed {
	fn funding_confirmed<K: KeysInterface, L: Deref>(self, tx: Transaction, block_height: u32, tx_index: u32, keys: &K, logger: &L, now_seconds: u64) -> (ChannelState, Vec<Action>)
		where L::Target: Logger
	{
		let funding_outpoint = self.commitments.commit_input.outpoint;
		if tx.txid() != funding_outpoint.txid {
			log_warn!(logger, "confirmation of unknown tx {} for channel {}", tx.txid(), self.commitments.channel_id);
			return (ChannelState::WaitForFundingConfirmed(self), Vec::new());
		}
		let output_ok = tx.output.get(funding_outpoint.vout as usize)
			.map(|output| *output == self.commitments.commit_input.txout)
			.unwrap_or(false);
		if !output_ok {
			// Somebody got the funding transaction wrong; on a real chain this channel must not
			// come up. Regtest setups routinely mangle coinbase-funded test transactions, so only
			// warn there.
			if self.static_params.network != Network::Regtest {
				log_error!(logger, "funding tx {} does not pay the funding script", funding_outpoint.txid);
				return (ChannelState::WaitForFundingConfirmed(self), vec![Action::HandleError(ChannelError::InvalidFundingTx)]);
			}
			log_warn!(logger, "funding tx {} does not pay the funding script; ignoring on regtest", funding_outpoint.txid);
		}

		let short_channel_id = match scid_from_parts(block_height as u64, tx_index as u64, funding_outpoint.vout as u64) {
			Ok(scid) => scid,
			Err(_) => {
				log_error!(logger, "confirmation of channel {} at an unrepresentable location", self.commitments.channel_id);
				return (ChannelState::WaitForFundingConfirmed(self), Vec::new());
			},
		};

		let key_path = keys.channel_key_path(&self.commitments.local_params, self.commitments.channel_version);
		let funding_locked = msgs::FundingLocked {
			channel_id: self.commitments.channel_id,
			next_per_commitment_point: keys.commitment_point(&key_path, 1),
		};
		log_info!(logger, "funding tx for channel {} confirmed at height {}", self.commitments.channel_id, block_height);

		let mut actions = vec![
			Action::SendWatch(WatchRequest::Lost { txid: funding_outpoint.txid }),
			Action::SendMessage(msgs::Message::FundingLocked(funding_locked.clone())),
			Action::StoreState,
		];
		let state = ChannelState::WaitForFundingLocked(WaitForFundingLocked {
			static_params: self.static_params,
			current_tip: self.current_tip,
			commitments: self.commitments,
			short_channel_id,
			last_sent: funding_locked,
		});
		// If their funding_locked arrived while we were still waiting, replay it now.
		if let Some(deferred) = self.deferred {
			let (state, mut deferred_actions) = state.process(
				Event::MessageReceived(msgs::Message::FundingLocked(deferred)), keys, logger, now_seconds);
			actions.append(&mut deferred_actions);
			return (state, actions);
		}
		(state, actions)
	}

	fn check_funding_timeout<L: Deref>(self, logger: &L, now_seconds: u64) -> (ChannelState, Vec<Action>)
		where L::Target: Logger
	{
		// Only the fundee gives up: the funder can always double-spend its own funding input.
		let is_fundee = matches!(self.last_sent, LastSent::FundingSigned(_));
		if is_fundee && now_seconds >= self.waiting_since + FUNDING_TIMEOUT_FUNDEE {
			log_warn!(logger, "funding tx for channel {} unconfirmed after {} seconds",
				self.commitments.channel_id, now_seconds - self.waiting_since);
			let error = ChannelError::Protocol("funding transaction timed out".to_owned());
			return (ChannelState::WaitForFundingConfirmed(self), vec![Action::HandleError(error)]);
		}
		(ChannelState::WaitForFundingConfirmed(self), Vec::new())
	}
}

/// Signs and assembles the channel_update advertising our relay parameters.
fn make_channel_update(static_params: &StaticParams, short_channel_id: u64, capacity_msat: u64, htlc_minimum_msat: u64, timestamp: u32) -> msgs::ChannelUpdate {
	let secp_ctx = Secp256k1::new();
	let handshake = &static_params.config.handshake;
	let direction = if static_params.node_id.serialize()[..] < static_params.remote_node_id.serialize()[..] { 0 } else { 1 };
	let message_flags = 1u8; // htlc_maximum_msat is present
	let cltv_expiry_delta = handshake.cltv_expiry_delta;
	let fee_base_msat = handshake.fee_base_msat;
	let fee_proportional_millionths = handshake.fee_proportional_millionths;

	// The signature covers the double-SHA256 of everything after the signature field.
	let mut content = VecWriter(Vec::new());
	static_params.chain_hash.write(&mut content).expect("in-memory write");
	short_channel_id.write(&mut content).expect("in-memory write");
	timestamp.write(&mut content).expect("in-memory write");
	message_flags.write(&mut content).expect("in-memory write");
	direction.write(&mut content).expect("in-memory write");
	cltv_expiry_delta.write(&mut content).expect("in-memory write");
	htlc_minimum_msat.write(&mut content).expect("in-memory write");
	fee_base_msat.write(&mut content).expect("in-memory write");
	fee_proportional_millionths.write(&mut content).expect("in-memory write");
	capacity_msat.write(&mut content).expect("in-memory write");
	let digest = Sha256d::hash(&content.0);
	let signature = secp_ctx.sign_ecdsa(&SecpMessage::from_slice(&digest[..]).expect("32-byte hash"), &static_params.node_secret);

	msgs::ChannelUpdate {
		signature,
		chain_hash: static_params.chain_hash,
		short_channel_id,
		timestamp,
		message_flags,
		channel_flags: direction,
		cltv_expiry_delta,
		htlc_minimum_msat,
		fee_base_msat,
		fee_proportional_millionths,
		htlc_maximum_msat: capacity_msat,
	}
}

impl WaitForFundingLocked {
	fn funding_locked<L: Deref>(self, msg: msgs::FundingLocked, logger: &L, now_seconds: u64) -> (ChannelState, Vec<Action>)
		where L::Target: Logger
	{
		let mut commitments = self.commitments;
		// Their funding_locked hands us the point for their commitment number 1.
		commitments.remote_next_commit_info = RemoteNextCommitInfo::NextPoint(msg.next_per_commitment_point);
		let capacity_msat = commitments.commit_input.txout.value * 1000;
		let channel_update = make_channel_update(&self.static_params, self.short_channel_id,
			capacity_msat, commitments.local_params.htlc_minimum_msat, now_seconds as u32);
		log_info!(logger, "channel {} is now operational", commitments.channel_id);

		let actions = vec![
			Action::SendWatch(WatchRequest::Confirmed {
				txid: commitments.commit_input.outpoint.txid,
				min_depth: ANNOUNCEMENTS_MINCONF,
			}),
			Action::StoreState,
		];
		(ChannelState::Normal(Normal {
			static_params: self.static_params,
			current_tip: self.current_tip,
			commitments,
			short_channel_id: self.short_channel_id,
			buried: false,
			channel_announcement: None,
			channel_update,
			local_shutdown: None,
			remote_shutdown: None,
		}), actions)
	}
}

impl Normal {
	fn with_commitments(&self, commitments: Commitments) -> Normal {
		Normal { commitments, ..self.clone() }
	}

	fn execute_command<K: KeysInterface, L: Deref>(self, command: Command, keys: &K, logger: &L) -> (ChannelState, Vec<Action>)
		where L::Target: Logger
	{
		match command {
			Command::AddHtlc { amount_msat, payment_hash, cltv_expiry, onion_routing_packet, commit } => {
				if self.local_shutdown.is_some() || self.remote_shutdown.is_some() {
					let error = ChannelError::Protocol("cannot send a new htlc while closing".to_owned());
					return (ChannelState::Normal(self), vec![Action::HandleError(error)]);
				}
				match self.commitments.send_add(amount_msat, payment_hash, cltv_expiry, onion_routing_packet, self.current_tip.height) {
					Ok((commitments, add)) => {
						log_debug!(logger, "sending htlc {} of {} msat on channel {}", add.htlc_id, add.amount_msat, add.channel_id);
						let mut actions = vec![Action::SendMessage(msgs::Message::UpdateAddHTLC(add))];
						if commit {
							actions.push(Action::ProcessCommand(Command::Sign));
						}
						(ChannelState::Normal(self.with_commitments(commitments)), actions)
					},
					Err(error) => (ChannelState::Normal(self), vec![Action::HandleError(error)]),
				}
			},
			Command::FulfillHtlc { htlc_id, payment_preimage, commit } => {
				match self.commitments.send_fulfill(htlc_id, payment_preimage) {
					Ok((commitments, fulfill)) => {
						let mut actions = vec![Action::SendMessage(msgs::Message::UpdateFulfillHTLC(fulfill))];
						if commit {
							actions.push(Action::ProcessCommand(Command::Sign));
						}
						(ChannelState::Normal(self.with_commitments(commitments)), actions)
					},
					Err(error) => (ChannelState::Normal(self), vec![Action::HandleError(error)]),
				}
			},
			Command::FailHtlc { htlc_id, reason, commit } => {
				match self.commitments.send_fail(htlc_id, reason) {
					Ok((commitments, fail)) => {
						let mut actions = vec![Action::SendMessage(msgs::Message::UpdateFailHTLC(fail))];
						if commit {
							actions.push(Action::ProcessCommand(Command::Sign));
						}
						(ChannelState::Normal(self.with_commitments(commitments)), actions)
					},
					Err(error) => (ChannelState::Normal(self), vec![Action::HandleError(error)]),
				}
			},
			Command::FailMalformedHtlc { htlc_id, sha256_of_onion, failure_code, commit } => {
				match self.commitments.send_fail_malformed(htlc_id, sha256_of_onion, failure_code) {
					Ok((commitments, fail)) => {
						let mut actions = vec![Action::SendMessage(msgs::Message::UpdateFailMalformedHTLC(fail))];
						if commit {
							actions.push(Action::ProcessCommand(Command::Sign));
						}
						(ChannelState::Normal(self.with_commitments(commitments)), actions)
					},
					Err(error) => (ChannelState::Normal(self), vec![Action::HandleError(error)]),
				}
			},
			Command::Sign => self.sign(keys, logger),
		}
	}

	fn sign<K: KeysInterface, L: Deref>(self, keys: &K, logger: &L) -> (ChannelState, Vec<Action>)
		where L::Target: Logger
	{
		match &self.commitments.remote_next_commit_info {
			RemoteNextCommitInfo::WaitingForRevocation(waiting) => {
				// A dance is already in flight; re-sign the moment it finishes.
				let mut commitments = self.commitments.clone();
				let mut waiting = waiting.clone();
				waiting.re_sign_asap = true;
				commitments.remote_next_commit_info = RemoteNextCommitInfo::WaitingForRevocation(waiting);
				(ChannelState::Normal(self.with_commitments(commitments)), Vec::new())
			},
			RemoteNextCommitInfo::NextPoint(_) => {
				if !self.commitments.local_has_changes() {
					log_debug!(logger, "ignoring sign command without pending changes on channel {}", self.commitments.channel_id);
					return (ChannelState::Normal(self), Vec::new());
				}
				match self.commitments.send_commit(keys) {
					Ok((commitments, commit_sig)) => {
						let htlc_infos = match &commitments.remote_next_commit_info {
							RemoteNextCommitInfo::WaitingForRevocation(waiting) => {
								let spec = &waiting.next_remote_commit.spec;
								let dust_limit = commitments.remote_params.dust_limit_satoshis;
								let htlcs = spec.htlcs.iter().filter(|htlc| {
									let threshold = match htlc.direction {
										HtlcDirection::Outgoing => offered_htlc_trim_threshold_sat(dust_limit, spec.feerate_per_kw),
										HtlcDirection::Incoming => received_htlc_trim_threshold_sat(dust_limit, spec.feerate_per_kw),
									};
									htlc.add.amount_msat / 1000 >= threshold
								}).map(|htlc| HtlcInfo {
									payment_hash: htlc.add.payment_hash,
									cltv_expiry: htlc.add.cltv_expiry,
								}).collect();
								Action::StoreHtlcInfos {
									commitment_number: waiting.next_remote_commit.index,
									htlcs,
								}
							},
							RemoteNextCommitInfo::NextPoint(_) => unreachable!("send_commit always leaves a pending commitment"),
						};
						log_debug!(logger, "signing commitment {} on channel {}",
							self.commitments.remote_commit.index + 1, self.commitments.channel_id);
						let actions = vec![
							htlc_infos,
							Action::StoreState,
							Action::SendMessage(msgs::Message::CommitmentSigned(commit_sig)),
						];
						(ChannelState::Normal(self.with_commitments(commitments)), actions)
					},
					Err(error) => (ChannelState::Normal(self), vec![Action::HandleError(error)]),
				}
			},
		}
	}

	fn message_received<K: KeysInterface, L: Deref>(self, message: msgs::Message, keys: &K, logger: &L) -> (ChannelState, Vec<Action>)
		where L::Target: Logger
	{
		match message {
			msgs::Message::UpdateAddHTLC(msg) => {
				match self.commitments.receive_add(&msg) {
					Ok(commitments) => (ChannelState::Normal(self.with_commitments(commitments)), Vec::new()),
					Err(error) => (ChannelState::Normal(self), vec![Action::HandleError(error)]),
				}
			},
			msgs::Message::UpdateFulfillHTLC(msg) => {
				match self.commitments.receive_fulfill(&msg) {
					Ok((commitments, _add)) => (ChannelState::Normal(self.with_commitments(commitments)), Vec::new()),
					Err(error) => (ChannelState::Normal(self), vec![Action::HandleError(error)]),
				}
			},
			msgs::Message::UpdateFailHTLC(msg) => {
				match self.commitments.receive_fail(&msg) {
					Ok((commitments, _add)) => (ChannelState::Normal(self.with_commitments(commitments)), Vec::new()),
					Err(error) => (ChannelState::Normal(self), vec![Action::HandleError(error)]),
				}
			},
			msgs::Message::UpdateFailMalformedHTLC(msg) => {
				match self.commitments.receive_fail_malformed(&msg) {
					Ok((commitments, _add)) => (ChannelState::Normal(self.with_commitments(commitments)), Vec::new()),
					Err(error) => (ChannelState::Normal(self), vec![Action::HandleError(error)]),
				}
			},
			msgs::Message::CommitmentSigned(msg) => {
				match self.commitments.receive_commit(&msg, keys) {
					Ok((commitments, revocation)) => {
						log_debug!(logger, "commitment {} accepted on channel {}, revoking {}",
							commitments.local_commit.index, commitments.channel_id, commitments.local_commit.index - 1);
						let mut actions = vec![
							Action::StoreState,
							Action::SendMessage(msgs::Message::RevokeAndACK(revocation)),
						];
						if commitments.local_has_changes() {
							actions.push(Action::ProcessCommand(Command::Sign));
						}
						(ChannelState::Normal(self.with_commitments(commitments)), actions)
					},
					Err(error) => (ChannelState::Normal(self), vec![Action::HandleError(error)]),
				}
			},
			msgs::Message::RevokeAndACK(msg) => {
				let re_sign_asap = match &self.commitments.remote_next_commit_info {
					RemoteNextCommitInfo::WaitingForRevocation(waiting) => waiting.re_sign_asap,
					RemoteNextCommitInfo::NextPoint(_) => false,
				};
				match self.commitments.receive_revocation(&msg) {
					Ok((commitments, newly_committed)) => {
						log_debug!(logger, "commitment {} revoked on channel {}",
							commitments.remote_commit.index - 1, commitments.channel_id);
						let mut actions = vec![Action::StoreState];
						for change in newly_committed {
							actions.push(match change {
								UpdateMessage::AddHtlc(add) => Action::ProcessAdd(add),
								UpdateMessage::FailHtlc(fail) => Action::ProcessFail(fail),
								UpdateMessage::FailMalformedHtlc(fail) => Action::ProcessFailMalformed(fail),
								UpdateMessage::FulfillHtlc(_) => continue,
							});
						}
						if re_sign_asap && commitments.local_has_changes() {
							actions.push(Action::ProcessCommand(Command::Sign));
						}
						(ChannelState::Normal(self.with_commitments(commitments)), actions)
					},
					Err(error) => (ChannelState::Normal(self), vec![Action::HandleError(error)]),
				}
			},
			msgs::Message::Shutdown(msg) => {
				// The cooperative close dance is handled elsewhere; just note that it started so
				// we stop accepting new HTLCs.
				log_info!(logger, "peer initiated shutdown of channel {}", self.commitments.channel_id);
				let state = Normal { remote_shutdown: Some(msg), ..self };
				(ChannelState::Normal(state), vec![Action::StoreState])
			},
			msgs::Message::Error(msg) => {
				let error = ChannelError::Protocol(format!("peer sent error: {}", sanitize(&msg.data)));
				(ChannelState::Normal(self), vec![Action::HandleError(error)])
			},
			other => {
				log_warn!(logger, "unhandled message {:?} in state Normal", other);
				(ChannelState::Normal(self), Vec::new())
			},
		}
	}
}

impl Writeable for ChannelState {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		match self {
			ChannelState::WaitForFundingConfirmed(state) => {
				0u8.write(w)?;
				state.current_tip.write(w)?;
				state.commitments.write(w)?;
				state.funding_tx.write(w)?;
				state.waiting_since.write(w)?;
				state.deferred.write(w)?;
				state.last_sent.write(w)
			},
			ChannelState::WaitForFundingLocked(state) => {
				1u8.write(w)?;
				state.current_tip.write(w)?;
				state.commitments.write(w)?;
				state.short_channel_id.write(w)?;
				state.last_sent.write(w)
			},
			ChannelState::Normal(state) => {
				2u8.write(w)?;
				state.current_tip.write(w)?;
				state.commitments.write(w)?;
				state.short_channel_id.write(w)?;
				state.buried.write(w)?;
				state.channel_announcement.write(w)?;
				state.channel_update.write(w)?;
				state.local_shutdown.write(w)?;
				state.remote_shutdown.write(w)
			},
			// Nothing irreversible has happened yet in the handshake states, so the driver never
			// stores them and a crash simply forgets the channel.
			_ => Err(io::Error::new(io::ErrorKind::InvalidInput, "handshake states are never persisted")),
		}
	}
}

impl ReadableArgs<StaticParams> for ChannelState {
	fn read<R: io::Read>(r: &mut R, static_params: StaticParams) -> Result<Self, msgs::DecodeError> {
		match <u8 as Readable>::read(r)? {
			0 => Ok(ChannelState::WaitForFundingConfirmed(WaitForFundingConfirmed {
				static_params,
				current_tip: Readable::read(r)?,
				commitments: Readable::read(r)?,
				funding_tx: Readable::read(r)?,
				waiting_since: Readable::read(r)?,
				deferred: Readable::read(r)?,
				last_sent: Readable::read(r)?,
			})),
			1 => Ok(ChannelState::WaitForFundingLocked(WaitForFundingLocked {
				static_params,
				current_tip: Readable::read(r)?,
				commitments: Readable::read(r)?,
				short_channel_id: Readable::read(r)?,
				last_sent: Readable::read(r)?,
			})),
			2 => Ok(ChannelState::Normal(Normal {
				static_params,
				current_tip: Readable::read(r)?,
				commitments: Readable::read(r)?,
				short_channel_id: Readable::read(r)?,
				buried: Readable::read(r)?,
				channel_announcement: Readable::read(r)?,
				channel_update: Readable::read(r)?,
				local_shutdown: Readable::read(r)?,
				remote_shutdown: Readable::read(r)?,
			})),
			_ => Err(msgs::DecodeError::InvalidValue),
		}
	}
}

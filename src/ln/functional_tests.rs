// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Tests which drive a funder and a fundee state machine against each other, ferrying messages
//! by hand, from open through locked-in operation and full commitment dances.

use crate::chain::{BestBlock, MakeFundingTx, MakeFundingTxResponse, WatchEvent, WatchRequest};
use crate::chain::chaininterface::{ConfirmationTarget, FeeEstimator};
use crate::chain::keysinterface::{KeyPath, KeysManager};
use crate::ln::PaymentPreimage;
use crate::ln::channel::{
	Action, ChannelState, Command, Event, InitFundee, InitFunder, Normal, StaticParams,
	ANNOUNCEMENTS_MINCONF, FUNDING_TIMEOUT_FUNDEE,
};
use crate::ln::channel_id::ChannelId;
use crate::ln::commitments::{Commitments, LocalParams};
use crate::ln::features::Features;
use crate::ln::msgs::{self, Message};
use crate::util::config::NodeConfig;
use crate::util::errors::ChannelError;
use crate::util::ser::{ReadableArgs, Writeable};
use crate::util::test_utils::{TestFeeEstimator, TestLogger};

use bitcoin::blockdata::constants::genesis_block;
use bitcoin::blockdata::locktime::absolute::LockTime;
use bitcoin::blockdata::script::ScriptBuf;
use bitcoin::blockdata::transaction::{OutPoint, Transaction, TxIn, TxOut};
use bitcoin::hashes::Hash;
use bitcoin::hash_types::Txid;
use bitcoin::network::constants::Network;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{Sequence, Witness};

const FUNDING_SATOSHIS: u64 = 1_000_000;
const FEERATE_PER_KW: u32 = 2500;

struct Node {
	state: Option<ChannelState>,
	keys: KeysManager,
	logger: TestLogger,
	now: u64,
}

impl Node {
	fn process(&mut self, event: Event) -> Vec<Action> {
		let state = self.state.take().unwrap();
		let (state, actions) = state.process(event, &self.keys, &&self.logger, self.now);
		self.state = Some(state);
		actions
	}

	fn state(&self) -> &ChannelState {
		self.state.as_ref().unwrap()
	}

	fn commitments(&self) -> &Commitments {
		self.state().commitments().expect("state has no commitments yet")
	}

	fn normal(&self) -> &Normal {
		match self.state() {
			ChannelState::Normal(state) => state,
			other => panic!("expected Normal, got {}", other.name()),
		}
	}
}

fn local_params_with_reserve(is_funder: bool, channel_reserve_satoshis: u64) -> LocalParams {
	LocalParams {
		dust_limit_satoshis: 546,
		max_htlc_value_in_flight_msat: 1_000_000_000,
		channel_reserve_satoshis,
		htlc_minimum_msat: 1,
		to_self_delay: 144,
		max_accepted_htlcs: 30,
		is_funder,
		funding_key_path: KeyPath(vec![if is_funder { 1 } else { 2 }]),
	}
}

fn local_params(is_funder: bool) -> LocalParams {
	local_params_with_reserve(is_funder, 10_000)
}

fn node_pair() -> (Node, Node) {
	let secp_ctx = Secp256k1::new();
	let keys_alice = KeysManager::new(&[1; 32]);
	let keys_bob = KeysManager::new(&[2; 32]);
	let alice_id = PublicKey::from_secret_key(&secp_ctx, &keys_alice.node_secret());
	let bob_id = PublicKey::from_secret_key(&secp_ctx, &keys_bob.node_secret());
	let tip = BestBlock::from_genesis(Network::Testnet);

	let alice = Node {
		state: Some(ChannelState::new(
			StaticParams::new(Network::Testnet, keys_alice.node_secret(), bob_id, NodeConfig::default()),
			tip.clone())),
		keys: keys_alice,
		logger: TestLogger::new(),
		now: 1_600_000_000,
	};
	let bob = Node {
		state: Some(ChannelState::new(
			StaticParams::new(Network::Testnet, keys_bob.node_secret(), alice_id, NodeConfig::default()),
			tip)),
		keys: keys_bob,
		logger: TestLogger::new(),
		now: 1_600_000_000,
	};
	(alice, bob)
}

fn temporary_channel_id() -> ChannelId {
	let mut id = [0; 32];
	id[31] = 1;
	ChannelId(id)
}

fn init_funder_with_reserve(channel_reserve_satoshis: u64) -> InitFunder {
	let fee_estimator = TestFeeEstimator { sat_per_kw: 1000 };
	InitFunder {
		temporary_channel_id: temporary_channel_id(),
		funding_satoshis: FUNDING_SATOSHIS,
		push_msat: 0,
		initial_feerate_per_kw: FEERATE_PER_KW,
		funding_tx_feerate_per_kw: fee_estimator.get_est_sat_per_1000_weight(ConfirmationTarget::Normal),
		local_params: local_params_with_reserve(true, channel_reserve_satoshis),
		remote_init: msgs::Init { features: Features::recommended() },
		channel_flags: 0,
	}
}

fn init_funder() -> InitFunder {
	init_funder_with_reserve(10_000)
}

fn sent_messages(actions: &[Action]) -> Vec<Message> {
	actions.iter().filter_map(|action| match action {
		Action::SendMessage(msg) => Some(msg.clone()),
		_ => None,
	}).collect()
}

fn single_message(actions: &[Action]) -> Message {
	let mut messages = sent_messages(actions);
	assert_eq!(messages.len(), 1, "expected exactly one message in {:?}", actions);
	messages.pop().unwrap()
}

fn position_of<F: Fn(&Action) -> bool>(actions: &[Action], pred: F) -> usize {
	actions.iter().position(|action| pred(action)).expect("expected action missing")
}

/// Asserts that StoreState comes before the given (irreversible) action.
fn assert_stored_before<F: Fn(&Action) -> bool>(actions: &[Action], pred: F) {
	let store = position_of(actions, |action| matches!(action, Action::StoreState));
	assert!(store < position_of(actions, pred), "StoreState must precede the irreversible action in {:?}", actions);
}

fn funding_tx_for(request: &MakeFundingTx) -> Transaction {
	Transaction {
		version: 2,
		lock_time: LockTime::ZERO,
		input: vec![TxIn {
			previous_output: OutPoint { txid: Txid::all_zeros(), vout: 0 },
			script_sig: ScriptBuf::new(),
			sequence: Sequence::MAX,
			witness: Witness::new(),
		}],
		output: vec![TxOut {
			value: request.amount_satoshis,
			script_pubkey: request.script_pubkey.clone(),
		}],
	}
}

/// Runs both nodes through the funding handshake, stopping with both in WaitForFundingConfirmed.
fn open_until_funding_confirmed_with_reserve(channel_reserve_satoshis: u64, expected_min_depth: u32) -> (Node, Node, Transaction) {
	let (mut alice, mut bob) = node_pair();

	let actions = alice.process(Event::InitFunder(init_funder_with_reserve(channel_reserve_satoshis)));
	let open = match single_message(&actions) {
		Message::OpenChannel(msg) => msg,
		other => panic!("expected open_channel, got {:?}", other),
	};
	assert_eq!(alice.state().name(), "WaitForAcceptChannel");
	assert_eq!(open.funding_satoshis, FUNDING_SATOSHIS);

	assert!(bob.process(Event::InitFundee(InitFundee {
		temporary_channel_id: temporary_channel_id(),
		local_params: local_params_with_reserve(false, channel_reserve_satoshis),
		remote_init: msgs::Init { features: Features::recommended() },
	})).is_empty());
	let actions = bob.process(Event::MessageReceived(Message::OpenChannel(open)));
	let accept = match single_message(&actions) {
		Message::AcceptChannel(msg) => msg,
		other => panic!("expected accept_channel, got {:?}", other),
	};
	assert_eq!(accept.minimum_depth, expected_min_depth);
	assert_eq!(bob.state().name(), "WaitForFundingCreated");

	let actions = alice.process(Event::MessageReceived(Message::AcceptChannel(accept)));
	let funding_request = match &actions[..] {
		[Action::MakeFundingTx(request)] => request.clone(),
		other => panic!("expected a funding tx request, got {:?}", other),
	};
	assert_eq!(funding_request.amount_satoshis, FUNDING_SATOSHIS);
	assert_eq!(alice.state().name(), "WaitForFundingInternal");

	let funding_tx = funding_tx_for(&funding_request);
	let funding_txid = funding_tx.txid();
	let actions = alice.process(Event::MakeFundingTxResponse(MakeFundingTxResponse {
		funding_tx: funding_tx.clone(),
		output_index: 0,
		fee_satoshis: 250,
	}));
	let expected_channel_id = ChannelId::v1_from_funding_txid(&funding_txid, 0);
	match &actions[0] {
		Action::ChannelIdAssigned { temporary_channel_id: temp, channel_id } => {
			assert_eq!(*temp, temporary_channel_id());
			assert_eq!(*channel_id, expected_channel_id);
		},
		other => panic!("expected the channel id switch, got {:?}", other),
	}
	let funding_created = match single_message(&actions) {
		Message::FundingCreated(msg) => msg,
		other => panic!("expected funding_created, got {:?}", other),
	};
	assert_eq!(alice.state().name(), "WaitForFundingSigned");

	let actions = bob.process(Event::MessageReceived(Message::FundingCreated(funding_created)));
	assert!(matches!(actions[0], Action::SendWatch(WatchRequest::Spent { .. })));
	match &actions[1] {
		Action::SendWatch(WatchRequest::Confirmed { txid, min_depth }) => {
			assert_eq!(*txid, funding_txid);
			assert_eq!(*min_depth, expected_min_depth);
		},
		other => panic!("expected a confirmation watch, got {:?}", other),
	}
	assert!(matches!(actions[4], Action::StoreState));
	let funding_signed = match single_message(&actions) {
		Message::FundingSigned(msg) => msg,
		other => panic!("expected funding_signed, got {:?}", other),
	};
	assert_eq!(funding_signed.channel_id, expected_channel_id);
	assert_eq!(bob.state().name(), "WaitForFundingConfirmed");

	let actions = alice.process(Event::MessageReceived(Message::FundingSigned(funding_signed)));
	assert_stored_before(&actions, |action| matches!(action, Action::PublishTx(_)));
	match actions.last().unwrap() {
		Action::PublishTx(tx) => assert_eq!(tx.txid(), funding_txid),
		other => panic!("expected the funding tx broadcast, got {:?}", other),
	}
	assert_eq!(alice.state().name(), "WaitForFundingConfirmed");
	assert_eq!(alice.commitments().channel_id, expected_channel_id);
	assert_eq!(bob.commitments().channel_id, expected_channel_id);

	(alice, bob, funding_tx)
}

fn open_until_funding_confirmed() -> (Node, Node, Transaction) {
	open_until_funding_confirmed_with_reserve(10_000, 3)
}

/// Confirms the funding tx for both nodes and exchanges funding_locked, entering Normal.
fn lock_in(alice: &mut Node, bob: &mut Node, funding_tx: &Transaction) {
	let confirmed = Event::WatchReceived(WatchEvent::Confirmed {
		tx: funding_tx.clone(),
		block_height: 100,
		tx_index: 1,
	});

	let actions = alice.process(confirmed.clone());
	assert!(matches!(actions[0], Action::SendWatch(WatchRequest::Lost { .. })));
	let locked_alice = match single_message(&actions) {
		Message::FundingLocked(msg) => msg,
		other => panic!("expected funding_locked, got {:?}", other),
	};
	assert_eq!(alice.state().name(), "WaitForFundingLocked");

	let actions = bob.process(confirmed);
	let locked_bob = match single_message(&actions) {
		Message::FundingLocked(msg) => msg,
		other => panic!("expected funding_locked, got {:?}", other),
	};

	let actions = alice.process(Event::MessageReceived(Message::FundingLocked(locked_bob)));
	match &actions[0] {
		Action::SendWatch(WatchRequest::Confirmed { min_depth, .. }) =>
			assert_eq!(*min_depth, ANNOUNCEMENTS_MINCONF),
		other => panic!("expected the announcement depth watch, got {:?}", other),
	}
	bob.process(Event::MessageReceived(Message::FundingLocked(locked_alice)));

	assert!(!alice.normal().buried);
	assert!(!bob.normal().buried);

	// Move the clock of the world forward a bit so HTLC expiries have room.
	let header = genesis_block(Network::Testnet).header;
	let tip = BestBlock { height: 100, header };
	alice.process(Event::NewBlock(tip.clone()));
	bob.process(Event::NewBlock(tip));
}

fn open_channel() -> (Node, Node) {
	let (mut alice, mut bob, funding_tx) = open_until_funding_confirmed();
	lock_in(&mut alice, &mut bob, &funding_tx);
	(alice, bob)
}

fn test_onion() -> msgs::OnionPacket {
	let secp_ctx = Secp256k1::new();
	msgs::OnionPacket {
		version: 0,
		public_key: PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&[6; 32]).unwrap()),
		hop_data: [0; 1300],
		hmac: [0; 32],
	}
}

/// Sends an HTLC from `sender` to `receiver` without signing, returning its id.
fn add_htlc(sender: &mut Node, receiver: &mut Node, amount_msat: u64, preimage: PaymentPreimage) -> u64 {
	let actions = sender.process(Event::ExecuteCommand(Command::AddHtlc {
		amount_msat,
		payment_hash: preimage.payment_hash(),
		cltv_expiry: 244,
		onion_routing_packet: test_onion(),
		commit: false,
	}));
	let add = match single_message(&actions) {
		Message::UpdateAddHTLC(msg) => msg,
		other => panic!("expected update_add_htlc, got {:?}", other),
	};
	let htlc_id = add.htlc_id;
	assert!(receiver.process(Event::MessageReceived(Message::UpdateAddHTLC(add))).is_empty());
	htlc_id
}

/// One commitment dance: `signer` signs, `receiver` takes the signature and revokes. Returns the
/// receiver's actions on the signature and the signer's actions on the revocation.
fn sign_dance(signer: &mut Node, receiver: &mut Node) -> (Vec<Action>, Vec<Action>) {
	let sign_actions = signer.process(Event::ExecuteCommand(Command::Sign));
	assert!(matches!(sign_actions[0], Action::StoreHtlcInfos { .. }));
	assert_stored_before(&sign_actions, |action| matches!(action, Action::SendMessage(Message::CommitmentSigned(_))));
	let commit_sig = single_message(&sign_actions);

	let receiver_actions = receiver.process(Event::MessageReceived(commit_sig));
	assert_stored_before(&receiver_actions, |action| matches!(action, Action::SendMessage(Message::RevokeAndACK(_))));
	let revocation = single_message(&receiver_actions);

	let signer_actions = signer.process(Event::MessageReceived(revocation));
	assert!(matches!(signer_actions[0], Action::StoreState));
	(receiver_actions, signer_actions)
}

fn wants_sign(actions: &[Action]) -> bool {
	actions.iter().any(|action| matches!(action, Action::ProcessCommand(Command::Sign)))
}

#[test]
fn channel_open_flow() {
	let (alice, bob) = open_channel();
	// 100 << 40 | 1 << 16 | 0
	let expected_scid = (100u64 << 40) | (1u64 << 16);
	assert_eq!(alice.normal().short_channel_id, expected_scid);
	assert_eq!(bob.normal().short_channel_id, expected_scid);
	assert_eq!(alice.commitments().local_commit.spec.to_local_msat, FUNDING_SATOSHIS * 1000);
	assert_eq!(bob.commitments().local_commit.spec.to_local_msat, 0);
	// Both sides agree on the channel version and on the initial commitment txids.
	assert_eq!(alice.commitments().channel_version, bob.commitments().channel_version);
	assert_eq!(alice.commitments().remote_commit.txid,
		bob.commitments().local_commit.publishable_txs.commit_tx.txid());
	assert_eq!(bob.commitments().remote_commit.txid,
		alice.commitments().local_commit.publishable_txs.commit_tx.txid());
}

#[test]
fn negotiates_static_remotekey() {
	let (alice, bob) = open_channel();
	assert!(alice.commitments().channel_version.has_static_remotekey());
	assert!(bob.commitments().channel_version.has_static_remotekey());
	assert!(!alice.commitments().channel_version.is_zero_reserve());
}

#[test]
fn negotiates_zero_reserve() {
	// When both sides waive their reserve, the fundee needs no confirmations and both ends
	// persist the same channel version, zero-reserve bit included.
	let (alice, bob, _funding_tx) = open_until_funding_confirmed_with_reserve(0, 0);
	assert!(alice.commitments().channel_version.is_zero_reserve());
	assert!(bob.commitments().channel_version.is_zero_reserve());
	assert_eq!(alice.commitments().channel_version, bob.commitments().channel_version);
}

#[test]
fn htlc_ids_are_monotonic() {
	let (mut alice, mut bob) = open_channel();
	assert_eq!(add_htlc(&mut alice, &mut bob, 10_000_000, PaymentPreimage([3; 32])), 0);
	assert_eq!(add_htlc(&mut alice, &mut bob, 10_000_000, PaymentPreimage([4; 32])), 1);
	assert_eq!(alice.commitments().local_next_htlc_id, 2);
	assert_eq!(bob.commitments().remote_next_htlc_id, 2);
}

#[test]
fn payment_flow_with_commitment_dances() {
	let (mut alice, mut bob) = open_channel();
	let preimage_one = PaymentPreimage([3; 32]);
	let preimage_two = PaymentPreimage([4; 32]);
	add_htlc(&mut alice, &mut bob, 10_000_000, preimage_one);
	add_htlc(&mut alice, &mut bob, 10_000_000, preimage_two);

	// Alice signs her two adds into Bob's commitment.
	let (bob_actions, alice_actions) = sign_dance(&mut alice, &mut bob);
	// Bob now has changes of his own to sign (the acked adds) and says so.
	assert!(wants_sign(&bob_actions));
	assert!(alice_actions.len() == 1, "nothing to relay yet: {:?}", alice_actions);

	// Bob signs back; once Alice revokes, the adds are irrevocable on both sides and Bob gets
	// them handed over for processing.
	let (alice_actions, bob_actions) = sign_dance(&mut bob, &mut alice);
	assert!(!wants_sign(&alice_actions));
	let adds: Vec<_> = bob_actions.iter().filter(|action| matches!(action, Action::ProcessAdd(_))).collect();
	assert_eq!(adds.len(), 2);

	assert_eq!(alice.commitments().local_commit.index, 1);
	assert_eq!(bob.commitments().local_commit.index, 1);
	assert_eq!(alice.commitments().remote_commit.index, 1);
	assert_eq!(alice.commitments().local_commit.spec.to_local_msat, 980_000_000);
	assert_eq!(bob.commitments().local_commit.spec.to_remote_msat, 980_000_000);
	// Conservation: balances plus in-flight HTLCs still add up to the channel value.
	assert_eq!(alice.commitments().local_commit.spec.total_msat(), FUNDING_SATOSHIS * 1000);

	// What Alice can send is exactly what Bob can receive, and vice versa.
	assert_eq!(alice.commitments().available_balance_for_send_msat(),
		bob.commitments().available_balance_for_receive_msat());
	assert_eq!(bob.commitments().available_balance_for_send_msat(),
		alice.commitments().available_balance_for_receive_msat());

	// Bob fulfills the first HTLC and asks for an immediate signature.
	let actions = bob.process(Event::ExecuteCommand(Command::FulfillHtlc {
		htlc_id: 0,
		payment_preimage: preimage_one,
		commit: true,
	}));
	assert!(wants_sign(&actions));
	let fulfill = single_message(&actions);
	assert!(alice.process(Event::MessageReceived(fulfill)).is_empty());

	let (alice_actions, _) = sign_dance(&mut bob, &mut alice);
	// The fulfill is in Alice's commitment now; she owes Bob a signature for his.
	assert!(wants_sign(&alice_actions));
	let (_, alice_actions) = sign_dance(&mut alice, &mut bob);
	// Fulfillments are acted upon when they arrive, not at revocation.
	assert!(alice_actions.iter().all(|action| !matches!(action, Action::ProcessAdd(_) | Action::ProcessFail(_))));

	assert_eq!(alice.commitments().local_commit.spec.to_local_msat, 980_000_000);
	assert_eq!(alice.commitments().local_commit.spec.to_remote_msat, 10_000_000);
	assert_eq!(alice.commitments().local_commit.spec.htlcs.len(), 1);

	// Bob fails the second HTLC.
	let actions = bob.process(Event::ExecuteCommand(Command::FailHtlc {
		htlc_id: 1,
		reason: msgs::OnionErrorPacket { data: vec![1, 2, 3] },
		commit: true,
	}));
	let fail = single_message(&actions);
	assert!(alice.process(Event::MessageReceived(fail)).is_empty());

	let (alice_actions, _) = sign_dance(&mut bob, &mut alice);
	assert!(wants_sign(&alice_actions));
	let (_, alice_actions) = sign_dance(&mut alice, &mut bob);
	// The failure became irrevocable when Bob revoked: it is relayed back to the application.
	assert!(alice_actions.iter().any(|action| matches!(action, Action::ProcessFail(_))));

	// The failed HTLC's value came home.
	assert_eq!(alice.commitments().local_commit.spec.to_local_msat, 990_000_000);
	assert_eq!(alice.commitments().local_commit.spec.to_remote_msat, 10_000_000);
	assert!(alice.commitments().local_commit.spec.htlcs.is_empty());
	assert_eq!(alice.commitments().local_commit.spec.total_msat(), FUNDING_SATOSHIS * 1000);
	assert_eq!(bob.commitments().local_commit.spec.to_local_msat, 10_000_000);

	// Quiescent again: the balance views still mirror each other.
	assert_eq!(alice.commitments().available_balance_for_send_msat(),
		bob.commitments().available_balance_for_receive_msat());
}

#[test]
fn sign_while_dance_in_flight_is_deferred() {
	let (mut alice, mut bob) = open_channel();
	add_htlc(&mut alice, &mut bob, 10_000_000, PaymentPreimage([3; 32]));

	// Alice signs, then immediately queues another HTLC and a sign command before Bob revokes.
	let sign_actions = alice.process(Event::ExecuteCommand(Command::Sign));
	let commit_sig = single_message(&sign_actions);
	let actions = alice.process(Event::ExecuteCommand(Command::AddHtlc {
		amount_msat: 5_000_000,
		payment_hash: PaymentPreimage([4; 32]).payment_hash(),
		cltv_expiry: 244,
		onion_routing_packet: test_onion(),
		commit: false,
	}));
	let second_add = single_message(&actions);
	assert!(alice.process(Event::ExecuteCommand(Command::Sign)).is_empty());

	// Bob sees everything in wire order: the signature first, the new HTLC after.
	let bob_actions = bob.process(Event::MessageReceived(commit_sig));
	let revocation = single_message(&bob_actions);
	assert!(bob.process(Event::MessageReceived(second_add)).is_empty());

	let alice_actions = alice.process(Event::MessageReceived(revocation));
	// The deferred sign command resurfaces now that the dance is over.
	assert!(wants_sign(&alice_actions));
}

#[test]
fn invalid_commitment_signature_leaves_state_unchanged() {
	let (mut alice, mut bob) = open_channel();
	add_htlc(&mut alice, &mut bob, 10_000_000, PaymentPreimage([3; 32]));

	let before = bob.commitments().clone();
	let garbage = Signature::from_compact(&[42; 64]).unwrap();
	let actions = bob.process(Event::MessageReceived(Message::CommitmentSigned(msgs::CommitmentSigned {
		channel_id: before.channel_id,
		signature: garbage,
		htlc_signatures: vec![garbage],
	})));
	match &actions[..] {
		[Action::HandleError(ChannelError::InvalidCommitmentSignature)] => {},
		other => panic!("expected an invalid-signature error, got {:?}", other),
	}
	assert_eq!(bob.commitments(), &before);
	assert_eq!(bob.state().name(), "Normal");
}

#[test]
fn unknown_htlc_settlement_is_rejected() {
	let (mut alice, _bob) = open_channel();
	let actions = alice.process(Event::ExecuteCommand(Command::FulfillHtlc {
		htlc_id: 7,
		payment_preimage: PaymentPreimage([9; 32]),
		commit: false,
	}));
	assert!(matches!(&actions[..], [Action::HandleError(ChannelError::Protocol(_))]));
}

#[test]
fn spurious_events_are_ignored() {
	let (mut alice, _bob) = open_channel();
	let actions = alice.process(Event::CheckFundingTimeout);
	assert!(actions.is_empty());
	assert_eq!(alice.state().name(), "Normal");
	alice.logger.assert_log_contains("unhandled event");
}

#[test]
fn fundee_rejects_invalid_open_channel() {
	let (mut alice, mut bob) = node_pair();
	let actions = alice.process(Event::InitFunder(init_funder()));
	let mut open = match single_message(&actions) {
		Message::OpenChannel(msg) => msg,
		other => panic!("expected open_channel, got {:?}", other),
	};
	open.dust_limit_satoshis = 100;

	bob.process(Event::InitFundee(InitFundee {
		temporary_channel_id: temporary_channel_id(),
		local_params: local_params(false),
		remote_init: msgs::Init { features: Features::recommended() },
	}));
	let actions = bob.process(Event::MessageReceived(Message::OpenChannel(open)));
	assert!(matches!(&actions[..], [Action::HandleError(ChannelError::InvalidParameters(_))]));
	assert_eq!(bob.state().name(), "WaitForOpenChannel");
}

#[test]
fn fundee_times_out_waiting_for_funding() {
	let (mut alice, mut bob, _funding_tx) = open_until_funding_confirmed();

	// The funder never gives up on its own funding tx...
	alice.now += FUNDING_TIMEOUT_FUNDEE + 1;
	assert!(alice.process(Event::CheckFundingTimeout).is_empty());

	// ...but the fundee does.
	assert!(bob.process(Event::CheckFundingTimeout).is_empty());
	bob.now += FUNDING_TIMEOUT_FUNDEE + 1;
	let actions = bob.process(Event::CheckFundingTimeout);
	assert!(matches!(&actions[..], [Action::HandleError(ChannelError::Protocol(_))]));
}

#[test]
fn early_funding_locked_is_deferred_and_replayed() {
	let (mut alice, mut bob, funding_tx) = open_until_funding_confirmed();
	let confirmed = Event::WatchReceived(WatchEvent::Confirmed {
		tx: funding_tx.clone(),
		block_height: 100,
		tx_index: 1,
	});

	let actions = alice.process(confirmed.clone());
	let locked_alice = match single_message(&actions) {
		Message::FundingLocked(msg) => msg,
		other => panic!("expected funding_locked, got {:?}", other),
	};

	// Bob hears Alice's funding_locked before his own watcher fires.
	assert!(bob.process(Event::MessageReceived(Message::FundingLocked(locked_alice))).is_empty());
	assert_eq!(bob.state().name(), "WaitForFundingConfirmed");

	// When it does fire, Bob answers with his own funding_locked and lands directly in Normal.
	let actions = bob.process(confirmed);
	let locked_bob = match single_message(&actions) {
		Message::FundingLocked(msg) => msg,
		other => panic!("expected funding_locked, got {:?}", other),
	};
	assert_eq!(bob.state().name(), "Normal");

	alice.process(Event::MessageReceived(Message::FundingLocked(locked_bob)));
	assert_eq!(alice.state().name(), "Normal");
}

#[test]
fn normal_state_roundtrips_through_serialization() {
	let (mut alice, mut bob) = open_channel();
	add_htlc(&mut alice, &mut bob, 10_000_000, PaymentPreimage([3; 32]));
	sign_dance(&mut alice, &mut bob);
	sign_dance(&mut bob, &mut alice);

	let state = alice.state.take().unwrap();
	let static_params = match &state {
		ChannelState::Normal(normal) => normal.static_params.clone(),
		other => panic!("expected Normal, got {}", other.name()),
	};
	let mut encoded = Vec::new();
	state.write(&mut encoded).unwrap();
	let restored = <ChannelState as ReadableArgs<StaticParams>>::read(&mut &encoded[..], static_params).unwrap();

	let (original, restored) = match (&state, &restored) {
		(ChannelState::Normal(original), ChannelState::Normal(restored)) => (original, restored),
		_ => panic!("restored into a different state"),
	};
	assert_eq!(original.commitments, restored.commitments);
	assert_eq!(original.short_channel_id, restored.short_channel_id);
	assert_eq!(original.buried, restored.buried);
	assert_eq!(original.channel_update, restored.channel_update);
}

#[test]
fn fulfill_with_wrong_preimage_is_rejected() {
	let (mut alice, mut bob) = open_channel();
	add_htlc(&mut alice, &mut bob, 10_000_000, PaymentPreimage([3; 32]));
	sign_dance(&mut alice, &mut bob);
	sign_dance(&mut bob, &mut alice);

	let actions = bob.process(Event::ExecuteCommand(Command::FulfillHtlc {
		htlc_id: 0,
		payment_preimage: PaymentPreimage([250; 32]),
		commit: false,
	}));
	assert!(matches!(&actions[..], [Action::HandleError(ChannelError::Protocol(_))]));
}

#[test]
fn stored_htlc_infos_cover_the_signed_commitment() {
	let (mut alice, mut bob) = open_channel();
	add_htlc(&mut alice, &mut bob, 10_000_000, PaymentPreimage([3; 32]));
	add_htlc(&mut alice, &mut bob, 10_000_000, PaymentPreimage([4; 32]));

	let actions = alice.process(Event::ExecuteCommand(Command::Sign));
	match &actions[0] {
		Action::StoreHtlcInfos { commitment_number, htlcs } => {
			assert_eq!(*commitment_number, 1);
			assert_eq!(htlcs.len(), 2);
		},
		other => panic!("expected the htlc snapshot, got {:?}", other),
	}
}

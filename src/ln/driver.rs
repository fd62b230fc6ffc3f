// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The per-channel event pump.
//!
//! [`ChannelDriver`] owns one channel's [`ChannelState`] and a FIFO of pending [`Event`]s. It
//! feeds events through [`ChannelState::process`] one at a time and dispatches the resulting
//! [`Action`]s, in order, to a set of user-supplied collaborators. Because
//! [`Action::StoreState`] is ordered before any irreversible action, dispatching in order gives
//! crash safety for free: on restart, reload the stored state and carry on.

use std::collections::VecDeque;
use std::io;
use std::ops::Deref;

use crate::chain::chaininterface::BroadcasterInterface;
use crate::chain::{MakeFundingTx, WatchRequest};
use crate::chain::keysinterface::KeysInterface;
use crate::ln::channel::{Action, ChannelState, Event};
use crate::ln::channel_id::ChannelId;
use crate::ln::commitments::HtlcInfo;
use crate::ln::msgs;
use crate::util::errors::ChannelError;
use crate::util::logger::Logger;

/// Writes messages to the peer this channel belongs to.
pub trait PeerWriter {
	/// Queues the message for delivery. Ordering must be preserved.
	fn send_message(&self, msg: &msgs::Message);
}

/// Registers the channel's watches with a chain watcher, which reports back through
/// [`Event::WatchReceived`].
pub trait TxWatcher {
	/// Registers the watch.
	fn watch(&self, request: &WatchRequest);
}

/// Builds funding transactions, reporting back through [`Event::MakeFundingTxResponse`].
pub trait FundingWallet {
	/// Requests a funding transaction. The wallet must not broadcast it.
	fn make_funding_tx(&self, request: &MakeFundingTx);
}

/// Durable per-channel storage.
pub trait Store {
	/// Persists the channel state. The write MUST be atomic and MUST be durable by the time this
	/// returns: the driver is about to take irreversible steps based on it.
	fn store_state(&self, channel_id: &ChannelId, state: &ChannelState) -> Result<(), io::Error>;
	/// Persists the HTLCs of a signed counterparty commitment for the revoked-commitment
	/// watcher.
	fn store_htlc_infos(&self, channel_id: &ChannelId, commitment_number: u64, htlcs: &[HtlcInfo]) -> Result<(), io::Error>;
}

/// Everything the channel reports to the application.
pub trait ChannelEvents {
	/// The channel's definitive id is known; update any indexes.
	fn channel_id_assigned(&self, temporary_channel_id: &ChannelId, channel_id: &ChannelId);
	/// An incoming HTLC became irrevocably committed.
	fn process_add(&self, add: &msgs::UpdateAddHTLC);
	/// An outgoing HTLC was irrevocably failed.
	fn process_fail(&self, fail: &msgs::UpdateFailHTLC);
	/// An outgoing HTLC was irrevocably failed as malformed.
	fn process_fail_malformed(&self, fail: &msgs::UpdateFailMalformedHTLC);
	/// The channel hit an error; `error.is_fatal()` tells whether it can be used further.
	fn handle_error(&self, error: &ChannelError);
}

/// A source of wall-clock time, injected so tests are deterministic.
pub trait Clock {
	/// Seconds since the unix epoch.
	fn now_seconds(&self) -> u64;
}

/// Ties one channel's state machine to its collaborators.
///
/// Single-threaded: one event is fully consumed, state update and action dispatch included,
/// before the next is drawn. Run many drivers in parallel for many channels; they share nothing
/// but the key manager.
pub struct ChannelDriver<K: KeysInterface, C: Clock, P: PeerWriter, W: TxWatcher, B: BroadcasterInterface, F: FundingWallet, S: Store, E: ChannelEvents, L: Deref>
	where L::Target: Logger
{
	state: Option<ChannelState>,
	queue: VecDeque<Event>,
	keys: K,
	clock: C,
	peer: P,
	watcher: W,
	broadcaster: B,
	wallet: F,
	store: S,
	events: E,
	logger: L,
}

impl<K: KeysInterface, C: Clock, P: PeerWriter, W: TxWatcher, B: BroadcasterInterface, F: FundingWallet, S: Store, E: ChannelEvents, L: Deref> ChannelDriver<K, C, P, W, B, F, S, E, L>
	where L::Target: Logger
{
	/// Builds a driver around a channel state, fresh or reloaded from a [`Store`].
	pub fn new(state: ChannelState, keys: K, clock: C, peer: P, watcher: W, broadcaster: B, wallet: F, store: S, events: E, logger: L) -> Self {
		ChannelDriver {
			state: Some(state),
			queue: VecDeque::new(),
			keys, clock, peer, watcher, broadcaster, wallet, store, events, logger,
		}
	}

	/// The channel's current state.
	pub fn state(&self) -> &ChannelState {
		self.state.as_ref().expect("state is only vacated inside process_events")
	}

	/// Appends an event to the queue. Call [`ChannelDriver::process_events`] to run it.
	pub fn enqueue(&mut self, event: Event) {
		self.queue.push_back(event);
	}

	/// Drains the event queue, dispatching all resulting actions. Stops early only if the store
	/// fails, in which case the channel must not be used further without reloading.
	pub fn process_events(&mut self) -> Result<(), io::Error> {
		while let Some(event) = self.queue.pop_front() {
			let state = self.state.take().expect("state is only vacated inside process_events");
			let (state, actions) = state.process(event, &self.keys, &self.logger, self.clock.now_seconds());
			self.state = Some(state);
			for action in actions {
				self.dispatch(action)?;
			}
		}
		Ok(())
	}

	fn dispatch(&mut self, action: Action) -> Result<(), io::Error> {
		match action {
			Action::SendMessage(msg) => self.peer.send_message(&msg),
			Action::SendWatch(request) => self.watcher.watch(&request),
			Action::PublishTx(tx) => self.broadcaster.broadcast_transaction(&tx),
			Action::MakeFundingTx(request) => self.wallet.make_funding_tx(&request),
			Action::ChannelIdAssigned { temporary_channel_id, channel_id } =>
				self.events.channel_id_assigned(&temporary_channel_id, &channel_id),
			Action::StoreState => {
				let state = self.state.as_ref().expect("state is only vacated inside process_events");
				self.store.store_state(&state.channel_id(), state)?;
			},
			Action::StoreHtlcInfos { commitment_number, htlcs } => {
				let channel_id = self.state().channel_id();
				self.store.store_htlc_infos(&channel_id, commitment_number, &htlcs)?;
			},
			Action::ProcessCommand(command) => self.queue.push_back(Event::ExecuteCommand(command)),
			Action::ProcessAdd(add) => self.events.process_add(&add),
			Action::ProcessFail(fail) => self.events.process_fail(&fail),
			Action::ProcessFailMalformed(fail) => self.events.process_fail_malformed(&fail),
			Action::HandleError(error) => self.events.handle_error(&error),
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::chain::BestBlock;
	use crate::chain::keysinterface::{KeyPath, KeysManager};
	use crate::ln::channel::{InitFundee, StaticParams};
	use crate::ln::commitments::LocalParams;
	use crate::ln::features::Features;
	use crate::util::config::NodeConfig;
	use crate::util::test_utils::{
		FixedClock, TestBroadcaster, TestChannelEvents, TestLogger, TestPeer, TestStore,
		TestWallet, TestWatcher,
	};

	use bitcoin::network::constants::Network;
	use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

	#[test]
	fn driver_pumps_events_and_dispatches_actions() {
		let secp_ctx = Secp256k1::new();
		let remote_node_id = PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&[9; 32]).unwrap());
		let static_params = StaticParams::new(Network::Testnet,
			SecretKey::from_slice(&[8; 32]).unwrap(), remote_node_id, NodeConfig::default());
		let state = ChannelState::new(static_params, BestBlock::from_genesis(Network::Testnet));

		let mut driver = ChannelDriver::new(state, KeysManager::new(&[1; 32]), FixedClock::new(1_000_000),
			TestPeer::new(), TestWatcher::new(), TestBroadcaster::new(), TestWallet::new(),
			TestStore::new(), TestChannelEvents::new(), Box::new(TestLogger::new()));

		driver.enqueue(Event::InitFundee(InitFundee {
			temporary_channel_id: ChannelId([42; 32]),
			local_params: LocalParams {
				dust_limit_satoshis: 546,
				max_htlc_value_in_flight_msat: 100_000_000,
				channel_reserve_satoshis: 10_000,
				htlc_minimum_msat: 1,
				to_self_delay: 144,
				max_accepted_htlcs: 30,
				is_funder: false,
				funding_key_path: KeyPath(vec![7]),
			},
			remote_init: msgs::Init { features: Features::recommended() },
		}));
		driver.process_events().unwrap();
		assert_eq!(driver.state().name(), "WaitForOpenChannel");
		assert_eq!(driver.state().channel_id(), ChannelId([42; 32]));
	}
}

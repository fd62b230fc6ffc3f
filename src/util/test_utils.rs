// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Collaborator stand-ins used by the tests: everything records what it was asked to do and
//! nothing talks to the outside world.

use bitcoin::blockdata::transaction::Transaction;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;

use crate::chain::{MakeFundingTx, WatchRequest};
use crate::chain::chaininterface::{BroadcasterInterface, ConfirmationTarget, FeeEstimator};
use crate::ln::channel::ChannelState;
use crate::ln::channel_id::ChannelId;
use crate::ln::commitments::HtlcInfo;
use crate::ln::driver::{ChannelEvents, Clock, FundingWallet, PeerWriter, Store, TxWatcher};
use crate::ln::msgs;
use crate::util::logger::{Logger, Record};
use crate::util::ser::Writeable;

pub struct TestLogger {
	lines: Mutex<Vec<String>>,
}

impl TestLogger {
	pub fn new() -> TestLogger {
		TestLogger { lines: Mutex::new(Vec::new()) }
	}

	/// Asserts that some log line contains the given fragment.
	pub fn assert_log_contains(&self, fragment: &str) {
		let lines = self.lines.lock().unwrap();
		assert!(lines.iter().any(|line| line.contains(fragment)),
			"no log line contains {:?}; got {:#?}", fragment, &*lines);
	}
}

impl Logger for TestLogger {
	fn log(&self, record: &Record) {
		let line = format!("{} [{}:{}] {}", record.level, record.module_path, record.line, record.args);
		self.lines.lock().unwrap().push(line);
	}
}

pub struct FixedClock {
	now: Cell<u64>,
}

impl FixedClock {
	pub fn new(now: u64) -> FixedClock {
		FixedClock { now: Cell::new(now) }
	}
}

impl Clock for FixedClock {
	fn now_seconds(&self) -> u64 {
		self.now.get()
	}
}

pub struct TestPeer {
	pub sent: RefCell<VecDeque<msgs::Message>>,
}

impl TestPeer {
	pub fn new() -> TestPeer {
		TestPeer { sent: RefCell::new(VecDeque::new()) }
	}
}

impl PeerWriter for TestPeer {
	fn send_message(&self, msg: &msgs::Message) {
		self.sent.borrow_mut().push_back(msg.clone());
	}
}

pub struct TestWatcher {
	pub watches: RefCell<Vec<WatchRequest>>,
}

impl TestWatcher {
	pub fn new() -> TestWatcher {
		TestWatcher { watches: RefCell::new(Vec::new()) }
	}
}

impl TxWatcher for TestWatcher {
	fn watch(&self, request: &WatchRequest) {
		self.watches.borrow_mut().push(request.clone());
	}
}

pub struct TestBroadcaster {
	pub txn_broadcasted: RefCell<Vec<Transaction>>,
}

impl TestBroadcaster {
	pub fn new() -> TestBroadcaster {
		TestBroadcaster { txn_broadcasted: RefCell::new(Vec::new()) }
	}
}

impl BroadcasterInterface for TestBroadcaster {
	fn broadcast_transaction(&self, tx: &Transaction) {
		self.txn_broadcasted.borrow_mut().push(tx.clone());
	}
}

pub struct TestWallet {
	pub requests: RefCell<Vec<MakeFundingTx>>,
}

impl TestWallet {
	pub fn new() -> TestWallet {
		TestWallet { requests: RefCell::new(Vec::new()) }
	}
}

impl FundingWallet for TestWallet {
	fn make_funding_tx(&self, request: &MakeFundingTx) {
		self.requests.borrow_mut().push(request.clone());
	}
}

pub struct TestStore {
	pub stored_states: RefCell<Vec<(ChannelId, Vec<u8>)>>,
	pub stored_htlc_infos: RefCell<Vec<(ChannelId, u64, Vec<HtlcInfo>)>>,
}

impl TestStore {
	pub fn new() -> TestStore {
		TestStore { stored_states: RefCell::new(Vec::new()), stored_htlc_infos: RefCell::new(Vec::new()) }
	}
}

impl Store for TestStore {
	fn store_state(&self, channel_id: &ChannelId, state: &ChannelState) -> Result<(), io::Error> {
		let mut buf = Vec::new();
		state.write(&mut buf)?;
		self.stored_states.borrow_mut().push((*channel_id, buf));
		Ok(())
	}

	fn store_htlc_infos(&self, channel_id: &ChannelId, commitment_number: u64, htlcs: &[HtlcInfo]) -> Result<(), io::Error> {
		self.stored_htlc_infos.borrow_mut().push((*channel_id, commitment_number, htlcs.to_vec()));
		Ok(())
	}
}

pub struct TestChannelEvents {
	pub assigned_ids: RefCell<Vec<(ChannelId, ChannelId)>>,
	pub adds: RefCell<Vec<msgs::UpdateAddHTLC>>,
	pub fails: RefCell<Vec<msgs::UpdateFailHTLC>>,
	pub fails_malformed: RefCell<Vec<msgs::UpdateFailMalformedHTLC>>,
	pub errors: RefCell<Vec<crate::util::errors::ChannelError>>,
}

impl TestChannelEvents {
	pub fn new() -> TestChannelEvents {
		TestChannelEvents {
			assigned_ids: RefCell::new(Vec::new()),
			adds: RefCell::new(Vec::new()),
			fails: RefCell::new(Vec::new()),
			fails_malformed: RefCell::new(Vec::new()),
			errors: RefCell::new(Vec::new()),
		}
	}
}

impl ChannelEvents for TestChannelEvents {
	fn channel_id_assigned(&self, temporary_channel_id: &ChannelId, channel_id: &ChannelId) {
		self.assigned_ids.borrow_mut().push((*temporary_channel_id, *channel_id));
	}

	fn process_add(&self, add: &msgs::UpdateAddHTLC) {
		self.adds.borrow_mut().push(add.clone());
	}

	fn process_fail(&self, fail: &msgs::UpdateFailHTLC) {
		self.fails.borrow_mut().push(fail.clone());
	}

	fn process_fail_malformed(&self, fail: &msgs::UpdateFailMalformedHTLC) {
		self.fails_malformed.borrow_mut().push(fail.clone());
	}

	fn handle_error(&self, error: &crate::util::errors::ChannelError) {
		self.errors.borrow_mut().push(error.clone());
	}
}

pub struct TestFeeEstimator {
	pub sat_per_kw: u32,
}

impl FeeEstimator for TestFeeEstimator {
	fn get_est_sat_per_1000_weight(&self, _confirmation_target: ConfirmationTarget) -> u32 {
		self.sat_per_kw
	}
}

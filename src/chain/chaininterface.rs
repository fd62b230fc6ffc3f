// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Traits which allow external code to supply chain access: broadcasting transactions and
//! estimating fees.

use bitcoin::blockdata::transaction::Transaction;

/// An interface to send a transaction to the Bitcoin network.
pub trait BroadcasterInterface {
	/// Sends a transaction out to (hopefully) be mined.
	fn broadcast_transaction(&self, tx: &Transaction);
}

/// An enum that represents the speed at which we want a transaction to confirm used for feerate
/// estimation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConfirmationTarget {
	/// We'd like a transaction to confirm in the future, but don't want to commit most of the fees
	/// required to do so.
	Background,
	/// We'd like a transaction to confirm without major delay, i.e., within the next 12-24 blocks.
	Normal,
	/// We'd like a transaction to confirm in the next few blocks.
	HighPriority,
}

/// A trait which should be implemented to provide feerate information on a number of time
/// horizons.
///
/// Note that all of the functions implemented here *must* be reentrant-safe (obviously - they're
/// called from inside the library in response to chain events, P2P events, or timer events).
pub trait FeeEstimator {
	/// Gets estimated satoshis of fee required per 1000 Weight-Units.
	///
	/// The following unit conversions can be used to convert to sats/KW. Note that they are not
	/// exact:
	/// max(satoshis-per-byte * 250, 253)
	/// max(satoshis-per-kbyte / 4, 253)
	fn get_est_sat_per_1000_weight(&self, confirmation_target: ConfirmationTarget) -> u32;
}

/// Minimum feerate that takes a sane approach to bitcoind weight-to-vbytes rounding: 1 sat/vbyte
/// is 250 sat/kW, but Core rounds weight up when converting, so the floor is 253.
pub const FEERATE_FLOOR_SATS_PER_KW: u32 = 253;

// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Implementations of various parts of the Lightning protocol are in this module.

pub mod channel_id;
pub mod features;
pub mod msgs;
pub mod chan_utils;
pub mod commitments;
pub mod channel;
pub mod driver;

#[cfg(test)]
mod functional_tests;

use bitcoin::hashes::Hash;
use bitcoin::hashes::sha256::Hash as Sha256;

pub use self::channel_id::ChannelId;

/// payment_hash type, use to cross-lock hop
#[derive(Hash, Copy, Clone, PartialEq, Eq, Debug)]
pub struct PaymentHash(pub [u8; 32]);
/// payment_preimage type, use to route payment between hop
#[derive(Hash, Copy, Clone, PartialEq, Eq, Debug)]
pub struct PaymentPreimage(pub [u8; 32]);

impl PaymentPreimage {
	/// The payment hash unlocked by this preimage.
	pub fn payment_hash(&self) -> PaymentHash {
		PaymentHash(Sha256::hash(&self.0).to_byte_array())
	}
}


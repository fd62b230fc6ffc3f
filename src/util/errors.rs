// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Error types live here.

use std::fmt;

/// Indicates a message from the peer, a local command, or negotiated channel parameters violated
/// the channel protocol in some way.
///
/// The state machine never consumes its state on error: it hands one of these back inside
/// [`crate::ln::channel::Action::HandleError`] and stays where it was, leaving the decision to
/// warn, disconnect or force-close to the driver.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelError {
	/// The peer (or a local command) broke a protocol rule: bad HTLC id, unknown HTLC, wrong
	/// preimage, a violated dust/reserve/in-flight limit, an out-of-range CLTV expiry, etc.
	Protocol(String),
	/// The peer's signature on a commitment transaction or one of its HTLC transactions did not
	/// verify. Fatal: the commitment dance cannot proceed with an unprovable state.
	InvalidCommitmentSignature,
	/// The revealed per-commitment secret does not match the per-commitment point the peer
	/// previously committed to. Fatal.
	InvalidRevocationSecret,
	/// The peer's open_channel/accept_channel parameters violate local policy.
	InvalidParameters(String),
	/// The confirmed funding transaction does not pay the expected script or amount.
	InvalidFundingTx,
}

impl ChannelError {
	/// Whether the driver must treat the channel as unrecoverable.
	pub fn is_fatal(&self) -> bool {
		match self {
			ChannelError::Protocol(_) => false,
			ChannelError::InvalidCommitmentSignature => true,
			ChannelError::InvalidRevocationSecret => true,
			ChannelError::InvalidParameters(_) => false,
			ChannelError::InvalidFundingTx => true,
		}
	}
}

impl fmt::Display for ChannelError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			ChannelError::Protocol(e) => write!(f, "protocol violation: {}", e),
			ChannelError::InvalidCommitmentSignature => write!(f, "invalid commitment signature"),
			ChannelError::InvalidRevocationSecret => write!(f, "invalid revocation secret"),
			ChannelError::InvalidParameters(e) => write!(f, "invalid channel parameters: {}", e),
			ChannelError::InvalidFundingTx => write!(f, "invalid funding transaction"),
		}
	}
}

// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Various user-configurable channel limits and settings which applications
//! may set, which get applied at channel open and during normal operation.

use crate::ln::channel::{MAX_FUNDING_SATOSHIS, MAX_TO_SELF_DELAY, MIN_DUST_LIMIT_SATOSHIS};
use crate::ln::features::Features;

/// Configuration we set when applicable.
///
/// Default::default() provides sane defaults.
#[derive(Clone, Debug)]
pub struct ChannelHandshakeConfig {
	/// Confirmations we will wait for before considering the channel locked in.
	/// Applied only for inbound channels (see [`ChannelHandshakeLimits::max_minimum_depth`] for the
	/// equivalent limit applied to outbound channels).
	///
	/// Default value: 3.
	pub minimum_depth: u32,
	/// Set to the number of blocks we require our counterparty to wait to claim their money (ie
	/// the number of blocks we have to punish our counterparty if they broadcast a revoked
	/// transaction).
	///
	/// Default value: 144, or roughly one day and only applies to outbound channels.
	pub to_self_delay: u16,
	/// Set to the smallest value HTLC we will accept to process.
	///
	/// Default value: 1. If the value is less than 1, it is ignored and set to 1, as is required
	/// by the protocol.
	pub htlc_minimum_msat: u64,
	/// The threshold below which outputs on transactions broadcast by us will be omitted.
	///
	/// Default value: 546 satoshis.
	pub dust_limit_satoshis: u64,
	/// The maximum total value of pending HTLCs towards us we will allow at any given time.
	///
	/// Default value: 100 million msat.
	pub max_htlc_value_in_flight_msat: u64,
	/// The portion (in millionths) of the channel value we will require the counterparty to keep
	/// on their side at all times, as protection against a cheating attempt.
	///
	/// Default value: 10_000 millionths, ie 1% of the channel value.
	pub reserve_millionths: u64,
	/// The maximum number of concurrent HTLCs we will accept from our counterparty.
	///
	/// Default value: 30; the protocol maximum is 483.
	pub max_accepted_htlcs: u16,
	/// Set to announce the channel publicly and notify all nodes that they can route via this
	/// channel.
	///
	/// Default value: false.
	pub announce_channel: bool,
	/// The feerate (in sat per 1000 weight) we will propose for commitment transactions on
	/// channels we initiate.
	///
	/// Default value: 2500.
	pub commitment_feerate_per_kw: u32,
	/// The fees (in msat) charged as the flat portion for forwarding a payment on a channel,
	/// advertised in our channel_update.
	///
	/// Default value: 1000.
	pub fee_base_msat: u32,
	/// The fees (in millionths of a satoshi) charged proportionally to the payment amount,
	/// advertised in our channel_update.
	///
	/// Default value: 100.
	pub fee_proportional_millionths: u32,
	/// The difference of CLTV expiry between incoming and outgoing HTLCs advertised in our
	/// channel_update.
	///
	/// Default value: 144.
	pub cltv_expiry_delta: u16,
	/// The feature bits we advertise in our init message, used to negotiate the channel version.
	pub features: Features,
}

impl Default for ChannelHandshakeConfig {
	fn default() -> ChannelHandshakeConfig {
		ChannelHandshakeConfig {
			minimum_depth: 3,
			to_self_delay: 144,
			htlc_minimum_msat: 1,
			dust_limit_satoshis: MIN_DUST_LIMIT_SATOSHIS,
			max_htlc_value_in_flight_msat: 100_000_000,
			reserve_millionths: 10_000,
			max_accepted_htlcs: 30,
			announce_channel: false,
			commitment_feerate_per_kw: 2500,
			fee_base_msat: 1000,
			fee_proportional_millionths: 100,
			cltv_expiry_delta: 144,
			features: Features::recommended(),
		}
	}
}

/// Optional channel limits which are applied during channel creation.
///
/// These limits are only applied to our counterparty's limits, not our own.
///
/// Default::default() provides sane defaults.
#[derive(Clone, Debug)]
pub struct ChannelHandshakeLimits {
	/// Minimum allowed satoshis when a channel is funded; this is supplied by the sender and so
	/// only applies to inbound channels.
	///
	/// Default value: 1000.
	pub min_funding_satoshis: u64,
	/// Maximum allowed satoshis when a channel is funded.
	///
	/// Default value: the protocol maximum of 10 BTC (non-wumbo).
	pub max_funding_satoshis: u64,
	/// The remote node sets a limit on the minimum size of HTLCs we can send to them. This allows
	/// you to limit the maximum minimum-size they can require.
	///
	/// Default value: u64::MAX.
	pub max_htlc_minimum_msat: u64,
	/// The remote node sets a limit on the maximum value of pending HTLCs to them at any given
	/// time to limit their funds exposure to HTLCs. This allows you to set a minimum such value.
	///
	/// Default value: 0.
	pub min_max_htlc_value_in_flight_msat: u64,
	/// The remote node will require we keep a certain amount in direct payment to ourselves at all
	/// time, ensuring that we are able to be punished if we broadcast an old state. This allows to
	/// you limit the amount which we will have to keep to ourselves (and cannot use for HTLCs).
	///
	/// Default value: u64::MAX.
	pub max_channel_reserve_satoshis: u64,
	/// The remote node sets a limit on the maximum number of pending HTLCs to them at any given
	/// time. This allows you to set a minimum such value.
	///
	/// Default value: 0.
	pub min_max_accepted_htlcs: u16,
	/// The remote node's dust limit must be within this range to be accepted.
	///
	/// Default value: 546 .. 3000 satoshis.
	pub min_dust_limit_satoshis: u64,
	/// See [`ChannelHandshakeLimits::min_dust_limit_satoshis`].
	pub max_dust_limit_satoshis: u64,
	/// Before a channel is usable the funding transaction will need to be confirmed by at least a
	/// certain number of blocks, specified by the node which is not the funder (as the funder can
	/// assume they aren't going to double-spend themselves). This config allows you to set a limit
	/// on the maximum amount of time to wait.
	///
	/// Default value: 144, or roughly one day and only applies to outbound channels.
	pub max_minimum_depth: u32,
	/// The remote node sets a delay before it can claim its own funds after unilaterally closing.
	/// This allows you to bound how long your own funds may be locked up with an unresponsive
	/// peer.
	///
	/// Default value: 2016, the protocol maximum.
	pub max_to_self_delay: u16,
}

impl Default for ChannelHandshakeLimits {
	fn default() -> ChannelHandshakeLimits {
		ChannelHandshakeLimits {
			min_funding_satoshis: 1000,
			max_funding_satoshis: MAX_FUNDING_SATOSHIS,
			max_htlc_minimum_msat: u64::max_value(),
			min_max_htlc_value_in_flight_msat: 0,
			max_channel_reserve_satoshis: u64::max_value(),
			min_max_accepted_htlcs: 0,
			min_dust_limit_satoshis: MIN_DUST_LIMIT_SATOSHIS,
			max_dust_limit_satoshis: 3000,
			max_minimum_depth: 144,
			max_to_self_delay: MAX_TO_SELF_DELAY,
		}
	}
}

/// Top-level config which holds both our own settings and the limits we place on our
/// counterparty's.
///
/// Default::default() provides sane defaults for most configurations.
#[derive(Clone, Debug, Default)]
pub struct NodeConfig {
	/// Channel config that we propose to our counterparty.
	pub handshake: ChannelHandshakeConfig,
	/// Limits applied to our counterparty's proposed channel config settings.
	pub limits: ChannelHandshakeLimits,
}

#[cfg(test)]
mod tests {
	use super::NodeConfig;
	use crate::ln::channel::MAX_ACCEPTED_HTLCS;

	#[test]
	fn defaults_are_within_protocol_bounds() {
		let config = NodeConfig::default();
		assert!(config.handshake.max_accepted_htlcs <= MAX_ACCEPTED_HTLCS);
		assert!(config.handshake.dust_limit_satoshis >= config.limits.min_dust_limit_satoshis);
		assert!(config.handshake.dust_limit_satoshis <= config.limits.max_dust_limit_satoshis);
		assert!(config.handshake.to_self_delay <= config.limits.max_to_self_delay);
	}
}

// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Lightning exposes sets of supported operations through "feature flags". This module includes
//! types to store those feature flags and query for specific flags.
//!
//! Flags come in pairs: for a feature at even bit `2n`, the even bit means the feature is
//! mandatory (a peer which does not understand it must fail the connection) and bit `2n + 1`
//! means the feature is optional. Bits we do not know about are carried around verbatim so that
//! re-encoding a feature vector is lossless.

use std::collections::HashSet;
use std::fmt;
use std::io;

use crate::ln::msgs::DecodeError;
use crate::util::ser::{Readable, Writeable, Writer};

/// A feature defined in BOLT 9 which this crate knows about.
///
/// See [BOLT #9] for details.
///
/// [BOLT #9]: https://github.com/lightning/bolts/blob/master/09-features.md
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Feature {
	/// `option_data_loss_protect`, fall back to a remote commitment point on data loss
	OptionDataLossProtect,
	/// `initial_routing_sync`, ask for the full routing table at connection
	InitialRoutingSync,
	/// `gossip_queries`, serve short-channel-id based gossip queries
	ChannelRangeQueries,
	/// `var_onion_optin`, understand variable-length (TLV) onion payloads
	VariableLengthOnion,
	/// `gossip_queries_ex`, gossip queries with additional checksum data
	ChannelRangeQueriesExtended,
	/// `option_static_remotekey`, the to_remote output pays a static key
	StaticRemoteKey,
	/// `payment_secret`, payments carry a secret to protect against probing
	PaymentSecret,
	/// `basic_mpp`, payments may be split across multiple HTLCs
	BasicMultiPartPayment,
	/// `option_support_large_channel`, channels larger than the 10 BTC soft cap
	Wumbo,
	/// `trampoline_payment`, delegate route construction to a trampoline node
	TrampolinePayment,
}

/// Whether a [`Feature`] is advertised as required or merely available.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FeatureSupport {
	/// The even bit: peers which do not understand the feature must fail the connection.
	Mandatory,
	/// The odd bit: "it's ok to be odd".
	Optional,
}

impl Feature {
	/// Every feature this crate knows about.
	pub const KNOWN: [Feature; 10] = [
		Feature::OptionDataLossProtect,
		Feature::InitialRoutingSync,
		Feature::ChannelRangeQueries,
		Feature::VariableLengthOnion,
		Feature::ChannelRangeQueriesExtended,
		Feature::StaticRemoteKey,
		Feature::PaymentSecret,
		Feature::BasicMultiPartPayment,
		Feature::Wumbo,
		Feature::TrampolinePayment,
	];

	/// The even (mandatory) bit for this feature. The optional bit is always one above.
	pub fn mandatory_bit(&self) -> u16 {
		match self {
			Feature::OptionDataLossProtect => 0,
			Feature::InitialRoutingSync => 2,
			Feature::ChannelRangeQueries => 6,
			Feature::VariableLengthOnion => 8,
			Feature::ChannelRangeQueriesExtended => 10,
			Feature::StaticRemoteKey => 12,
			Feature::PaymentSecret => 14,
			Feature::BasicMultiPartPayment => 16,
			Feature::Wumbo => 18,
			Feature::TrampolinePayment => 50,
		}
	}

	/// The odd (optional) bit for this feature.
	pub fn optional_bit(&self) -> u16 {
		self.mandatory_bit() + 1
	}

	/// The feature name as it appears in the BOLTs, for error messages.
	pub fn rfc_name(&self) -> &'static str {
		match self {
			Feature::OptionDataLossProtect => "option_data_loss_protect",
			Feature::InitialRoutingSync => "initial_routing_sync",
			Feature::ChannelRangeQueries => "gossip_queries",
			Feature::VariableLengthOnion => "var_onion_optin",
			Feature::ChannelRangeQueriesExtended => "gossip_queries_ex",
			Feature::StaticRemoteKey => "option_static_remotekey",
			Feature::PaymentSecret => "payment_secret",
			Feature::BasicMultiPartPayment => "basic_mpp",
			Feature::Wumbo => "option_support_large_channel",
			Feature::TrampolinePayment => "trampoline_payment",
		}
	}

	/// Features which must also be set whenever this feature is set.
	///
	/// Note that `payment_secret` does not list `var_onion_optin` even though the BOLTs pair
	/// them: invoices generated before TLV onions were widespread set `payment_secret` alone, so
	/// enforcing the pair would make us reject payments that work fine in practice. This is
	/// deliberate; revisit once such invoices have disappeared from the wild.
	pub fn dependencies(&self) -> &'static [Feature] {
		match self {
			Feature::ChannelRangeQueriesExtended => &[Feature::ChannelRangeQueries],
			Feature::BasicMultiPartPayment => &[Feature::PaymentSecret],
			Feature::TrampolinePayment => &[Feature::PaymentSecret],
			_ => &[],
		}
	}

	/// Whether we implement the feature well enough to accept a peer requiring it.
	fn supported_as_mandatory(&self) -> bool {
		match self {
			Feature::OptionDataLossProtect => true,
			Feature::ChannelRangeQueries => true,
			Feature::VariableLengthOnion => true,
			Feature::ChannelRangeQueriesExtended => true,
			Feature::PaymentSecret => true,
			Feature::BasicMultiPartPayment => true,
			Feature::Wumbo => true,
			_ => false,
		}
	}

	/// Maps a bit index back to the feature and support level it stands for, if known.
	fn from_bit(bit: u16) -> Option<(Feature, FeatureSupport)> {
		for feature in Feature::KNOWN.iter() {
			if feature.mandatory_bit() == bit {
				return Some((*feature, FeatureSupport::Mandatory));
			}
			if feature.optional_bit() == bit {
				return Some((*feature, FeatureSupport::Optional));
			}
		}
		None
	}
}

impl fmt::Display for Feature {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.rfc_name())
	}
}

/// An error returned when a feature set names a feature whose dependencies are not also set.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureDependencyError {
	/// The feature whose dependencies are not met.
	pub feature: Feature,
	/// The missing dependencies.
	pub missing: Vec<Feature>,
}

impl fmt::Display for FeatureDependencyError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{} is set but is missing a dependency: ", self.feature)?;
		for (i, feature) in self.missing.iter().enumerate() {
			if i != 0 { f.write_str(", ")?; }
			write!(f, "{}", feature)?;
		}
		Ok(())
	}
}

/// Tracks the set of features which a node implements.
///
/// Known bits are kept as `(Feature, FeatureSupport)` pairs, everything else is kept as raw bit
/// indexes so that `from_bytes` followed by `to_bytes` is the identity on any input.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Features {
	activated: HashSet<(Feature, FeatureSupport)>,
	unknown: HashSet<u16>,
}

impl Features {
	/// Create a blank Features with no features set
	pub fn empty() -> Features {
		Features { activated: HashSet::new(), unknown: HashSet::new() }
	}

	/// The feature set a freshly configured node advertises.
	pub fn recommended() -> Features {
		let mut features = Features::empty();
		features.set(Feature::OptionDataLossProtect, FeatureSupport::Optional);
		features.set(Feature::VariableLengthOnion, FeatureSupport::Optional);
		features.set(Feature::StaticRemoteKey, FeatureSupport::Optional);
		features.set(Feature::PaymentSecret, FeatureSupport::Optional);
		features.set(Feature::BasicMultiPartPayment, FeatureSupport::Optional);
		features
	}

	/// Sets the given feature at the given support level.
	pub fn set(&mut self, feature: Feature, support: FeatureSupport) {
		self.activated.insert((feature, support));
	}

	/// Returns whether the feature is set. When `support` is `None`, either bit counts.
	pub fn has_feature(&self, feature: Feature, support: Option<FeatureSupport>) -> bool {
		match support {
			Some(support) => self.activated.contains(&(feature, support)),
			None => {
				self.activated.contains(&(feature, FeatureSupport::Mandatory))
					|| self.activated.contains(&(feature, FeatureSupport::Optional))
			},
		}
	}

	/// Returns whether both `local` and `remote` have the feature set (at either support level),
	/// ie whether the feature can actually be used on a connection between the two.
	pub fn can_use_feature(local: &Features, remote: &Features, feature: Feature) -> bool {
		local.has_feature(feature, None) && remote.has_feature(feature, None)
	}

	/// Checks that every feature set here also has its declared dependencies set.
	pub fn validate_dependencies(&self) -> Result<(), FeatureDependencyError> {
		for (feature, _) in self.activated.iter() {
			let missing: Vec<Feature> = feature.dependencies().iter()
				.filter(|dep| !self.has_feature(**dep, None))
				.cloned().collect();
			if !missing.is_empty() {
				return Err(FeatureDependencyError { feature: *feature, missing });
			}
		}
		Ok(())
	}

	/// Whether we can interact with a peer advertising this feature set: no unknown feature may
	/// be required of us, and every known feature required of us must be one we fully implement.
	pub fn are_supported(&self) -> bool {
		self.unknown.iter().all(|bit| bit % 2 == 1)
			&& self.activated.iter().all(|(feature, support)| {
				*support == FeatureSupport::Optional || feature.supported_as_mandatory()
			})
	}

	/// Ors another Features into this one.
	pub(crate) fn or(mut self, other: Features) -> Features {
		for entry in other.activated.into_iter() {
			self.activated.insert(entry);
		}
		for bit in other.unknown.into_iter() {
			self.unknown.insert(bit);
		}
		self
	}

	fn bits(&self) -> HashSet<u16> {
		let mut bits = HashSet::new();
		for (feature, support) in self.activated.iter() {
			bits.insert(match support {
				FeatureSupport::Mandatory => feature.mandatory_bit(),
				FeatureSupport::Optional => feature.optional_bit(),
			});
		}
		for bit in self.unknown.iter() {
			bits.insert(*bit);
		}
		bits
	}

	/// Encodes the feature set as a big-endian bit field: bit 0 is the least significant bit of
	/// the last byte, and the vector is exactly long enough for the highest set bit.
	pub fn to_bytes(&self) -> Vec<u8> {
		let bits = self.bits();
		let len = match bits.iter().max() {
			None => return Vec::new(),
			Some(max) => (*max as usize) / 8 + 1,
		};
		let mut ret = vec![0u8; len];
		for bit in bits {
			ret[len - 1 - (bit as usize) / 8] |= 1 << (bit % 8);
		}
		ret
	}

	/// Decodes a big-endian bit field, splitting set bits into known features and unknown bit
	/// indexes. Inverse of [`Features::to_bytes`] for any input.
	pub fn from_bytes(bytes: &[u8]) -> Features {
		let mut features = Features::empty();
		let len = bytes.len();
		for (i, byte) in bytes.iter().enumerate() {
			for shift in 0..8 {
				if byte & (1 << shift) != 0 {
					let bit = ((len - 1 - i) * 8 + shift) as u16;
					match Feature::from_bit(bit) {
						Some((feature, support)) => features.set(feature, support),
						None => { features.unknown.insert(bit); },
					}
				}
			}
		}
		features
	}

	#[cfg(test)]
	pub(crate) fn set_unknown_bit(&mut self, bit: u16) {
		self.unknown.insert(bit);
	}
}

impl Writeable for Features {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		let bytes = self.to_bytes();
		(bytes.len() as u16).write(w)?;
		w.write_all(&bytes)
	}
}

impl Readable for Features {
	fn read<R: io::Read>(r: &mut R) -> Result<Self, DecodeError> {
		let len: u16 = Readable::read(r)?;
		let mut bytes = vec![0u8; len as usize];
		r.read_exact(&mut bytes)?;
		Ok(Features::from_bytes(&bytes))
	}
}

#[cfg(test)]
mod tests {
	use super::{Feature, FeatureSupport, Features};
	use crate::util::ser::{Readable, Writeable};

	fn with(pairs: &[(Feature, FeatureSupport)]) -> Features {
		let mut features = Features::empty();
		for (feature, support) in pairs {
			features.set(*feature, *support);
		}
		features
	}

	#[test]
	fn encodes_known_bit_positions() {
		assert_eq!(Features::empty().to_bytes(), Vec::<u8>::new());
		// var_onion_optin required sits alone on bit 8
		assert_eq!(with(&[(Feature::VariableLengthOnion, FeatureSupport::Mandatory)]).to_bytes(),
			vec![0x01, 0x00]);
		// bits 9 (var_onion_optin optional) and 14 (payment_secret required)
		assert_eq!(with(&[
			(Feature::VariableLengthOnion, FeatureSupport::Optional),
			(Feature::PaymentSecret, FeatureSupport::Mandatory),
		]).to_bytes(), vec![0x42, 0x00]);
		// bits 1 and 3 fit in a single byte
		assert_eq!(with(&[
			(Feature::OptionDataLossProtect, FeatureSupport::Optional),
			(Feature::InitialRoutingSync, FeatureSupport::Optional),
		]).to_bytes(), vec![0x0a]);
		// trampoline lives way up at bit 50/51
		assert_eq!(with(&[(Feature::TrampolinePayment, FeatureSupport::Optional)]).to_bytes().len(), 7);
	}

	#[test]
	fn bytes_roundtrip_losslessly() {
		let mut features = Features::recommended();
		features.set(Feature::Wumbo, FeatureSupport::Mandatory);
		features.set_unknown_bit(27);
		features.set_unknown_bit(41);
		let bytes = features.to_bytes();
		assert_eq!(Features::from_bytes(&bytes), features);
		// And again through the wire codec, which length-prefixes.
		let decoded: Features = Readable::read(&mut &features.encode()[..]).unwrap();
		assert_eq!(decoded, features);
	}

	#[test]
	fn leading_zero_bytes_are_trimmed() {
		// A low-bit-only set re-encodes to a single byte even if decoded from a padded vector.
		let features = Features::from_bytes(&[0x00, 0x00, 0x02]);
		assert!(features.has_feature(Feature::OptionDataLossProtect, Some(FeatureSupport::Optional)));
		assert_eq!(features.to_bytes(), vec![0x02]);
	}

	#[test]
	fn reports_missing_dependencies() {
		let err = with(&[(Feature::BasicMultiPartPayment, FeatureSupport::Optional)])
			.validate_dependencies().unwrap_err();
		assert_eq!(err.feature, Feature::BasicMultiPartPayment);
		assert_eq!(err.missing, vec![Feature::PaymentSecret]);
		assert!(err.to_string().contains("payment_secret"));

		let err = with(&[(Feature::ChannelRangeQueriesExtended, FeatureSupport::Optional)])
			.validate_dependencies().unwrap_err();
		assert_eq!(err.missing, vec![Feature::ChannelRangeQueries]);

		let err = with(&[(Feature::TrampolinePayment, FeatureSupport::Optional)])
			.validate_dependencies().unwrap_err();
		assert_eq!(err.missing, vec![Feature::PaymentSecret]);

		assert!(with(&[
			(Feature::PaymentSecret, FeatureSupport::Optional),
			(Feature::BasicMultiPartPayment, FeatureSupport::Optional),
			(Feature::TrampolinePayment, FeatureSupport::Optional),
		]).validate_dependencies().is_ok());
	}

	#[test]
	fn payment_secret_does_not_require_var_onion() {
		// Legacy invoices set payment_secret without var_onion_optin; we accept that on purpose.
		assert!(with(&[(Feature::PaymentSecret, FeatureSupport::Mandatory)])
			.validate_dependencies().is_ok());
	}

	#[test]
	fn unknown_required_bits_are_unsupported() {
		assert!(Features::empty().are_supported());
		assert!(Features::recommended().are_supported());

		let mut features = Features::empty();
		features.set_unknown_bit(20);
		assert!(!features.are_supported());

		let mut features = Features::empty();
		features.set_unknown_bit(21);
		assert!(features.are_supported());
	}

	#[test]
	fn unimplemented_mandatory_features_are_unsupported() {
		// We can't handle a peer which requires initial_routing_sync or static_remotekey of us...
		assert!(!with(&[(Feature::StaticRemoteKey, FeatureSupport::Mandatory)]).are_supported());
		assert!(!with(&[(Feature::TrampolinePayment, FeatureSupport::Mandatory)]).are_supported());
		// ...but requiring features we fully implement is fine.
		assert!(with(&[
			(Feature::VariableLengthOnion, FeatureSupport::Mandatory),
			(Feature::PaymentSecret, FeatureSupport::Mandatory),
			(Feature::Wumbo, FeatureSupport::Mandatory),
		]).are_supported());
	}

	#[test]
	fn feature_use_requires_both_sides() {
		let local = Features::recommended();
		let mut remote = Features::empty();
		assert!(!Features::can_use_feature(&local, &remote, Feature::StaticRemoteKey));
		remote.set(Feature::StaticRemoteKey, FeatureSupport::Mandatory);
		assert!(Features::can_use_feature(&local, &remote, Feature::StaticRemoteKey));
		assert!(!Features::can_use_feature(&local, &remote, Feature::Wumbo));
	}
}

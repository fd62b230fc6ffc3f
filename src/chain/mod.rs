// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Structs and traits which allow other parts of the library to interact with the blockchain.

use bitcoin::blockdata::block::Header as BlockHeader;
use bitcoin::blockdata::constants::genesis_block;
use bitcoin::blockdata::script::ScriptBuf;
use bitcoin::blockdata::transaction::{OutPoint, Transaction};
use bitcoin::hash_types::Txid;
use bitcoin::network::constants::Network;

use std::io;

use crate::ln::msgs::DecodeError;
use crate::util::ser::{Readable, Writeable, Writer};

pub mod chaininterface;
pub mod keysinterface;

/// The best known block as identified by its height and header.
#[derive(Clone, Debug, PartialEq)]
pub struct BestBlock {
	/// The height at which the block was confirmed.
	pub height: u32,
	/// The block's full header.
	pub header: BlockHeader,
}

impl BestBlock {
	/// Constructs a `BestBlock` at the genesis of the given chain.
	pub fn from_genesis(network: Network) -> Self {
		BestBlock { height: 0, header: genesis_block(network).header }
	}
}

impl Writeable for BestBlock {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.height.write(w)?;
		self.header.write(w)
	}
}
impl Readable for BestBlock {
	fn read<R: io::Read>(r: &mut R) -> Result<Self, DecodeError> {
		let height = Readable::read(r)?;
		let header = Readable::read(r)?;
		Ok(BestBlock { height, header })
	}
}

/// Something the channel wants the chain watcher to keep an eye on.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchRequest {
	/// Report any transaction spending the given outpoint, forever. Spends of the funding output
	/// not made by us mean the commitment or a revoked state hit the chain.
	Spent {
		/// The outpoint to watch for spends
		outpoint: OutPoint,
	},
	/// Report when the given transaction has at least `min_depth` confirmations. A `min_depth`
	/// of zero fires as soon as the transaction is seen.
	Confirmed {
		/// The transaction to watch for confirmations
		txid: Txid,
		/// The number of confirmations to wait for
		min_depth: u32,
	},
	/// Report if the given transaction is still unconfirmed after a long time, suggesting it was
	/// double-spent or never broadcast.
	Lost {
		/// The transaction to watch for disappearance
		txid: Txid,
	},
}

/// An observation the chain watcher reports back in response to a [`WatchRequest`].
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent {
	/// A watched transaction reached the requested depth.
	Confirmed {
		/// The confirmed transaction
		tx: Transaction,
		/// The height of the block including it
		block_height: u32,
		/// The index of the transaction within that block
		tx_index: u32,
	},
	/// A watched outpoint was spent.
	Spent {
		/// The spending transaction
		tx: Transaction,
	},
}

/// A request for the on-chain wallet to construct (but not broadcast!) a funding transaction
/// paying `amount_satoshis` to `script_pubkey`.
#[derive(Clone, Debug, PartialEq)]
pub struct MakeFundingTx {
	/// The funding script, a P2WSH over the 2-of-2 multisig of both funding keys
	pub script_pubkey: ScriptBuf,
	/// The channel value
	pub amount_satoshis: u64,
	/// The feerate to use for the funding transaction, per 1000 weight
	pub feerate_per_kw: u32,
}

/// The on-chain wallet's response to a [`MakeFundingTx`] request.
#[derive(Clone, Debug, PartialEq)]
pub struct MakeFundingTxResponse {
	/// The complete, signed funding transaction. It must not be broadcast until the channel
	/// requests it: the counterparty's signature on our first commitment has to come first.
	pub funding_tx: Transaction,
	/// The index of the funding output within `funding_tx`
	pub output_index: u16,
	/// The fee paid by the funding transaction
	pub fee_satoshis: u64,
}

// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

#![crate_name = "lightning_channel"]

//! A Bitcoin Lightning channel state machine, in library form.
//!
//! The heart of the crate is a deterministic transition function: every channel is a value of
//! [`ln::channel::ChannelState`], and feeding it an [`ln::channel::Event`] yields a new state
//! plus an ordered list of [`ln::channel::Action`]s for the caller to dispatch. The transition
//! function performs no I/O whatsoever, which makes the protocol logic trivially testable and
//! crash recovery a matter of replaying the last persisted state.
//!
//! Networking, chain access, key storage and persistence are all left to the user, behind small
//! trait interfaces. [`ln::driver::ChannelDriver`] ties them together into a single-threaded
//! per-channel event pump for users who do not need anything fancier.
//!
//! Available features are:
//!
//! * Skip logging of messages at levels below the given log level:
//!     * `max_level_off`
//!     * `max_level_error`
//!     * `max_level_warn`
//!     * `max_level_info`
//!     * `max_level_debug`

#![cfg_attr(not(test), deny(missing_docs))]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![forbid(unsafe_code)]

extern crate bitcoin;

#[macro_use]
pub mod util;
pub mod chain;
pub mod ln;

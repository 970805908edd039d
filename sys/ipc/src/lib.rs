// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Core of the heterogeneous multiprocessor IPC runtime.
//!
//! The pieces here are deliberately coupled the way the hardware couples
//! them: the shared-memory containers ([`listmp`], [`heapmem`],
//! [`heapmultibuf`]) live in regions described by the [`sharedregion`]
//! directory and serialize through [`gate`]; the [`messageq`] service rides
//! the [`transport`] endpoint fabric and publishes names through the
//! [`nameserver`]; [`notify`] demultiplexes the inter-processor interrupt
//! lines everything else signals on.
//!
//! Every module is an explicit context value: callers construct it, share it
//! via `Arc`, and tear it down by dropping it. There are no hidden
//! singletons.

pub mod gate;
pub mod heapmem;
pub mod heapmultibuf;
pub mod listmp;
pub mod messageq;
pub mod multiproc;
pub mod nameserver;
pub mod notify;
pub mod sharedregion;
pub mod transport;

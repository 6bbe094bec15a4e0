// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//!  Boot-time handling of a node's encrypted state disk.
//!
//!  A fresh disk is formatted as LUKS2 with a random passphrase. A disk that
//!  was used before is only unlocked after the node obtained its key, either
//!  pushed by an operator or issued by the running control plane after the
//!  node attested itself. Recovering the key re-taints the node as
//!  bootstrapped by extending its cluster id into a measurement register.

pub mod mapper;
pub mod marker;
pub mod recovery;
pub mod rejoin;
pub mod setup;
pub mod state;
pub mod systemd;

#[cfg(test)]
mod testutil;

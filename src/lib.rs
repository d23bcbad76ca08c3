
//! Host-side multicast group membership: MLDv1/MLDv2 over ICMPv6 and
//! IGMPv1/v2/v3 over IPv4, sharing one protocol engine.
//!
//! [`stack::MulticastStack`] is the entry point. It consumes its environment
//! through the traits in [`services`]; [`backend::LinuxServices`] implements
//! them for MLD on Linux.

pub mod backend;
pub mod compat;
pub mod config;
pub mod error;
pub mod family;
pub mod filter;
pub mod gmp;
pub mod group;
pub mod icmp6;
pub mod igmp;
pub mod interface;
pub mod membership;
pub mod rtnl;
pub mod services;
pub mod srcset;
pub mod stack;
pub mod timer;
pub mod util;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::MulticastError;
pub use family::{AddressFamily, Igmp, Mld};
pub use stack::MulticastStack;

//! Receive-side core of an IPv4 protocol layer.
//!
//! The crate takes raw frames as the link layer delivers them, validates them
//! as IPv4 datagrams, reassembles fragmented datagrams, and fans whole
//! datagrams out to any number of upper-layer client sessions that registered
//! interest in matching packets. Delivery hands each interested client its own
//! view of the packet data, shares the backing storage as long as possible,
//! and honors per-client receive timeouts.
//!
//! The transmit path, ICMP/IGMP processing, interface configuration and
//! routing are external collaborators reached through the `Env` seam; see the
//! [`layer::ip`] module for the processing pipeline and [`wire`] for the
//! packet representations.
//!
//! [`layer::ip`]: layer/ip/index.html
//! [`wire`]: wire/index.html
#[macro_use]
mod macros;
pub mod layer;
pub mod storage;
pub mod wire;

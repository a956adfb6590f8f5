/*! Low-level packet access and representation.

The `wire` module deals with the packet *representation*. It provides two
levels of functionality.

 * First, it provides functions to extract fields from sequences of octets,
   and to insert fields into sequences of octets. This happens in the
   lowercase structures, e.g. [`ipv4_header`].
 * Second, it provides a compact, host-byte-order representation of header
   data that can be created from parsing and emitted back into a sequence of
   octets. This happens in the [`Ipv4Head`] struct, which is the header view
   that stays attached to a packet buffer while the receive pipeline works on
   the headless payload.

[`ipv4_header`]: struct.ipv4_header.html
[`Ipv4Head`]: struct.Ipv4Head.html
*/

mod field {
    pub(crate) type Field = ::core::ops::Range<usize>;
}

mod error;
mod icmpv4;
mod ipv4;

pub use self::error::{
    Error,
    Result};

pub use self::ipv4::{
    ipv4 as ipv4_header,
    Address as Ipv4Address,
    Cidr as Ipv4Cidr,
    CastType,
    Head as Ipv4Head,
    Protocol as IpProtocol,
    options_valid,
    MIN_HEAD_LEN as IPV4_MIN_HEAD_LEN,
    MAX_HEAD_LEN as IPV4_MAX_HEAD_LEN,
    MAX_PACKET_SIZE as IPV4_MAX_PACKET_SIZE};

pub use self::icmpv4::{
    Class as IcmpClass,
    Message as IcmpMessage,
    ERROR_IP_HEAD_OFFSET as ICMP_ERROR_IP_HEAD_OFFSET};

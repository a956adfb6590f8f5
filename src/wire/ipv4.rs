use core::fmt;
use byteorder::{ByteOrder, NetworkEndian};

use super::field::Field;
use super::{Error, Result};

/// Length of a header without options. See [RFC 791 § 3.1].
///
/// [RFC 791 § 3.1]: https://tools.ietf.org/html/rfc791#section-3.1
pub const MIN_HEAD_LEN: usize = 20;

/// Length of a header carrying the full 40 bytes of options.
pub const MAX_HEAD_LEN: usize = 60;

/// Largest representable datagram, header included.
///
/// The total-length field is 16 bits wide; a reassembled datagram whose end
/// offset exceeds this value cannot have come from a conforming sender.
pub const MAX_PACKET_SIZE: usize = 65535;

enum_with_unknown! {
    /// IP datagram encapsulated protocol.
    pub enum Protocol(u8) {
        /// Internet control message protocol.
        Icmp = 0x01,
        /// Internet group management protocol.
        Igmp = 0x02,
        /// Transmission control protocol.
        Tcp  = 0x06,
        /// User datagram protocol.
        Udp  = 0x11,
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Protocol::Icmp => write!(f, "ICMP"),
            Protocol::Igmp => write!(f, "IGMP"),
            Protocol::Tcp  => write!(f, "TCP"),
            Protocol::Udp  => write!(f, "UDP"),
            Protocol::Unknown(id) => write!(f, "0x{:02x}", id),
        }
    }
}

/// A four-octet IPv4 address.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct Address(pub [u8; 4]);

impl Address {
    /// An unspecified address.
    pub const UNSPECIFIED: Address = Address([0x00; 4]);

    /// The limited broadcast address.
    pub const BROADCAST:   Address = Address([0xff; 4]);

    /// Construct an IPv4 address from parts.
    pub const fn new(a0: u8, a1: u8, a2: u8, a3: u8) -> Address {
        Address([a0, a1, a2, a3])
    }

    /// Construct an IPv4 address from a sequence of octets, in big-endian.
    ///
    /// # Panics
    /// The function panics if `data` is not four octets long.
    pub fn from_bytes(data: &[u8]) -> Address {
        let mut bytes = [0; 4];
        bytes.copy_from_slice(data);
        Address(bytes)
    }

    /// Return an IPv4 address as a sequence of octets, in big-endian.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Query whether the address is the limited broadcast address.
    pub fn is_broadcast(&self) -> bool {
        self.0[0..4] == [255; 4]
    }

    /// Query whether the address is a multicast address.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0xf0 == 224
    }

    /// Query whether the address falls into the "unspecified" range.
    pub fn is_unspecified(&self) -> bool {
        self.0 == [0; 4]
    }
}

impl From<Address> for u32 {
    fn from(Address(bytes): Address) -> u32 {
        NetworkEndian::read_u32(&bytes[..])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = self.0;
        write!(f, "{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3])
    }
}

/// A specification of an IPv4 CIDR block, containing an address and a
/// variable-length subnet masking prefix length.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct Cidr {
    address:    Address,
    prefix_len: u8,
}

impl Cidr {
    /// Create an IPv4 CIDR block from the given address and prefix length.
    ///
    /// # Panics
    /// This function panics if the prefix length is larger than 32.
    pub fn new(address: Address, prefix_len: u8) -> Cidr {
        assert!(prefix_len <= 32);
        Cidr { address, prefix_len }
    }

    /// Create an IPv4 CIDR block from the given address and network mask.
    ///
    /// Returns `None` when the mask octets are not a contiguous prefix.
    pub fn from_netmask(addr: Address, netmask: Address) -> Option<Cidr> {
        let netmask = NetworkEndian::read_u32(&netmask.0[..]);
        if netmask.leading_zeros() == 0 && netmask.trailing_zeros() == netmask.count_zeros() {
            Some(Cidr { address: addr, prefix_len: netmask.count_ones() as u8 })
        } else {
            None
        }
    }

    /// Return the address of this IPv4 CIDR block.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Return the prefix length of this IPv4 CIDR block.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Return the directed broadcast address of this IPv4 CIDR.
    ///
    /// Point-to-point blocks (/31 and /32) have no distinct broadcast address.
    pub fn broadcast(&self) -> Option<Address> {
        if self.prefix_len == 31 || self.prefix_len == 32 {
            return None;
        }

        let network = NetworkEndian::read_u32(self.address.as_bytes())
            & !(0xffffffffu32 >> self.prefix_len);
        let number = if self.prefix_len == 0 {
            0xffffffffu32
        } else {
            network | 0xffffffffu32 >> self.prefix_len
        };
        let mut data = [0; 4];
        NetworkEndian::write_u32(&mut data[..], number);

        Some(Address(data))
    }

    /// Query whether the subnetwork described by this IPv4 CIDR block contains
    /// the given address.
    pub fn contains_addr(&self, addr: &Address) -> bool {
        // right shift by 32 is not legal
        if self.prefix_len == 0 { return true }

        let shift = 32 - self.prefix_len;
        let self_prefix = NetworkEndian::read_u32(self.address.as_bytes()) >> shift;
        let addr_prefix = NetworkEndian::read_u32(addr.as_bytes()) >> shift;
        self_prefix == addr_prefix
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// Classification of a destination address relative to the receiving station.
///
/// A packet that classifies as none of these is not meant for the station and
/// is represented as `None` at the computation seam; the variant is never
/// stored on a packet that survived ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastType {
    /// The destination matches an interface address.
    Unicast,
    /// The destination is the limited broadcast address 255.255.255.255.
    LocalBroadcast,
    /// The destination is the directed broadcast of an interface subnet.
    SubnetBroadcast,
    /// The destination is a class D group address.
    Multicast,
    /// Nothing matched, but an interface receives promiscuously.
    Promiscuous,
}

impl CastType {
    /// Whether the class is one of the two broadcast forms.
    pub fn is_broadcast(self) -> bool {
        match self {
            CastType::LocalBroadcast | CastType::SubnetBroadcast => true,
            _ => false,
        }
    }
}

/// A byte sequence holding an IPv4 header and payload.
byte_wrapper!(ipv4);

mod field {
    use super::Field;

    pub const VER_IHL:  usize = 0;
    pub const TOS:      usize = 1;
    pub const LENGTH:   Field = 2..4;
    pub const IDENT:    Field = 4..6;
    pub const FLG_OFF:  Field = 6..8;
    pub const TTL:      usize = 8;
    pub const PROTOCOL: usize = 9;
    pub const CHECKSUM: Field = 10..12;
    pub const SRC_ADDR: Field = 12..16;
    pub const DST_ADDR: Field = 16..20;
}

impl ipv4 {
    /// Imbue a raw octet buffer with IPv4 header structure.
    pub fn new_unchecked(buffer: &[u8]) -> &ipv4 {
        Self::__from_macro_new_unchecked(buffer)
    }

    /// Imbue a mutable octet buffer with IPv4 header structure.
    pub fn new_unchecked_mut(buffer: &mut [u8]) -> &mut ipv4 {
        Self::__from_macro_new_unchecked_mut(buffer)
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(data: &[u8]) -> Result<&ipv4> {
        let packet = Self::new_unchecked(data);
        packet.check_len()?;
        Ok(packet)
    }

    /// Unwrap the header as a raw byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Ensure that no accessor method will panic if called.
    ///
    /// Returns `Err(Error::Truncated)` if the buffer is too short and
    /// `Err(Error::Malformed)` if the header length exceeds the total length.
    pub fn check_len(&self) -> Result<()> {
        let len = self.0.len();
        if len < field::DST_ADDR.end {
            Err(Error::Truncated)
        } else if len < self.header_len() as usize {
            Err(Error::Truncated)
        } else if self.header_len() as u16 > self.total_len() {
            Err(Error::Malformed)
        } else {
            Ok(())
        }
    }

    /// Return the version field.
    #[inline]
    pub fn version(&self) -> u8 {
        self.0[field::VER_IHL] >> 4
    }

    /// Return the header length, in octets.
    #[inline]
    pub fn header_len(&self) -> u8 {
        (self.0[field::VER_IHL] & 0x0f) * 4
    }

    /// Return the type of service field.
    pub fn tos(&self) -> u8 {
        self.0[field::TOS]
    }

    /// Return the total length field.
    #[inline]
    pub fn total_len(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::LENGTH])
    }

    /// Return the fragment identification field.
    #[inline]
    pub fn ident(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::IDENT])
    }

    /// Return the "don't fragment" flag.
    #[inline]
    pub fn dont_frag(&self) -> bool {
        NetworkEndian::read_u16(&self.0[field::FLG_OFF]) & 0x4000 != 0
    }

    /// Return the "more fragments" flag.
    #[inline]
    pub fn more_frags(&self) -> bool {
        NetworkEndian::read_u16(&self.0[field::FLG_OFF]) & 0x2000 != 0
    }

    /// Return the fragment offset, in octets.
    #[inline]
    pub fn frag_offset(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::FLG_OFF]) << 3
    }

    /// Return the time to live field.
    #[inline]
    pub fn ttl(&self) -> u8 {
        self.0[field::TTL]
    }

    /// Return the protocol field.
    #[inline]
    pub fn protocol(&self) -> Protocol {
        Protocol::from(self.0[field::PROTOCOL])
    }

    /// Return the header checksum field.
    #[inline]
    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::CHECKSUM])
    }

    /// Return the source address field.
    #[inline]
    pub fn src_addr(&self) -> Address {
        Address::from_bytes(&self.0[field::SRC_ADDR])
    }

    /// Return the destination address field.
    #[inline]
    pub fn dst_addr(&self) -> Address {
        Address::from_bytes(&self.0[field::DST_ADDR])
    }

    /// Return the option bytes between the fixed header and the payload.
    pub fn options_slice(&self) -> &[u8] {
        &self.0[MIN_HEAD_LEN..self.header_len() as usize]
    }

    /// Validate the header checksum.
    pub fn verify_checksum(&self) -> bool {
        checksum::data(&self.0[..self.header_len() as usize]) == !0
    }

    /// Set the version field.
    #[inline]
    pub fn set_version(&mut self, value: u8) {
        self.0[field::VER_IHL] = (self.0[field::VER_IHL] & !0xf0) | (value << 4);
    }

    /// Set the header length, in octets.
    #[inline]
    pub fn set_header_len(&mut self, value: u8) {
        self.0[field::VER_IHL] = (self.0[field::VER_IHL] & !0x0f) | ((value / 4) & 0x0f);
    }

    /// Set the type of service field.
    pub fn set_tos(&mut self, value: u8) {
        self.0[field::TOS] = value
    }

    /// Set the total length field.
    #[inline]
    pub fn set_total_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::LENGTH], value)
    }

    /// Set the fragment identification field.
    #[inline]
    pub fn set_ident(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::IDENT], value)
    }

    /// Set the "don't fragment" flag.
    #[inline]
    pub fn set_dont_frag(&mut self, value: bool) {
        let raw = NetworkEndian::read_u16(&self.0[field::FLG_OFF]);
        let raw = if value { raw | 0x4000 } else { raw & !0x4000 };
        NetworkEndian::write_u16(&mut self.0[field::FLG_OFF], raw);
    }

    /// Set the "more fragments" flag.
    #[inline]
    pub fn set_more_frags(&mut self, value: bool) {
        let raw = NetworkEndian::read_u16(&self.0[field::FLG_OFF]);
        let raw = if value { raw | 0x2000 } else { raw & !0x2000 };
        NetworkEndian::write_u16(&mut self.0[field::FLG_OFF], raw);
    }

    /// Set the fragment offset, in octets.
    #[inline]
    pub fn set_frag_offset(&mut self, value: u16) {
        let raw = NetworkEndian::read_u16(&self.0[field::FLG_OFF]);
        let raw = (raw & 0xe000) | (value >> 3);
        NetworkEndian::write_u16(&mut self.0[field::FLG_OFF], raw);
    }

    /// Set the time to live field.
    #[inline]
    pub fn set_ttl(&mut self, value: u8) {
        self.0[field::TTL] = value
    }

    /// Set the protocol field.
    #[inline]
    pub fn set_protocol(&mut self, value: Protocol) {
        self.0[field::PROTOCOL] = value.into()
    }

    /// Set the header checksum field.
    #[inline]
    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::CHECKSUM], value)
    }

    /// Set the source address field.
    #[inline]
    pub fn set_src_addr(&mut self, value: Address) {
        self.0[field::SRC_ADDR].copy_from_slice(value.as_bytes())
    }

    /// Set the destination address field.
    #[inline]
    pub fn set_dst_addr(&mut self, value: Address) {
        self.0[field::DST_ADDR].copy_from_slice(value.as_bytes())
    }

    /// Compute and fill in the header checksum.
    pub fn fill_checksum(&mut self) {
        self.set_checksum(0);
        let checksum = {
            !checksum::data(&self.0[..self.header_len() as usize])
        };
        self.set_checksum(checksum)
    }
}

impl AsRef<[u8]> for ipv4 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A host-byte-order view of one IPv4 header.
///
/// This is the representation the receive pipeline attaches to a packet
/// buffer once the header bytes have been validated and stripped. Fragment
/// reassembly captures the view of the offset-zero fragment, and delivery
/// emits it back into network byte order for upper-layer presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    /// Header length in octets, options included.
    pub header_len:  u8,
    /// Type of service, as received.
    pub tos:         u8,
    /// Total datagram length as carried in the header.
    pub total_len:   u16,
    /// Fragment identification.
    pub ident:       u16,
    /// The "don't fragment" flag.
    pub dont_frag:   bool,
    /// The "more fragments" flag.
    pub more_frags:  bool,
    /// Fragment offset in octets.
    pub frag_offset: u16,
    /// Time to live, as received.
    pub ttl:         u8,
    /// Encapsulated protocol.
    pub protocol:    Protocol,
    /// The checksum field as carried in the header.
    pub checksum:    u16,
    /// Source address.
    pub src_addr:    Address,
    /// Destination address.
    pub dst_addr:    Address,
    /// Raw option bytes, empty for a minimal header.
    pub options:     Vec<u8>,
}

impl Head {
    /// Parse a checked header into the host-order view.
    ///
    /// The caller is responsible for having validated length, version and
    /// checksum; this only transcribes fields.
    pub fn parse(raw: &ipv4) -> Head {
        Head {
            header_len:  raw.header_len(),
            tos:         raw.tos(),
            total_len:   raw.total_len(),
            ident:       raw.ident(),
            dont_frag:   raw.dont_frag(),
            more_frags:  raw.more_frags(),
            frag_offset: raw.frag_offset(),
            ttl:         raw.ttl(),
            protocol:    raw.protocol(),
            checksum:    raw.checksum(),
            src_addr:    raw.src_addr(),
            dst_addr:    raw.dst_addr(),
            options:     raw.options_slice().to_vec(),
        }
    }

    /// Whether the datagram this header belongs to is a fragment.
    ///
    /// A packet is a fragment if more fragments follow it or it does not
    /// start at offset zero.
    pub fn is_fragment(&self) -> bool {
        self.more_frags || self.frag_offset != 0
    }

    /// Emit the header back into network byte order, options included.
    pub fn emit(&self) -> Vec<u8> {
        let mut bytes = vec![0; self.header_len as usize];
        {
            let raw = ipv4::new_unchecked_mut(&mut bytes);
            raw.set_version(4);
            raw.set_header_len(self.header_len);
            raw.set_tos(self.tos);
            raw.set_total_len(self.total_len);
            raw.set_ident(self.ident);
            raw.set_dont_frag(self.dont_frag);
            raw.set_more_frags(self.more_frags);
            raw.set_frag_offset(self.frag_offset);
            raw.set_ttl(self.ttl);
            raw.set_protocol(self.protocol);
            raw.set_checksum(self.checksum);
            raw.set_src_addr(self.src_addr);
            raw.set_dst_addr(self.dst_addr);
        }
        bytes[MIN_HEAD_LEN..].copy_from_slice(&self.options);
        bytes
    }
}

const OPTION_END:  u8 = 0;
const OPTION_NOOP: u8 = 1;

/// Check the option bytes of a received header for structural validity.
///
/// End-of-list terminates the walk and a no-op advances one octet; every
/// other option must carry a length octet of at least 2 that fits inside the
/// remaining option bytes. Option semantics are not interpreted here.
pub fn options_valid(mut options: &[u8]) -> bool {
    while let Some(&kind) = options.first() {
        match kind {
            OPTION_END => break,
            OPTION_NOOP => options = &options[1..],
            _ => {
                let len = match options.get(1) {
                    Some(&len) => len as usize,
                    None => return false,
                };
                if len < 2 || len > options.len() {
                    return false;
                }
                options = &options[len..];
            }
        }
    }
    true
}

pub(crate) mod checksum {
    use byteorder::{ByteOrder, NetworkEndian};

    fn propagate_carries(word: u32) -> u16 {
        let sum = (word >> 16) + (word & 0xffff);
        ((sum >> 16) as u16) + (sum as u16)
    }

    /// Compute an RFC 1071 compliant checksum (without the final complement).
    pub(crate) fn data(mut data: &[u8]) -> u16 {
        let mut accum = 0;

        while data.len() >= 2 {
            accum += NetworkEndian::read_u16(data) as u32;
            data = &data[2..];
        }

        // Add the last remaining odd byte, if any.
        if let Some(&value) = data.first() {
            accum += (value as u32) << 8;
        }

        propagate_carries(accum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static HEADER_BYTES: [u8; 24] =
        [0x46, 0x00, 0x00, 0x20,
         0x12, 0x34, 0x20, 0x02,
         0x40, 0x11, 0x00, 0x00,
         0x0a, 0x00, 0x00, 0x03,
         0x0a, 0x00, 0x00, 0x02,
         0x01, 0x04, 0x00, 0x00];

    fn checked_header() -> Vec<u8> {
        let mut bytes = HEADER_BYTES.to_vec();
        bytes.resize(32, 0xaa);
        ipv4::new_unchecked_mut(&mut bytes).fill_checksum();
        bytes
    }

    #[test]
    fn field_access() {
        let bytes = checked_header();
        let raw = ipv4::new_checked(&bytes).unwrap();
        assert_eq!(raw.version(), 4);
        assert_eq!(raw.header_len(), 24);
        assert_eq!(raw.total_len(), 32);
        assert_eq!(raw.ident(), 0x1234);
        assert!(!raw.dont_frag());
        assert!(raw.more_frags());
        assert_eq!(raw.frag_offset(), 16);
        assert_eq!(raw.ttl(), 64);
        assert_eq!(raw.protocol(), Protocol::Udp);
        assert_eq!(raw.src_addr(), Address::new(10, 0, 0, 3));
        assert_eq!(raw.dst_addr(), Address::new(10, 0, 0, 2));
        assert_eq!(raw.options_slice(), &[0x01, 0x04, 0x00, 0x00][..]);
        assert!(raw.verify_checksum());
    }

    #[test]
    fn head_round_trip() {
        let bytes = checked_header();
        let head = Head::parse(ipv4::new_unchecked(&bytes));
        assert!(head.is_fragment());
        assert_eq!(head.emit(), &bytes[..24]);
    }

    #[test]
    fn corrupted_checksum() {
        let mut bytes = checked_header();
        bytes[0x08] = !bytes[0x08];
        assert!(!ipv4::new_unchecked(&bytes).verify_checksum());
    }

    #[test]
    fn options_walk() {
        // end-of-list stops the scan regardless of what follows
        assert!(options_valid(&[0x00, 0xff, 0xff, 0xff]));
        // no-op padding only
        assert!(options_valid(&[0x01, 0x01, 0x01, 0x01]));
        // a well-formed option with a length byte
        assert!(options_valid(&[0x07, 0x04, 0x00, 0x00]));
        // length byte missing
        assert!(!options_valid(&[0x01, 0x01, 0x01, 0x07]));
        // length below the two-octet minimum
        assert!(!options_valid(&[0x07, 0x01, 0x00, 0x00]));
        // length overruns the option bytes
        assert!(!options_valid(&[0x07, 0x08, 0x00, 0x00]));
    }

    #[test]
    fn directed_broadcast() {
        let cidr = Cidr::from_netmask(
            Address::new(10, 0, 0, 2),
            Address::new(255, 255, 255, 0)).unwrap();
        assert_eq!(cidr.prefix_len(), 24);
        assert_eq!(cidr.broadcast(), Some(Address::new(10, 0, 0, 255)));
        assert_eq!(Cidr::from_netmask(
            Address::new(10, 0, 0, 2),
            Address::new(255, 0, 255, 0)), None);
    }

    #[test]
    fn cast_classes() {
        assert!(CastType::LocalBroadcast.is_broadcast());
        assert!(CastType::SubnetBroadcast.is_broadcast());
        assert!(!CastType::Multicast.is_broadcast());
        assert!(!CastType::Unicast.is_broadcast());
    }
}

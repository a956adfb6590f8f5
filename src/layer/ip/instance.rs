use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::layer::{Error, Result};
use crate::storage::PacketBuf;
use crate::wire::{CastType, IcmpClass, IcmpMessage, Ipv4Address, Ipv4Head, IpProtocol};
use crate::wire::{ICMP_ERROR_IP_HEAD_OFFSET, IPV4_MAX_HEAD_LEN, IPV4_MIN_HEAD_LEN};

/// The result a completed receive token carries alongside its packet.
pub type Status = Result<()>;

/// How long a client session lets queued datagrams wait for a receive token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveTimeout {
    /// The session never receives; it exists only to send.
    ///
    /// Datagrams are filtered out before a copy is ever queued. Configuration
    /// encodings without a variant for this use an all-ones timeout value.
    Disabled,

    /// Queued datagrams wait this many microseconds; zero waits forever.
    Timeout(u32),
}

impl ReceiveTimeout {
    /// The queue life in aging ticks; zero means the datagram never expires.
    pub(crate) fn life(self) -> u32 {
        match self {
            ReceiveTimeout::Disabled => 0,
            ReceiveTimeout::Timeout(micros) => ((u64::from(micros) + 999_999) / 1_000_000) as u32,
        }
    }
}

impl Default for ReceiveTimeout {
    fn default() -> ReceiveTimeout {
        ReceiveTimeout::Timeout(0)
    }
}

/// Filter configuration of one client session.
#[derive(Debug, Clone)]
pub struct Config {
    /// Deliver datagrams of every protocol, not just the default one.
    pub accept_any_protocol: bool,
    /// The protocol this session registered for.
    pub default_protocol: IpProtocol,
    /// Deliver ICMP errors quoting a datagram of the session's protocol.
    pub accept_icmp_errors: bool,
    /// Deliver limited and directed broadcasts.
    pub accept_broadcast: bool,
    /// Deliver everything that reaches the station, filters notwithstanding.
    pub accept_promiscuous: bool,
    /// Use the interface's address instead of `station_address`.
    pub use_default_address: bool,
    /// The session's own address, or zero.
    pub station_address: Ipv4Address,
    /// The netmask belonging to `station_address`.
    pub subnet_mask: Ipv4Address,
    /// Receive queue timeout behavior.
    pub receive_timeout: ReceiveTimeout,
    /// Type of service for transmitted datagrams.
    pub type_of_service: u8,
    /// Time to live for transmitted datagrams.
    pub time_to_live: u8,
    /// Multicast groups the session joined.
    pub groups: Vec<Ipv4Address>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            accept_any_protocol: false,
            default_protocol: IpProtocol::Udp,
            accept_icmp_errors: false,
            accept_broadcast: false,
            accept_promiscuous: false,
            use_default_address: true,
            station_address: Ipv4Address::UNSPECIFIED,
            subnet_mask: Ipv4Address::UNSPECIFIED,
            receive_timeout: ReceiveTimeout::default(),
            type_of_service: 0,
            time_to_live: 64,
            groups: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Unconfigured,
    Configured,
    Stopping,
}

/// A completed receive handed to the upper layer.
///
/// The descriptor owns the packet it presents. The upper layer reads the
/// header and payload views and then consumes the descriptor with
/// [`recycle`], which takes it off the session's delivered list and releases
/// the backing storage; consuming it makes signalling twice unrepresentable.
///
/// [`recycle`]: #method.recycle
#[derive(Debug)]
pub struct Delivered {
    wrap: Arc<RxWrap>,
    home: Weak<Mutex<Vec<Arc<RxWrap>>>>,
}

#[derive(Debug)]
pub(crate) struct RxWrap {
    packet: PacketBuf,
    header: Vec<u8>,
}

impl Delivered {
    /// The header in network byte order, options included.
    pub fn header(&self) -> &[u8] {
        &self.wrap.header
    }

    /// The header length in octets.
    pub fn header_len(&self) -> usize {
        self.wrap.header.len()
    }

    /// The option bytes, empty for a minimal header.
    pub fn options(&self) -> &[u8] {
        &self.wrap.header[IPV4_MIN_HEAD_LEN.min(self.wrap.header.len())..]
    }

    /// The number of payload bytes.
    pub fn data_len(&self) -> usize {
        self.wrap.packet.len()
    }

    /// The physical payload blocks, in order.
    pub fn fragment_table(&self) -> Vec<&[u8]> {
        self.wrap.packet.fragment_table()
    }

    /// Hand the packet back.
    ///
    /// Unlinks the descriptor from the session's delivered list and drops
    /// the packet storage. Must be called exactly once, which consuming
    /// `self` enforces.
    pub fn recycle(self) {
        if let Some(home) = self.home.upgrade() {
            let mut delivered = lock(&home);
            delivered.retain(|wrap| !Arc::ptr_eq(wrap, &self.wrap));
        }
    }
}

/// A client-supplied receive token.
///
/// The client keeps the paired [`RxWatch`] and hands the token to the layer;
/// once a datagram is matched to the token the layer fills in status and
/// packet and the watch observes the completion.
///
/// [`RxWatch`]: struct.RxWatch.html
#[derive(Debug)]
pub struct RxToken {
    slot: Arc<Mutex<Option<(Status, Delivered)>>>,
}

/// The client-side view of a pending [`RxToken`].
///
/// [`RxToken`]: struct.RxToken.html
#[derive(Debug)]
pub struct RxWatch {
    slot: Arc<Mutex<Option<(Status, Delivered)>>>,
}

impl RxToken {
    /// Create a token and the watch observing it.
    pub fn pair() -> (RxToken, RxWatch) {
        let slot = Arc::new(Mutex::new(None));
        (RxToken { slot: slot.clone() }, RxWatch { slot })
    }

    fn complete(self, status: Status, packet: Delivered) {
        *lock(&self.slot) = Some((status, packet));
    }
}

impl RxWatch {
    /// Take the completion out of the token, if it happened.
    pub fn take(&self) -> Option<(Status, Delivered)> {
        lock(&self.slot).take()
    }

    /// Whether the token is still waiting for a datagram.
    pub fn is_pending(&self) -> bool {
        lock(&self.slot).is_none()
    }
}

/// One upper-layer client session.
///
/// Holds the session's filter configuration and the three delivery stages: a
/// queue of accepted datagrams waiting for a token, the pending receive
/// tokens, and the wrapped packets currently in the client's hands. The
/// delivered list is behind a mutex because recycling may be signalled from
/// an arbitrary context.
#[derive(Debug)]
pub struct Instance {
    pub(crate) config: Config,
    pub(crate) state: State,
    pub(crate) received: VecDeque<PacketBuf>,
    pub(crate) rx_tokens: VecDeque<RxToken>,
    pub(crate) delivered: Arc<Mutex<Vec<Arc<RxWrap>>>>,
}

impl Instance {
    pub(crate) fn new() -> Instance {
        Instance {
            config: Config::default(),
            state: State::Unconfigured,
            received: VecDeque::new(),
            rx_tokens: VecDeque::new(),
            delivered: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Apply a configuration, or stop the session with `None`.
    ///
    /// Stopping flushes the receive queue and forgets pending tokens; the
    /// packets a client still holds stay valid until it recycles them.
    pub(crate) fn configure(&mut self, config: Option<Config>) {
        match config {
            Some(config) => {
                self.config = config;
                self.state = State::Configured;
            }
            None => {
                self.state = State::Stopping;
                self.received.clear();
                self.rx_tokens.clear();
                self.state = State::Unconfigured;
            }
        }
    }

    /// Whether the session wants this datagram.
    fn acceptable(&self, head: &Ipv4Head, packet: &PacketBuf, cast: CastType) -> bool {
        let config = &self.config;

        // A receive-disabled session exists to send; never copy for it.
        if config.receive_timeout == ReceiveTimeout::Disabled {
            return false;
        }

        if config.accept_promiscuous {
            return true;
        }

        let mut protocol = head.protocol;

        if protocol == IpProtocol::Icmp {
            let mut kind = [0u8; 1];
            if packet.copy_to(0, &mut kind) < 1 {
                return false;
            }
            if IcmpMessage::from(kind[0]).class() == IcmpClass::Error {
                if !config.accept_icmp_errors {
                    return false;
                }
                // Filter by the protocol of the datagram the error quotes,
                // so a UDP client sees UDP errors. The protocol field lives
                // nine octets into the quoted header.
                let mut quoted = [0u8; 1];
                if packet.copy_to(ICMP_ERROR_IP_HEAD_OFFSET + 9, &mut quoted) < 1 {
                    return false;
                }
                protocol = IpProtocol::from(quoted[0]);
            }
        }

        if !config.accept_any_protocol && protocol != config.default_protocol {
            return false;
        }

        if cast.is_broadcast() {
            return config.accept_broadcast;
        }

        if cast == CastType::Multicast {
            // Without an address of its own the session hears every group.
            if !config.use_default_address && config.station_address.is_unspecified() {
                return true;
            }
            return config.groups.contains(&head.dst_addr);
        }

        true
    }

    /// Queue a shared copy of the packet if the session accepts it.
    ///
    /// The copy shares the packet data but carries its own control block,
    /// stamped with the interface-local cast type and the session's queue
    /// life.
    pub(crate) fn enqueue(&mut self, head: &Ipv4Head, packet: &PacketBuf, cast: CastType) -> Result<()> {
        if self.state != State::Configured {
            return Err(Error::NotStarted);
        }

        if !self.acceptable(head, packet, cast) {
            return Err(Error::InvalidParameter);
        }

        let mut clone = packet.clone_shared();
        {
            let clip = clone.clip_mut();
            clip.cast_type = Some(cast);
            clip.life = self.config.receive_timeout.life();
        }
        self.received.push_back(clone);
        Ok(())
    }

    /// Register a receive token and deliver anything already queued.
    pub(crate) fn receive(&mut self, token: RxToken) -> Result<()> {
        if self.state != State::Configured {
            return Err(Error::NotStarted);
        }
        self.rx_tokens.push_back(token);
        self.deliver()
    }

    /// Match queued datagrams to pending tokens.
    ///
    /// A datagram still shared with other sessions is copied into a private
    /// contiguous buffer first; the last session to take a datagram keeps
    /// the shared bytes without a copy. On failure the queue is left intact
    /// for a later attempt.
    pub(crate) fn deliver(&mut self) -> Result<()> {
        loop {
            if self.received.is_empty() {
                break;
            }
            // Pop the token under the same discipline that checked it; it
            // may have been cancelled in between.
            let token = match self.rx_tokens.pop_front() {
                Some(token) => token,
                None => break,
            };
            let packet = match self.received.pop_front() {
                Some(packet) => packet,
                None => {
                    self.rx_tokens.push_front(token);
                    break;
                }
            };

            let packet = if packet.is_shared() {
                let private = packet.duplicate(IPV4_MAX_HEAD_LEN);
                drop(packet);
                private
            } else {
                packet
            };

            let status = packet.clip().status;
            let header = match packet.head() {
                Some(head) => head.emit(),
                None => {
                    debug_assert!(false, "queued datagram without a parsed header");
                    Vec::new()
                }
            };

            let wrap = Arc::new(RxWrap { packet, header });
            lock(&self.delivered).push(wrap.clone());

            token.complete(status, Delivered {
                wrap,
                home: Arc::downgrade(&self.delivered),
            });
        }
        Ok(())
    }

    /// Age the receive queue by one tick.
    pub(crate) fn tick(&mut self) {
        self.received.retain_mut(|packet| {
            let clip = packet.clip_mut();
            if clip.life > 0 {
                clip.life -= 1;
                if clip.life == 0 {
                    net_trace!("ip4: queued datagram timed out");
                    return false;
                }
            }
            true
        });
    }

    /// The number of packets the client holds and has not recycled yet.
    pub(crate) fn delivered_count(&self) -> usize {
        lock(&self.delivered).len()
    }
}

/// Poisoning cannot leave the delivered list in a bad state, so a poisoned
/// lock is simply taken over.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(protocol: IpProtocol, dst: Ipv4Address) -> Ipv4Head {
        Ipv4Head {
            header_len: 20,
            tos: 0,
            total_len: 28,
            ident: 0x1234,
            dont_frag: false,
            more_frags: false,
            frag_offset: 0,
            ttl: 64,
            protocol,
            checksum: 0,
            src_addr: Ipv4Address::new(10, 0, 0, 3),
            dst_addr: dst,
            options: Vec::new(),
        }
    }

    fn datagram(protocol: IpProtocol, dst: Ipv4Address, payload: &[u8]) -> (Ipv4Head, PacketBuf) {
        let mut packet = PacketBuf::from_vec(payload.to_vec());
        let mut head = head(protocol, dst);
        head.total_len = (20 + payload.len()) as u16;
        packet.set_head(head.clone());
        (head, packet)
    }

    fn configured(config: Config) -> Instance {
        let mut instance = Instance::new();
        instance.configure(Some(config));
        instance
    }

    #[test]
    fn unconfigured_rejects() {
        let mut instance = Instance::new();
        let (head, packet) = datagram(IpProtocol::Udp, Ipv4Address::new(10, 0, 0, 2), &[0; 8]);
        assert_eq!(instance.enqueue(&head, &packet, CastType::Unicast), Err(Error::NotStarted));
    }

    #[test]
    fn receive_disabled_never_queues() {
        let mut instance = configured(Config {
            receive_timeout: ReceiveTimeout::Disabled,
            accept_any_protocol: true,
            accept_promiscuous: true,
            ..Config::default()
        });
        let (head, packet) = datagram(IpProtocol::Udp, Ipv4Address::new(10, 0, 0, 2), &[0; 8]);
        assert_eq!(
            instance.enqueue(&head, &packet, CastType::Unicast),
            Err(Error::InvalidParameter));
        assert!(instance.received.is_empty());
    }

    #[test]
    fn protocol_filter() {
        let mut instance = configured(Config::default());
        let (head, packet) = datagram(IpProtocol::Tcp, Ipv4Address::new(10, 0, 0, 2), &[0; 8]);
        assert_eq!(
            instance.enqueue(&head, &packet, CastType::Unicast),
            Err(Error::InvalidParameter));

        let (head, packet) = datagram(IpProtocol::Udp, Ipv4Address::new(10, 0, 0, 2), &[0; 8]);
        assert_eq!(instance.enqueue(&head, &packet, CastType::Unicast), Ok(()));
        assert_eq!(instance.received.len(), 1);
    }

    #[test]
    fn icmp_error_filter() {
        // Destination unreachable quoting a UDP datagram: type, code,
        // checksum, unused, then the quoted header.
        let mut body = vec![3, 3, 0, 0, 0, 0, 0, 0];
        let mut quoted = vec![0x45, 0, 0, 28, 0, 0, 0, 0, 64, 17, 0, 0];
        quoted.extend_from_slice(&[10, 0, 0, 2, 10, 0, 0, 3]);
        body.extend_from_slice(&quoted);
        body.extend_from_slice(&[0; 8]);

        let mut packet = PacketBuf::from_vec(body);
        let head = head(IpProtocol::Icmp, Ipv4Address::new(10, 0, 0, 2));
        packet.set_head(head.clone());

        // A UDP session that did not opt into errors rejects it.
        let mut instance = configured(Config::default());
        assert_eq!(
            instance.enqueue(&head, &packet, CastType::Unicast),
            Err(Error::InvalidParameter));

        // With the opt-in, the quoted protocol decides.
        let mut instance = configured(Config {
            accept_icmp_errors: true,
            ..Config::default()
        });
        assert_eq!(instance.enqueue(&head, &packet, CastType::Unicast), Ok(()));

        let mut instance = configured(Config {
            accept_icmp_errors: true,
            default_protocol: IpProtocol::Tcp,
            ..Config::default()
        });
        assert_eq!(
            instance.enqueue(&head, &packet, CastType::Unicast),
            Err(Error::InvalidParameter));
    }

    #[test]
    fn icmp_query_filter() {
        // An echo request is no error; only an ICMP session sees it.
        let mut packet = PacketBuf::from_vec(vec![8, 0, 0, 0, 0, 0, 0, 0]);
        let head = head(IpProtocol::Icmp, Ipv4Address::new(10, 0, 0, 2));
        packet.set_head(head.clone());

        let mut instance = configured(Config::default());
        assert_eq!(
            instance.enqueue(&head, &packet, CastType::Unicast),
            Err(Error::InvalidParameter));

        let mut instance = configured(Config {
            default_protocol: IpProtocol::Icmp,
            ..Config::default()
        });
        assert_eq!(instance.enqueue(&head, &packet, CastType::Unicast), Ok(()));
    }

    #[test]
    fn broadcast_needs_opt_in() {
        let (head, packet) = datagram(IpProtocol::Udp, Ipv4Address::BROADCAST, &[0; 8]);

        let mut instance = configured(Config::default());
        assert_eq!(
            instance.enqueue(&head, &packet, CastType::SubnetBroadcast),
            Err(Error::InvalidParameter));

        let mut instance = configured(Config {
            accept_broadcast: true,
            ..Config::default()
        });
        assert_eq!(instance.enqueue(&head, &packet, CastType::SubnetBroadcast), Ok(()));
    }

    #[test]
    fn multicast_group_membership() {
        let group = Ipv4Address::new(224, 0, 0, 9);
        let (head, packet) = datagram(IpProtocol::Udp, group, &[0; 8]);

        let mut instance = configured(Config {
            use_default_address: false,
            station_address: Ipv4Address::new(10, 0, 0, 2),
            ..Config::default()
        });
        assert_eq!(
            instance.enqueue(&head, &packet, CastType::Multicast),
            Err(Error::InvalidParameter));

        let mut instance = configured(Config {
            use_default_address: false,
            station_address: Ipv4Address::new(10, 0, 0, 2),
            groups: vec![group],
            ..Config::default()
        });
        assert_eq!(instance.enqueue(&head, &packet, CastType::Multicast), Ok(()));

        // A session without any address of its own hears every group.
        let mut instance = configured(Config {
            use_default_address: false,
            ..Config::default()
        });
        assert_eq!(instance.enqueue(&head, &packet, CastType::Multicast), Ok(()));
    }

    #[test]
    fn delivery_and_recycle() {
        let mut instance = configured(Config::default());
        let (head, packet) = datagram(IpProtocol::Udp, Ipv4Address::new(10, 0, 0, 2), &[1, 2, 3, 4]);
        assert_eq!(instance.enqueue(&head, &packet, CastType::Unicast), Ok(()));
        drop(packet);

        let (token, watch) = RxToken::pair();
        assert!(watch.is_pending());
        assert_eq!(instance.receive(token), Ok(()));

        let (status, delivered) = watch.take().expect("token completed");
        assert_eq!(status, Ok(()));
        assert_eq!(delivered.header_len(), 20);
        assert_eq!(delivered.options(), &[] as &[u8]);
        assert_eq!(delivered.data_len(), 4);
        assert_eq!(delivered.fragment_table().concat(), &[1, 2, 3, 4][..]);

        assert_eq!(instance.delivered_count(), 1);
        delivered.recycle();
        assert_eq!(instance.delivered_count(), 0);
    }

    #[test]
    fn shared_queue_entry_is_copied_for_delivery() {
        let mut instance = configured(Config::default());
        let (head, packet) = datagram(IpProtocol::Udp, Ipv4Address::new(10, 0, 0, 2), &[9; 6]);
        assert_eq!(instance.enqueue(&head, &packet, CastType::Unicast), Ok(()));

        // The original handle stays alive, so delivery must not hand out the
        // shared bytes.
        let (token, watch) = RxToken::pair();
        assert_eq!(instance.receive(token), Ok(()));
        let (_, delivered) = watch.take().expect("token completed");
        assert_eq!(delivered.fragment_table().concat(), vec![9; 6]);
        // The delivered copy is private; the caller's handle is the only one
        // left on the original bytes.
        assert!(!packet.is_shared());
        delivered.recycle();
    }

    #[test]
    fn tokens_wait_for_data() {
        let mut instance = configured(Config::default());
        let (token, watch) = RxToken::pair();
        assert_eq!(instance.receive(token), Ok(()));
        assert!(watch.is_pending());

        let (head, packet) = datagram(IpProtocol::Udp, Ipv4Address::new(10, 0, 0, 2), &[7; 3]);
        assert_eq!(instance.enqueue(&head, &packet, CastType::Unicast), Ok(()));
        drop(packet);
        assert_eq!(instance.deliver(), Ok(()));
        assert!(watch.take().is_some());
    }

    #[test]
    fn queue_life_expires() {
        let mut instance = configured(Config {
            receive_timeout: ReceiveTimeout::Timeout(2_000_000),
            ..Config::default()
        });
        let (head, packet) = datagram(IpProtocol::Udp, Ipv4Address::new(10, 0, 0, 2), &[0; 8]);
        assert_eq!(instance.enqueue(&head, &packet, CastType::Unicast), Ok(()));
        drop(packet);

        instance.tick();
        assert_eq!(instance.received.len(), 1);
        instance.tick();
        assert!(instance.received.is_empty());
    }

    #[test]
    fn zero_timeout_never_expires() {
        let mut instance = configured(Config::default());
        let (head, packet) = datagram(IpProtocol::Udp, Ipv4Address::new(10, 0, 0, 2), &[0; 8]);
        assert_eq!(instance.enqueue(&head, &packet, CastType::Unicast), Ok(()));
        drop(packet);

        for _ in 0..300 {
            instance.tick();
        }
        assert_eq!(instance.received.len(), 1);
    }

    #[test]
    fn stop_flushes_the_session() {
        let mut instance = configured(Config::default());
        let (head, packet) = datagram(IpProtocol::Udp, Ipv4Address::new(10, 0, 0, 2), &[0; 8]);
        assert_eq!(instance.enqueue(&head, &packet, CastType::Unicast), Ok(()));
        drop(packet);
        let (token, _watch) = RxToken::pair();
        // Keep the data queued by not matching it yet.
        instance.rx_tokens.push_back(token);

        instance.configure(None);
        assert_eq!(instance.state, State::Unconfigured);
        assert!(instance.received.is_empty());
        assert!(instance.rx_tokens.is_empty());

        let (head, packet) = datagram(IpProtocol::Udp, Ipv4Address::new(10, 0, 0, 2), &[0; 8]);
        assert_eq!(instance.enqueue(&head, &packet, CastType::Unicast), Err(Error::NotStarted));
    }
}

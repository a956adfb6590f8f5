use crate::layer::{Error, Result};
use crate::storage::PacketBuf;
use crate::wire::{ipv4_header, CastType, Ipv4Address, Ipv4Cidr, Ipv4Head, IpProtocol};
use crate::wire::{options_valid, IPV4_MAX_HEAD_LEN, IPV4_MAX_PACKET_SIZE, IPV4_MIN_HEAD_LEN};

use super::assemble::AssembleTable;
use super::instance::{Config, Instance, RxToken};

/// The environment a service is embedded into.
///
/// The receive core drives its collaborators through this seam: re-arming
/// the link-layer receive, and the ICMP/IGMP subsystems that consume whole
/// datagrams of their protocol. Buffer ownership transfers with the call.
pub trait Env {
    /// Re-arm the link-layer receive.
    ///
    /// Called exactly once per delivered frame, on every termination path of
    /// frame processing, and never once the service started tearing down.
    fn restart_receive(&mut self);

    /// Consume a whole ICMP datagram.
    fn icmp_handle(&mut self, head: &Ipv4Head, packet: PacketBuf);

    /// Consume a whole IGMP datagram.
    fn igmp_handle(&mut self, head: &Ipv4Head, packet: PacketBuf);

    /// Age the transmit tokens of one client session by one tick.
    fn transmit_tick(&mut self, _child: usize) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Running,
    Destroying,
}

/// A logical binding of an address to the link, grouping client sessions.
#[derive(Debug)]
pub struct Interface {
    pub(crate) ip: Ipv4Address,
    pub(crate) netmask: Ipv4Address,
    pub(crate) promiscuous: bool,
    pub(crate) configured: bool,
    pub(crate) instances: Vec<usize>,
}

impl Interface {
    fn directed_broadcast(&self) -> Option<Ipv4Address> {
        if self.ip.is_unspecified() {
            return None;
        }
        Ipv4Cidr::from_netmask(self.ip, self.netmask)?.broadcast()
    }
}

/// The receive side of one IPv4 layer binding.
///
/// Owns the reassembly state, the interfaces and the client sessions, and is
/// driven from exactly two entry points: [`accept_frame`] with each frame the
/// link layer took in, and [`timer_tick`] from the nominal 1 Hz aging timer.
/// Both run in the same cooperative context; nothing here blocks.
///
/// [`accept_frame`]: #method.accept_frame
/// [`timer_tick`]: #method.timer_tick
pub struct Service<E> {
    state: State,
    pub(crate) assemble: AssembleTable,
    pub(crate) interfaces: Vec<Interface>,
    pub(crate) children: Vec<Instance>,
    env: E,
}

impl<E: Env> Service<E> {
    /// Create a running service bound to its environment.
    pub fn new(env: E) -> Service<E> {
        Service {
            state: State::Running,
            assemble: AssembleTable::new(),
            interfaces: Vec::new(),
            children: Vec::new(),
            env,
        }
    }

    /// Access the environment.
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Mutable access to the environment.
    pub fn env_mut(&mut self) -> &mut E {
        &mut self.env
    }

    /// Bind an interface, returning its index.
    ///
    /// An unspecified address makes the interface accept every local
    /// destination.
    pub fn add_interface(&mut self, ip: Ipv4Address, netmask: Ipv4Address, promiscuous: bool) -> usize {
        self.interfaces.push(Interface {
            ip,
            netmask,
            promiscuous,
            configured: true,
            instances: Vec::new(),
        });
        self.interfaces.len() - 1
    }

    /// Create an unconfigured client session on an interface.
    pub fn add_child(&mut self, interface: usize) -> Result<usize> {
        if interface >= self.interfaces.len() {
            return Err(Error::NotFound);
        }
        self.children.push(Instance::new());
        let child = self.children.len() - 1;
        self.interfaces[interface].instances.push(child);
        Ok(child)
    }

    /// Configure a client session, or stop it with `None`.
    pub fn configure_child(&mut self, child: usize, config: Option<Config>) -> Result<()> {
        match self.children.get_mut(child) {
            Some(instance) => {
                instance.configure(config);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    /// Queue a receive token for a client session.
    ///
    /// Anything already waiting on the session's receive queue is delivered
    /// against it immediately.
    pub fn receive(&mut self, child: usize, token: RxToken) -> Result<()> {
        match self.children.get_mut(child) {
            Some(instance) => instance.receive(token),
            None => Err(Error::NotFound),
        }
    }

    /// Enter teardown: drop reassembly state and stop accepting frames.
    pub fn begin_destroy(&mut self) {
        self.state = State::Destroying;
        self.assemble.clear();
    }

    /// The link layer's frame callback.
    ///
    /// Validates, reassembles and dispatches one received frame, then
    /// re-arms the receive. A frame that arrived with a link error, or after
    /// teardown began, is dropped without re-arming.
    pub fn accept_frame(&mut self, io_status: Result<()>, packet: PacketBuf, link_flag: u32) {
        if io_status.is_err() || self.state == State::Destroying {
            return;
        }
        self.ingress(packet, link_flag);
        self.env.restart_receive();
    }

    /// Validate one frame and feed it onward.
    ///
    /// Consumes the buffer on every path: dispatch transfers it, reassembly
    /// takes it over, and every reject simply drops it.
    fn ingress(&mut self, mut packet: PacketBuf, link_flag: u32) {
        if packet.len() < IPV4_MIN_HEAD_LEN {
            net_debug!("ip4: frame below minimum header size");
            return;
        }

        let mut raw = [0; IPV4_MAX_HEAD_LEN];
        let prefix = packet.copy_to(0, &mut raw);
        let header = ipv4_header::new_unchecked(&raw[..prefix]);

        let head_len = header.header_len() as usize;
        let total_len = header.total_len() as usize;

        // The link layer may deliver the frame trailer too; trim it off.
        if total_len < packet.len() {
            packet.trim_tail(packet.len() - total_len);
        }

        if header.version() != 4
            || head_len < IPV4_MIN_HEAD_LEN
            || total_len < head_len
            || total_len != packet.len()
        {
            net_debug!("ip4: malformed header");
            return;
        }

        // A checksum field of zero means the sender did not compute one.
        if header.checksum() != 0 && !header.verify_checksum() {
            net_debug!("ip4: header checksum mismatch");
            return;
        }

        let head = Ipv4Head::parse(header);

        let start = head.frag_offset as usize;
        let length = total_len - head_len;
        let end = start + length;

        let cast = match self.host_cast(head.dst_addr, head.src_addr) {
            Some(cast) if end <= IPV4_MAX_PACKET_SIZE => cast,
            _ => {
                net_debug!("ip4: not destined to this station");
                return;
            }
        };

        if head_len > IPV4_MIN_HEAD_LEN && !options_valid(&raw[IPV4_MIN_HEAD_LEN..head_len]) {
            net_debug!("ip4: invalid options");
            return;
        }

        // Strip the header; from here on the buffer is headless payload and
        // the parsed view travels with it.
        packet.trim_head(head_len);
        {
            let clip = packet.clip_mut();
            clip.start = start;
            clip.length = length;
            clip.end = end;
            clip.cast_type = Some(cast);
            clip.link_flag = link_flag;
            clip.life = 0;
            clip.status = Ok(());
        }

        let is_fragment = head.is_fragment();
        let dont_frag = head.dont_frag;
        let more_frags = head.more_frags;
        packet.set_head(head);

        if is_fragment {
            if dont_frag {
                // A gateway would answer this with a destination-unreachable;
                // a host-only receiver just drops it.
                net_debug!("ip4: fragment with DF set");
                return;
            }

            // All but the final fragment come in units of eight octets.
            if more_frags && length % 8 != 0 {
                net_debug!("ip4: fragment length not a multiple of 8");
                return;
            }

            packet = match self.assemble.reassemble(packet) {
                Some(whole) => whole,
                None => return,
            };
        }

        // Reassembly may have replaced the packet; reload its header view
        // before branching on the protocol. Ownership moves to the callee.
        let head = match packet.head() {
            Some(head) => head.clone(),
            None => return,
        };
        packet.clip_mut().status = Ok(());

        match head.protocol {
            IpProtocol::Icmp => self.env.icmp_handle(&head, packet),
            IpProtocol::Igmp => self.env.igmp_handle(&head, packet),
            _ => {
                if self.demultiplex(&head, packet).is_err() {
                    net_trace!("ip4: no session accepted the datagram");
                }
            }
        }
    }

    /// Classify a destination relative to the whole station.
    ///
    /// A source address that is broadcast or multicast within the station's
    /// own scope disqualifies the packet entirely.
    fn host_cast(&self, dst: Ipv4Address, src: Ipv4Address) -> Option<CastType> {
        if src.is_broadcast() || src.is_multicast() {
            return None;
        }
        if self.interfaces.iter().any(|iface| {
            iface.configured && iface.directed_broadcast() == Some(src)
        }) {
            return None;
        }

        if dst.is_broadcast() {
            return Some(CastType::LocalBroadcast);
        }
        if dst.is_multicast() {
            return Some(CastType::Multicast);
        }

        for iface in self.interfaces.iter().filter(|iface| iface.configured) {
            if let Some(cast) = Self::net_cast(dst, iface) {
                return Some(cast);
            }
        }

        if self.interfaces.iter().any(|iface| iface.configured && iface.promiscuous) {
            return Some(CastType::Promiscuous);
        }

        None
    }

    /// Classify a destination against one interface.
    fn net_cast(dst: Ipv4Address, iface: &Interface) -> Option<CastType> {
        if !iface.ip.is_unspecified() && dst == iface.ip {
            return Some(CastType::Unicast);
        }
        if iface.directed_broadcast() == Some(dst) {
            return Some(CastType::SubnetBroadcast);
        }
        None
    }

    /// The interface-local cast type used for acceptance on one interface.
    ///
    /// Multicast and limited broadcast hold station-wide; everything else is
    /// recomputed against the interface, with an unspecified interface
    /// address accepting any local destination.
    fn interface_cast(global: CastType, dst: Ipv4Address, iface: &Interface) -> Option<CastType> {
        match global {
            CastType::Multicast | CastType::LocalBroadcast => Some(global),
            _ => {
                if iface.ip.is_unspecified() {
                    return Some(CastType::Unicast);
                }
                match Self::net_cast(dst, iface) {
                    Some(cast) => Some(cast),
                    None if iface.promiscuous => Some(CastType::Promiscuous),
                    None => None,
                }
            }
        }
    }

    /// Fan a whole datagram out to every interested client session.
    ///
    /// Two passes: the first enqueues a shared copy to each session whose
    /// filter accepts the datagram under its interface-local cast type; the
    /// second matches the queues against pending receive tokens. In between,
    /// the caller's own reference is released so the last taker can keep the
    /// bytes without copying.
    pub fn demultiplex(&mut self, head: &Ipv4Head, packet: PacketBuf) -> Result<()> {
        let global = match packet.clip().cast_type {
            Some(cast) => cast,
            None => return Err(Error::NotFound),
        };

        let mut enqueued = 0;
        {
            let Service { interfaces, children, .. } = self;
            for iface in interfaces.iter().filter(|iface| iface.configured) {
                let local = match Self::interface_cast(global, head.dst_addr, iface) {
                    Some(cast) => cast,
                    None => continue,
                };
                for &child in &iface.instances {
                    if let Some(instance) = children.get_mut(child) {
                        if instance.enqueue(head, &packet, local).is_ok() {
                            enqueued += 1;
                        }
                    }
                }
            }
        }

        drop(packet);

        if enqueued == 0 {
            return Err(Error::NotFound);
        }

        let Service { interfaces, children, .. } = self;
        for iface in interfaces.iter().filter(|iface| iface.configured) {
            for &child in &iface.instances {
                if let Some(instance) = children.get_mut(child) {
                    let _ = instance.deliver();
                }
            }
        }

        Ok(())
    }

    /// Age reassemblies, receive queues and transmit tokens by one tick.
    pub fn timer_tick(&mut self) {
        self.assemble.tick();

        let Service { children, env, .. } = self;
        for (index, instance) in children.iter_mut().enumerate() {
            instance.tick();
            env.transmit_tick(index);
        }
    }
}

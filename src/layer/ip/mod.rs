//! The IPv4 receive layer.
//!
//! This layer turns the raw frames a link service delivers into whole
//! datagrams in the hands of upper-layer client sessions. It covers header
//! validation, fragment reassembly, per-session acceptance filtering,
//! two-pass demultiplexing and delivery against client receive tokens.
//!
//! ## Structure
//!
//! The [`Service`] owns the per-binding state: the assemble table of
//! in-flight reassemblies, the [`Interface`] list and the client sessions.
//! Everything a service needs from the outside world (re-arming the link
//! receive, the ICMP and IGMP subsystems) sits behind the [`Env`] trait, so
//! an embedder or a test supplies the collaborators at construction.
//!
//! ## Receiving packets
//!
//! The link layer calls [`Service::accept_frame`] with each received frame.
//! The frame is validated as an IPv4 datagram and its destination classified
//! against the station's addresses; fragments pass through the assemble
//! table until their datagram is whole. ICMP and IGMP datagrams leave
//! through the environment; everything else is fanned out to the sessions
//! whose filters accept it, each getting its own shared-storage handle.
//!
//! A client session obtains data by queueing receive tokens. Each matched
//! token completes with a wrapped packet the client must hand back by
//! recycling it once done; until then the packet stays on the session's
//! delivered list.
//!
//! ## Timeouts
//!
//! [`Service::timer_tick`] runs at a nominal 1 Hz and ages three things:
//! partial reassemblies, queued datagrams whose session configured a receive
//! timeout, and the session's transmit tokens through the environment.
//!
//! [`Env`]: trait.Env.html
//! [`Interface`]: struct.Interface.html
//! [`Service`]: struct.Service.html
//! [`Service::accept_frame`]: struct.Service.html#method.accept_frame
//! [`Service::timer_tick`]: struct.Service.html#method.timer_tick

mod assemble;
mod endpoint;
mod instance;

pub use assemble::{
    AssembleTable,
    FRAGMENT_LIFE,
};

pub use endpoint::{
    Env,
    Interface,
    Service,
};

pub use instance::{
    Config,
    Delivered,
    Instance,
    ReceiveTimeout,
    RxToken,
    RxWatch,
    Status,
};

use core::fmt;

/// Byte offset of the embedded IP header inside an ICMP error message.
///
/// An error message carries type, code, checksum and a four-octet rest field
/// before quoting the offending datagram's header.
pub const ERROR_IP_HEAD_OFFSET: usize = 8;

enum_with_unknown! {
    /// Internet control message type.
    pub enum Message(u8) {
        /// Echo reply
        EchoReply      =  0,
        /// Destination unreachable
        DstUnreachable =  3,
        /// Source quench
        SourceQuench   =  4,
        /// Message redirect
        Redirect       =  5,
        /// Echo request
        EchoRequest    =  8,
        /// Router advertisement
        RouterAdvert   =  9,
        /// Router solicitation
        RouterSolicit  = 10,
        /// Time exceeded
        TimeExceeded   = 11,
        /// Parameter problem
        ParamProblem   = 12,
        /// Timestamp
        Timestamp      = 13,
        /// Timestamp reply
        TimestampReply = 14,
        /// Information request
        InfoRequest    = 15,
        /// Information reply
        InfoReply      = 16,
    }
}

/// Coarse classification of a message type.
///
/// The receive filter cares about exactly one property of an ICMP datagram:
/// whether it reports an error about an earlier transmission, in which case
/// the protocol of the quoted datagram decides which client sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    /// A request or reply that stands on its own.
    Query,
    /// A report about an earlier datagram, quoting its header.
    Error,
    /// A type this implementation does not know.
    Invalid,
}

impl Message {
    /// Classify the message type as query or error.
    pub fn class(self) -> Class {
        match self {
            Message::DstUnreachable
            | Message::SourceQuench
            | Message::Redirect
            | Message::TimeExceeded
            | Message::ParamProblem => Class::Error,
            Message::EchoReply
            | Message::EchoRequest
            | Message::RouterAdvert
            | Message::RouterSolicit
            | Message::Timestamp
            | Message::TimestampReply
            | Message::InfoRequest
            | Message::InfoReply => Class::Query,
            Message::Unknown(_) => Class::Invalid,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Message::EchoReply      => write!(f, "echo reply"),
            Message::DstUnreachable => write!(f, "destination unreachable"),
            Message::SourceQuench   => write!(f, "source quench"),
            Message::Redirect       => write!(f, "message redirect"),
            Message::EchoRequest    => write!(f, "echo request"),
            Message::RouterAdvert   => write!(f, "router advertisement"),
            Message::RouterSolicit  => write!(f, "router solicitation"),
            Message::TimeExceeded   => write!(f, "time exceeded"),
            Message::ParamProblem   => write!(f, "parameter problem"),
            Message::Timestamp      => write!(f, "timestamp"),
            Message::TimestampReply => write!(f, "timestamp reply"),
            Message::InfoRequest    => write!(f, "information request"),
            Message::InfoReply      => write!(f, "information reply"),
            Message::Unknown(id)    => write!(f, "{}", id),
        }
    }
}

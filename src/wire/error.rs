use core::fmt;

/// The error type for parsing of incoming packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An incoming packet could not be parsed because it was shorter than assumed.
    ///
    /// The buffer may be shorter than the fixed minimum header, or shorter than a
    /// length one of its own fields claims.
    Truncated,

    /// An incoming packet had an incorrect checksum and was dropped.
    ///
    /// Note that the receive path treats a checksum field of zero as "the sender
    /// did not compute one" and accepts such packets; this error is only produced
    /// for checksums that were present and wrong.
    WrongChecksum,

    /// An incoming packet was recognized but was self-contradictory.
    ///
    /// Examples: a version field other than 4; a header length below the fixed
    /// minimum; a total length smaller than the header length.
    Malformed,
}

/// The result type for wire parsing.
pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Truncated     => write!(f, "truncated packet"),
            Error::WrongChecksum => write!(f, "checksum error"),
            Error::Malformed     => write!(f, "malformed packet"),
        }
    }
}

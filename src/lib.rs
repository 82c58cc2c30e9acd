//! A user-space TCP/IP stack with a blocking socket-style interface.
//!
//! *ministack* implements the IPv4 datagram path and the TCP connection state
//! machine on top of an abstract link-layer device, and exposes the classic
//! blocking user commands (`open`, `close`, `send`, `receive`) to application
//! threads. The crate is built from three layers:
//!
//!  * The `wire` module provides zero-copy access to packet fields and
//!    high-level packet representations, including checksum computation.
//!  * The `phy` module defines the link-layer [`Device`](phy::Device)
//!    abstraction the stack transmits through.
//!  * The [`Stack`] itself owns the interface registry and the TCP protocol
//!    control blocks. Inbound datagrams are handed to
//!    [`Stack::ip_input`](stack::Stack::ip_input) by an external receive
//!    loop; user commands run on any number of application threads and
//!    coordinate with the receive path through a single stack-wide mutex and
//!    per-connection condition variables.
//!
//! Retransmission, congestion control, IPv6 and fragment reassembly are out
//! of scope; active (client) opens and orderly FIN teardown are not
//! implemented, and `close` resets the connection.

use core::fmt;

#[macro_use]
mod macros;
mod parsers;

pub mod phy;
pub mod stack;
pub mod tcp;
pub mod wire;

pub use self::stack::{Interface, Stack};
pub use self::tcp::State as TcpState;

/// The error type for the networking stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// An incoming packet could not be parsed because some of its fields were
    /// out of bounds of the received data.
    Truncated,
    /// An incoming packet could not be recognized and was dropped.
    /// E.g. an IPv4 packet with an unhandled protocol number.
    Unrecognized,
    /// An incoming packet was recognized but was self-contradictory, or
    /// contained an invalid field.
    /// E.g. a TCP packet with both SYN and FIN flags set.
    Malformed,
    /// An incoming packet had an incorrect checksum and was dropped.
    Checksum,
    /// An incoming IP packet has been split into several IP fragments and was
    /// dropped, since IP reassembly is not supported.
    Fragmented,
    /// An incoming packet was recognized but contradicted internal state.
    /// E.g. a datagram whose destination address belongs to no interface.
    Dropped,
    /// A destination address could not be mapped to an interface.
    /// E.g. there was no route to the remote host.
    Unaddressable,
    /// An operation cannot proceed because a buffer is empty or full.
    Exhausted,
    /// There is no free protocol control block slot.
    NoFreeSlot,
    /// An operation is not permitted in the current state.
    Illegal,
    /// A blocking operation was cancelled by an interrupt.
    Interrupted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Truncated => write!(f, "truncated packet"),
            Error::Unrecognized => write!(f, "unrecognized packet"),
            Error::Malformed => write!(f, "malformed packet"),
            Error::Checksum => write!(f, "checksum error"),
            Error::Fragmented => write!(f, "fragmented packet"),
            Error::Dropped => write!(f, "dropped packet"),
            Error::Unaddressable => write!(f, "unaddressable destination"),
            Error::Exhausted => write!(f, "buffer space exhausted"),
            Error::NoFreeSlot => write!(f, "no free slot"),
            Error::Illegal => write!(f, "illegal operation"),
            Error::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl std::error::Error for Error {}

/// The result type for the networking stack.
pub type Result<T> = core::result::Result<T, Error>;

//! Low-level packet access and construction.
//!
//! The `wire` module deals with the packet *representation*. It provides two
//! levels of functionality.
//!
//!  * First, it provides functions to extract fields from sequences of octets,
//!    and to insert fields into sequences of octets. This happens through the
//!    `Packet` family of structures, e.g. [Ipv4Packet].
//!  * Second, in cases where the space of valid field values is much smaller
//!    than the space of possible field values, it provides a compact,
//!    high-level representation of packet data that can be parsed from and
//!    emitted into a sequence of octets. This happens through the `Repr`
//!    family of structures, e.g. [Ipv4Repr].
//!
//! The accessor and parsing functions never panic. The setter and emission
//! functions only panic if the underlying buffer is too small.
//!
//! The `Packet` structures do not perform validation of received data beyond
//! what is necessary to access fields safely; that is the job of an upper
//! layer, or of the corresponding `Repr`.

macro_rules! enum_with_unknown {
    (
        $( #[$enum_attr:meta] )*
        pub enum $name:ident($ty:ty) {
            $(
              $( #[$variant_attr:meta] )*
              $variant:ident = $value:expr
            ),+ $(,)?
        }
    ) => {
        #[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
        $( #[$enum_attr] )*
        pub enum $name {
            $(
              $( #[$variant_attr] )*
              $variant
            ),*,
            Unknown($ty)
        }

        impl ::core::convert::From<$ty> for $name {
            fn from(value: $ty) -> Self {
                match value {
                    $( $value => $name::$variant ),*,
                    other => $name::Unknown(other)
                }
            }
        }

        impl ::core::convert::From<$name> for $ty {
            fn from(value: $name) -> Self {
                match value {
                    $( $name::$variant => $value ),*,
                    $name::Unknown(other) => other
                }
            }
        }
    }
}

mod field {
    pub type Field = ::core::ops::Range<usize>;
}

pub(crate) mod ip;
pub(crate) mod ipv4;
pub(crate) mod tcp;

pub use self::ip::checksum;
pub use self::ip::Endpoint as IpEndpoint;
pub use self::ip::Protocol as IpProtocol;

pub use self::ipv4::Address as Ipv4Address;
pub use self::ipv4::Packet as Ipv4Packet;
pub use self::ipv4::Repr as Ipv4Repr;
pub use self::ipv4::HEADER_LEN as IPV4_HEADER_LEN;

pub use self::tcp::Control as TcpControl;
pub use self::tcp::Packet as TcpPacket;
pub use self::tcp::Repr as TcpRepr;
pub use self::tcp::SeqNumber as TcpSeqNumber;
pub use self::tcp::HEADER_LEN as TCP_HEADER_LEN;

use rand::Rng;
use std::fmt::{Display, Formatter};

/// The 2-byte identity of a logical connection, embedded in every packet header.
///
/// A controller announces itself with a pseudo-random *temporary* id; the switcher side of a
///  connection never generates an id but adopts whatever the first connect packet carries.
///  Once a `ConnectionState` is built around an id, the id never changes.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ConnectionId(u16);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

impl ConnectionId {
    /// Temporary ids occupy the low 11 bits: the low 3 bits of the high byte plus a fully
    ///  random low byte. The device rejects connect requests outside this range.
    const TEMPORARY_ID_MASK: u16 = 0x07ff;

    /// Generate a temporary id for a new controller connection. The random source is passed
    ///  in explicitly so callers can supply a deterministic generator.
    pub fn temporary(rng: &mut impl Rng) -> ConnectionId {
        ConnectionId(rng.gen::<u16>() & Self::TEMPORARY_ID_MASK)
    }

    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(self) -> u16 {
        self.0
    }
}

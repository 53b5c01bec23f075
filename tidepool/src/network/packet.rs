//! Packets: the unit carried by routes.

use std::any::Any;
use std::fmt;
use std::ops::BitOr;
use std::rc::Rc;

use crate::cluster::Endpoint;

/// Opaque application payload. The network never inspects it; receivers
/// downcast to the concrete message type they expect.
pub type Payload = Rc<dyn Any>;

/// Control flags on a packet.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// Plain data, no control meaning.
    pub const NONE: Self = Self(0);
    /// Open request.
    pub const SYN: Self = Self(1);
    /// Acknowledgement.
    pub const ACK: Self = Self(1 << 1);
    /// Graceful end of stream.
    pub const FIN: Self = Self(1 << 2);
    /// Abortive close.
    pub const RESET: Self = Self(1 << 3);

    /// True when every flag in `other` is set here too.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when no flag is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for PacketFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for PacketFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for PacketFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("data");
        }
        let mut first = true;
        for (flag, name) in [
            (Self::SYN, "SYN"),
            (Self::ACK, "ACK"),
            (Self::FIN, "FIN"),
            (Self::RESET, "RESET"),
        ] {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// One packet in flight between two endpoints.
#[derive(Clone)]
pub struct Packet {
    /// Sending endpoint.
    pub source: Endpoint,
    /// Receiving endpoint.
    pub destination: Endpoint,
    /// Control flags.
    pub flags: PacketFlags,
    /// Sequence number of this packet.
    pub seq: u32,
    /// Next sequence number the sender expects from the peer.
    pub ack: u32,
    /// Application payload, absent on pure control packets.
    pub payload: Option<Payload>,
}

impl Packet {
    /// Sequence number of the packet that follows this one.
    pub fn next_seq(&self) -> u32 {
        self.seq.wrapping_add(1)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} {} seq={} ack={}",
            self.source, self.destination, self.flags, self.seq, self.ack
        )
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("flags", &self.flags)
            .field("seq", &self.seq)
            .field("ack", &self.ack)
            .field("payload", &self.payload.as_ref().map(|_| "..."))
            .finish()
    }
}

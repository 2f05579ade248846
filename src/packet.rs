use crate::connection_id::ConnectionId;
use crate::packet_id::PacketId;
use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes};
use std::fmt::Debug;

/// Fixed packet header length. Every datagram of the protocol starts with this header,
///  the payload (if any) follows directly after it.
pub const HEADER_LEN: usize = 12;

/// The length field occupies the low 11 bits of the first header word, the flags the
///  high 5 bits.
const LENGTH_BITS: u16 = 11;
const LENGTH_MASK: u16 = (1 << LENGTH_BITS) - 1;

/// Largest datagram the length field can describe.
pub const MAX_PACKET_LEN: usize = LENGTH_MASK as usize;

/// Connect packets carry a fixed 8-byte blob instead of message blocks.
const CONNECT_PAYLOAD_LEN: usize = 8;

/// Each message block starts with a u16 length that counts the length bytes themselves.
const MESSAGE_LENGTH_PREFIX: usize = 2;

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone, Debug)]
    struct PacketFlags: u8 {
        /// The packet carries a sequence number and the peer must acknowledge it
        const ACK_REQUEST        = 0b00001;
        /// Handshake packet (connect request or connect acknowledgment)
        const CONNECT            = 0b00010;
        /// Repeat of an earlier transmission
        const RETRANSMISSION     = 0b00100;
        /// Reserved by the wire format; this engine never produces it
        const RETRANSMIT_REQUEST = 0b01000;
        /// The packet carries a cumulative acknowledgment number
        const ACK_REPLY          = 0b10000;
    }
}

/// Distinguishes the two handshake packet variants on the wire.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectKind {
    Request = 0x01,
    Accepted = 0x02,
}

/// Parsed, read-only view over one received datagram. Constructed per datagram,
///  discarded once [`crate::connection_state::ConnectionState::interpret`] has extracted it.
#[derive(Clone, Debug)]
pub struct Packet {
    pub connection_id: ConnectionId,
    pub sequence_number: Option<PacketId>,
    pub acknowledgment_number: Option<PacketId>,
    pub is_connect: bool,
    pub is_retransmission: bool,
    /// The message payloads embedded in the packet, as slices of the received datagram.
    ///  Their content is owned by the application layer and opaque here.
    pub messages: Vec<Bytes>,
}

impl Packet {
    pub fn deser(datagram: Bytes) -> anyhow::Result<Packet> {
        if datagram.len() < HEADER_LEN {
            bail!("datagram of {} bytes is shorter than the fixed header", datagram.len());
        }

        let mut header = &datagram[..HEADER_LEN];
        let length_word = header.get_u16();
        let flags = PacketFlags::from_bits_truncate((length_word >> LENGTH_BITS) as u8);
        let declared_len = (length_word & LENGTH_MASK) as usize;
        if declared_len != datagram.len() {
            bail!("declared packet length {} does not match datagram length {}", declared_len, datagram.len());
        }

        let connection_id = ConnectionId::from_raw(header.get_u16());
        let acknowledgment = header.get_u16();
        let _retransmit_request = header.get_u16();
        let _reserved = header.get_u16();
        let sequence = header.get_u16();

        let is_connect = flags.contains(PacketFlags::CONNECT);

        // Connect packets expose their sequence number unconditionally: the switcher
        //  bootstrap records it as the connection's first pending receipt
        let sequence_number = (is_connect || flags.contains(PacketFlags::ACK_REQUEST))
            .then(|| PacketId::from_raw(sequence));
        let acknowledgment_number = flags.contains(PacketFlags::ACK_REPLY)
            .then(|| PacketId::from_raw(acknowledgment));

        let messages = if is_connect {
            Vec::new()
        }
        else {
            Self::split_messages(datagram.slice(HEADER_LEN..))?
        };

        Ok(Packet {
            connection_id,
            sequence_number,
            acknowledgment_number,
            is_connect,
            is_retransmission: flags.contains(PacketFlags::RETRANSMISSION),
            messages,
        })
    }

    fn split_messages(payload: Bytes) -> anyhow::Result<Vec<Bytes>> {
        let mut messages = Vec::new();
        let mut offset = 0;
        while offset < payload.len() {
            let remaining = payload.len() - offset;
            if remaining < MESSAGE_LENGTH_PREFIX {
                bail!("trailing {} bytes are too short for a message block", remaining);
            }
            let block_len = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
            if block_len < MESSAGE_LENGTH_PREFIX || block_len > remaining {
                bail!("message block length {} out of range with {} bytes remaining", block_len, remaining);
            }
            messages.push(payload.slice(offset + MESSAGE_LENGTH_PREFIX..offset + block_len));
            offset += block_len;
        }
        Ok(messages)
    }
}

/// One outbound datagram, queued for or already sent to the peer.
///
/// Once queued, a packet is mutated in place only to flip its retransmission marker; it
///  leaves the outbox when a peer acknowledgment covers its sequence number.
#[derive(Clone, Eq, PartialEq)]
pub struct SerialPacket {
    pub connection_id: ConnectionId,
    pub sequence_number: Option<PacketId>,
    pub acknowledgment_number: Option<PacketId>,
    connect: Option<ConnectKind>,
    retransmission: bool,
    pub messages: Vec<Bytes>,
}

impl Debug for SerialPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PCKT{{{}", self.connection_id)?;
        if let Some(kind) = self.connect {
            write!(f, " {:?}", kind)?;
        }
        if let Some(number) = self.sequence_number {
            write!(f, " #{}", number)?;
        }
        if let Some(acknowledged) = self.acknowledgment_number {
            write!(f, " ACK:{}", acknowledged)?;
        }
        if self.retransmission {
            write!(f, " RETR")?;
        }
        if !self.messages.is_empty() {
            write!(f, " {}msg", self.messages.len())?;
        }
        write!(f, "}}")
    }
}

impl SerialPacket {
    pub fn connect(connection_id: ConnectionId, kind: ConnectKind) -> SerialPacket {
        SerialPacket {
            connection_id,
            sequence_number: None,
            acknowledgment_number: None,
            connect: Some(kind),
            retransmission: false,
            messages: Vec::new(),
        }
    }

    pub fn sequenced(connection_id: ConnectionId, sequence_number: PacketId, messages: Vec<Bytes>) -> SerialPacket {
        SerialPacket {
            connection_id,
            sequence_number: Some(sequence_number),
            acknowledgment_number: None,
            connect: None,
            retransmission: false,
            messages,
        }
    }

    pub fn acknowledgment(connection_id: ConnectionId, acknowledged: PacketId) -> SerialPacket {
        SerialPacket {
            connection_id,
            sequence_number: None,
            acknowledgment_number: Some(acknowledged),
            connect: None,
            retransmission: false,
            messages: Vec::new(),
        }
    }

    pub fn mark_retransmission(&mut self) {
        self.retransmission = true;
    }

    pub fn connect_kind(&self) -> Option<ConnectKind> {
        self.connect
    }

    pub fn is_retransmission(&self) -> bool {
        self.retransmission
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let mut flags = PacketFlags::empty();
        if self.sequence_number.is_some() {
            flags |= PacketFlags::ACK_REQUEST;
        }
        if self.connect.is_some() {
            flags |= PacketFlags::CONNECT;
        }
        if self.retransmission {
            flags |= PacketFlags::RETRANSMISSION;
        }
        if self.acknowledgment_number.is_some() {
            flags |= PacketFlags::ACK_REPLY;
        }

        let payload_len: usize = match self.connect {
            Some(_) => CONNECT_PAYLOAD_LEN,
            None => self.messages.iter().map(|m| MESSAGE_LENGTH_PREFIX + m.len()).sum(),
        };
        let length = HEADER_LEN + payload_len;
        assert!(length <= LENGTH_MASK as usize, "packet of {} bytes exceeds the length field of the wire format", length);

        buf.put_u16(((flags.bits() as u16) << LENGTH_BITS) | length as u16);
        buf.put_u16(self.connection_id.to_raw());
        buf.put_u16(self.acknowledgment_number.map(PacketId::to_raw).unwrap_or(0));
        buf.put_u16(0); // retransmit-request id, reserved
        buf.put_u16(0); // reserved
        buf.put_u16(self.sequence_number.map(PacketId::to_raw).unwrap_or(0));

        match self.connect {
            Some(kind) => {
                buf.put_u8(kind as u8);
                buf.put_bytes(0, CONNECT_PAYLOAD_LEN - 1);
            }
            None => {
                for message in &self.messages {
                    buf.put_u16((MESSAGE_LENGTH_PREFIX + message.len()) as u16);
                    buf.put_slice(message);
                }
            }
        }
    }
}

//! Reliable-delivery session layer for the UDP control protocol of a broadcast video
//!  switcher device family. UDP provides no ordering or delivery guarantees, so the
//!  protocol supplies its own connection establishment, packet sequencing, cumulative
//!  acknowledgment, retransmission and keep-alive behavior - a miniature ARQ transport
//!  with device-specific framing.
//!
//! ## Design
//!
//! * Two roles share one state-machine shape with different initialization:
//!   * the *controller* (client) announces itself with a connect packet carrying a
//!     pseudo-random temporary connection id
//!   * the *switcher* (device) adopts the id from the first connect packet it sees and
//!     immediately pushes a fixed burst of 14 initial-state packets, numbered 1 through
//!     14, to the new controller
//! * All per-connection state lives in [`connection_state::ConnectionState`], a purely
//!   synchronous engine with no I/O of its own. The surrounding endpoint owns the socket
//!   and the keep-alive timer and calls the engine strictly sequentially.
//! * *Packets* have sequence numbers and carry zero or more opaque *messages*. Message
//!   payloads are handed to the application in packet arrival order - a packet that
//!   arrives out of order is delivered right away, ahead of an earlier missing one. The
//!   protocol family trades strict ordering for latency here, and this layer preserves
//!   that trade-off.
//! * Acknowledgments are cumulative. A receiver only ever acknowledges the longest
//!   contiguous run of received sequence numbers starting at its lowest pending one,
//!   so numbers after a gap stay pending and the sender's outbox pruning stays correct.
//! * Everything unacknowledged is retransmitted on every keep-alive tick, flagged as a
//!   repeat from the second transmission onward. There is no retry limit and no
//!   dead-connection detection in this layer.
//!
//! ## Packet header
//!
//! 12 bytes, all numbers in network byte order (BE):
//!
//! ```ascii
//! 0:  flags (high 5 bits) | total datagram length (low 11 bits): u16
//!     * 0b00001 packet carries a sequence number that must be acknowledged
//!     * 0b00010 connect packet (handshake)
//!     * 0b00100 retransmission
//!     * 0b01000 retransmit request (reserved, never produced here)
//!     * 0b10000 packet carries a cumulative acknowledgment number
//! 2:  connection id: u16
//! 4:  acknowledgment number: u16
//! 6:  retransmit-request id: u16 (reserved, 0)
//! 8:  reserved: u16 (0)
//! 10: sequence number: u16
//! ```
//!
//! The payload of a connect packet is a fixed 8-byte blob (first byte 0x01 for a connect
//!  request, 0x02 for the acknowledgment). Any other payload is a sequence of message
//!  blocks, each prefixed with a u16 length that counts the length bytes themselves.
//!
//! Out of scope by design: congestion control, stream multiplexing, encryption and NAT
//!  traversal - the protocol family has none of these.

pub mod config;
pub mod connection_id;
pub mod connection_state;
pub mod end_point;
pub mod initial_state;
pub mod message_dispatcher;
pub mod packet;
pub mod packet_id;

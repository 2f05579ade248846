use crate::connection_id::ConnectionId;
use crate::initial_state::INITIAL_STATE;
use crate::packet::{ConnectKind, Packet, SerialPacket};
use crate::packet_id::PacketId;
use bytes::Bytes;
use rand::Rng;
use std::collections::BTreeSet;
use tracing::{debug, trace};

/// All state needed to keep one connection to a peer alive: the engine behind both the
///  controller and the switcher role.
///
/// The engine is purely synchronous and performs no I/O. The driver owning the socket and
///  the keep-alive timer feeds it every received packet (in arrival order) via [`interpret`]
///  and transmits whatever [`construct_keep_alive_packets`] and [`construct_packet`] return.
///  One instance must only ever be mutated by a single caller at a time.
///
/// [`interpret`]: ConnectionState::interpret
/// [`construct_keep_alive_packets`]: ConnectionState::construct_keep_alive_packets
/// [`construct_packet`]: ConnectionState::construct_packet
pub struct ConnectionState {
    /// Sequence numbers that were received but not yet flushed into an acknowledgment.
    ///  Kept sorted and duplicate-free; shrinks only by flushing a contiguous prefix
    ///  starting at its minimum.
    pending_receipts: BTreeSet<PacketId>,

    /// The sequence number of the last packet that was sent from this connection
    last_sent_packet_id: PacketId,

    /// Packets sent to the peer but not yet acknowledged, ascending by sequence number.
    ///  Entries are only ever appended (through [`Self::append_to_outbox`]) and removed as
    ///  a contiguous acknowledged prefix.
    outbox: Vec<SerialPacket>,

    /// The identity of the connection, fixed for the lifetime of this instance
    id: ConnectionId,
}

impl ConnectionState {
    /// Initialize the controller (client) side of a fresh connection: announce a
    ///  pseudo-random temporary identity with a single connect packet and start counting
    ///  sequence numbers from zero.
    pub fn controller(rng: &mut impl Rng) -> ConnectionState {
        let id = ConnectionId::temporary(rng);
        debug!("initializing controller connection with temporary id {}", id);
        ConnectionState {
            pending_receipts: BTreeSet::new(),
            last_sent_packet_id: PacketId::ZERO,
            outbox: vec![SerialPacket::connect(id, ConnectKind::Request)],
            id,
        }
    }

    /// Initialize the switcher (device) side from the first packet a new peer sent.
    ///
    /// The device family requires a fixed burst of initial-state packets to go out to
    ///  every new controller before anything else, so the outbox starts out with the
    ///  connect acknowledgment followed by the 14 pre-defined initial-state packets.
    ///
    /// Panics if the packet is not a connect packet: a non-connect first packet means the
    ///  driver violated the handshake contract, which is not a recoverable condition.
    pub fn switcher(first_packet: &Packet) -> ConnectionState {
        assert!(first_packet.is_connect, "first inbound packet must be a connect packet");
        let id = first_packet.connection_id;
        let number = first_packet.sequence_number
            .expect("connect packets always expose a sequence number");
        debug!("initializing switcher connection {}, connect packet #{}", id, number);

        let mut outbox = Vec::with_capacity(1 + INITIAL_STATE.len());
        outbox.push(SerialPacket::connect(id, ConnectKind::Accepted));
        for (offset, payload) in INITIAL_STATE.into_iter().enumerate() {
            outbox.push(SerialPacket::sequenced(
                id,
                PacketId::from_raw(offset as u16 + 1),
                vec![Bytes::from_static(payload)],
            ));
        }

        ConnectionState {
            pending_receipts: BTreeSet::from([number]),
            last_sent_packet_id: PacketId::from_raw(INITIAL_STATE.len() as u16),
            outbox,
            id,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Interpret one received packet and return the message payloads it carries.
    ///
    /// The packet's sequence number (if any) is recorded for a later acknowledgment flush;
    ///  its acknowledgment number (if any) is cumulative and releases every outbox entry up
    ///  to and including that sequence number. Handshake entries without a sequence number
    ///  sort before every numbered entry and fall to any acknowledgment.
    pub fn interpret(&mut self, packet: Packet) -> Vec<Bytes> {
        if let Some(number) = packet.sequence_number {
            self.pending_receipts.insert(number);
        }

        if let Some(acknowledged) = packet.acknowledgment_number {
            let boundary = self.outbox.partition_point(|queued| match queued.sequence_number {
                None => true,
                Some(number) => number <= acknowledged,
            });
            if boundary > 0 {
                trace!("connection {}: peer acknowledged up to #{}, dropping {} packets from the outbox",
                    self.id, acknowledged, boundary);
                self.outbox.drain(..boundary);
            }
        }

        packet.messages
    }

    /// Construct the packets that must be sent on this keep-alive tick: the not-yet
    ///  acknowledged outbox (to be retransmitted), an acknowledgment for the longest
    ///  contiguous run of pending receipts, or - failing both - a single empty packet
    ///  that does nothing but keep the connection from timing out.
    ///
    /// The returned packets carry the retransmission markers as they were *before* this
    ///  tick; the live outbox entries are marked so the next tick sends them as repeats.
    pub fn construct_keep_alive_packets(&mut self) -> Vec<SerialPacket> {
        let mut packets = self.outbox.clone();
        for queued in &mut self.outbox {
            queued.mark_retransmission();
        }

        if let Some(&lowest) = self.pending_receipts.first() {
            // extend the acknowledged run while the receipts are consecutive: numbers
            //  after a gap must not be covered by a cumulative acknowledgment
            let mut acknowledged = lowest;
            for &number in self.pending_receipts.iter().skip(1) {
                if number == acknowledged.next() {
                    acknowledged = number;
                }
                else {
                    break;
                }
            }
            trace!("connection {}: flushing receipts up to #{}", self.id, acknowledged);
            self.pending_receipts = self.pending_receipts.split_off(&acknowledged.next());
            packets.push(SerialPacket::acknowledgment(self.id, acknowledged));
        }

        if packets.is_empty() {
            // note that the empty keep-alive goes out without entering the outbox: it
            //  carries no data worth retransmitting
            self.last_sent_packet_id = self.last_sent_packet_id.next();
            trace!("connection {}: nothing pending, sending empty keep-alive #{}", self.id, self.last_sent_packet_id);
            packets.push(SerialPacket::sequenced(self.id, self.last_sent_packet_id, Vec::new()));
        }

        packets
    }

    /// Package a batch of application messages into the next sequenced packet. The packet
    ///  is queued for retransmission until the peer acknowledges it; the returned clone
    ///  must be transmitted immediately.
    pub fn construct_packet(&mut self, messages: Vec<Bytes>) -> SerialPacket {
        self.last_sent_packet_id = self.last_sent_packet_id.next();
        let packet = SerialPacket::sequenced(self.id, self.last_sent_packet_id, messages);
        self.append_to_outbox(packet.clone());
        packet
    }

    fn append_to_outbox(&mut self, packet: SerialPacket) {
        let highest = self.outbox.iter().rev().find_map(|queued| queued.sequence_number);
        if let (Some(highest), Some(new)) = (highest, packet.sequence_number) {
            assert!(new > highest, "outbox must grow in ascending sequence order: #{} after #{}", new, highest);
        }
        self.outbox.push(packet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use rstest::rstest;

    fn test_id() -> ConnectionId {
        ConnectionId::from_raw(0x0102)
    }

    fn state_with(pending: &[u16], outbox_numbers: &[u16], last_sent: u16) -> ConnectionState {
        ConnectionState {
            pending_receipts: pending.iter().map(|&n| PacketId::from_raw(n)).collect(),
            last_sent_packet_id: PacketId::from_raw(last_sent),
            outbox: outbox_numbers.iter()
                .map(|&n| SerialPacket::sequenced(test_id(), PacketId::from_raw(n), Vec::new()))
                .collect(),
            id: test_id(),
        }
    }

    fn inbound(sequence: Option<u16>, acknowledgment: Option<u16>) -> Packet {
        Packet {
            connection_id: test_id(),
            sequence_number: sequence.map(PacketId::from_raw),
            acknowledgment_number: acknowledgment.map(PacketId::from_raw),
            is_connect: false,
            is_retransmission: false,
            messages: Vec::new(),
        }
    }

    fn inbound_connect(sequence: u16) -> Packet {
        Packet {
            connection_id: test_id(),
            sequence_number: Some(PacketId::from_raw(sequence)),
            acknowledgment_number: None,
            is_connect: true,
            is_retransmission: false,
            messages: Vec::new(),
        }
    }

    fn outbox_numbers(state: &ConnectionState) -> Vec<Option<u16>> {
        state.outbox.iter()
            .map(|p| p.sequence_number.map(PacketId::to_raw))
            .collect()
    }

    fn pending(state: &ConnectionState) -> Vec<u16> {
        state.pending_receipts.iter().map(|p| p.to_raw()).collect()
    }

    #[rstest]
    fn test_controller_bootstrap() {
        let mut rng = StepRng::new(0x0345, 0);
        let state = ConnectionState::controller(&mut rng);

        assert_eq!(state.id().to_raw(), 0x0345);
        assert_eq!(state.last_sent_packet_id, PacketId::ZERO);
        assert!(state.pending_receipts.is_empty());
        assert_eq!(state.outbox.len(), 1);
        assert_eq!(state.outbox[0].connect_kind(), Some(ConnectKind::Request));
        assert_eq!(state.outbox[0].sequence_number, None);
    }

    #[rstest]
    fn test_switcher_bootstrap() {
        let state = ConnectionState::switcher(&inbound_connect(3));

        assert_eq!(state.id(), test_id());
        assert_eq!(state.last_sent_packet_id, PacketId::from_raw(14));
        assert_eq!(pending(&state), vec![3]);

        assert_eq!(state.outbox.len(), 15);
        assert_eq!(state.outbox[0].connect_kind(), Some(ConnectKind::Accepted));
        assert_eq!(state.outbox[0].sequence_number, None);
        for (offset, packet) in state.outbox[1..].iter().enumerate() {
            assert_eq!(packet.sequence_number, Some(PacketId::from_raw(offset as u16 + 1)));
            assert_eq!(packet.connect_kind(), None);
            assert_eq!(packet.messages, vec![Bytes::from_static(INITIAL_STATE[offset])]);
        }
    }

    #[rstest]
    #[should_panic(expected = "must be a connect packet")]
    fn test_switcher_bootstrap_rejects_non_connect() {
        ConnectionState::switcher(&inbound(Some(1), None));
    }

    #[rstest]
    #[case::in_order(vec![1, 2, 3], vec![1, 2, 3])]
    #[case::out_of_order(vec![5, 9, 7, 6], vec![5, 6, 7, 9])]
    #[case::duplicates(vec![5, 5, 5], vec![5])]
    #[case::duplicates_interleaved(vec![2, 7, 2, 4, 7], vec![2, 4, 7])]
    fn test_interpret_keeps_receipts_sorted_and_unique(#[case] sequences: Vec<u16>, #[case] expected: Vec<u16>) {
        let mut state = state_with(&[], &[], 0);
        for sequence in sequences {
            state.interpret(inbound(Some(sequence), None));
        }
        assert_eq!(pending(&state), expected);
    }

    #[rstest]
    #[case::prefix(vec![1, 2, 3, 4, 5], 3, vec![Some(4), Some(5)])]
    #[case::everything(vec![1, 2, 3, 4, 5], 5, vec![])]
    #[case::past_the_end(vec![1, 2, 3, 4, 5], 7, vec![])]
    #[case::nothing(vec![1, 2, 3, 4, 5], 0, vec![Some(1), Some(2), Some(3), Some(4), Some(5)])]
    #[case::ack_in_gap(vec![2, 4, 6], 5, vec![Some(6)])]
    #[case::empty_outbox(vec![], 3, vec![])]
    fn test_interpret_cumulative_ack(#[case] outbox: Vec<u16>, #[case] acknowledged: u16, #[case] expected: Vec<Option<u16>>) {
        let mut state = state_with(&[], &outbox, 20);
        state.interpret(inbound(None, Some(acknowledged)));
        assert_eq!(outbox_numbers(&state), expected);
    }

    #[rstest]
    #[case::covered_by_first_ack(0, vec![Some(1), Some(2)])]
    #[case::covered_with_numbered_prefix(1, vec![Some(2)])]
    fn test_interpret_ack_releases_handshake_packets(#[case] acknowledged: u16, #[case] expected: Vec<Option<u16>>) {
        let mut state = ConnectionState::switcher(&inbound_connect(0));
        state.outbox.truncate(3); // connect-ack plus packets 1 and 2 keep the test readable
        state.interpret(inbound(None, Some(acknowledged)));
        assert_eq!(outbox_numbers(&state), expected);
    }

    #[rstest]
    fn test_interpret_returns_messages_and_leaves_sequence_counter_alone() {
        let mut state = state_with(&[], &[7], 7);
        let messages = vec![Bytes::from_static(&[1, 2]), Bytes::from_static(&[3])];

        let mut packet = inbound(Some(8), Some(7));
        packet.messages = messages.clone();
        let returned = state.interpret(packet);

        assert_eq!(returned, messages);
        assert_eq!(state.last_sent_packet_id, PacketId::from_raw(7));
        assert_eq!(pending(&state), vec![8]);
        assert_eq!(outbox_numbers(&state), vec![]);
    }

    #[rstest]
    fn test_keep_alive_when_idle() {
        let mut state = state_with(&[], &[], 7);
        let packets = state.construct_keep_alive_packets();

        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].sequence_number, Some(PacketId::from_raw(8)));
        assert_eq!(packets[0].acknowledgment_number, None);
        assert!(packets[0].messages.is_empty());
        assert!(!packets[0].is_retransmission());
        assert_eq!(state.last_sent_packet_id, PacketId::from_raw(8));
        // the empty keep-alive is fire-and-forget, it must not enter the outbox
        assert_eq!(outbox_numbers(&state), vec![]);
    }

    #[rstest]
    #[case::stops_at_gap(vec![5, 6, 7, 9], 7, vec![9])]
    #[case::single(vec![3], 3, vec![])]
    #[case::fully_contiguous(vec![1, 2, 3], 3, vec![])]
    #[case::gap_right_after_minimum(vec![4, 6], 4, vec![6])]
    fn test_keep_alive_flushes_contiguous_prefix(#[case] receipts: Vec<u16>, #[case] expected_ack: u16, #[case] expected_left: Vec<u16>) {
        let mut state = state_with(&receipts, &[], 20);
        let packets = state.construct_keep_alive_packets();

        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].acknowledgment_number, Some(PacketId::from_raw(expected_ack)));
        assert_eq!(packets[0].sequence_number, None);
        assert_eq!(pending(&state), expected_left);
        // an acknowledgment was produced, so no empty keep-alive must be synthesized
        assert_eq!(state.last_sent_packet_id, PacketId::from_raw(20));
    }

    #[rstest]
    fn test_keep_alive_retransmission_is_idempotent() {
        let mut state = state_with(&[], &[1, 2], 2);

        let first = state.construct_keep_alive_packets();
        assert_eq!(first.len(), 2);
        // the first tick sends the packets as originally queued; only the live outbox
        //  is flagged for the next round
        assert!(first.iter().all(|p| !p.is_retransmission()));
        assert!(state.outbox.iter().all(|p| p.is_retransmission()));

        let second = state.construct_keep_alive_packets();
        assert_eq!(second.len(), 2);
        assert!(second.iter().all(|p| p.is_retransmission()));
        assert_eq!(outbox_numbers(&state), vec![Some(1), Some(2)]);

        assert_eq!(
            second.iter().map(|p| p.sequence_number).collect::<Vec<_>>(),
            vec![Some(PacketId::from_raw(1)), Some(PacketId::from_raw(2))],
        );
    }

    #[rstest]
    fn test_keep_alive_appends_ack_after_retransmissions() {
        let mut state = state_with(&[4], &[1, 2], 2);
        let packets = state.construct_keep_alive_packets();

        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].sequence_number, Some(PacketId::from_raw(1)));
        assert_eq!(packets[1].sequence_number, Some(PacketId::from_raw(2)));
        assert_eq!(packets[2].sequence_number, None);
        assert_eq!(packets[2].acknowledgment_number, Some(PacketId::from_raw(4)));
        // the acknowledgment packet is synthesized per tick, not queued
        assert_eq!(outbox_numbers(&state), vec![Some(1), Some(2)]);
    }

    #[rstest]
    fn test_construct_packet_allocates_next_sequence_number() {
        let mut state = state_with(&[], &[], 14);
        let messages = vec![Bytes::from_static(&[1]), Bytes::from_static(&[2, 3])];

        let packet = state.construct_packet(messages.clone());
        assert_eq!(packet.sequence_number, Some(PacketId::from_raw(15)));
        assert_eq!(packet.messages, messages);
        assert_eq!(state.last_sent_packet_id, PacketId::from_raw(15));
        assert_eq!(outbox_numbers(&state), vec![Some(15)]);
        assert_eq!(state.outbox[0], packet);

        let next = state.construct_packet(Vec::new());
        assert_eq!(next.sequence_number, Some(PacketId::from_raw(16)));
        assert_eq!(outbox_numbers(&state), vec![Some(15), Some(16)]);
    }

    #[rstest]
    fn test_constructed_packet_is_released_by_ack() {
        let mut state = state_with(&[], &[], 14);
        state.construct_packet(vec![Bytes::from_static(&[1])]);
        state.construct_packet(vec![Bytes::from_static(&[2])]);

        state.interpret(inbound(None, Some(15)));
        assert_eq!(outbox_numbers(&state), vec![Some(16)]);
    }
}

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::packet::PacketRecord;

/// Wrap-around aware sequence comparison.
fn seq_cmp(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}
fn seq_less_equal(a: u32, b: u32) -> bool {
    seq_cmp(a, b) <= 0
}

/// One direction of a reliable-transport stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamDirection {
    ClientToServer,
    ServerToClient,
}

/// What happened to a segment when it was folded into the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentOutcome {
    /// Zero-length segment, flag state only.
    Empty,
    Retransmission,
    Counted,
}

/// Byte-level view of one reliable-transport conversation.
///
/// The client side is fixed as the source of the first packet observed for
/// the flow and never flips, even if later packets arrive in the reverse
/// direction first.
#[derive(Debug, Clone, Serialize)]
pub struct TcpStream {
    /// Process-unique index, never reused.
    pub stream_index: u32,
    pub conversation_id: String,

    pub client_address: String,
    pub client_port: u16,
    pub server_address: String,
    pub server_port: u16,

    pub client_init_seq: u32,
    pub server_init_seq: u32,
    pub client_next_seq: u32,
    pub server_next_seq: u32,

    pub client_packets: u64,
    pub server_packets: u64,
    pub client_bytes: u64,
    pub server_bytes: u64,
    pub retransmissions: u64,
    pub out_of_order: u64,

    /// Missing ranges per direction as `(start_seq, length)` pairs.
    pub client_gaps: Vec<(u32, u32)>,
    pub server_gaps: Vec<(u32, u32)>,
    pub has_gaps: bool,
    pub is_complete: bool,

    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,

    // Payload chunks in arrival order, truncated per direction at the
    // configured stream-size cap.
    #[serde(skip)]
    chunks: Vec<(StreamDirection, Vec<u8>)>,
    #[serde(skip)]
    client_retained: usize,
    #[serde(skip)]
    server_retained: usize,
    #[serde(skip)]
    client_seq_seen: bool,
    #[serde(skip)]
    server_seq_seen: bool,
}

impl TcpStream {
    /// Create the stream record for a flow's first observed packet.
    pub(crate) fn open(stream_index: u32, conversation_id: String, packet: &PacketRecord) -> Self {
        let mut stream = TcpStream {
            stream_index,
            conversation_id,
            client_address: packet.src_addr.clone(),
            client_port: packet.src_port,
            server_address: packet.dst_addr.clone(),
            server_port: packet.dst_port,
            client_init_seq: 0,
            server_init_seq: 0,
            client_next_seq: 0,
            server_next_seq: 0,
            client_packets: 0,
            server_packets: 0,
            client_bytes: 0,
            server_bytes: 0,
            retransmissions: 0,
            out_of_order: 0,
            client_gaps: Vec::new(),
            server_gaps: Vec::new(),
            has_gaps: false,
            is_complete: false,
            start_time: packet.timestamp,
            end_time: packet.timestamp,
            chunks: Vec::new(),
            client_retained: 0,
            server_retained: 0,
            client_seq_seen: false,
            server_seq_seen: false,
        };

        // The opening packet pins the client's sequence space; the +1
        // accounts for the SYN consuming one sequence number.
        if packet.fields.contains_key(PacketRecord::TCP_SEQ) {
            stream.client_init_seq = packet.u32_field(PacketRecord::TCP_SEQ);
            stream.client_next_seq = stream.client_init_seq.wrapping_add(1);
            stream.client_seq_seen = true;
        }
        stream
    }

    fn direction_of(&self, packet: &PacketRecord) -> StreamDirection {
        if packet.src_addr == self.client_address && packet.src_port == self.client_port {
            StreamDirection::ClientToServer
        } else {
            StreamDirection::ServerToClient
        }
    }

    /// Fold one segment into the stream: retransmission test, gap
    /// detection, directional accounting and payload retention.
    ///
    /// A retransmitted segment (`seq + len` not advancing past the expected
    /// next sequence for its direction) bumps `retransmissions` and leaves
    /// every other counter untouched.
    pub(crate) fn record_segment(&mut self, packet: &PacketRecord, max_stream_size: usize) -> SegmentOutcome {
        let direction = self.direction_of(packet);
        let seq = packet.u32_field(PacketRecord::TCP_SEQ);
        let len = packet.u32_field(PacketRecord::TCP_LEN);

        if len == 0 {
            return SegmentOutcome::Empty;
        }

        let end = seq.wrapping_add(len);
        let (seen, next_seq, init_seq, gaps) = match direction {
            StreamDirection::ClientToServer => (
                &mut self.client_seq_seen,
                &mut self.client_next_seq,
                &mut self.client_init_seq,
                &mut self.client_gaps,
            ),
            StreamDirection::ServerToClient => (
                &mut self.server_seq_seen,
                &mut self.server_next_seq,
                &mut self.server_init_seq,
                &mut self.server_gaps,
            ),
        };

        if !*seen {
            // First data in this direction pins its sequence space.
            *seen = true;
            *init_seq = seq;
            *next_seq = end;
        } else if seq_less_equal(end, *next_seq) {
            self.retransmissions += 1;
            return SegmentOutcome::Retransmission;
        } else {
            if seq_cmp(seq, *next_seq) > 0 {
                gaps.push((*next_seq, seq.wrapping_sub(*next_seq)));
                self.out_of_order += 1;
                self.has_gaps = true;
            }
            *next_seq = end;
        }

        match direction {
            StreamDirection::ClientToServer => {
                self.client_packets += 1;
                self.client_bytes += len as u64;
            }
            StreamDirection::ServerToClient => {
                self.server_packets += 1;
                self.server_bytes += len as u64;
            }
        }
        self.end_time = packet.timestamp;

        if !packet.payload.is_empty() {
            self.retain_payload(direction, &packet.payload, max_stream_size);
        }
        SegmentOutcome::Counted
    }

    fn retain_payload(&mut self, direction: StreamDirection, payload: &[u8], max_stream_size: usize) {
        let retained = match direction {
            StreamDirection::ClientToServer => &mut self.client_retained,
            StreamDirection::ServerToClient => &mut self.server_retained,
        };
        let room = max_stream_size.saturating_sub(*retained);
        if room == 0 {
            return;
        }
        let take = payload.len().min(room);
        *retained += take;
        self.chunks.push((direction, payload[..take].to_vec()));
    }

    /// Mark completion on FIN or RST from either side. Returns true on the
    /// packet that completed the stream.
    pub(crate) fn mark_flags(&mut self, packet: &PacketRecord) -> bool {
        let fin = packet.bool_field(PacketRecord::TCP_FIN);
        let rst = packet.bool_field(PacketRecord::TCP_RST);
        if (fin || rst) && !self.is_complete {
            self.is_complete = true;
            return true;
        }
        false
    }

    /// Retained payload for one direction, in arrival order.
    pub fn payload(&self, direction: StreamDirection) -> Vec<u8> {
        self.chunks
            .iter()
            .filter(|(d, _)| *d == direction)
            .flat_map(|(_, data)| data.iter().copied())
            .collect()
    }

    /// Retained payload of both directions interleaved in arrival order.
    pub fn raw_payload(&self) -> Vec<u8> {
        self.chunks.iter().flat_map(|(_, data)| data.iter().copied()).collect()
    }
}

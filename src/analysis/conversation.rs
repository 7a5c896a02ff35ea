use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::packet::PacketRecord;

/// Build the canonical key identifying a bidirectional flow.
///
/// Both directions of a flow must resolve to the same key, so the endpoint
/// pair is ordered lexicographically by address, ties broken by port, before
/// it is joined with the protocol label.
///
/// Invariants:
/// - `flow_key(p, a, pa, b, pb) == flow_key(p, b, pb, a, pa)`.
/// - Distinct protocols never share a key.
pub fn flow_key(protocol: &str, src_addr: &str, src_port: u16, dst_addr: &str, dst_port: u16) -> String {
    format!(
        "{}_{}",
        protocol,
        normalize_endpoints(src_addr, src_port, dst_addr, dst_port)
    )
}

fn normalize_endpoints(addr_a: &str, port_a: u16, addr_b: &str, port_b: u16) -> String {
    if addr_a < addr_b || (addr_a == addr_b && port_a < port_b) {
        format!("{}:{}_{}:{}", addr_a, port_a, addr_b, port_b)
    } else {
        format!("{}:{}_{}:{}", addr_b, port_b, addr_a, port_a)
    }
}

/// Flow key for a packet, or `None` when the packet carries no protocol
/// label and is therefore untrackable.
pub fn flow_key_for(packet: &PacketRecord) -> Option<String> {
    if packet.protocol.is_empty() {
        return None;
    }
    Some(flow_key(
        &packet.protocol,
        &packet.src_addr,
        packet.src_port,
        &packet.dst_addr,
        packet.dst_port,
    ))
}

/// Well-known-port heuristics. Classification is by the lower of the two
/// conversation ports and is permanent once assigned.
fn application_protocol(port_a: u16, port_b: u16) -> Option<&'static str> {
    match port_a.min(port_b) {
        80 | 8080 => Some("HTTP"),
        443 | 8443 => Some("HTTPS"),
        53 => Some("DNS"),
        21 => Some("FTP"),
        22 => Some("SSH"),
        25 | 587 => Some("SMTP"),
        110 | 995 => Some("POP3"),
        143 | 993 => Some("IMAP"),
        _ => None,
    }
}

/// A bidirectional flow between one canonical endpoint pair.
///
/// Endpoint A is the source of the first observed packet; the canonical
/// ordering only shapes the key, not which side is A.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub protocol: String,
    pub address_a: String,
    pub port_a: u16,
    pub address_b: String,
    pub port_b: u16,

    pub packets_a_to_b: u64,
    pub packets_b_to_a: u64,
    pub bytes_a_to_b: u64,
    pub bytes_b_to_a: u64,

    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Seconds between first and last packet.
    pub duration: f64,

    pub packet_numbers: Vec<u64>,
    pub first_packet_num: u64,
    pub last_packet_num: u64,

    pub is_tcp_complete: bool,
    pub has_syn: bool,
    pub has_fin: bool,
    pub has_rst: bool,
    /// Packet number of the first SYN, 0 if none seen.
    pub syn_packet_num: u64,
    /// Packet number of the most recent FIN, 0 if none seen.
    pub fin_packet_num: u64,

    /// Detected application protocol, empty until a heuristic matches.
    pub application_protocol: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Conversation {
    /// Open a conversation from the first packet of an unseen flow. The
    /// opening packet's lifecycle flags count: a flow that starts on a SYN
    /// has `has_syn` set immediately.
    pub(crate) fn open(id: String, packet: &PacketRecord) -> Self {
        let mut conv = Conversation {
            id,
            protocol: packet.protocol.clone(),
            address_a: packet.src_addr.clone(),
            port_a: packet.src_port,
            address_b: packet.dst_addr.clone(),
            port_b: packet.dst_port,
            packets_a_to_b: 1,
            packets_b_to_a: 0,
            bytes_a_to_b: packet.length,
            bytes_b_to_a: 0,
            start_time: packet.timestamp,
            end_time: packet.timestamp,
            duration: 0.0,
            packet_numbers: vec![packet.number],
            first_packet_num: packet.number,
            last_packet_num: packet.number,
            is_tcp_complete: false,
            has_syn: false,
            has_fin: false,
            has_rst: false,
            syn_packet_num: 0,
            fin_packet_num: 0,
            application_protocol: String::new(),
            metadata: HashMap::new(),
        };
        if packet.protocol == "TCP" {
            conv.update_tcp_state(packet);
        }
        conv
    }

    /// Fold a subsequent packet of this flow into the record. Returns true
    /// when the TCP lifecycle completed on this exact packet.
    pub(crate) fn record(&mut self, packet: &PacketRecord) -> bool {
        let a_to_b = packet.src_addr == self.address_a && packet.src_port == self.port_a;
        if a_to_b {
            self.packets_a_to_b += 1;
            self.bytes_a_to_b += packet.length;
        } else {
            self.packets_b_to_a += 1;
            self.bytes_b_to_a += packet.length;
        }

        self.end_time = packet.timestamp;
        self.duration =
            self.end_time.signed_duration_since(self.start_time).num_milliseconds() as f64 / 1000.0;
        self.last_packet_num = packet.number;
        self.packet_numbers.push(packet.number);

        let mut completed = false;
        if packet.protocol == "TCP" {
            completed = self.update_tcp_state(packet);
        }

        if self.application_protocol.is_empty() {
            if let Some(proto) = application_protocol(self.port_a, self.port_b) {
                self.application_protocol = proto.to_string();
            }
        }

        completed
    }

    fn update_tcp_state(&mut self, packet: &PacketRecord) -> bool {
        if packet.bool_field(PacketRecord::TCP_SYN) {
            self.has_syn = true;
            if self.syn_packet_num == 0 {
                self.syn_packet_num = packet.number;
            }
        }
        if packet.bool_field(PacketRecord::TCP_FIN) {
            self.has_fin = true;
            self.fin_packet_num = packet.number;
        }
        if packet.bool_field(PacketRecord::TCP_RST) {
            self.has_rst = true;
        }

        if !self.is_tcp_complete && self.has_syn && (self.has_fin || self.has_rst) {
            self.is_tcp_complete = true;
            return true;
        }
        false
    }

    pub fn total_packets(&self) -> u64 {
        self.packets_a_to_b + self.packets_b_to_a
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_a_to_b + self.bytes_b_to_a
    }

    /// True if `address` is either endpoint.
    pub fn involves(&self, address: &str) -> bool {
        self.address_a == address || self.address_b == address
    }

    /// True if `port` is either endpoint's port.
    pub fn uses_port(&self, port: u16) -> bool {
        self.port_a == port || self.port_b == port
    }
}

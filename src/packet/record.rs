use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single decoded packet handed to the analysis components.
///
/// Produced by the upstream dissector; the analysis layer never touches raw
/// frame bytes. Protocol-specific values travel in the `fields` bag, keyed
/// by dotted names such as `tcp.flags.syn` or `tcp.seq`. Absent keys read
/// as zero/false through the accessors below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketRecord {
    /// Monotonically assigned capture sequence number.
    pub number: u64,
    /// Capture timestamp, millisecond precision.
    pub timestamp: DateTime<Utc>,
    /// On-wire size in bytes.
    pub length: u64,
    /// Protocol label ("TCP", "UDP", "ICMP", ...).
    pub protocol: String,
    pub src_addr: String,
    pub dst_addr: String,
    /// 0 if the transport has no ports.
    pub src_port: u16,
    pub dst_port: u16,
    pub has_error: bool,
    pub error_info: String,
    pub fields: HashMap<String, Value>,
    /// Transport payload bytes when the dissector hands them over.
    /// May be empty; counters do not depend on it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
}

impl PacketRecord {
    pub const TCP_SYN: &'static str = "tcp.flags.syn";
    pub const TCP_FIN: &'static str = "tcp.flags.fin";
    pub const TCP_RST: &'static str = "tcp.flags.rst";
    pub const TCP_SEQ: &'static str = "tcp.seq";
    pub const TCP_LEN: &'static str = "tcp.len";

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        number: u64,
        timestamp: DateTime<Utc>,
        length: u64,
        protocol: impl Into<String>,
        src_addr: impl Into<String>,
        src_port: u16,
        dst_addr: impl Into<String>,
        dst_port: u16,
    ) -> Self {
        PacketRecord {
            number,
            timestamp,
            length,
            protocol: protocol.into(),
            src_addr: src_addr.into(),
            dst_addr: dst_addr.into(),
            src_port,
            dst_port,
            has_error: false,
            error_info: String::new(),
            fields: HashMap::new(),
            payload: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Fill the reliable-transport fields in one call.
    pub fn with_tcp(mut self, seq: u32, payload_len: u32, syn: bool, fin: bool, rst: bool) -> Self {
        self.fields.insert(Self::TCP_SEQ.into(), seq.into());
        self.fields.insert(Self::TCP_LEN.into(), payload_len.into());
        self.fields.insert(Self::TCP_SYN.into(), syn.into());
        self.fields.insert(Self::TCP_FIN.into(), fin.into());
        self.fields.insert(Self::TCP_RST.into(), rst.into());
        self
    }

    pub fn with_error(mut self, info: impl Into<String>) -> Self {
        self.has_error = true;
        self.error_info = info.into();
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Read a boolean from the field bag; absent or mistyped keys are false.
    pub fn bool_field(&self, name: &str) -> bool {
        self.fields.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Read an unsigned 32-bit value from the field bag; absent or mistyped
    /// keys are 0.
    pub fn u32_field(&self, name: &str) -> u32 {
        self.fields
            .get(name)
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or(0)
    }
}

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Per-protocol traffic breakdown.
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolStats {
    pub protocol: String,
    pub packet_count: u64,
    pub byte_count: u64,
    /// Share of total packets, 0..=100.
    pub percentage: f64,
    /// Share of total bytes, 0..=100.
    pub bytes_percentage: f64,
    pub avg_packet_size: f64,
    pub min_packet_size: u64,
    pub max_packet_size: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl ProtocolStats {
    pub(crate) fn open(protocol: String, first_seen: DateTime<Utc>, length: u64) -> Self {
        ProtocolStats {
            protocol,
            packet_count: 0,
            byte_count: 0,
            percentage: 0.0,
            bytes_percentage: 0.0,
            avg_packet_size: 0.0,
            min_packet_size: length,
            max_packet_size: 0,
            first_seen,
            last_seen: first_seen,
        }
    }
}

/// Per-address traffic breakdown. An endpoint is any address that appeared
/// as source or destination of at least one packet.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub address: String,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub total_packets: u64,
    pub total_bytes: u64,
    pub protocols: BTreeSet<String>,
    /// Source ports this address sent from.
    pub src_ports: BTreeSet<u16>,
    /// Destination ports this address was contacted on.
    pub dst_ports: BTreeSet<u16>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl EndpointStats {
    pub(crate) fn open(address: String, first_seen: DateTime<Utc>) -> Self {
        EndpointStats {
            address,
            packets_sent: 0,
            packets_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            total_packets: 0,
            total_bytes: 0,
            protocols: BTreeSet::new(),
            src_ports: BTreeSet::new(),
            dst_ports: BTreeSet::new(),
            first_seen,
            last_seen: first_seen,
        }
    }
}

/// One closed interval of the rate time series.
#[derive(Debug, Clone, Serialize)]
pub struct RatePoint {
    /// Interval start.
    pub timestamp: DateTime<Utc>,
    pub packet_count: u64,
    pub byte_count: u64,
    pub packets_per_second: f64,
    pub bits_per_second: f64,
}

/// One `[min, max)` slot of the packet-size histogram. The terminal bucket
/// carries `max_size == u64::MAX` and is effectively open-ended.
#[derive(Debug, Clone, Serialize)]
pub struct SizeBucket {
    pub min_size: u64,
    pub max_size: u64,
    pub count: u64,
    pub percentage: f64,
}

impl SizeBucket {
    pub(crate) fn new(min_size: u64, max_size: u64) -> Self {
        SizeBucket {
            min_size,
            max_size,
            count: 0,
            percentage: 0.0,
        }
    }

    pub fn contains(&self, length: u64) -> bool {
        length >= self.min_size && length < self.max_size
    }
}

/// Aggregate counters over the whole capture.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureStatistics {
    pub total_packets: u64,
    pub total_bytes: u64,
    pub displayed_packets: u64,
    pub displayed_bytes: u64,
    pub marked_packets: u64,
    pub dropped_packets: u64,

    pub capture_start: Option<DateTime<Utc>>,
    pub capture_end: Option<DateTime<Utc>>,
    /// Seconds between first and last packet.
    pub capture_duration: f64,

    pub avg_packets_per_second: f64,
    pub avg_bits_per_second: f64,
    pub avg_mbits_per_second: f64,
    pub peak_packets_per_second: f64,
    pub peak_bits_per_second: f64,

    pub avg_packet_size: f64,
    /// 0 until the first packet defines it.
    pub min_packet_size: u64,
    pub max_packet_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_bucket_half_open() {
        let bucket = SizeBucket::new(64, 128);
        assert!(bucket.contains(64));
        assert!(bucket.contains(127));
        assert!(!bucket.contains(128));
        assert!(!bucket.contains(63));
    }

    #[test]
    fn test_terminal_bucket_is_open_ended() {
        let bucket = SizeBucket::new(1518, u64::MAX);
        assert!(bucket.contains(1518));
        assert!(bucket.contains(1 << 40));
    }
}

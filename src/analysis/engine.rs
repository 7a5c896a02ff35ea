use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::config::{validate_size_buckets, ConfigError, StatsConfig};
use crate::events::{AnalyzerEvent, EventHub};
use crate::packet::PacketRecord;
use crate::util::write_atomic;

use super::stats::{CaptureStatistics, EndpointStats, ProtocolStats, RatePoint, SizeBucket};

struct EngineState {
    capture: CaptureStatistics,
    protocols: HashMap<String, ProtocolStats>,
    endpoints: HashMap<String, EndpointStats>,
    max_endpoints: usize,

    time_series: Vec<RatePoint>,
    time_series_interval_ms: i64,
    current_interval_start: Option<DateTime<Utc>>,
    current_interval_packets: u64,
    current_interval_bytes: u64,

    bucket_boundaries: Vec<u64>,
    size_distribution: Vec<SizeBucket>,

    src_ports: HashMap<u16, u64>,
    dst_ports: HashMap<u16, u64>,

    total_errors: u64,
    error_types: HashMap<String, u64>,
    error_packets: Vec<PacketRecord>,
    max_error_packets: usize,

    peak_packets_per_second: f64,
    peak_bits_per_second: f64,
}

fn build_buckets(boundaries: &[u64]) -> Vec<SizeBucket> {
    let mut buckets: Vec<SizeBucket> = boundaries
        .windows(2)
        .map(|w| SizeBucket::new(w[0], w[1]))
        .collect();
    if let Some(&last) = boundaries.last() {
        buckets.push(SizeBucket::new(last, u64::MAX));
    }
    buckets
}

fn top_ports(map: &HashMap<u16, u64>, count: usize) -> Vec<(u16, u64)> {
    let mut entries: Vec<(u16, u64)> = map.iter().map(|(&port, &hits)| (port, hits)).collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    entries.truncate(count);
    entries
}

/// Aggregates capture-wide statistics over the packet stream: totals,
/// per-protocol and per-endpoint breakdowns, a rate time series with peak
/// tracking, a packet-size histogram, port rankings and error accounting.
///
/// Independent of the conversation tracker; both are fed the same packets.
/// Same concurrency contract: one internal mutex, snapshot queries,
/// notification handlers run under the lock.
pub struct StatisticsEngine {
    state: Mutex<EngineState>,
    events: EventHub,
}

impl Default for StatisticsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StatisticsEngine {
    pub fn new() -> Self {
        Self::with_config(&StatsConfig::default())
    }

    pub fn with_config(config: &StatsConfig) -> Self {
        let boundaries = match validate_size_buckets(&config.packet_size_buckets) {
            Ok(()) => config.packet_size_buckets.clone(),
            Err(err) => {
                log::warn!("invalid size buckets in config ({}), using defaults", err);
                StatsConfig::default().packet_size_buckets
            }
        };
        let size_distribution = build_buckets(&boundaries);
        StatisticsEngine {
            state: Mutex::new(EngineState {
                capture: CaptureStatistics::default(),
                protocols: HashMap::new(),
                endpoints: HashMap::new(),
                max_endpoints: config.max_endpoints,
                time_series: Vec::new(),
                time_series_interval_ms: config.time_series_interval_ms,
                current_interval_start: None,
                current_interval_packets: 0,
                current_interval_bytes: 0,
                bucket_boundaries: boundaries,
                size_distribution,
                src_ports: HashMap::new(),
                dst_ports: HashMap::new(),
                total_errors: 0,
                error_types: HashMap::new(),
                error_packets: Vec::new(),
                max_error_packets: config.max_error_packets,
                peak_packets_per_second: 0.0,
                peak_bits_per_second: 0.0,
            }),
            events: EventHub::new(),
        }
    }

    /// Notification surface; subscribe or open a watch channel here.
    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Ingest one packet and refresh every aggregate. Packets without a
    /// protocol label are silently dropped.
    pub fn add_packet(&self, packet: &PacketRecord) {
        if packet.protocol.is_empty() {
            log::debug!("dropping packet #{} without protocol label", packet.number);
            return;
        }

        let mut state = self.state.lock();

        state.capture.total_packets += 1;
        state.capture.total_bytes += packet.length;

        if state.capture.capture_start.is_none() {
            state.capture.capture_start = Some(packet.timestamp);
            state.current_interval_start = Some(packet.timestamp);
        }
        state.capture.capture_end = Some(packet.timestamp);

        if state.capture.min_packet_size == 0 || packet.length < state.capture.min_packet_size {
            state.capture.min_packet_size = packet.length;
        }
        if packet.length > state.capture.max_packet_size {
            state.capture.max_packet_size = packet.length;
        }

        self.update_protocol_stats(&mut state, packet);
        self.update_endpoint_stats(&mut state, packet);
        self.update_time_series(&mut state, packet);
        Self::update_size_distribution(&mut state, packet);
        Self::update_port_stats(&mut state, packet);
        if packet.has_error {
            Self::track_error(&mut state, packet);
        }

        Self::recalculate_rates(&mut state);
        self.events.emit(AnalyzerEvent::StatisticsUpdated);
    }

    fn update_protocol_stats(&self, state: &mut EngineState, packet: &PacketRecord) {
        let entry = state
            .protocols
            .entry(packet.protocol.clone())
            .or_insert_with(|| {
                ProtocolStats::open(packet.protocol.clone(), packet.timestamp, packet.length)
            });

        entry.packet_count += 1;
        entry.byte_count += packet.length;
        entry.last_seen = packet.timestamp;
        if packet.length < entry.min_packet_size {
            entry.min_packet_size = packet.length;
        }
        if packet.length > entry.max_packet_size {
            entry.max_packet_size = packet.length;
        }
        entry.avg_packet_size = entry.byte_count as f64 / entry.packet_count as f64;

        let total_packets = state.capture.total_packets;
        let total_bytes = state.capture.total_bytes;
        for stats in state.protocols.values_mut() {
            stats.percentage = if total_packets > 0 {
                stats.packet_count as f64 / total_packets as f64 * 100.0
            } else {
                0.0
            };
            stats.bytes_percentage = if total_bytes > 0 {
                stats.byte_count as f64 / total_bytes as f64 * 100.0
            } else {
                0.0
            };
        }
        self.events.emit(AnalyzerEvent::ProtocolStatsUpdated);
    }

    fn update_endpoint_stats(&self, state: &mut EngineState, packet: &PacketRecord) {
        if !packet.src_addr.is_empty() {
            let entry = state
                .endpoints
                .entry(packet.src_addr.clone())
                .or_insert_with(|| EndpointStats::open(packet.src_addr.clone(), packet.timestamp));
            entry.packets_sent += 1;
            entry.bytes_sent += packet.length;
            entry.total_packets += 1;
            entry.total_bytes += packet.length;
            entry.protocols.insert(packet.protocol.clone());
            entry.src_ports.insert(packet.src_port);
            entry.last_seen = packet.timestamp;
        }

        if !packet.dst_addr.is_empty() {
            let entry = state
                .endpoints
                .entry(packet.dst_addr.clone())
                .or_insert_with(|| EndpointStats::open(packet.dst_addr.clone(), packet.timestamp));
            entry.packets_received += 1;
            entry.bytes_received += packet.length;
            entry.total_packets += 1;
            entry.total_bytes += packet.length;
            entry.protocols.insert(packet.protocol.clone());
            entry.dst_ports.insert(packet.dst_port);
            entry.last_seen = packet.timestamp;
        }

        if state.endpoints.len() > state.max_endpoints {
            Self::enforce_endpoint_limit(state);
        }
        self.events.emit(AnalyzerEvent::EndpointStatsUpdated);
    }

    /// Evict the quietest endpoints until the table is back under the cap.
    fn enforce_endpoint_limit(state: &mut EngineState) {
        while state.endpoints.len() > state.max_endpoints {
            let quietest = state
                .endpoints
                .iter()
                .min_by_key(|(_, stats)| stats.total_packets)
                .map(|(address, _)| address.clone());
            match quietest {
                Some(address) => {
                    state.endpoints.remove(&address);
                    log::debug!("evicted endpoint {} over cap {}", address, state.max_endpoints);
                }
                None => break,
            }
        }
    }

    fn update_time_series(&self, state: &mut EngineState, packet: &PacketRecord) {
        let Some(interval_start) = state.current_interval_start else {
            return;
        };

        let elapsed_ms = packet.timestamp.signed_duration_since(interval_start).num_milliseconds();
        if elapsed_ms >= state.time_series_interval_ms {
            let interval_secs = state.time_series_interval_ms as f64 / 1000.0;
            let point = RatePoint {
                timestamp: interval_start,
                packet_count: state.current_interval_packets,
                byte_count: state.current_interval_bytes,
                packets_per_second: state.current_interval_packets as f64 / interval_secs,
                bits_per_second: state.current_interval_bytes as f64 * 8.0 / interval_secs,
            };
            if point.packets_per_second > state.peak_packets_per_second {
                state.peak_packets_per_second = point.packets_per_second;
            }
            if point.bits_per_second > state.peak_bits_per_second {
                state.peak_bits_per_second = point.bits_per_second;
            }
            self.events.emit(AnalyzerEvent::RateUpdated {
                packets_per_second: point.packets_per_second,
                bits_per_second: point.bits_per_second,
            });
            state.time_series.push(point);

            // Advance by exactly one interval; silent gaps are not
            // back-filled with zero points.
            state.current_interval_start =
                Some(interval_start + Duration::milliseconds(state.time_series_interval_ms));
            state.current_interval_packets = 0;
            state.current_interval_bytes = 0;
        }

        state.current_interval_packets += 1;
        state.current_interval_bytes += packet.length;
    }

    fn update_size_distribution(state: &mut EngineState, packet: &PacketRecord) {
        let total_packets = state.capture.total_packets;
        if let Some(bucket) = state
            .size_distribution
            .iter_mut()
            .find(|bucket| bucket.contains(packet.length))
        {
            bucket.count += 1;
        }
        for bucket in &mut state.size_distribution {
            bucket.percentage = if total_packets > 0 {
                bucket.count as f64 / total_packets as f64 * 100.0
            } else {
                0.0
            };
        }
    }

    fn update_port_stats(state: &mut EngineState, packet: &PacketRecord) {
        if packet.src_port > 0 {
            *state.src_ports.entry(packet.src_port).or_insert(0) += 1;
        }
        if packet.dst_port > 0 {
            *state.dst_ports.entry(packet.dst_port).or_insert(0) += 1;
        }
    }

    fn track_error(state: &mut EngineState, packet: &PacketRecord) {
        state.total_errors += 1;
        let error_type = if packet.error_info.is_empty() {
            "Unknown".to_string()
        } else {
            packet.error_info.clone()
        };
        *state.error_types.entry(error_type).or_insert(0) += 1;

        // Past the cap, errors still count but the sample stops growing.
        if state.error_packets.len() < state.max_error_packets {
            state.error_packets.push(packet.clone());
        }
    }

    fn recalculate_rates(state: &mut EngineState) {
        let capture = &mut state.capture;
        if let (Some(start), Some(end)) = (capture.capture_start, capture.capture_end) {
            capture.capture_duration =
                end.signed_duration_since(start).num_milliseconds() as f64 / 1000.0;
        }
        if capture.capture_duration > 0.0 {
            capture.avg_packets_per_second = capture.total_packets as f64 / capture.capture_duration;
            capture.avg_bits_per_second =
                capture.total_bytes as f64 * 8.0 / capture.capture_duration;
            capture.avg_mbits_per_second = capture.avg_bits_per_second / 1_000_000.0;
        }
        if capture.total_packets > 0 {
            capture.avg_packet_size = capture.total_bytes as f64 / capture.total_packets as f64;
        }
    }

    /// Drop all aggregates and counters. Configuration (interval, caps,
    /// bucket boundaries) survives. Idempotent.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.capture = CaptureStatistics::default();
        state.protocols.clear();
        state.endpoints.clear();
        state.time_series.clear();
        state.current_interval_start = None;
        state.current_interval_packets = 0;
        state.current_interval_bytes = 0;
        state.src_ports.clear();
        state.dst_ports.clear();
        state.total_errors = 0;
        state.error_types.clear();
        state.error_packets.clear();
        state.peak_packets_per_second = 0.0;
        state.peak_bits_per_second = 0.0;
        let boundaries = state.bucket_boundaries.clone();
        state.size_distribution = build_buckets(&boundaries);
    }

    pub fn reset(&self) {
        self.clear();
    }

    // --- queries ---

    pub fn capture_statistics(&self) -> CaptureStatistics {
        let state = self.state.lock();
        let mut capture = state.capture.clone();
        capture.peak_packets_per_second = state.peak_packets_per_second;
        capture.peak_bits_per_second = state.peak_bits_per_second;
        capture
    }

    /// All protocol breakdowns, sorted by protocol label.
    pub fn protocol_statistics(&self) -> Vec<ProtocolStats> {
        let mut all: Vec<ProtocolStats> = self.state.lock().protocols.values().cloned().collect();
        all.sort_by(|a, b| a.protocol.cmp(&b.protocol));
        all
    }

    pub fn protocol_stats(&self, protocol: &str) -> Option<ProtocolStats> {
        self.state.lock().protocols.get(protocol).cloned()
    }

    pub fn protocol_distribution(&self) -> HashMap<String, u64> {
        self.state
            .lock()
            .protocols
            .iter()
            .map(|(name, stats)| (name.clone(), stats.packet_count))
            .collect()
    }

    pub fn top_protocols(&self, count: usize) -> Vec<String> {
        let mut all: Vec<(String, u64)> = self
            .state
            .lock()
            .protocols
            .iter()
            .map(|(name, stats)| (name.clone(), stats.packet_count))
            .collect();
        all.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        all.into_iter().take(count).map(|(name, _)| name).collect()
    }

    /// All endpoint breakdowns, sorted by address.
    pub fn endpoint_statistics(&self) -> Vec<EndpointStats> {
        let mut all: Vec<EndpointStats> = self.state.lock().endpoints.values().cloned().collect();
        all.sort_by(|a, b| a.address.cmp(&b.address));
        all
    }

    pub fn endpoint_stats(&self, address: &str) -> Option<EndpointStats> {
        self.state.lock().endpoints.get(address).cloned()
    }

    pub fn top_endpoints_by_packets(&self, count: usize) -> Vec<EndpointStats> {
        let mut all: Vec<EndpointStats> = self.state.lock().endpoints.values().cloned().collect();
        all.sort_by(|a, b| b.total_packets.cmp(&a.total_packets).then(a.address.cmp(&b.address)));
        all.truncate(count);
        all
    }

    pub fn top_endpoints_by_bytes(&self, count: usize) -> Vec<EndpointStats> {
        let mut all: Vec<EndpointStats> = self.state.lock().endpoints.values().cloned().collect();
        all.sort_by(|a, b| b.total_bytes.cmp(&a.total_bytes).then(a.address.cmp(&b.address)));
        all.truncate(count);
        all
    }

    /// Closed rate intervals, oldest first.
    pub fn rate_time_series(&self) -> Vec<RatePoint> {
        self.state.lock().time_series.clone()
    }

    /// The interval currently being accumulated, if any. Its rates are 0
    /// until the interval closes.
    pub fn current_interval(&self) -> Option<RatePoint> {
        let state = self.state.lock();
        state.current_interval_start.map(|start| RatePoint {
            timestamp: start,
            packet_count: state.current_interval_packets,
            byte_count: state.current_interval_bytes,
            packets_per_second: 0.0,
            bits_per_second: 0.0,
        })
    }

    /// Highest observed closed-interval rates as `(pps, bps)`.
    pub fn peak_rate(&self) -> (f64, f64) {
        let state = self.state.lock();
        (state.peak_packets_per_second, state.peak_bits_per_second)
    }

    pub fn size_distribution(&self) -> Vec<SizeBucket> {
        self.state.lock().size_distribution.clone()
    }

    pub fn top_source_ports(&self, count: usize) -> Vec<(u16, u64)> {
        top_ports(&self.state.lock().src_ports, count)
    }

    pub fn top_destination_ports(&self, count: usize) -> Vec<(u16, u64)> {
        top_ports(&self.state.lock().dst_ports, count)
    }

    /// Source and destination hits merged per port.
    pub fn port_usage(&self) -> HashMap<u16, u64> {
        let state = self.state.lock();
        let mut usage = state.src_ports.clone();
        for (&port, &hits) in &state.dst_ports {
            *usage.entry(port).or_insert(0) += hits;
        }
        usage
    }

    pub fn error_count(&self) -> u64 {
        self.state.lock().total_errors
    }

    pub fn errors_by_type(&self) -> HashMap<String, u64> {
        self.state.lock().error_types.clone()
    }

    /// The retained error-packet sample, at most `max_error_packets` long.
    pub fn error_packets(&self) -> Vec<PacketRecord> {
        self.state.lock().error_packets.clone()
    }

    // --- display-layer counters ---

    pub fn set_display_filter(&self, displayed_packets: u64, displayed_bytes: u64) {
        let mut state = self.state.lock();
        state.capture.displayed_packets = displayed_packets;
        state.capture.displayed_bytes = displayed_bytes;
    }

    pub fn set_marked_packets(&self, count: u64) {
        self.state.lock().capture.marked_packets = count;
    }

    pub fn set_dropped_packets(&self, count: u64) {
        self.state.lock().capture.dropped_packets = count;
    }

    // --- exports ---

    /// Serialize the full current state as one JSON object and write it
    /// atomically to `path`.
    pub fn export_json(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let totals = self.capture_statistics();
        let protocols = self.protocol_statistics();
        let endpoints = self.endpoint_statistics();
        let size_distribution = self.size_distribution();
        let time_series = self.rate_time_series();
        let top_src: Vec<serde_json::Value> = self
            .top_source_ports(10)
            .into_iter()
            .map(|(port, count)| serde_json::json!({ "port": port, "count": count }))
            .collect();
        let top_dst: Vec<serde_json::Value> = self
            .top_destination_ports(10)
            .into_iter()
            .map(|(port, count)| serde_json::json!({ "port": port, "count": count }))
            .collect();

        let document = serde_json::json!({
            "totals": totals,
            "protocols": protocols,
            "endpoints": endpoints,
            "size_distribution": size_distribution,
            "time_series": time_series,
            "top_src_ports": top_src,
            "top_dst_ports": top_dst,
        });

        let bytes = serde_json::to_vec_pretty(&document)?;
        write_atomic(path.as_ref(), &bytes)?;
        log::info!("exported statistics json to {}", path.as_ref().display());
        Ok(())
    }

    /// Write one CSV row per protocol, atomically.
    pub fn export_csv(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let mut protocols = self.protocol_statistics();
        protocols.sort_by(|a, b| b.packet_count.cmp(&a.packet_count).then(a.protocol.cmp(&b.protocol)));

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record([
            "protocol",
            "packets",
            "bytes",
            "pct_packets",
            "pct_bytes",
            "avg_size",
            "min_size",
            "max_size",
        ])?;
        for stats in &protocols {
            writer.write_record([
                stats.protocol.clone(),
                stats.packet_count.to_string(),
                stats.byte_count.to_string(),
                format!("{:.2}", stats.percentage),
                format!("{:.2}", stats.bytes_percentage),
                format!("{:.1}", stats.avg_packet_size),
                stats.min_packet_size.to_string(),
                stats.max_packet_size.to_string(),
            ])?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|err| anyhow::anyhow!("finalizing csv: {}", err))?;
        write_atomic(path.as_ref(), &bytes)?;
        log::info!("exported statistics csv to {}", path.as_ref().display());
        Ok(())
    }

    /// Human-readable one-screen summary of the capture.
    pub fn summary(&self) -> String {
        let capture = self.capture_statistics();
        let mut out = String::new();
        let _ = writeln!(out, "=== Capture Statistics ===");
        let _ = writeln!(out, "Total Packets: {}", capture.total_packets);
        let _ = writeln!(out, "Total Bytes: {}", capture.total_bytes);
        let _ = writeln!(out, "Duration: {:.3} seconds", capture.capture_duration);
        let _ = writeln!(out, "Avg Rate: {:.2} packets/sec", capture.avg_packets_per_second);
        let _ = writeln!(out, "Avg Bandwidth: {:.3} Mbps", capture.avg_mbits_per_second);
        out
    }

    // --- configuration ---

    pub fn set_time_series_interval(&self, interval_ms: i64) {
        self.state.lock().time_series_interval_ms = interval_ms;
    }

    pub fn set_max_endpoints(&self, max: usize) {
        self.state.lock().max_endpoints = max;
    }

    pub fn set_max_error_packets(&self, max: usize) {
        self.state.lock().max_error_packets = max;
    }

    /// Replace the histogram boundaries. Existing counts are discarded, so
    /// this is meant to run before ingestion or right after a reset.
    pub fn set_size_buckets(&self, boundaries: &[u64]) -> Result<(), ConfigError> {
        validate_size_buckets(boundaries)?;
        let mut state = self.state.lock();
        state.bucket_boundaries = boundaries.to_vec();
        state.size_distribution = build_buckets(boundaries);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::milliseconds(ms)
    }

    fn packet(number: u64, ms: i64, length: u64, protocol: &str) -> PacketRecord {
        PacketRecord::new(number, ts(ms), length, protocol, "10.0.0.1", 5000, "10.0.0.2", 80)
    }

    #[test]
    fn test_fresh_engine_is_empty() {
        let engine = StatisticsEngine::new();
        let capture = engine.capture_statistics();
        assert_eq!(capture.total_packets, 0);
        assert!(capture.capture_start.is_none());
        assert!(engine.protocol_statistics().is_empty());
        assert!(engine.endpoint_statistics().is_empty());
        assert!(engine.rate_time_series().is_empty());
        assert!(engine.current_interval().is_none());
        assert_eq!(engine.error_count(), 0);
    }

    #[test]
    fn test_empty_protocol_dropped() {
        let engine = StatisticsEngine::new();
        engine.add_packet(&PacketRecord::new(1, ts(0), 60, "", "a", 1, "b", 2));
        assert_eq!(engine.capture_statistics().total_packets, 0);
        assert!(engine.endpoint_statistics().is_empty());
    }

    #[test]
    fn test_totals_and_sizes() {
        let engine = StatisticsEngine::new();
        engine.add_packet(&packet(1, 0, 100, "TCP"));
        engine.add_packet(&packet(2, 10, 40, "TCP"));
        engine.add_packet(&packet(3, 20, 1500, "UDP"));

        let capture = engine.capture_statistics();
        assert_eq!(capture.total_packets, 3);
        assert_eq!(capture.total_bytes, 1640);
        assert_eq!(capture.min_packet_size, 40);
        assert_eq!(capture.max_packet_size, 1500);
        assert!((capture.avg_packet_size - 1640.0 / 3.0).abs() < 1e-9);
        assert_eq!(capture.capture_start, Some(ts(0)));
        assert_eq!(capture.capture_end, Some(ts(20)));
        assert!((capture.capture_duration - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_zero_duration_guards_averages() {
        let engine = StatisticsEngine::new();
        for i in 0..100u64 {
            engine.add_packet(&packet(i + 1, 0, 100, "TCP"));
        }
        let capture = engine.capture_statistics();
        assert_eq!(capture.capture_duration, 0.0);
        assert_eq!(capture.avg_packets_per_second, 0.0);
        assert_eq!(capture.avg_bits_per_second, 0.0);

        // Nothing closed, everything sits in the open interval.
        assert!(engine.rate_time_series().is_empty());
        let open = engine.current_interval().unwrap();
        assert_eq!(open.packet_count, 100);
        assert_eq!(open.byte_count, 10_000);
    }

    #[test]
    fn test_protocol_breakdown_sums_to_totals() {
        let engine = StatisticsEngine::new();
        engine.add_packet(&packet(1, 0, 100, "TCP"));
        engine.add_packet(&packet(2, 10, 200, "TCP"));
        engine.add_packet(&packet(3, 20, 300, "UDP"));
        engine.add_packet(&packet(4, 30, 60, "ICMP"));

        let capture = engine.capture_statistics();
        let protocols = engine.protocol_statistics();
        let packet_sum: u64 = protocols.iter().map(|p| p.packet_count).sum();
        let byte_sum: u64 = protocols.iter().map(|p| p.byte_count).sum();
        assert_eq!(packet_sum, capture.total_packets);
        assert_eq!(byte_sum, capture.total_bytes);

        let pct_sum: f64 = protocols.iter().map(|p| p.percentage).sum();
        assert!((pct_sum - 100.0).abs() < 1e-6);

        let tcp = engine.protocol_stats("TCP").unwrap();
        assert_eq!(tcp.packet_count, 2);
        assert_eq!(tcp.min_packet_size, 100);
        assert_eq!(tcp.max_packet_size, 200);
        assert!((tcp.avg_packet_size - 150.0).abs() < 1e-9);
        assert!((tcp.percentage - 50.0).abs() < 1e-9);

        assert_eq!(engine.top_protocols(1), vec!["TCP".to_string()]);
        assert_eq!(engine.protocol_distribution()["UDP"], 1);
    }

    #[test]
    fn test_endpoint_accounting_balances() {
        let engine = StatisticsEngine::new();
        engine.add_packet(&packet(1, 0, 100, "TCP"));
        let reverse =
            PacketRecord::new(2, ts(10), 50, "TCP", "10.0.0.2", 80, "10.0.0.1", 5000);
        engine.add_packet(&reverse);

        let a = engine.endpoint_stats("10.0.0.1").unwrap();
        assert_eq!(a.packets_sent, 1);
        assert_eq!(a.packets_received, 1);
        assert_eq!(a.packets_sent + a.packets_received, a.total_packets);
        assert_eq!(a.bytes_sent + a.bytes_received, a.total_bytes);
        assert_eq!(a.bytes_sent, 100);
        assert_eq!(a.bytes_received, 50);
        assert!(a.src_ports.contains(&5000));
        assert!(a.dst_ports.contains(&5000));
        assert!(a.protocols.contains("TCP"));

        let b = engine.endpoint_stats("10.0.0.2").unwrap();
        assert_eq!(b.packets_sent, 1);
        assert_eq!(b.packets_received, 1);
    }

    #[test]
    fn test_endpoint_cap_evicts_quietest() {
        let engine = StatisticsEngine::new();
        engine.set_max_endpoints(2);
        // 10.0.0.1 and 10.0.0.2 each see two packets; the newcomers only one.
        engine.add_packet(&packet(1, 0, 100, "TCP"));
        engine.add_packet(&packet(2, 10, 100, "TCP"));
        let newcomer =
            PacketRecord::new(3, ts(20), 60, "UDP", "172.16.0.1", 4000, "10.0.0.1", 53);
        engine.add_packet(&newcomer);

        assert!(engine.endpoint_statistics().len() <= 2);
        assert!(engine.endpoint_stats("10.0.0.1").is_some());
        assert!(engine.endpoint_stats("172.16.0.1").is_none());
    }

    #[test]
    fn test_interval_closes_on_boundary() {
        let engine = StatisticsEngine::new();
        for i in 0..10u64 {
            engine.add_packet(&packet(i + 1, 0, 125, "TCP"));
        }
        // Exactly one interval later: closes [0, 1000) before accumulating.
        engine.add_packet(&packet(11, 1000, 125, "TCP"));

        let series = engine.rate_time_series();
        assert_eq!(series.len(), 1);
        let point = &series[0];
        assert_eq!(point.timestamp, ts(0));
        assert_eq!(point.packet_count, 10);
        assert_eq!(point.byte_count, 1250);
        assert!((point.packets_per_second - 10.0).abs() < 1e-9);
        assert!((point.bits_per_second - 10_000.0).abs() < 1e-9);

        let open = engine.current_interval().unwrap();
        assert_eq!(open.timestamp, ts(1000));
        assert_eq!(open.packet_count, 1);

        assert_eq!(engine.peak_rate(), (10.0, 10_000.0));
        let capture = engine.capture_statistics();
        assert_eq!(capture.peak_packets_per_second, 10.0);
    }

    #[test]
    fn test_rate_updated_event_on_close() {
        let engine = StatisticsEngine::new();
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        engine.events().subscribe(EventKind::RateUpdated, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        engine.add_packet(&packet(1, 0, 100, "TCP"));
        engine.add_packet(&packet(2, 999, 100, "TCP"));
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        engine.add_packet(&packet(3, 2500, 100, "TCP"));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_size_distribution_default_buckets() {
        let engine = StatisticsEngine::new();
        for (i, size) in [32u64, 64, 100, 1500, 2000].into_iter().enumerate() {
            engine.add_packet(&packet(i as u64 + 1, i as i64, size, "TCP"));
        }
        let buckets = engine.size_distribution();
        let counts: Vec<u64> = buckets.iter().map(|b| b.count).collect();
        assert_eq!(counts, vec![1, 2, 0, 0, 0, 1, 1]);

        let count_sum: u64 = counts.iter().sum();
        assert_eq!(count_sum, engine.capture_statistics().total_packets);
        let pct_sum: f64 = buckets.iter().map(|b| b.percentage).sum();
        assert!((pct_sum - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_custom_size_buckets() {
        let engine = StatisticsEngine::new();
        engine.set_size_buckets(&[0, 100]).unwrap();
        engine.add_packet(&packet(1, 0, 99, "TCP"));
        engine.add_packet(&packet(2, 10, 100, "TCP"));
        let buckets = engine.size_distribution();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].count, 1);
        assert_eq!(buckets[1].count, 1);

        assert!(engine.set_size_buckets(&[5, 10]).is_err());
        assert!(engine.set_size_buckets(&[0, 10, 10]).is_err());
    }

    #[test]
    fn test_port_rankings() {
        let engine = StatisticsEngine::new();
        for i in 0..3u64 {
            engine.add_packet(&packet(i + 1, i as i64, 100, "TCP")); // 5000 -> 80
        }
        let dns = PacketRecord::new(4, ts(30), 60, "UDP", "10.0.0.1", 6000, "10.0.0.9", 53);
        engine.add_packet(&dns);
        let portless = PacketRecord::new(5, ts(40), 60, "ICMP", "10.0.0.1", 0, "10.0.0.9", 0);
        engine.add_packet(&portless);

        assert_eq!(engine.top_source_ports(1), vec![(5000, 3)]);
        assert_eq!(engine.top_destination_ports(2), vec![(80, 3), (53, 1)]);
        let usage = engine.port_usage();
        assert_eq!(usage[&80], 3);
        assert_eq!(usage[&5000], 3);
        assert_eq!(usage[&53], 1);
        assert!(!usage.contains_key(&0));
    }

    #[test]
    fn test_error_tracking_and_sample_cap() {
        let engine = StatisticsEngine::new();
        engine.set_max_error_packets(2);
        engine.add_packet(&packet(1, 0, 100, "TCP").with_error("bad checksum"));
        engine.add_packet(&packet(2, 10, 100, "TCP").with_error(""));
        engine.add_packet(&packet(3, 20, 100, "TCP").with_error("bad checksum"));

        assert_eq!(engine.error_count(), 3);
        let by_type = engine.errors_by_type();
        assert_eq!(by_type["bad checksum"], 2);
        assert_eq!(by_type["Unknown"], 1);
        // Third error is counted but not retained.
        assert_eq!(engine.error_packets().len(), 2);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let engine = StatisticsEngine::new();
        engine.add_packet(&packet(1, 0, 100, "TCP").with_error("x"));
        engine.add_packet(&packet(2, 1500, 100, "TCP"));
        engine.clear();
        engine.clear();

        let capture = engine.capture_statistics();
        assert_eq!(capture.total_packets, 0);
        assert!(capture.capture_start.is_none());
        assert_eq!(capture.peak_packets_per_second, 0.0);
        assert!(engine.protocol_statistics().is_empty());
        assert!(engine.endpoint_statistics().is_empty());
        assert!(engine.rate_time_series().is_empty());
        assert!(engine.current_interval().is_none());
        assert_eq!(engine.error_count(), 0);
        assert!(engine.size_distribution().iter().all(|b| b.count == 0));
        assert!(engine.top_source_ports(5).is_empty());
    }

    #[test]
    fn test_display_layer_counters() {
        let engine = StatisticsEngine::new();
        engine.set_display_filter(5, 500);
        engine.set_marked_packets(2);
        engine.set_dropped_packets(7);
        let capture = engine.capture_statistics();
        assert_eq!(capture.displayed_packets, 5);
        assert_eq!(capture.displayed_bytes, 500);
        assert_eq!(capture.marked_packets, 2);
        assert_eq!(capture.dropped_packets, 7);
    }

    #[test]
    fn test_export_json_shape() {
        let engine = StatisticsEngine::new();
        engine.add_packet(&packet(1, 0, 100, "TCP"));
        engine.add_packet(&packet(2, 1200, 200, "UDP"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        engine.export_json(&path).unwrap();

        let document: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(document["totals"]["total_packets"], 2);
        assert_eq!(document["protocols"].as_array().unwrap().len(), 2);
        assert!(document["endpoints"].is_array());
        assert_eq!(document["size_distribution"].as_array().unwrap().len(), 7);
        assert_eq!(document["time_series"].as_array().unwrap().len(), 1);
        assert_eq!(document["top_src_ports"][0]["port"], 5000);
        assert_eq!(document["top_dst_ports"][0]["count"], 2);
    }

    #[test]
    fn test_export_csv_rows() {
        let engine = StatisticsEngine::new();
        engine.add_packet(&packet(1, 0, 100, "TCP"));
        engine.add_packet(&packet(2, 10, 200, "TCP"));
        engine.add_packet(&packet(3, 20, 60, "UDP"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.csv");
        engine.export_csv(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "protocol,packets,bytes,pct_packets,pct_bytes,avg_size,min_size,max_size"
        );
        // Sorted by packet count, TCP first.
        assert!(lines[1].starts_with("TCP,2,300,"));
        assert!(lines[2].starts_with("UDP,1,60,"));
    }

    #[test]
    fn test_summary_text() {
        let engine = StatisticsEngine::new();
        engine.add_packet(&packet(1, 0, 100, "TCP"));
        engine.add_packet(&packet(2, 2000, 100, "TCP"));
        let summary = engine.summary();
        assert!(summary.contains("=== Capture Statistics ==="));
        assert!(summary.contains("Total Packets: 2"));
        assert!(summary.contains("Duration: 2.000 seconds"));
    }
}

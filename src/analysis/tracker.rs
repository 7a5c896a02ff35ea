use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::config::TrackerConfig;
use crate::events::{AnalyzerEvent, EventHub};
use crate::packet::PacketRecord;
use crate::util::write_atomic;

use super::conversation::{flow_key_for, Conversation};
use super::tcp_stream::{StreamDirection, TcpStream};

#[derive(Debug)]
struct TrackerState {
    conversations: HashMap<String, Conversation>,
    streams: HashMap<u32, TcpStream>,
    stream_index_by_flow: HashMap<String, u32>,
    next_stream_index: u32,
    max_conversations: usize,
    conversation_timeout_secs: i64,
    enable_stream_reassembly: bool,
    max_stream_size: usize,
    total_packets: u64,
    total_bytes: u64,
}

/// Groups packets into bidirectional conversations and tracks the byte
/// streams of reliable-transport flows.
///
/// The tracker is passive: `add_packet` runs on whichever thread calls it,
/// a single internal mutex serializes writers against readers, and every
/// query returns an owned snapshot. Notification handlers registered on
/// [`events`](Self::events) run under that mutex and must not call back in.
#[derive(Debug)]
pub struct ConversationTracker {
    state: Mutex<TrackerState>,
    events: EventHub,
}

impl Default for ConversationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationTracker {
    pub fn new() -> Self {
        Self::with_config(&TrackerConfig::default())
    }

    pub fn with_config(config: &TrackerConfig) -> Self {
        ConversationTracker {
            state: Mutex::new(TrackerState {
                conversations: HashMap::new(),
                streams: HashMap::new(),
                stream_index_by_flow: HashMap::new(),
                next_stream_index: 0,
                max_conversations: config.max_conversations,
                conversation_timeout_secs: config.conversation_timeout_secs,
                enable_stream_reassembly: config.enable_stream_reassembly,
                max_stream_size: config.max_stream_size,
                total_packets: 0,
                total_bytes: 0,
            }),
            events: EventHub::new(),
        }
    }

    /// Notification surface; subscribe or open a watch channel here.
    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Ingest one packet. Total: packets without a protocol label are
    /// silently dropped, everything else is accounted.
    pub fn add_packet(&self, packet: &PacketRecord) {
        let Some(flow_id) = flow_key_for(packet) else {
            log::debug!("dropping packet #{} without protocol label", packet.number);
            return;
        };

        let mut state = self.state.lock();

        if let Some(conv) = state.conversations.get_mut(&flow_id) {
            let completed = conv.record(packet);
            self.events.emit(AnalyzerEvent::ConversationUpdated {
                conversation_id: flow_id.clone(),
            });
            if completed {
                self.events.emit(AnalyzerEvent::ConversationCompleted {
                    conversation_id: flow_id.clone(),
                });
            }
        } else {
            let conv = Conversation::open(flow_id.clone(), packet);
            let completed = conv.is_tcp_complete;
            state.conversations.insert(flow_id.clone(), conv);
            self.events.emit(AnalyzerEvent::ConversationAdded {
                conversation_id: flow_id.clone(),
            });
            if completed {
                self.events.emit(AnalyzerEvent::ConversationCompleted {
                    conversation_id: flow_id.clone(),
                });
            }
            if state.conversations.len() > state.max_conversations {
                self.enforce_conversation_limit(&mut state);
            }
        }

        if packet.protocol == "TCP" && state.enable_stream_reassembly {
            self.process_tcp_packet(&mut state, &flow_id, packet);
        }

        state.total_packets += 1;
        state.total_bytes += packet.length;
        self.events.emit(AnalyzerEvent::StatisticsUpdated);
    }

    fn process_tcp_packet(&self, state: &mut TrackerState, flow_id: &str, packet: &PacketRecord) {
        let index = match state.stream_index_by_flow.get(flow_id) {
            Some(&index) => index,
            None => {
                let index = state.next_stream_index;
                state.next_stream_index = state.next_stream_index.wrapping_add(1);
                state
                    .streams
                    .insert(index, TcpStream::open(index, flow_id.to_string(), packet));
                state.stream_index_by_flow.insert(flow_id.to_string(), index);
                self.events.emit(AnalyzerEvent::TcpStreamCreated { stream_index: index });
                index
            }
        };

        let max_stream_size = state.max_stream_size;
        if let Some(stream) = state.streams.get_mut(&index) {
            stream.record_segment(packet, max_stream_size);
            let completed = stream.mark_flags(packet);
            self.events.emit(AnalyzerEvent::TcpStreamUpdated { stream_index: index });
            if completed {
                self.events.emit(AnalyzerEvent::TcpStreamComplete { stream_index: index });
            }
        }
    }

    /// Evict conversations with the oldest `end_time` until the count is
    /// back under the cap. Associated streams go with them.
    fn enforce_conversation_limit(&self, state: &mut TrackerState) {
        while state.conversations.len() > state.max_conversations {
            let oldest = state
                .conversations
                .iter()
                .min_by_key(|(_, conv)| conv.end_time)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    Self::remove_conversation(state, &id);
                    log::debug!("evicted conversation {} over cap {}", id, state.max_conversations);
                }
                None => break,
            }
        }
    }

    fn remove_conversation(state: &mut TrackerState, flow_id: &str) {
        state.conversations.remove(flow_id);
        if let Some(index) = state.stream_index_by_flow.remove(flow_id) {
            state.streams.remove(&index);
        }
    }

    /// Remove conversations idle longer than the configured timeout,
    /// measured against `now`. Maintenance operation; never run on the
    /// ingestion path. Returns the number of evicted conversations.
    pub fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.lock();
        let cutoff = now - Duration::seconds(state.conversation_timeout_secs);
        let idle: Vec<String> = state
            .conversations
            .iter()
            .filter(|(_, conv)| conv.end_time < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &idle {
            Self::remove_conversation(&mut state, id);
        }
        if !idle.is_empty() {
            log::debug!("evicted {} idle conversations", idle.len());
        }
        idle.len()
    }

    /// Drop all tracked state and reset counters. Idempotent. The stream
    /// index allocator is deliberately not rewound: indices stay unique for
    /// the tracker's lifetime even across resets.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.conversations.clear();
        state.streams.clear();
        state.stream_index_by_flow.clear();
        state.total_packets = 0;
        state.total_bytes = 0;
    }

    pub fn reset(&self) {
        self.clear();
    }

    // --- conversation queries ---

    pub fn conversations(&self) -> Vec<Conversation> {
        self.state.lock().conversations.values().cloned().collect()
    }

    pub fn conversation(&self, flow_id: &str) -> Option<Conversation> {
        self.state.lock().conversations.get(flow_id).cloned()
    }

    pub fn conversations_by_protocol(&self, protocol: &str) -> Vec<Conversation> {
        self.state
            .lock()
            .conversations
            .values()
            .filter(|conv| conv.protocol == protocol)
            .cloned()
            .collect()
    }

    pub fn conversations_with_address(&self, address: &str) -> Vec<Conversation> {
        self.state
            .lock()
            .conversations
            .values()
            .filter(|conv| conv.involves(address))
            .cloned()
            .collect()
    }

    pub fn conversations_with_port(&self, port: u16) -> Vec<Conversation> {
        self.state
            .lock()
            .conversations
            .values()
            .filter(|conv| conv.uses_port(port))
            .cloned()
            .collect()
    }

    /// Conversations whose last packet is at or after `since`.
    pub fn active_conversations(&self, since: DateTime<Utc>) -> Vec<Conversation> {
        self.state
            .lock()
            .conversations
            .values()
            .filter(|conv| conv.end_time >= since)
            .cloned()
            .collect()
    }

    pub fn top_conversations_by_packets(&self, count: usize) -> Vec<Conversation> {
        let mut all = self.conversations();
        all.sort_by(|a, b| b.total_packets().cmp(&a.total_packets()));
        all.truncate(count);
        all
    }

    pub fn top_conversations_by_bytes(&self, count: usize) -> Vec<Conversation> {
        let mut all = self.conversations();
        all.sort_by(|a, b| b.total_bytes().cmp(&a.total_bytes()));
        all.truncate(count);
        all
    }

    /// Flow key this packet resolves to, independent of direction.
    pub fn conversation_id(&self, packet: &PacketRecord) -> Option<String> {
        flow_key_for(packet)
    }

    /// Member packet numbers of a conversation, empty if unknown.
    pub fn conversation_packets(&self, flow_id: &str) -> Vec<u64> {
        self.state
            .lock()
            .conversations
            .get(flow_id)
            .map(|conv| conv.packet_numbers.clone())
            .unwrap_or_default()
    }

    pub fn total_conversations(&self) -> u64 {
        self.state.lock().conversations.len() as u64
    }

    pub fn conversation_count_by_protocol(&self) -> HashMap<String, u64> {
        let state = self.state.lock();
        let mut counts = HashMap::new();
        for conv in state.conversations.values() {
            *counts.entry(conv.protocol.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Total accepted traffic as `(packets, bytes)`.
    pub fn total_traffic(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.total_packets, state.total_bytes)
    }

    // --- stream queries ---

    pub fn tcp_streams(&self) -> Vec<TcpStream> {
        self.state.lock().streams.values().cloned().collect()
    }

    pub fn tcp_stream(&self, stream_index: u32) -> Option<TcpStream> {
        self.state.lock().streams.get(&stream_index).cloned()
    }

    pub fn tcp_stream_for_packet(&self, packet: &PacketRecord) -> Option<TcpStream> {
        let flow_id = flow_key_for(packet)?;
        let state = self.state.lock();
        let index = state.stream_index_by_flow.get(&flow_id)?;
        state.streams.get(index).cloned()
    }

    /// Stream index for the packet's flow. `None` when the flow has no
    /// stream; index 0 is a real stream, not a sentinel.
    pub fn tcp_stream_index(&self, packet: &PacketRecord) -> Option<u32> {
        let flow_id = flow_key_for(packet)?;
        self.state.lock().stream_index_by_flow.get(&flow_id).copied()
    }

    pub fn total_tcp_streams(&self) -> u64 {
        self.state.lock().streams.len() as u64
    }

    /// Retained payload of one stream direction, empty if the stream is
    /// unknown or nothing was retained.
    pub fn stream_payload(&self, stream_index: u32, direction: StreamDirection) -> Vec<u8> {
        self.state
            .lock()
            .streams
            .get(&stream_index)
            .map(|stream| stream.payload(direction))
            .unwrap_or_default()
    }

    // --- stream exports ---

    /// Write one direction's retained payload to `path` (temp file plus
    /// rename, so no partial file survives a failure).
    pub fn export_stream_payload(
        &self,
        stream_index: u32,
        path: impl AsRef<Path>,
        direction: StreamDirection,
    ) -> anyhow::Result<()> {
        let bytes = {
            let state = self.state.lock();
            state
                .streams
                .get(&stream_index)
                .with_context(|| format!("unknown tcp stream {}", stream_index))?
                .payload(direction)
        };
        write_atomic(path.as_ref(), &bytes)?;
        log::info!(
            "exported {} bytes of stream {} to {}",
            bytes.len(),
            stream_index,
            path.as_ref().display()
        );
        Ok(())
    }

    /// Write both directions interleaved in arrival order.
    pub fn export_stream_raw(&self, stream_index: u32, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let bytes = {
            let state = self.state.lock();
            state
                .streams
                .get(&stream_index)
                .with_context(|| format!("unknown tcp stream {}", stream_index))?
                .raw_payload()
        };
        write_atomic(path.as_ref(), &bytes)?;
        log::info!(
            "exported {} raw bytes of stream {} to {}",
            bytes.len(),
            stream_index,
            path.as_ref().display()
        );
        Ok(())
    }

    // --- configuration ---

    pub fn set_max_conversations(&self, max: usize) {
        self.state.lock().max_conversations = max;
    }

    pub fn set_conversation_timeout(&self, seconds: i64) {
        self.state.lock().conversation_timeout_secs = seconds;
    }

    pub fn set_enable_stream_reassembly(&self, enable: bool) {
        self.state.lock().enable_stream_reassembly = enable;
    }

    pub fn set_max_stream_size(&self, max_bytes: usize) {
        self.state.lock().max_stream_size = max_bytes;
    }
}

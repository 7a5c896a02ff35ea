//! Analytical core of a live capture analyzer.
//!
//! Two independent components consume the same stream of pre-decoded
//! [`PacketRecord`]s: the [`ConversationTracker`] groups packets into
//! bidirectional flows and follows reliable-transport streams, while the
//! [`StatisticsEngine`] maintains capture-wide aggregates. Both are passive
//! and safe for one ingestion thread plus any number of reader threads.

pub mod analysis;
pub mod config;
pub mod events;
pub mod packet;
mod util;

pub use analysis::{
    CaptureStatistics, Conversation, ConversationTracker, EndpointStats, ProtocolStats, RatePoint,
    SizeBucket, StatisticsEngine, StreamDirection, TcpStream,
};
pub use config::{AnalyzerConfig, ConfigError, StatsConfig, TrackerConfig};
pub use events::{AnalyzerEvent, EventHub, EventKind};
pub use packet::PacketRecord;

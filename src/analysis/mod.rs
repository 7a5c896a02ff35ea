pub mod conversation;
pub mod engine;
pub mod stats;
pub mod tcp_stream;
pub mod tracker;

pub use conversation::{flow_key, flow_key_for, Conversation};
pub use engine::StatisticsEngine;
pub use stats::{CaptureStatistics, EndpointStats, ProtocolStats, RatePoint, SizeBucket};
pub use tcp_stream::{StreamDirection, TcpStream};
pub use tracker::ConversationTracker;

//! Concord Transport Layer
//!
//! Moves replicated forum state between peers:
//! - Transport: topics for fan-out, streams for request/response
//!   (in-process [`MemoryNetwork`] and [`TcpTransport`])
//! - Dispatcher: routes decoded frames to handlers
//! - Reconciler: digest-based anti-entropy with on-demand body fetch
//! - Broadcaster: best-effort publication of local ops
//! - Metrics: Prometheus metrics (optional feature)

pub mod broadcaster;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod memory;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod node;
pub mod rate_limit;
pub mod reconcile;
pub mod stats;
#[cfg(feature = "tcp")]
pub mod tcp;
pub mod transport;

pub use broadcaster::Broadcaster;
pub use config::{LimitsConfig, NodeConfig, SyncConfig, DEFAULT_TOPIC, MAX_BATCH_SIZE};
pub use context::NodeContext;
pub use dispatcher::{Dispatcher, HandlerFn};
pub use error::{TransportError, TransportResult};
pub use memory::{MemoryNetwork, MemoryTransport};
#[cfg(feature = "metrics")]
pub use metrics::{Metrics, MetricsServer};
pub use node::{Node, NodeHandle};
pub use rate_limit::{PeerRateLimiter, RateLimitConfig, TokenBucket};
pub use reconcile::{PeerSyncState, Reconciler, SyncPhase, SyncReport};
pub use stats::{SyncStats, SyncStatsSnapshot};
#[cfg(feature = "tcp")]
pub use tcp::TcpTransport;
pub use transport::{PeerId, PeerStream, TopicFrame, Transport};

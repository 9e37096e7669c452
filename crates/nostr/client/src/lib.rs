//! Client-side Nostr relay query engine.
//!
//! - `relay`/`pool`: connections to relays, supervised and reconnecting
//! - `request_builder`/`router`: filter fragments to per-relay REQ payloads
//! - `query`/`query_manager`: live queries, progress and deduplicated feeds
//! - `negentropy`: NIP-77 sync of cached result sets
//! - `system`: the facade wiring all of it to a single event loop

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod negentropy;
pub mod pool;
pub mod query;
pub mod query_manager;
pub mod relay;
pub mod request_builder;
pub mod router;
pub mod system;
pub mod transport;

pub use cache::{
    CacheEntity, CacheRelay, CacheUpdate, CachedTable, ConnectionCacheRelay, EventCache,
    FilterCacheLayer, IdsCacheLayer, MemoryTable, RelayListEntry, RelayMetadataLoader,
    RelayMetrics, RelayMetricsHandler, UserRelaysLoader, UsersRelays,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{FallbackSync, SystemConfig};
pub use error::{ClientError, Result};
pub use negentropy::{NegentropyFlow, SyncOutcome};
pub use pool::{PoolConfig, PoolEvent, RelayPool};
pub use query::{Query, QueryProgress, QueryStatus, QueryTrace, TraceReport, TraceState};
pub use query_manager::{ManagerOptions, QueryManager, QueryManagerEvent};
pub use relay::{
    ConnectionEvent, ConnectionStatus, OkResponse, RelayConfig, RelayConnection, RelayMessage,
    RelaySettings,
};
pub use request_builder::{BuiltRequest, RequestBuilder, RequestFilterBuilder, RequestOptions};
pub use router::{OutboxRouter, RequestRouter};
pub use system::{NostrSystem, SystemDeps, SystemSnapshot};
pub use transport::{
    ChannelPeer, ChannelTransport, RelayTransport, TransportChannels, TransportEvent,
    WebSocketTransport,
};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

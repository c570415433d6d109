//! Side-effecting collaborators: the device key-value store, the hosted
//! tables with their object bucket, and the realtime change feed.

mod http;
mod kv;
mod realtime;
mod tables;

pub use self::http::{RestTables, ValidatedUrl, MAX_UPLOAD_SIZE};
pub use self::kv::{KeyValueStore, KvError, KvKey, MemoryKv, StorageErrorCode};
#[cfg(not(target_arch = "wasm32"))]
pub use self::kv::SqliteKv;
pub use self::realtime::{
    BroadcastSource, ChangeKind, ChangeNotice, ChangeSource, PhoenixSource, RealtimeError,
    Subscription, CHANNEL_TOPIC,
};
pub use self::tables::{Filter, MemoryTables, RemoteError, RemoteTables, SelectQuery, Table};

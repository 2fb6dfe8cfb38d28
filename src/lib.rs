pub mod antientropy;
pub mod attrs;
pub mod bitmap;
pub mod broadcast;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod field;
pub mod fragment;
pub mod index;
pub mod pql;
pub mod quantum;
pub mod server;
pub mod stats;

pub use bitmap::{Bitmap, Container};
pub use broadcast::{Broadcaster, ClusterMessage, HttpBroadcaster, NopBroadcaster};
pub use cluster::{Cluster, Node, NodeSet, StaticNodeSet};
pub use config::{BuildInfo, Config};
pub use engine::Engine;
pub use error::{DbError, DbResult};
pub use executor::{Executor, QueryRequest, QueryResponse, QueryResult};
pub use field::{Field, FieldOptions, VIEW_STANDARD};
pub use fragment::{CacheType, Fragment, Pair, SLICE_WIDTH};
pub use index::{Index, IndexOptions};
pub use server::{create_router, AppState};
pub use stats::{NopStats, Stats};

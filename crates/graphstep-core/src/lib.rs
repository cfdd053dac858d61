//! Bidirectional sync between STEP assembly files and a graph database.
//!
//! - [`step`]: exchange-file codec and the product-tree document model
//! - [`graph`]: persisted schema, document mapping and store clients
//! - [`sync`]: the public operations ([`SyncEngine`])

pub mod config;
pub mod error;
pub mod graph;
pub mod step;
pub mod sync;

pub use config::{Config, DbConfig};
pub use error::SyncError;
pub use graph::{GraphConnector, MemoryConnector, Neo4jConnector};
pub use step::{Position, Quaternion, StepCodec, StepDocument};
pub use sync::{ProductHierarchy, SyncEngine};

//! Graph side of the bridge: schema, document mapping and store clients.

pub mod cypher;
pub mod error;
pub mod mapper;
pub mod memory;
pub mod neo4j;
pub mod schema;
pub mod store;

pub use error::{GraphError, MapperError};
pub use mapper::{checksum, GraphMapper};
pub use memory::MemoryConnector;
pub use neo4j::Neo4jConnector;
pub use schema::{
    ChildRef, EdgeUpsert, GraphCounts, MergePolicy, NodeRecord, NodeUpsert, RawNode, RawSubgraph, ShapeRecord,
    SubgraphUpsert, UpsertScope,
};
pub use store::{GraphConnector, GraphSession};

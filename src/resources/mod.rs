pub mod common;
pub mod engine;
pub mod postgres_client;
pub mod publication;
pub mod registry;
pub mod secret;
pub mod sql;

pub use common::{FIELD_MANAGER, owner_reference, standard_labels};
pub use engine::{EngineError, EngineResult, PgEngine};
pub use postgres_client::{PoolConnector, PooledEngine};
pub use registry::{ConnectionParams, Connector, EngineRegistry};

pub mod context;
pub mod database_reconciler;
pub mod engine_reconciler;
pub mod error;
pub mod events;
pub mod link_guard;
pub mod publication_reconciler;
pub mod reconciler;
pub mod resolve;
pub mod roles;
pub mod rotation;
pub mod schemas;
pub mod state_machine;
pub mod status;
pub mod store;
pub mod user_role_reconciler;

pub use context::Context;
pub use database_reconciler::DATABASE_FINALIZER;
pub use engine_reconciler::ENGINE_FINALIZER;
pub use error::{BackoffConfig, Error, Result};
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
pub use publication_reconciler::PUBLICATION_FINALIZER;
pub use reconciler::{ManagedResource, error_policy, reconcile};
pub use store::{KubeSecretStore, KubeStore, ResourceStore, SecretStore};
pub use user_role_reconciler::USER_ROLE_FINALIZER;

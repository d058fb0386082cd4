mod common;
mod postgres_database;
mod postgres_engine;
mod postgres_publication;
mod postgres_user_role;

pub use common::*;
pub use postgres_database::*;
pub use postgres_engine::*;
pub use postgres_publication::*;
pub use postgres_user_role::*;

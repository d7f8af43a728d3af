//! Persistence layer - Settings and the cached app catalog

mod database;

pub use database::Database;

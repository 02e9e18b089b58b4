pub mod auth;
pub mod config;
pub mod engine;
pub mod inventory;
pub mod limits;
pub mod model;
pub mod observability;
pub mod pricing;
pub mod sql;
pub mod sweeper;
pub mod tls;
pub mod wal;
pub mod wire;

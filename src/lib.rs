pub mod audit;
pub mod clock;
pub mod config;
pub mod error;
pub mod expiration;
pub mod inventory;
pub mod lifecycle;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod repository;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod wal;

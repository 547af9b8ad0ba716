pub mod auth;
pub mod cluster;
pub mod config;
pub mod error;
pub mod order_key;
pub mod reconcile;
pub mod registry;
pub mod reporter;
pub mod service;
pub mod store;
pub mod tasks;
pub mod types;

pub use error::{ConnectionError, DecodeError, TrackerError, TrackerResult};

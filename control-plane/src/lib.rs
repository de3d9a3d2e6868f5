#![recursion_limit = "1024"]

#[macro_use]
extern crate tracing;

pub mod api;
pub mod ca;
pub mod clients;
pub mod clusters;
pub mod config;
pub mod crypto;
pub mod error;
pub mod extract;
pub mod feeds;
pub mod guard;
pub mod log;
pub mod memory_cache;
pub mod middleware;
pub mod policy;
pub mod redis_backend;
pub mod rule_cache;
pub mod state;
pub mod token;

pub use state::AppState;

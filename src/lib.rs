//! BigUpload Server Library
//!
//! Resumable, deduplicated large-file uploads over HTTP. The main server
//! binary is in main.rs.
//!
//! # Modules
//!
//! - `upload`: Sessions, chunk staging, assembly and deduplication
//! - `db`: SQLite-backed session and dedup stores
//! - `routes`: HTTP surface

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
pub mod upload;

pub use config::Config;
pub use routes::router;
pub use state::AppState;

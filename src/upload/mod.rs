//! Resumable Chunked Upload Module
//!
//! Implements deduplicated large-file uploads with:
//! - SHA-256 content addressing for instant transfer
//! - Out-of-order, retryable chunk uploads with resume support
//! - Verified assembly into content-named artifacts
//!
//! Protocol Flow:
//! 1. Client calls verify with the file hash; the server answers with an
//!    existing artifact URL or the chunks it already holds
//! 2. Client uploads the missing chunks, in any order
//! 3. Client calls merge; the server assembles, verifies and publishes the
//!    file and returns its URL

pub mod artifact;
pub mod assembly;
pub mod chunk_store;
pub mod dedup;
pub mod digest;
pub mod service;
pub mod session;
pub mod store;
pub mod types;

pub use artifact::{ArtifactStore, StagedArtifact};
pub use assembly::AssemblyEngine;
pub use chunk_store::{ChunkStorage, ChunkStore, LocalChunkStorage};
pub use dedup::DedupIndex;
pub use digest::{compute_hash, hash_file, normalize_digest, verify_hash, ContentHasher};
pub use service::UploadService;
pub use session::SessionRegistry;
pub use store::{DedupStore, MemoryDedupStore, MemorySessionStore, SessionStore};
pub use types::*;

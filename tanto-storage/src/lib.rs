//! # TantoKV Storage Engine
//!
//! In-memory multi-database key/value engine with append-only-log durability.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Write Path                             │
//! │                                                             │
//! │  Mutation ──> Shard Write Lock ──> Bucket Chain             │
//! │                     │                                       │
//! │                     ├──> TTL Index (expiry buckets)         │
//! │                     └──> Log Queue ──> Writer Thread ──>    │
//! │                                        Flush + fsync        │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Recovery Path                          │
//! │                                                             │
//! │  Open ──> Replay frames in order ──> Live append mode       │
//! │            (truncated tail = clean EOF)                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each database bundles one sharded [`table::Table`], one
//! [`ttl::TtlIndex`] with its sweeper thread, and one append-only log
//! ([`aof`]). The [`registry::Registry`] maps upper-cased names to open
//! databases; the [`engine::Engine`] facade is what the wire surfaces
//! consume.

pub mod aof;
pub mod database;
pub mod engine;
mod entry;
pub mod hash;
pub mod registry;
pub mod table;
pub mod ttl;

pub use database::{Db, DbOptions};
pub use engine::{CreateOutcome, Engine};
pub use hash::KeyHasher;
pub use registry::{DbInfo, Registry};
pub use table::Table;
pub use ttl::TtlIndex;

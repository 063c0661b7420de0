//! # TantoKV Server
//!
//! The two wire surfaces over one [`tanto_storage::Engine`]:
//!
//! - [`http`]: the JSON/HTTP API (create/exists/set/setnx/incr/get/del,
//!   credential rotation, landing page, health and metrics probes)
//! - [`rpc`]: the length-prefixed binary RPC API with mandatory client
//!   deadlines
//!
//! Both surfaces run their own admission gate and expose the same engine
//! semantics; neither owns any state beyond its listener.

pub mod http;
pub mod models;
pub mod rpc;

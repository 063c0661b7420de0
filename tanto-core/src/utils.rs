//! Shared helpers: database name validation, shard sizing, wall-clock access.

use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;

/// Upper bound on shard-lock and expiration-shard counts.
pub const MAX_SHARDS: u64 = 1 << 31;

static DB_NAME_RE: OnceLock<Regex> = OnceLock::new();

/// Check a database name against `^[A-Za-z0-9]{1,100}$`.
pub fn valid_db_name(name: &str) -> bool {
    DB_NAME_RE
        .get_or_init(|| Regex::new("^[A-Za-z0-9]{1,100}$").expect("db name regex"))
        .is_match(name)
}

/// Smallest power of two that is >= `n`, floored at 2.
pub fn next_pow2_at_least_2(n: u64) -> u64 {
    if n <= 2 {
        2
    } else {
        n.next_power_of_two()
    }
}

/// Number of logical CPUs, falling back to 1 when unknown.
pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Shard count derived from the CPU count and the configured multiplier:
/// a power of two in `[2, MAX_SHARDS]`.
pub fn shard_count(cpu_multiplier: usize) -> usize {
    let raw = (cpu_count() as u64).saturating_mul(cpu_multiplier as u64);
    next_pow2_at_least_2(raw).min(MAX_SHARDS) as usize
}

/// Current wall-clock time as unix seconds.
pub fn unix_now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

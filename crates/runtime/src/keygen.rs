//! Distributed key generation.

use quilt_common::Value;
use quilt_error::{ErrorCode, QuiltError, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Produces one fresh key per call. Implementations must be safe to share
/// across statements.
pub trait KeyGenerator: Send + Sync {
    fn next_key(&self) -> Value;
}

impl std::fmt::Debug for dyn KeyGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyGenerator")
    }
}

const EPOCH_MS: u64 = 1_577_836_800_000; // 2020-01-01T00:00:00Z
const WORKER_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Snowflake-style 63-bit key: 41 bits of milliseconds since a fixed epoch,
/// 10 bits of worker id, 12 bits of per-millisecond sequence.
pub struct SnowflakeKeyGenerator {
    worker_id: u64,
    state: Mutex<SnowflakeState>,
}

struct SnowflakeState {
    last_ms: u64,
    sequence: u64,
}

impl SnowflakeKeyGenerator {
    pub fn new(worker_id: u16) -> Self {
        SnowflakeKeyGenerator {
            worker_id: u64::from(worker_id) & ((1 << WORKER_BITS) - 1),
            state: Mutex::new(SnowflakeState {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

impl KeyGenerator for SnowflakeKeyGenerator {
    fn next_key(&self) -> Value {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut now = Self::now_ms();
        // Clock moved backwards: hold the line at last_ms and burn sequence.
        if now < state.last_ms {
            now = state.last_ms;
        }
        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                now += 1;
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;
        let key = (now.saturating_sub(EPOCH_MS) << (WORKER_BITS + SEQUENCE_BITS))
            | (self.worker_id << SEQUENCE_BITS)
            | state.sequence;
        Value::Int(key as i64)
    }
}

/// Name-keyed generator registry, seeded with `snowflake`.
pub struct KeyGeneratorRegistry {
    generators: BTreeMap<String, Arc<dyn KeyGenerator>>,
}

impl KeyGeneratorRegistry {
    pub fn new() -> Self {
        KeyGeneratorRegistry {
            generators: BTreeMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("snowflake", Arc::new(SnowflakeKeyGenerator::new(0)));
        registry
    }

    pub fn register(&mut self, name: &str, generator: Arc<dyn KeyGenerator>) {
        self.generators.insert(name.to_string(), generator);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn KeyGenerator>> {
        self.generators.get(name).cloned().ok_or_else(|| {
            QuiltError::new(
                ErrorCode::UnknownKeyGenerator,
                format!("No key generator registered under '{}'", name),
            )
            .with_hint("Register the generator before building the sharding rule")
        })
    }
}

impl Default for KeyGeneratorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

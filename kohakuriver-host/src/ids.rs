//! Snowflake-style task id generation.
//!
//! Ids are 64-bit, time-sortable and strictly monotone within one host
//! process: 41 bits of milliseconds since the cluster epoch, 10 bits of
//! host id, 12 bits of per-millisecond sequence.

use chrono::Utc;
use std::sync::Mutex;

const HOST_ID_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

// 2024-01-01T00:00:00Z
const EPOCH_MS: i64 = 1_704_067_200_000;

pub struct TaskIdGenerator {
    host_id: u64,
    state: Mutex<GeneratorState>,
}

struct GeneratorState {
    last_ms: i64,
    sequence: u64,
}

impl TaskIdGenerator {
    pub fn new(host_id: u16) -> Self {
        let host_id = u64::from(host_id) & ((1 << HOST_ID_BITS) - 1);
        Self { host_id, state: Mutex::new(GeneratorState { last_ms: 0, sequence: 0 }) }
    }

    /// Allocate the next id. Never returns the same value twice, even
    /// when the wall clock steps backwards.
    pub fn next_id(&self) -> i64 {
        let mut state = self.state.lock().expect("id generator lock poisoned");
        let mut now = Utc::now().timestamp_millis() - EPOCH_MS;
        if now < state.last_ms {
            now = state.last_ms;
        }
        if now == state.last_ms {
            state.sequence += 1;
            if state.sequence > MAX_SEQUENCE {
                now += 1;
                state.sequence = 0;
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;
        ((now as u64) << (HOST_ID_BITS + SEQUENCE_BITS) | self.host_id << SEQUENCE_BITS | state.sequence) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn monotone_and_unique() {
        let generator = TaskIdGenerator::new(1);
        let mut last = 0;
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let id = generator.next_id();
            assert!(id > last, "{id} not greater than {last}");
            assert!(seen.insert(id));
            last = id;
        }
    }

    #[test]
    fn positive_ids() {
        let generator = TaskIdGenerator::new(1023);
        assert!(generator.next_id() > 0);
    }
}

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Custom epoch: 2026-01-01T00:00:00Z in milliseconds since Unix epoch.
const CHAT_EPOCH_MS: u64 = 1_767_225_600_000;

const WORKER_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const WORKER_MASK: u64 = (1 << WORKER_BITS) - 1;

/// Largest worker ID that fits the layout. Every instance writing to the same
/// table needs its own.
pub const MAX_WORKER_ID: u16 = WORKER_MASK as u16;

struct Clock {
    last_ms: u64,
    sequence: u64,
}

/// 64-bit time-ordered message ID generator.
///
/// Layout (MSB → LSB):
/// - Bits 63–22: Timestamp (42 bits), ms since the chat epoch
/// - Bits 21–12: Worker ID (10 bits), one per hub instance
/// - Bits 11–0:  Sequence (12 bits), per-ms counter
///
/// When the wall clock steps backwards the generator keeps issuing IDs from
/// the last observed millisecond, so IDs stay strictly increasing per worker.
pub struct SnowflakeGenerator {
    worker_id: u64,
    clock: Mutex<Clock>,
}

impl SnowflakeGenerator {
    /// Worker IDs wider than 10 bits are masked.
    pub fn new(worker_id: u16) -> Self {
        Self {
            worker_id: worker_id as u64 & WORKER_MASK,
            clock: Mutex::new(Clock {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    pub fn generate(&self) -> i64 {
        let mut clock = self.clock.lock().unwrap_or_else(|p| p.into_inner());

        let now_ms = current_ms().max(clock.last_ms);

        if now_ms == clock.last_ms {
            clock.sequence = (clock.sequence + 1) & SEQUENCE_MASK;
            if clock.sequence == 0 {
                // Sequence exhausted for this millisecond: borrow the next one.
                clock.last_ms += 1;
            }
        } else {
            clock.sequence = 0;
            clock.last_ms = now_ms;
        }

        let ts = clock.last_ms.saturating_sub(CHAT_EPOCH_MS);
        ((ts << (WORKER_BITS + SEQUENCE_BITS)) | (self.worker_id << SEQUENCE_BITS) | clock.sequence)
            as i64
    }
}

fn current_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(CHAT_EPOCH_MS)
}

/// Extract the creation timestamp (ms since Unix epoch) from a snowflake ID.
pub fn snowflake_timestamp_ms(id: i64) -> u64 {
    ((id as u64) >> (WORKER_BITS + SEQUENCE_BITS)) + CHAT_EPOCH_MS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generates_unique_increasing_ids() {
        let gen = SnowflakeGenerator::new(3);
        let mut seen = HashSet::new();
        let mut prev = 0i64;
        for _ in 0..10_000 {
            let id = gen.generate();
            assert!(id > prev, "not monotonic: {prev} >= {id}");
            assert!(seen.insert(id), "duplicate snowflake: {id}");
            prev = id;
        }
    }

    #[test]
    fn timestamp_is_recoverable() {
        let gen = SnowflakeGenerator::new(0);
        let before = current_ms();
        let id = gen.generate();

        // Sequence overflow may borrow a few ms ahead, never behind.
        assert!(snowflake_timestamp_ms(id) >= before);
    }

    #[test]
    fn distinct_workers_never_share_ids() {
        let a = SnowflakeGenerator::new(1);
        let b = SnowflakeGenerator::new(2);
        let from_a: HashSet<i64> = (0..5_000).map(|_| a.generate()).collect();
        assert!((0..5_000).map(|_| b.generate()).all(|id| !from_a.contains(&id)));
    }

    #[test]
    fn worker_id_is_carried_in_every_id() {
        let gen = SnowflakeGenerator::new(MAX_WORKER_ID);
        let id = gen.generate() as u64;
        assert_eq!((id >> SEQUENCE_BITS) & WORKER_MASK, MAX_WORKER_ID as u64);
    }
}

use std::sync::atomic::{AtomicU64, Ordering};

pub static ROWS_WRITTEN_TOTAL: AtomicU64 = AtomicU64::new(0);
pub static BATCHES_SENT_TOTAL: AtomicU64 = AtomicU64::new(0);
pub static AMBIGUOUS_ROWS_TOTAL: AtomicU64 = AtomicU64::new(0);
pub static FAILED_CYCLES_TOTAL: AtomicU64 = AtomicU64::new(0);

pub fn record_batch(rows: usize) {
    BATCHES_SENT_TOTAL.fetch_add(1, Ordering::Relaxed);
    ROWS_WRITTEN_TOTAL.fetch_add(rows as u64, Ordering::Relaxed);
}

pub fn record_ambiguous(rows: usize) {
    AMBIGUOUS_ROWS_TOTAL.fetch_add(rows as u64, Ordering::Relaxed);
}

pub fn record_failed_cycle() {
    FAILED_CYCLES_TOTAL.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub rows_written: u64,
    pub batches_sent: u64,
    pub ambiguous_rows: u64,
    pub failed_cycles: u64,
}

pub fn snapshot() -> CounterSnapshot {
    CounterSnapshot {
        rows_written: ROWS_WRITTEN_TOTAL.load(Ordering::Relaxed),
        batches_sent: BATCHES_SENT_TOTAL.load(Ordering::Relaxed),
        ambiguous_rows: AMBIGUOUS_ROWS_TOTAL.load(Ordering::Relaxed),
        failed_cycles: FAILED_CYCLES_TOTAL.load(Ordering::Relaxed),
    }
}

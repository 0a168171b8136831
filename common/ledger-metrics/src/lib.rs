// SPDX-License-Identifier: Apache-2.0

//! Process-wide Prometheus registry and the gauges/counters/histograms
//! shared across the core's subsystems, in the shape of the teacher's
//! `aptos-metrics-core` wrappers (lazily-registered `once_cell::sync::Lazy`
//! statics pulled from one `prometheus::Registry`).

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, HistogramVec,
    IntCounterVec, IntGaugeVec,
};

pub static BLOCKS_COMMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ledger_blocks_committed_total",
        "Number of blocks committed to the canonical chain",
        &["result"]
    )
    .unwrap()
});

pub static CHAIN_HEAD_NUMBER: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "ledger_chain_head_number",
        "Block number of the current chain head",
        &["chain"]
    )
    .unwrap()
});

pub static MEMPOOL_SIZE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "ledger_mempool_batches",
        "Number of batches currently pending in the publisher's mempool",
        &["state"]
    )
    .unwrap()
});

pub static BLOCK_VALIDATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "ledger_block_validation_seconds",
        "Wall-clock time to fully validate a candidate block",
        &["status"]
    )
    .unwrap()
});

pub static TRANSACTIONS_EXECUTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ledger_transactions_executed_total",
        "Transactions dispatched to a processor, by outcome",
        &["outcome"]
    )
    .unwrap()
});

pub static PROCESSOR_REGISTRY_SIZE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "ledger_processor_registry_workers",
        "Registered transaction-processor workers",
        &["family", "version"]
    )
    .unwrap()
});

/// Forces registration of every metric above; call once at startup so the
/// first scrape already reports zeroed series instead of missing ones.
pub fn init() {
    Lazy::force(&BLOCKS_COMMITTED);
    Lazy::force(&CHAIN_HEAD_NUMBER);
    Lazy::force(&MEMPOOL_SIZE);
    Lazy::force(&BLOCK_VALIDATION_SECONDS);
    Lazy::force(&TRANSACTIONS_EXECUTED);
    Lazy::force(&PROCESSOR_REGISTRY_SIZE);
}

//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Transaction preparation and signing latency
//! - Submission paths and failures
//! - Receipt and order watcher outcomes
//! - Reconciliation merges
//!
//! The host application scrapes them through [`render`]; no listener is opened here.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

lazy_static! {
    // Preparation metrics
    pub static ref TX_PREPARED: CounterVec = register_counter_vec!(
        "wallet_tx_prepared_total",
        "Total transactions prepared and signed",
        &["chain_id"]
    ).unwrap();

    pub static ref SIGNING_LATENCY: HistogramVec = register_histogram_vec!(
        "wallet_tx_signing_latency_seconds",
        "Time spent inside the signer",
        &["chain_id"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0]
    ).unwrap();

    pub static ref NONCE_FALLBACKS: CounterVec = register_counter_vec!(
        "wallet_tx_nonce_fallbacks_total",
        "Nonce calculations that failed and fell back to provider assignment",
        &["chain_id"]
    ).unwrap();

    // Submission metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "wallet_tx_submitted_total",
        "Total transactions broadcast",
        &["chain_id", "path"]
    ).unwrap();

    pub static ref TX_SUBMIT_FAILED: CounterVec = register_counter_vec!(
        "wallet_tx_submit_failed_total",
        "Total rejected submissions by kind",
        &["chain_id", "kind"]
    ).unwrap();

    // Watcher metrics
    pub static ref RECEIPT_TIMEOUTS: CounterVec = register_counter_vec!(
        "wallet_tx_receipt_timeouts_total",
        "Receipt waits that hit the deadline",
        &["chain_id"]
    ).unwrap();

    pub static ref RECEIPTS_OBSERVED: CounterVec = register_counter_vec!(
        "wallet_tx_receipts_total",
        "Receipts observed by outcome",
        &["chain_id", "status"]
    ).unwrap();

    pub static ref ORDERS_RESOLVED: CounterVec = register_counter_vec!(
        "wallet_tx_orders_resolved_total",
        "Orders resolved by status",
        &["status"]
    ).unwrap();

    pub static ref ORDER_TICK_FAILURES: CounterVec = register_counter_vec!(
        "wallet_tx_order_tick_failures_total",
        "Order watcher ticks that failed",
        &[]
    ).unwrap();

    pub static ref ORDER_SUBMISSION_INFERRED_FAILED: CounterVec = register_counter_vec!(
        "wallet_tx_order_submission_inferred_failed_total",
        "Orders never observed by the settlement API within the buffer",
        &[]
    ).unwrap();

    // Reconciliation metrics
    pub static ref RECONCILE_OUTCOMES: CounterVec = register_counter_vec!(
        "wallet_tx_reconcile_total",
        "Receipt merges by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref STALE_UPDATES_DROPPED: CounterVec = register_counter_vec!(
        "wallet_tx_stale_updates_dropped_total",
        "Writes refused because the stored status was already terminal",
        &["writer"]
    ).unwrap();
}

/// Text exposition of every registered metric
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

// Helper functions to record metrics

pub fn record_tx_prepared(chain_id: u64, signing_latency_secs: f64) {
    let chain = chain_id.to_string();
    TX_PREPARED.with_label_values(&[&chain]).inc();
    SIGNING_LATENCY
        .with_label_values(&[&chain])
        .observe(signing_latency_secs);
}

pub fn record_nonce_fallback(chain_id: u64) {
    NONCE_FALLBACKS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_submitted(chain_id: u64, private: bool) {
    let path = if private { "private" } else { "public" };
    TX_SUBMITTED
        .with_label_values(&[&chain_id.to_string(), path])
        .inc();
}

pub fn record_tx_submit_failed(chain_id: u64, kind: &str) {
    TX_SUBMIT_FAILED
        .with_label_values(&[&chain_id.to_string(), kind])
        .inc();
}

pub fn record_receipt_timeout(chain_id: u64) {
    RECEIPT_TIMEOUTS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_receipt(chain_id: u64, success: bool) {
    let status = if success { "success" } else { "failed" };
    RECEIPTS_OBSERVED
        .with_label_values(&[&chain_id.to_string(), status])
        .inc();
}

pub fn record_order_resolved(status: &str) {
    ORDERS_RESOLVED.with_label_values(&[status]).inc();
}

pub fn record_order_tick_failure() {
    ORDER_TICK_FAILURES.with_label_values(&[]).inc();
}

pub fn record_order_submission_inferred_failed() {
    ORDER_SUBMISSION_INFERRED_FAILED.with_label_values(&[]).inc();
}

pub fn record_reconcile(outcome: &str) {
    RECONCILE_OUTCOMES.with_label_values(&[outcome]).inc();
}

pub fn record_stale_update(writer: &str) {
    STALE_UPDATES_DROPPED.with_label_values(&[writer]).inc();
}

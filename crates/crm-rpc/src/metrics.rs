//! Call and refresh counters
//!
//! - `crm_rpc_calls_total` (counter): label `outcome`
//! - `crm_token_refreshes_total` (counter): label `result`
//!
//! No-ops until the binary installs a recorder.

/// Record the final outcome of one logical call.
pub fn record_call(outcome: &'static str) {
    metrics::counter!("crm_rpc_calls_total", "outcome" => outcome).increment(1);
}

/// Record one refresh attempt.
pub fn record_refresh(succeeded: bool) {
    let result = if succeeded { "success" } else { "failure" };
    metrics::counter!("crm_token_refreshes_total", "result" => result).increment(1);
}

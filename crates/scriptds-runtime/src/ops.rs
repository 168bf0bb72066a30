//! Deno ops backing the JavaScript shims.
//!
//! The bootstrap script wires `console.*` to `op_log` and the timer shim to
//! `op_sleep`; nothing else in the module can reach Rust.

use std::time::Duration;

use deno_core::op2;

/// Synchronous logging op - writes to the Rust tracing system.
#[op2(fast)]
pub fn op_log(#[string] level: &str, #[string] msg: &str) {
    match level {
        "error" => tracing::error!(target: "scriptds::js", "{}", msg),
        "warn" => tracing::warn!(target: "scriptds::js", "{}", msg),
        "debug" => tracing::debug!(target: "scriptds::js", "{}", msg),
        "trace" => tracing::trace!(target: "scriptds::js", "{}", msg),
        _ => tracing::info!(target: "scriptds::js", "{}", msg),
    }
}

/// Largest timer delay; anything outside `0..=TIMER_MAX_MS` fires at once.
const TIMER_MAX_MS: f64 = 2_147_483_647.0;

/// Sleep for the specified number of milliseconds.
#[op2(async)]
pub async fn op_sleep(millis: f64) {
    tokio::time::sleep(timer_delay(millis)).await;
}

fn timer_delay(millis: f64) -> Duration {
    if millis.is_finite() && millis > 0.0 && millis <= TIMER_MAX_MS {
        Duration::from_millis(millis as u64)
    } else {
        Duration::ZERO
    }
}

deno_core::extension!(
    scriptds_runtime,
    ops = [op_log, op_sleep],
    esm_entry_point = "ext:scriptds_runtime/bootstrap.js",
    esm = [dir "src", "bootstrap.js"],
);

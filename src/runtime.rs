//! One-time process initialization of the numerical engine
//!
//! candle detaches intermediate gradients during `backward()` unless told
//! otherwise, which drops part of the second-order terms of an inner-loop
//! update even when `first_order` is off. Hosts that want exact
//! meta-gradients call [`init`] once, before any task is built or any
//! backward pass runs.

use once_cell::sync::OnceCell;
use tracing::info;

const DO_NOT_DETACH_VAR: &str = "CANDLE_GRAD_DO_NOT_DETACH";

static INITIALIZED: OnceCell<()> = OnceCell::new();

/// Enable higher-order differentiation for the whole process. Idempotent.
///
/// The engine reads the toggle lazily per thread, so threads that already
/// ran a backward pass keep their previous mode.
///
/// The toggle is an environment variable and is set with
/// `std::env::set_var`, which is not synchronized with other threads reading
/// the environment. Call this from `main` before spawning threads (or
/// building tasks, whose preprocessing pool spawns workers). Under edition
/// 2024 the call becomes `unsafe` for the same reason.
pub fn init() {
    INITIALIZED.get_or_init(|| {
        std::env::set_var(DO_NOT_DETACH_VAR, "1");
        info!("Enabled higher-order gradients ({}=1)", DO_NOT_DETACH_VAR);
    });
}

/// Whether gradients are kept attached to the graph
pub fn higher_order_enabled() -> bool {
    match std::env::var(DO_NOT_DETACH_VAR) {
        Ok(value) => !value.is_empty() && value != "0",
        Err(_) => false,
    }
}

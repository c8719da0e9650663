use std::sync::atomic::{AtomicBool, Ordering};

/// Global readiness flag: set once a forwarding target set has been installed.
///
/// Queries arriving before that moment are held, so the readiness probe is
/// what lets an orchestrator keep traffic away until then.
static TARGETS_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Mark the service as ready. Only the first call logs.
pub fn mark_ready(targets: usize) {
    if !TARGETS_INSTALLED.swap(true, Ordering::SeqCst) {
        log::info!("First forwarding target set installed ({targets} targets), service is ready");
    }
}

/// Check if the service is ready to answer queries without waiting.
pub fn is_ready() -> bool {
    TARGETS_INSTALLED.load(Ordering::SeqCst)
}

/// Reset readiness status (useful for testing)
#[allow(dead_code)]
pub fn reset() {
    TARGETS_INSTALLED.store(false, Ordering::SeqCst);
    log::debug!("Readiness status reset");
}

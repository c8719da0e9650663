use std::{
    pin::pin,
    sync::{Arc, Mutex, PoisonError},
};

use arc_swap::ArcSwapOption;
use pingora_error::Result;
use tokio::sync::Notify;

use super::{Forward, ForwardOptions};

/// Holds the one current forwarder and hands it to request tasks.
///
/// Readers take a lock-free snapshot. Before the first install they park on
/// `installed` and are all woken together by it. Installs are serialized by
/// `update_lock`; the retired forwarder is stopped after the lock is released.
pub struct ForwarderRegistry<F> {
    current: ArcSwapOption<F>,
    installed: Notify,
    update_lock: Mutex<()>,
}

impl<F: Forward> Default for ForwarderRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Forward> ForwarderRegistry<F> {
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            installed: Notify::new(),
            update_lock: Mutex::new(()),
        }
    }

    /// Builds a forwarder for `targets` and makes it current.
    ///
    /// On a build error the current forwarder stays in place.
    pub fn replace(&self, targets: Vec<String>, options: &ForwardOptions) -> Result<()> {
        let retired = {
            let _guard = self.update_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let forwarder = F::build(targets, options)?;
            self.swap(forwarder)
        };

        if let Some(retired) = retired {
            log::debug!("Stopping retired forwarder: {:?}", retired.targets());
            retired.stop();
        }
        Ok(())
    }

    fn swap(&self, forwarder: F) -> Option<Arc<F>> {
        log::info!("Forward servers updated: {:?}", forwarder.targets());
        let retired = self.current.swap(Some(Arc::new(forwarder)));
        self.installed.notify_waiters();
        retired
    }

    /// Returns the current forwarder, waiting for the first install if needed.
    pub async fn current(&self) -> Arc<F> {
        if let Some(forwarder) = self.current.load_full() {
            return forwarder;
        }

        loop {
            let mut notified = pin!(self.installed.notified());
            // register before re-checking so an install in between is not lost
            notified.as_mut().enable();

            if let Some(forwarder) = self.current.load_full() {
                return forwarder;
            }
            notified.await;
        }
    }
}

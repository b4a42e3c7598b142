//! Background Evictor
//!
//! A dedicated thread that brings tiers back within capacity when signalled.
//! Signals coalesce: at most one is pending at any time. The thread exits
//! once the store is dropped.

use std::sync::{Arc, Weak};
use std::thread;

use crossbeam::channel::{self, Sender, TrySendError};
use tracing::{debug, warn};

use super::tiered::TieredStore;
use crate::error::Result;

pub(crate) struct BackgroundEvictor {
    signals: Sender<()>,
}

impl BackgroundEvictor {
    pub(crate) fn spawn(store: &Arc<TieredStore>) -> Result<Self> {
        let (signals, inbox) = channel::bounded::<()>(1);
        let weak: Weak<TieredStore> = Arc::downgrade(store);
        let name = store.name().to_string();

        thread::Builder::new()
            .name(format!("evictor-{}", name))
            .spawn(move || {
                while inbox.recv().is_ok() {
                    let Some(store) = weak.upgrade() else {
                        break;
                    };
                    if let Err(e) = store.enforce_capacity() {
                        warn!(cache = %name, error = %e, "Background eviction failed");
                    }
                }
                debug!(cache = %name, "Background evictor stopped");
            })?;

        Ok(Self { signals })
    }

    /// Request an eviction pass
    pub(crate) fn signal(&self) {
        match self.signals.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {
                warn!("Background evictor is gone; capacity no longer enforced");
            }
        }
    }
}

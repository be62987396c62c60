use std::{collections::BTreeMap, sync::atomic::Ordering};

use bootkeeper_process::{SlotId, SlotOutcome};
use tokio::task::JoinHandle;

use crate::supervisor::Supervisor;

impl Supervisor {
    /// Schedules the one-shot boot sequence: after the configured delay, run
    /// `start_all`. Returns `None` if it was already scheduled on this
    /// supervisor. Manual starts are not affected either way.
    pub fn schedule_auto_start(&self) -> Option<JoinHandle<BTreeMap<SlotId, SlotOutcome>>> {
        if self
            .inner
            .auto_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("auto-start already scheduled; ignoring");
            return None;
        }

        let supervisor = self.clone();
        let delay = self.inner.config.autostart_delay;
        tracing::info!(delay_ms = delay.as_millis() as u64, "auto-start scheduled");

        Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tracing::info!(slots = supervisor.registry().len(), "auto-starting all slots");
            supervisor.start_all().await
        }))
    }

    pub fn auto_start_scheduled(&self) -> bool {
        self.inner.auto_started.load(Ordering::SeqCst)
    }
}

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
};

use bootkeeper_process::{SlotId, SlotOutcome, SlotState, SlotStatus};
use tokio::sync::{Mutex, RwLock};

use crate::{
    broadcaster::{Broadcaster, SharedOutput, Subscription},
    config::SupervisorConfig,
    error::{Result, SupervisorError, format_error_chain},
    output_buffer::OutputBuffer,
    output_pump::OutputPump,
    process_handle::{ProcessHandle, Signal, wait_exited},
    slots::{SlotRegistry, SlotSpec},
};

const PHASE_IDLE: u8 = 0;
const PHASE_STARTING: u8 = 1;
const PHASE_STOPPING: u8 = 2;

/// Marks a slot as mid-operation; resets to idle when dropped, including
/// when the caller abandons the operation.
struct PhaseGuard<'a>(&'a AtomicU8);

impl<'a> PhaseGuard<'a> {
    fn enter(phase: &'a AtomicU8, value: u8) -> Self {
        phase.store(value, Ordering::SeqCst);
        Self(phase)
    }

    fn switch(&self, value: u8) {
        self.0.store(value, Ordering::SeqCst);
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.0.store(PHASE_IDLE, Ordering::SeqCst);
    }
}

struct SlotCell {
    spec: SlotSpec,
    /// Serializes start/stop of this slot.
    op: Mutex<()>,
    process: RwLock<Option<ProcessHandle>>,
    phase: AtomicU8,
    last_error: RwLock<Option<String>>,
    output: SharedOutput,
}

impl SlotCell {
    async fn is_alive(&self) -> bool {
        self.process
            .read()
            .await
            .as_ref()
            .is_some_and(ProcessHandle::is_alive)
    }
}

pub(crate) struct SupervisorInner {
    registry: SlotRegistry,
    slots: BTreeMap<SlotId, SlotCell>,
    broadcaster: Broadcaster,
    pub(crate) config: SupervisorConfig,
    pub(crate) auto_started: AtomicBool,
}

/// Owns every slot's process handle and output buffer. Cheap to clone; all
/// clones share the same state.
#[derive(Clone)]
pub struct Supervisor {
    pub(crate) inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(registry: SlotRegistry, config: SupervisorConfig) -> Self {
        let mut slots = BTreeMap::new();
        let mut outputs = BTreeMap::new();
        for spec in registry.iter() {
            let output: SharedOutput = Arc::new(Mutex::new(OutputBuffer::new(spec.id)));
            outputs.insert(spec.id, output.clone());
            slots.insert(
                spec.id,
                SlotCell {
                    spec: spec.clone(),
                    op: Mutex::new(()),
                    process: RwLock::new(None),
                    phase: AtomicU8::new(PHASE_IDLE),
                    last_error: RwLock::new(None),
                    output,
                },
            );
        }

        let broadcaster = Broadcaster::new(outputs);
        Self {
            inner: Arc::new(SupervisorInner {
                registry,
                slots,
                broadcaster,
                config,
                auto_started: AtomicBool::new(false),
            }),
        }
    }

    pub fn registry(&self) -> &SlotRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.inner.broadcaster
    }

    fn cell(&self, id: SlotId) -> Result<&SlotCell> {
        self.inner
            .slots
            .get(&id)
            .ok_or(SupervisorError::InvalidSlot(id))
    }

    /// Appends a synthetic line to the slot's output and publishes it.
    async fn emit_line(&self, cell: &SlotCell, line: String) {
        let event = cell.output.lock().await.push_line(line);
        self.inner.broadcaster.publish(event).await;
    }

    /// Starts the slot, stopping a live previous instance first.
    pub async fn start(&self, id: SlotId) -> Result<()> {
        let cell = self.cell(id)?;
        let _op = cell.op.lock().await;
        tracing::info!(slot = %id, name = %cell.spec.name, "start requested");

        let phase = PhaseGuard::enter(&cell.phase, PHASE_STARTING);
        if cell.is_alive().await {
            tracing::info!(slot = %id, "slot already running; stopping it before respawn");
            phase.switch(PHASE_STOPPING);
            match self.stop_locked(cell).await {
                Ok(()) | Err(SupervisorError::NotRunning(_)) => {}
                Err(e) => return Err(e),
            }
            phase.switch(PHASE_STARTING);
            tokio::time::sleep(self.inner.config.restart_drain).await;
        }

        let command = cell.spec.shell_command();
        tracing::debug!(slot = %id, command = %command, "spawning");

        match ProcessHandle::spawn(id, &self.inner.config.shell, &command) {
            Ok((handle, streams)) => {
                tracing::info!(
                    slot = %id,
                    pid = handle.pid(),
                    pgid = handle.pgid(),
                    "slot started"
                );
                OutputPump::new(
                    id,
                    cell.output.clone(),
                    self.inner.broadcaster.clone(),
                    handle.exit_watch(),
                    self.inner.config.poll_interval,
                )
                .spawn(streams);
                *cell.process.write().await = Some(handle);
                *cell.last_error.write().await = None;
                Ok(())
            }
            Err(e) => {
                let message = format_error_chain(&e);
                tracing::error!(slot = %id, error = %message, "spawn failed");
                self.emit_line(cell, format!("error starting slot {id}: {message}"))
                    .await;
                *cell.last_error.write().await = Some(message.clone());
                Err(SupervisorError::SpawnFailed { slot: id, message })
            }
        }
    }

    /// SIGINT to the slot's process group, SIGKILL after the grace period.
    pub async fn stop(&self, id: SlotId) -> Result<()> {
        let cell = self.cell(id)?;
        let _op = cell.op.lock().await;
        let _phase = PhaseGuard::enter(&cell.phase, PHASE_STOPPING);
        self.stop_locked(cell).await
    }

    /// Signals the slot's stored process group, if any.
    async fn signal_current(&self, cell: &SlotCell, sig: Signal) -> std::io::Result<()> {
        match cell.process.read().await.as_ref() {
            Some(handle) => handle.signal(sig),
            None => Ok(()),
        }
    }

    /// Caller holds the slot's operation lock.
    ///
    /// The handle stays stored until the process exited or SIGKILL went out,
    /// so an abandoned stop leaves the group tracked and `status` truthful.
    async fn stop_locked(&self, cell: &SlotCell) -> Result<()> {
        let id = cell.spec.id;
        let (pid, pgid, exit_rx) = {
            let process = cell.process.read().await;
            match process.as_ref() {
                Some(h) if h.is_alive() => (h.pid(), h.pgid(), h.exit_watch()),
                _ => return Err(SupervisorError::NotRunning(id)),
            }
        };

        let grace = self.inner.config.stop_grace;
        let started = tokio::time::Instant::now();
        tracing::info!(
            slot = %id,
            pid,
            pgid,
            grace_ms = grace.as_millis() as u64,
            "stop requested; sending SIGINT"
        );

        if let Err(e) = self.signal_current(cell, Signal::Interrupt).await {
            tracing::warn!(slot = %id, error = %e, "SIGINT failed");
            self.emit_line(cell, format!("error stopping slot {id}: SIGINT failed: {e}"))
                .await;
        }

        if wait_exited(exit_rx.clone(), grace).await {
            *cell.process.write().await = None;
            tracing::info!(
                slot = %id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "slot stopped after SIGINT"
            );
            return Ok(());
        }

        tracing::warn!(slot = %id, pgid, "still alive after grace; sending SIGKILL");
        if let Err(e) = self.signal_current(cell, Signal::Kill).await {
            tracing::warn!(slot = %id, error = %e, "SIGKILL failed");
            self.emit_line(cell, format!("error stopping slot {id}: SIGKILL failed: {e}"))
                .await;
        }
        *cell.process.write().await = None;
        if !wait_exited(exit_rx, self.inner.config.poll_interval).await {
            tracing::warn!(slot = %id, pid, "process not yet reaped after SIGKILL");
        }
        Ok(())
    }

    /// Whether the slot's process is alive right now.
    pub async fn status(&self, id: SlotId) -> Result<bool> {
        Ok(self.cell(id)?.is_alive().await)
    }

    pub async fn state(&self, id: SlotId) -> Result<SlotState> {
        let cell = self.cell(id)?;
        Ok(self.derive_state(cell).await)
    }

    async fn derive_state(&self, cell: &SlotCell) -> SlotState {
        match cell.phase.load(Ordering::SeqCst) {
            PHASE_STARTING => return SlotState::Starting,
            PHASE_STOPPING => return SlotState::Stopping,
            _ => {}
        }
        if cell.is_alive().await {
            SlotState::Running
        } else if cell.last_error.read().await.is_some() {
            SlotState::Failed
        } else {
            SlotState::Stopped
        }
    }

    pub async fn slot_status(&self, id: SlotId) -> Result<SlotStatus> {
        let cell = self.cell(id)?;
        let state = self.derive_state(cell).await;
        let process = cell.process.read().await;
        let handle = process.as_ref();
        Ok(SlotStatus {
            id,
            name: cell.spec.name.clone(),
            state,
            pid: handle.filter(|h| h.is_alive()).map(ProcessHandle::pid),
            pgid: handle.filter(|h| h.is_alive()).map(ProcessHandle::pgid),
            started_at: handle.map(ProcessHandle::started_at),
            exit_code: handle.and_then(|h| h.exit_info()).and_then(|i| i.code),
            message: cell.last_error.read().await.clone(),
        })
    }

    pub async fn statuses(&self) -> Vec<SlotStatus> {
        let mut out = Vec::with_capacity(self.inner.slots.len());
        for id in self.inner.registry.ids() {
            if let Ok(status) = self.slot_status(id).await {
                out.push(status);
            }
        }
        out
    }

    /// Starts every slot in ascending order, sleeping each slot's settle
    /// delay after its start. Failures do not abort the sequence.
    pub async fn start_all(&self) -> BTreeMap<SlotId, SlotOutcome> {
        let mut results = BTreeMap::new();
        for spec in self.inner.registry.iter() {
            let outcome = match self.start(spec.id).await {
                Ok(()) => SlotOutcome::Started,
                Err(e) => SlotOutcome::Failed {
                    reason: e.to_string(),
                },
            };
            results.insert(spec.id, outcome);
            tokio::time::sleep(spec.settle_delay).await;
        }
        tracing::info!(results = ?outcome_labels(&results), "start-all completed");
        results
    }

    pub async fn stop_all(&self) -> BTreeMap<SlotId, SlotOutcome> {
        let mut results = BTreeMap::new();
        for id in self.inner.registry.ids() {
            let outcome = match self.stop(id).await {
                Ok(()) => SlotOutcome::Stopped,
                Err(e) => SlotOutcome::Failed {
                    reason: e.to_string(),
                },
            };
            results.insert(id, outcome);
        }
        tracing::info!(results = ?outcome_labels(&results), "stop-all completed");
        results
    }

    /// Up to `n` most recent lines of the slot, oldest first.
    pub async fn recent_output(&self, id: SlotId, n: usize) -> Result<Vec<String>> {
        let cell = self.cell(id)?;
        Ok(cell.output.lock().await.tail(n))
    }

    pub async fn subscribe(&self) -> Subscription {
        self.inner.broadcaster.connect().await
    }

    /// Best-effort teardown: stop every running slot and drop observers.
    pub async fn shutdown(&self) {
        let mut running = Vec::new();
        for id in self.inner.registry.ids() {
            if self.status(id).await.unwrap_or(false) {
                running.push(id);
            }
        }
        tracing::info!(running = running.len(), "shutting down supervisor");
        for id in running {
            if let Err(e) = self.stop(id).await {
                tracing::debug!(slot = %id, error = %e, "stop during shutdown");
            }
        }
        self.inner.broadcaster.shutdown().await;
    }
}

fn outcome_labels(results: &BTreeMap<SlotId, SlotOutcome>) -> BTreeMap<u32, &'static str> {
    results.iter().map(|(id, o)| (id.0, o.label())).collect()
}

//! In-memory collaborators for running the firmware core on a host.
//!
//! Every simulator is a cheap handle over shared state: give one clone to
//! the code under test and keep another to inspect or steer it.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::lights::{Dimmer, LightError};
use crate::network::link::{EventSink, LinkConfig, LinkDriver, LinkError, LinkEvent, LinkRole};
use crate::network::service::{ServiceError, ServiceFactory};
use crate::ota::restart::Restarter;
use crate::ota::slots::{BootState, SlotStorage, StorageError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCall {
    SetMode(LinkRole),
    SetConfig(LinkConfig),
    Connect,
    Disconnect,
    Subscribe,
}

#[derive(Default)]
struct LinkState {
    calls: Vec<LinkCall>,
    sink: Option<EventSink>,
    failures: Vec<(&'static str, usize)>,
}

/// Records driver calls; events are injected with [`SimLink::emit`].
#[derive(Clone, Default)]
pub struct SimLink {
    state: Arc<Mutex<LinkState>>,
}

impl SimLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<LinkCall> {
        lock(&self.state).calls.clone()
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| **c == LinkCall::Connect)
            .count()
    }

    pub fn last_role(&self) -> Option<LinkRole> {
        lock(&self.state).calls.iter().rev().find_map(|c| match c {
            LinkCall::SetMode(role) => Some(*role),
            _ => None,
        })
    }

    /// Makes the next `times` calls of `op` fail
    pub fn fail_next(&self, op: &'static str, times: usize) {
        lock(&self.state).failures.push((op, times));
    }

    /// Delivers `event` through the subscribed sink. Returns `false` when
    /// nothing is subscribed.
    pub fn emit(&self, event: LinkEvent) -> bool {
        let sink = lock(&self.state).sink.clone();
        match sink {
            Some(sink) => {
                sink(event);
                true
            }
            None => false,
        }
    }

    fn record(&self, op: &'static str, call: LinkCall) -> Result<(), LinkError> {
        let mut state = lock(&self.state);
        if let Some(entry) = state.failures.iter_mut().find(|entry| entry.0 == op && entry.1 > 0) {
            entry.1 -= 1;
            return Err(LinkError::new(op, "injected failure"));
        }
        state.calls.push(call);
        Ok(())
    }
}

impl LinkDriver for SimLink {
    fn set_mode(&mut self, role: LinkRole) -> Result<(), LinkError> {
        self.record("set_mode", LinkCall::SetMode(role))
    }

    fn set_config(&mut self, config: &LinkConfig) -> Result<(), LinkError> {
        self.record("set_config", LinkCall::SetConfig(config.clone()))
    }

    fn connect(&mut self) -> Result<(), LinkError> {
        self.record("connect", LinkCall::Connect)
    }

    fn disconnect(&mut self) -> Result<(), LinkError> {
        self.record("disconnect", LinkCall::Disconnect)
    }

    fn subscribe(&mut self, sink: EventSink) -> Result<(), LinkError> {
        self.record("subscribe", LinkCall::Subscribe)?;
        lock(&self.state).sink = Some(sink);
        Ok(())
    }
}

#[derive(Default)]
struct ServiceState {
    active: Option<LinkRole>,
    binds: Vec<LinkRole>,
    fail_next: bool,
}

#[derive(Clone, Default)]
pub struct SimServiceFactory {
    state: Arc<Mutex<ServiceState>>,
}

/// A bound listener; dropping it unbinds
pub struct SimService {
    state: Arc<Mutex<ServiceState>>,
}

impl Drop for SimService {
    fn drop(&mut self) {
        lock(&self.state).active = None;
    }
}

impl SimServiceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<LinkRole> {
        lock(&self.state).active
    }

    pub fn binds(&self) -> Vec<LinkRole> {
        lock(&self.state).binds.clone()
    }

    pub fn fail_next_bind(&self) {
        lock(&self.state).fail_next = true;
    }
}

impl ServiceFactory for SimServiceFactory {
    type Service = SimService;

    fn bind(&mut self, role: LinkRole) -> Result<SimService, ServiceError> {
        let mut state = lock(&self.state);
        if std::mem::take(&mut state.fail_next) {
            return Err(ServiceError::Bind("injected failure".into()));
        }
        if state.active.is_some() {
            return Err(ServiceError::Bind("port 80 already bound".into()));
        }
        state.active = Some(role);
        state.binds.push(role);
        Ok(SimService {
            state: self.state.clone(),
        })
    }
}

#[derive(Clone)]
pub struct SimDimmer {
    duties: Arc<Mutex<Vec<u8>>>,
}

impl SimDimmer {
    pub fn new(channels: usize) -> Self {
        Self {
            duties: Arc::new(Mutex::new(vec![0; channels])),
        }
    }

    pub fn duties(&self) -> Vec<u8> {
        lock(&self.duties).clone()
    }
}

impl Dimmer for SimDimmer {
    fn channels(&self) -> usize {
        lock(&self.duties).len()
    }

    fn set_duty(&mut self, channel: usize, duty: u8) -> Result<(), LightError> {
        let mut duties = lock(&self.duties);
        let slot = duties
            .get_mut(channel)
            .ok_or_else(|| LightError::Driver(format!("channel {} not wired", channel)))?;
        *slot = duty;
        Ok(())
    }
}

/// Counts restarts instead of performing them
#[derive(Clone, Default)]
pub struct SimRestarter {
    inner: Arc<(Mutex<usize>, Condvar)>,
}

impl SimRestarter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        *lock(&self.inner.0)
    }

    /// Blocks until at least one restart was requested or `timeout` passes
    pub fn wait(&self, timeout: Duration) -> bool {
        let (count, cvar) = &*self.inner;
        let guard = lock(count);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |n| *n == 0)
            .unwrap_or_else(PoisonError::into_inner);
        *guard > 0
    }
}

impl Restarter for SimRestarter {
    fn restart(&self) {
        let (count, cvar) = &*self.inner;
        *lock(count) += 1;
        cvar.notify_all();
    }
}

struct SlotsState {
    images: [Vec<u8>; 2],
    staging: [Vec<u8>; 2],
    states: [BootState; 2],
    running: usize,
    boot: usize,
    single_slot: bool,
    open_writer: Option<usize>,
    transient_failures: usize,
    fail_finalize: bool,
    fail_set_boot: bool,
    aborts: usize,
}

/// Two firmware slots with bootloader-style rollback on [`SimSlots::reboot`]
#[derive(Clone)]
pub struct SimSlots {
    state: Arc<Mutex<SlotsState>>,
}

#[derive(Debug)]
pub struct SimWriter {
    slot: usize,
}

impl SimSlots {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SlotsState {
                images: [b"factory image".to_vec(), Vec::new()],
                staging: [Vec::new(), Vec::new()],
                states: [BootState::Valid, BootState::Undefined],
                running: 0,
                boot: 0,
                single_slot: false,
                open_writer: None,
                transient_failures: 0,
                fail_finalize: false,
                fail_set_boot: false,
                aborts: 0,
            })),
        }
    }

    /// Partition table without a second app slot
    pub fn single_slot() -> Self {
        let slots = Self::new();
        lock(&slots.state).single_slot = true;
        slots
    }

    /// Writes a finished image and selects it, as a completed update would
    pub fn install_image(&self, slot: usize, image: &[u8]) {
        let mut state = lock(&self.state);
        state.images[slot] = image.to_vec();
        state.states[slot] = BootState::New;
        state.boot = slot;
    }

    /// Simulates a reset. An image restarted while still pending
    /// verification is invalidated and the previous slot boots instead.
    pub fn reboot(&self) {
        let mut state = lock(&self.state);
        let mut target = state.boot;
        let running = state.running;
        if target == running && state.states[running] == BootState::PendingVerify {
            state.states[running] = BootState::Invalid;
            target = 1 - running;
            state.boot = target;
        }
        if state.states[target] == BootState::New {
            state.states[target] = BootState::PendingVerify;
        }
        state.running = target;
        state.open_writer = None;
    }

    pub fn state(&self, slot: usize) -> BootState {
        lock(&self.state).states[slot]
    }

    pub fn running_slot_index(&self) -> usize {
        lock(&self.state).running
    }

    pub fn boot_slot_index(&self) -> usize {
        lock(&self.state).boot
    }

    pub fn image(&self, slot: usize) -> Vec<u8> {
        lock(&self.state).images[slot].clone()
    }

    /// Bytes streamed into `slot` so far by an open writer
    pub fn written(&self, slot: usize) -> Vec<u8> {
        lock(&self.state).staging[slot].clone()
    }

    pub fn fail_writes_transient(&self, times: usize) {
        lock(&self.state).transient_failures = times;
    }

    pub fn fail_finalize(&self) {
        lock(&self.state).fail_finalize = true;
    }

    pub fn fail_set_boot(&self) {
        lock(&self.state).fail_set_boot = true;
    }

    pub fn aborts(&self) -> usize {
        lock(&self.state).aborts
    }

    fn check_slot(slot: usize) -> Result<(), StorageError> {
        if slot < 2 {
            Ok(())
        } else {
            Err(StorageError::Failed(format!("no slot {}", slot)))
        }
    }
}

impl Default for SimSlots {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotStorage for SimSlots {
    type Slot = usize;
    type Writer = SimWriter;

    fn running_slot(&self) -> Result<usize, StorageError> {
        Ok(lock(&self.state).running)
    }

    fn boot_slot(&self) -> Result<usize, StorageError> {
        Ok(lock(&self.state).boot)
    }

    fn inactive_slot(&self) -> Result<usize, StorageError> {
        let state = lock(&self.state);
        if state.single_slot {
            return Err(StorageError::NoInactiveSlot);
        }
        Ok(1 - state.running)
    }

    fn begin_write(&mut self, slot: usize) -> Result<SimWriter, StorageError> {
        Self::check_slot(slot)?;
        let mut state = lock(&self.state);
        if slot == state.running {
            return Err(StorageError::Failed("cannot write the running slot".into()));
        }
        if state.open_writer.is_some() {
            return Err(StorageError::Failed("a writer is already open".into()));
        }
        state.staging[slot].clear();
        state.images[slot].clear();
        state.states[slot] = BootState::Undefined;
        state.open_writer = Some(slot);
        Ok(SimWriter { slot })
    }

    fn write(&mut self, writer: &mut SimWriter, bytes: &[u8]) -> Result<(), StorageError> {
        let mut state = lock(&self.state);
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(StorageError::Transient("flash busy".into()));
        }
        state.staging[writer.slot].extend_from_slice(bytes);
        Ok(())
    }

    fn finalize(&mut self, writer: SimWriter) -> Result<(), StorageError> {
        let mut state = lock(&self.state);
        state.open_writer = None;
        if std::mem::take(&mut state.fail_finalize) {
            state.staging[writer.slot].clear();
            return Err(StorageError::Failed("image validation failed".into()));
        }
        let image = std::mem::take(&mut state.staging[writer.slot]);
        state.images[writer.slot] = image;
        state.states[writer.slot] = BootState::New;
        Ok(())
    }

    fn abort(&mut self, writer: SimWriter) {
        let mut state = lock(&self.state);
        state.open_writer = None;
        state.staging[writer.slot].clear();
        state.aborts += 1;
    }

    fn set_boot_slot(&mut self, slot: usize) -> Result<(), StorageError> {
        Self::check_slot(slot)?;
        let mut state = lock(&self.state);
        if std::mem::take(&mut state.fail_set_boot) {
            return Err(StorageError::Failed("boot pointer write failed".into()));
        }
        if matches!(state.states[slot], BootState::Undefined | BootState::Invalid) {
            return Err(StorageError::Failed("slot holds no finalized image".into()));
        }
        state.boot = slot;
        Ok(())
    }

    fn boot_state(&self, slot: usize) -> Result<BootState, StorageError> {
        Self::check_slot(slot)?;
        Ok(lock(&self.state).states[slot])
    }

    fn mark_valid(&mut self, slot: usize) -> Result<(), StorageError> {
        Self::check_slot(slot)?;
        lock(&self.state).states[slot] = BootState::Valid;
        Ok(())
    }

    fn rollback_and_reboot(&mut self) -> Result<(), StorageError> {
        {
            let mut state = lock(&self.state);
            let running = state.running;
            if state.states[1 - running] != BootState::Valid {
                return Err(StorageError::Failed("no valid image to roll back to".into()));
            }
            state.states[running] = BootState::Invalid;
            state.boot = 1 - running;
        }
        self.reboot();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfirmed_image_rolls_back_on_second_reboot() {
        let slots = SimSlots::new();
        slots.install_image(1, b"v2");
        slots.reboot();
        assert_eq!(slots.running_slot_index(), 1);
        assert_eq!(slots.state(1), BootState::PendingVerify);

        slots.reboot();
        assert_eq!(slots.running_slot_index(), 0);
        assert_eq!(slots.state(1), BootState::Invalid);
    }

    #[test]
    fn emit_without_subscriber_is_dropped() {
        let link = SimLink::new();
        assert!(!link.emit(LinkEvent::LinkDown));
    }
}

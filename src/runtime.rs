//! Motor-control runtime contract.
//!
//! The protocol engine asks the runtime for two things: the current system
//! status word (checked against each parameter's write-deny mask) and an
//! exclusive reload lock taken before flash is erased or programmed, which
//! the runtime refuses while the drive must not be interrupted.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Power stage enabled
pub const STATUS_ENABLED: u32 = 0x0000_0001;
/// Motor in motion
pub const STATUS_MOVING: u32 = 0x0000_0002;
/// Fault latched
pub const STATUS_FAULT: u32 = 0x0000_0004;
/// Firmware reload in progress
pub const STATUS_RELOADING: u32 = 0x0000_0008;

/// Services the protocol engine consumes from the motor-control runtime
pub trait DriveRuntime: Send + Sync {
    /// Current system status bits
    fn system_status(&self) -> u32;

    /// Try to take the exclusive reload lock; `false` if refused
    fn try_lock_reload(&self) -> bool;

    /// Release a lock obtained from [`DriveRuntime::try_lock_reload`]
    fn release_reload(&self);
}

/// Reload lock released on drop
pub struct ReloadGuard<'a> {
    runtime: &'a dyn DriveRuntime,
}

impl<'a> ReloadGuard<'a> {
    /// Take the reload lock, or `None` if the runtime refuses it
    pub fn acquire(runtime: &'a dyn DriveRuntime) -> Option<Self> {
        runtime.try_lock_reload().then_some(Self { runtime })
    }
}

impl Drop for ReloadGuard<'_> {
    fn drop(&mut self) {
        self.runtime.release_reload();
    }
}

/// Runtime stand-in for hosts without a motor-control loop
#[derive(Debug, Default)]
pub struct SimulatedDrive {
    status: AtomicU32,
    reload_locked: AtomicBool,
    refuse_reload: AtomicBool,
}

impl SimulatedDrive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, status: u32) {
        self.status.store(status, Ordering::Release);
    }

    /// Make the drive refuse (or grant again) the reload lock
    pub fn refuse_reload(&self, refuse: bool) {
        self.refuse_reload.store(refuse, Ordering::Release);
    }

    pub fn is_reload_locked(&self) -> bool {
        self.reload_locked.load(Ordering::Acquire)
    }
}

impl DriveRuntime for SimulatedDrive {
    fn system_status(&self) -> u32 {
        let status = self.status.load(Ordering::Acquire);
        if self.is_reload_locked() {
            status | STATUS_RELOADING
        } else {
            status
        }
    }

    fn try_lock_reload(&self) -> bool {
        if self.refuse_reload.load(Ordering::Acquire) || self.status.load(Ordering::Acquire) & STATUS_MOVING != 0 {
            return false;
        }
        self.reload_locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release_reload(&self) {
        self.reload_locked.store(false, Ordering::Release);
    }
}

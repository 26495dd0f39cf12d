//! Normal-mode channel seam.
//!
//! While the device runs its regular OS it is only reachable through the
//! lockdown service, which reads identity values and asks the device to
//! reboot into recovery. The wire protocol lives outside this crate; the
//! restore flow talks to it through [`NormalModeChannel`].

use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

use crate::protocol::DeviceIdentity;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("No normal-mode channel is available")]
    Unavailable,

    #[error("No device reachable over the normal-mode channel")]
    NoDevice,

    #[error("Normal-mode channel error: {0}")]
    Protocol(String),
}

/// Operations the restore flow needs from a device booted into its OS.
pub trait NormalModeChannel {
    /// Identity values (ECID, chip, board, UDID) of the connected device.
    fn read_identity(&mut self) -> Result<DeviceIdentity, ChannelError>;

    fn read_nonce(&mut self) -> Result<Option<Vec<u8>>, ChannelError>;

    /// Ask the device to reboot into recovery mode.
    fn enter_recovery(&mut self) -> Result<(), ChannelError>;

    /// Whether the device is running the restore ramdisk rather than its OS.
    fn is_restore_mode(&mut self) -> Result<bool, ChannelError>;

    fn reboot(&mut self) -> Result<(), ChannelError>;
}

/// Placeholder used when no lockdown implementation is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoNormalModeChannel;

impl NormalModeChannel for NoNormalModeChannel {
    fn read_identity(&mut self) -> Result<DeviceIdentity, ChannelError> {
        Err(ChannelError::Unavailable)
    }

    fn read_nonce(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        Err(ChannelError::Unavailable)
    }

    fn enter_recovery(&mut self) -> Result<(), ChannelError> {
        Err(ChannelError::Unavailable)
    }

    fn is_restore_mode(&mut self) -> Result<bool, ChannelError> {
        Err(ChannelError::Unavailable)
    }

    fn reboot(&mut self) -> Result<(), ChannelError> {
        Err(ChannelError::Unavailable)
    }
}

/// Calls recorded by [`MockChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelCall {
    ReadIdentity,
    ReadNonce,
    EnterRecovery,
    IsRestoreMode,
    Reboot,
}

#[derive(Debug, Default)]
struct MockChannelState {
    identity: DeviceIdentity,
    nonce: Option<Vec<u8>>,
    restore_mode: bool,
    calls: Vec<ChannelCall>,
}

/// Scripted normal-mode channel for tests. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockChannel {
    state: Arc<Mutex<MockChannelState>>,
}

impl MockChannel {
    pub fn new(identity: DeviceIdentity) -> Self {
        let channel = Self::default();
        channel.lock().identity = identity;
        channel
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_restore_mode(&self, restore: bool) {
        self.lock().restore_mode = restore;
    }

    pub fn set_nonce(&self, nonce: Option<Vec<u8>>) {
        self.lock().nonce = nonce;
    }

    pub fn calls(&self) -> Vec<ChannelCall> {
        self.lock().calls.clone()
    }

    fn record(&self, call: ChannelCall) {
        self.lock().calls.push(call);
    }
}

impl NormalModeChannel for MockChannel {
    fn read_identity(&mut self) -> Result<DeviceIdentity, ChannelError> {
        self.record(ChannelCall::ReadIdentity);
        Ok(self.lock().identity.clone())
    }

    fn read_nonce(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        self.record(ChannelCall::ReadNonce);
        Ok(self.lock().nonce.clone())
    }

    fn enter_recovery(&mut self) -> Result<(), ChannelError> {
        self.record(ChannelCall::EnterRecovery);
        Ok(())
    }

    fn is_restore_mode(&mut self) -> Result<bool, ChannelError> {
        self.record(ChannelCall::IsRestoreMode);
        Ok(self.lock().restore_mode)
    }

    fn reboot(&mut self) -> Result<(), ChannelError> {
        // A rebooted device comes back in its OS.
        self.record(ChannelCall::Reboot);
        self.lock().restore_mode = false;
        Ok(())
    }
}

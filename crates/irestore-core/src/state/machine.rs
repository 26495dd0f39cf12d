//! Restore state machine bookkeeping.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::protocol::DeviceMode;
use crate::tss::SigningTicket;

/// Orchestrator states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RestoreState {
    #[default]
    Detecting,
    NormalMode,
    RecoveryMode,
    DfuMode,
    WtfMode,
    EnteringRecovery,
    RecoveryReady,
    StagingComponents,
    Rebooting,
    Done,
    Failed,
}

impl fmt::Display for RestoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestoreState::Detecting => "Detecting",
            RestoreState::NormalMode => "NormalMode",
            RestoreState::RecoveryMode => "RecoveryMode",
            RestoreState::DfuMode => "DfuMode",
            RestoreState::WtfMode => "WtfMode",
            RestoreState::EnteringRecovery => "EnteringRecovery",
            RestoreState::RecoveryReady => "RecoveryReady",
            RestoreState::StagingComponents => "StagingComponents",
            RestoreState::Rebooting => "Rebooting",
            RestoreState::Done => "Done",
            RestoreState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

impl RestoreState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RestoreState::Done | RestoreState::Failed)
    }
}

/// Runtime state carried between handlers.
#[derive(Debug, Default)]
pub struct StateMachineContext {
    pub state: RestoreState,
    /// Every state entered, in order.
    pub history: Vec<RestoreState>,
    /// Last detected device mode.
    pub mode: Option<DeviceMode>,
    /// ECID of the device under restore, once known.
    pub ecid: u64,
    pub chip_id: u32,
    /// Board ID reported by the bootloader, once known.
    pub board_id: Option<u32>,
    /// Current anti-replay nonce.
    pub nonce: Option<Vec<u8>>,
    pub ticket: Option<SigningTicket>,
    /// Number of times detection restarted.
    pub redetects: u32,
    /// iBEC already loaded from stock recovery.
    pub ibec_loaded: bool,
    /// Components uploaded and loaded, in order.
    pub staged: Vec<&'static str>,
    /// Device probes issued by detection and polling.
    pub probes: u32,
    quit: Arc<AtomicBool>,
}

impl StateMachineContext {
    pub fn new(quit: Arc<AtomicBool>) -> Self {
        Self {
            history: vec![RestoreState::Detecting],
            quit,
            ..Default::default()
        }
    }

    /// Transition to a new state.
    pub fn goto_state(&mut self, new_state: RestoreState) {
        tracing::info!(from = %self.state, to = %new_state, "State transition");
        self.state = new_state;
        self.history.push(new_state);
    }

    /// Quit was requested by the caller.
    pub fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    pub fn should_continue(&self) -> bool {
        !self.quit_requested() && !self.state.is_terminal()
    }
}

//! Restore session - high-level orchestrator for the whole restore.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use crate::archive::FirmwareArchive;
use crate::error::{RestoreError, RestoreFailure};
use crate::events::{RestoreEvent, RestoreObserver, TracingObserver};
use crate::lockdown::{NoNormalModeChannel, NormalModeChannel};
use crate::manifest::RestoreBehavior;
use crate::retry::RetryPolicy;
use crate::state::handlers::{HandleResult, HandlerContext, handle_state};
use crate::state::machine::{RestoreState, StateMachineContext};
use crate::transport::DeviceConnector;
use crate::tss::{DEFAULT_TSS_URL, TssTransport};

/// Restore feature flags.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreFlags {
    /// Full erase instead of an update install.
    pub erase: bool,
    /// Firmware is user-built; skip signing.
    pub custom: bool,
    /// Device runs an exploited DFU stage; DFU uploads skip signing.
    pub exploit: bool,
    /// Stop after detecting the device.
    pub no_action: bool,
    /// Restore the newest available firmware.
    pub latest: bool,
}

/// Configuration for a restore session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Only talk to the device with this ECID.
    pub ecid: Option<u64>,
    /// Signing server URL.
    pub url: String,
    pub flags: RestoreFlags,
    /// Override for the kernel boot-args.
    pub boot_args: Option<String>,
    /// Budget for opening a bootloader connection.
    pub connect_retry: RetryPolicy,
    /// Budget for waiting on a mode change.
    pub recovery_poll: RetryPolicy,
    /// Budget for finding the device again after iBSS resets it.
    pub reconnect_poll: RetryPolicy,
    /// Pause after the ramdisk command.
    pub ramdisk_delay_ms: u64,
    /// Pause before reconnecting to a device that just took iBSS or WTF.
    pub dfu_reconnect_delay_ms: u64,
    /// Pause while iBEC starts.
    pub ibec_delay_ms: u64,
    pub usb_timeout_ms: u64,
    /// Load iBEC from stock recovery before staging.
    pub boot_ibec: bool,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            ecid: None,
            url: DEFAULT_TSS_URL.to_string(),
            flags: RestoreFlags::default(),
            boot_args: None,
            connect_retry: RetryPolicy::connect(),
            recovery_poll: RetryPolicy::connect(),
            reconnect_poll: RetryPolicy::reconnect(),
            ramdisk_delay_ms: 2_000,
            dfu_reconnect_delay_ms: 2_000,
            ibec_delay_ms: 7_000,
            usb_timeout_ms: crate::protocol::USB_TIMEOUT_MS,
            boot_ibec: false,
        }
    }
}

impl RestoreConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RestoreConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject flag combinations that cannot work together.
    pub fn validate(&self) -> Result<(), RestoreError> {
        if self.flags.latest && self.flags.custom {
            return Err(RestoreError::Configuration(
                "latest firmware cannot be combined with custom firmware".into(),
            ));
        }
        if self.url.trim().is_empty() && !self.flags.custom {
            return Err(RestoreError::Configuration(
                "signing server URL is empty".into(),
            ));
        }
        if self.connect_retry.attempts == 0
            || self.recovery_poll.attempts == 0
            || self.reconnect_poll.attempts == 0
        {
            return Err(RestoreError::Configuration(
                "retry budgets need at least one attempt".into(),
            ));
        }
        Ok(())
    }

    pub fn behavior(&self) -> RestoreBehavior {
        if self.flags.erase {
            RestoreBehavior::Erase
        } else {
            RestoreBehavior::Update
        }
    }
}

/// Restore session - orchestrates the complete restore.
pub struct RestoreSession<C: DeviceConnector, O: RestoreObserver> {
    config: RestoreConfig,
    connector: C,
    archive: Box<dyn FirmwareArchive>,
    channel: Box<dyn NormalModeChannel>,
    signer: Box<dyn TssTransport>,
    observer: Arc<O>,
    quit: Arc<AtomicBool>,
    history: Vec<RestoreState>,
    probes: u32,
}

impl<C: DeviceConnector> RestoreSession<C, TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(
        config: RestoreConfig,
        connector: C,
        archive: impl FirmwareArchive + 'static,
        signer: impl TssTransport + 'static,
    ) -> Self {
        Self::with_observer(config, connector, archive, signer, Arc::new(TracingObserver))
    }
}

impl<C: DeviceConnector, O: RestoreObserver> RestoreSession<C, O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(
        config: RestoreConfig,
        connector: C,
        archive: impl FirmwareArchive + 'static,
        signer: impl TssTransport + 'static,
        observer: Arc<O>,
    ) -> Self {
        Self {
            config,
            connector,
            archive: Box::new(archive),
            channel: Box::new(NoNormalModeChannel),
            signer: Box::new(signer),
            observer,
            quit: Arc::new(AtomicBool::new(false)),
            history: Vec::new(),
            probes: 0,
        }
    }

    /// Use `channel` to reach devices booted into their OS.
    pub fn with_channel(mut self, channel: impl NormalModeChannel + 'static) -> Self {
        self.channel = Box::new(channel);
        self
    }

    /// Setting the returned flag stops the session at the next state boundary.
    pub fn quit_handle(&self) -> Arc<AtomicBool> {
        self.quit.clone()
    }

    pub fn config(&self) -> &RestoreConfig {
        &self.config
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// States visited by the last run.
    pub fn history(&self) -> &[RestoreState] {
        &self.history
    }

    /// Device probes issued by the last run.
    pub fn probe_count(&self) -> u32 {
        self.probes
    }

    /// Run the complete restore session.
    #[instrument(skip(self))]
    pub fn run(&mut self) -> Result<(), RestoreFailure> {
        let mut state = StateMachineContext::new(self.quit.clone());
        let result = self.drive(&mut state);

        self.history = state.history.clone();
        self.probes = state.probes;

        match result {
            Ok(()) => {
                info!(probes = state.probes, "Restore session complete");
                Ok(())
            }
            Err(error) => {
                let failed_in = state.state;
                state.goto_state(RestoreState::Failed);
                self.history = state.history;
                error!(state = %failed_in, kind = %error.kind(), error = %error, "Restore failed");
                self.observer.on_event(&RestoreEvent::Error {
                    state: failed_in,
                    kind: error.kind(),
                    message: error.to_string(),
                });
                Err(RestoreFailure {
                    state: failed_in,
                    error,
                })
            }
        }
    }

    fn drive(&mut self, state: &mut StateMachineContext) -> Result<(), RestoreError> {
        self.config.validate()?;

        // The identity is picked once the device reports its chip and board.
        let manifest = self.archive.build_manifest()?;
        info!(
            product_version = manifest.product_version(),
            build_version = manifest.build_version(),
            identities = manifest.identities().len(),
            "Loaded build manifest"
        );

        let mut ctx = HandlerContext::new(
            &mut self.connector,
            &*self.archive,
            &mut *self.channel,
            &*self.signer,
            &*self.observer,
            &self.config,
            &manifest,
            state,
        );

        let result = run_state_machine(&mut ctx);
        // Every exit path gives the device handle back.
        ctx.release_client();
        result
    }
}

fn run_state_machine<C: DeviceConnector, O: RestoreObserver>(
    ctx: &mut HandlerContext<'_, C, O>,
) -> Result<(), RestoreError> {
    loop {
        match handle_state(ctx)? {
            HandleResult::Next(next) => {
                let from = ctx.state.state;
                ctx.state.goto_state(next);
                ctx.emit(RestoreEvent::StateChanged { from, to: next });
            }
            HandleResult::Finished => {
                let from = ctx.state.state;
                if from != RestoreState::Done {
                    ctx.state.goto_state(RestoreState::Done);
                    ctx.emit(RestoreEvent::StateChanged {
                        from,
                        to: RestoreState::Done,
                    });
                }
                ctx.emit(RestoreEvent::Complete);
                return Ok(());
            }
        }
    }
}

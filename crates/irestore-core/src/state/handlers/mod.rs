//! State handlers - one per orchestrator state.
//!
//! This module is split into submodules by phase:
//! - `detect`: device discovery and the normal-mode hop into recovery
//! - `dfu`: DFU and WTF boot stages
//! - `recovery`: recovery connection, signing ticket, auto-boot
//! - `staging`: ordered component upload and the final boot trigger

mod detect;
mod dfu;
mod recovery;
mod staging;

use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::archive::FirmwareArchive;
use crate::client::RecoveryClient;
use crate::error::RestoreError;
use crate::events::{EventAction, EventKind, HubEvent, LogLevel, RestoreEvent, RestoreObserver};
use crate::lockdown::NormalModeChannel;
use crate::manifest::{BuildIdentity, BuildManifest};
use crate::protocol::{DEFAULT_BOOT_ARGS, DeviceMode, TICKET_MIN_BUILD_MAJOR};
use crate::retry::{Attempt, RetryError, RetryPolicy, retry_with_backoff};
use crate::session::RestoreConfig;
use crate::state::machine::{RestoreState, StateMachineContext};
use crate::transport::{DeviceConnector, DeviceFilter, TransportError};
use crate::tss::{self, SigningTicket, TicketKey, TssError, TssTransport};

pub use recovery::disable_autoboot;
pub use staging::{LoadAction, STAGING_PLAN, StagingStep};

/// Result of handling one state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleResult {
    /// Move to the given state.
    Next(RestoreState),
    /// Restore finished successfully.
    Finished,
}

/// Handler context containing all resources.
pub struct HandlerContext<'a, C: DeviceConnector, O: RestoreObserver> {
    pub connector: &'a mut C,
    pub archive: &'a dyn FirmwareArchive,
    pub channel: &'a mut dyn NormalModeChannel,
    pub signer: &'a dyn TssTransport,
    pub observer: &'a O,
    pub config: &'a RestoreConfig,
    pub manifest: &'a BuildManifest,
    pub state: &'a mut StateMachineContext,
    /// Open bootloader session, if any.
    pub client: Option<RecoveryClient<C::Transport>>,
    /// Build identity matching the connected device, once resolved.
    build: Option<&'a BuildIdentity>,
    progress: Option<Receiver<(u64, u64)>>,
}

impl<'a, C: DeviceConnector, O: RestoreObserver> HandlerContext<'a, C, O> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connector: &'a mut C,
        archive: &'a dyn FirmwareArchive,
        channel: &'a mut dyn NormalModeChannel,
        signer: &'a dyn TssTransport,
        observer: &'a O,
        config: &'a RestoreConfig,
        manifest: &'a BuildManifest,
        state: &'a mut StateMachineContext,
    ) -> Self {
        Self {
            connector,
            archive,
            channel,
            signer,
            observer,
            config,
            manifest,
            state,
            client: None,
            build: None,
            progress: None,
        }
    }

    pub(crate) fn emit(&self, event: RestoreEvent) {
        self.observer.on_event(&event);
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(RestoreEvent::Log {
            level,
            message: message.into(),
        });
    }

    pub(crate) fn check_quit(&self) -> Result<(), RestoreError> {
        if self.state.quit_requested() {
            return Err(RestoreError::Aborted);
        }
        Ok(())
    }

    /// Requested ECID, or the one learned from the device so far.
    fn filter(&self) -> DeviceFilter {
        match self.config.ecid {
            Some(ecid) => DeviceFilter::ecid(ecid),
            None if self.state.ecid != 0 => DeviceFilter::ecid(self.state.ecid),
            None => DeviceFilter::any(),
        }
    }

    fn probe(&mut self) -> Result<DeviceMode, TransportError> {
        let filter = self.filter();
        self.state.probes += 1;
        let mode = self.connector.probe(&filter)?;
        self.state.mode = Some(mode);
        Ok(mode)
    }

    /// Poll until the device shows up in a mode `accept` takes.
    ///
    /// Each attempt is one probe. Running out of attempts is
    /// `DeviceUnreachable`.
    pub(crate) fn wait_for_mode(
        &mut self,
        what: &str,
        accept: fn(&DeviceMode) -> bool,
        policy: &RetryPolicy,
    ) -> Result<DeviceMode, RestoreError> {
        debug!(what, attempts = policy.attempts, "Waiting for device");
        let result = retry_with_backoff(policy, |attempt| {
            if self.state.quit_requested() {
                return Attempt::Abort(RestoreError::Aborted);
            }
            match self.probe() {
                Ok(mode) if accept(&mode) => Attempt::Ready(mode),
                Ok(mode) => {
                    trace!(attempt, mode = %mode, "Device not in the expected mode yet");
                    Attempt::Retry(RestoreError::ProtocolViolation(format!(
                        "device in {mode} mode while waiting for {what}"
                    )))
                }
                Err(e) if e.is_transient() => Attempt::Retry(e.into()),
                Err(e) => Attempt::Abort(e.into()),
            }
        });

        match result {
            Ok(mode) => {
                debug!(mode = %mode, probes = self.state.probes, "Device found");
                Ok(mode)
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                warn!(what, attempts, last = %last, "Device did not show up");
                Err(RestoreError::DeviceUnreachable { attempts })
            }
            Err(RetryError::Fatal(e)) => Err(e),
        }
    }

    /// Open a bootloader session on the current device.
    pub(crate) fn open_client(&mut self) -> Result<(), RestoreError> {
        self.release_client();
        let filter = self.filter();
        let config = self.config;
        let transport = self
            .connector
            .open_with_retry(&filter, &config.connect_retry)
            .map_err(|e| match e {
                RetryError::Exhausted { attempts, .. } => {
                    RestoreError::DeviceUnreachable { attempts }
                }
                RetryError::Fatal(e) => e.into(),
            })?;

        let mut client = RecoveryClient::new(transport);
        client.set_timeout(Duration::from_millis(config.usb_timeout_ms));

        let (tx, rx) = mpsc::channel();
        client.subscribe(EventKind::Progress, move |_, event| {
            if let HubEvent::Progress { sent, total, .. } = event {
                let _ = tx.send((*sent, *total));
            }
            EventAction::Proceed
        });
        self.progress = Some(rx);

        let identity = client.identity().clone();
        if identity.has_ecid() {
            self.state.ecid = identity.ecid;
        }
        if identity.chip_id != 0 {
            self.state.chip_id = identity.chip_id;
        }
        // WTF serials carry no board ID.
        if client.mode() != DeviceMode::Wtf {
            self.state.board_id = Some(identity.board_id);
        }
        if identity.ap_nonce.is_some() {
            self.state.nonce = identity.ap_nonce.clone();
        }

        info!(mode = %client.mode(), identity = %identity, "Bootloader connection open");
        self.emit(RestoreEvent::DeviceConnected {
            mode: client.mode(),
            ecid: self.state.ecid,
        });
        self.client = Some(client);
        Ok(())
    }

    pub(crate) fn client(&mut self) -> Result<&mut RecoveryClient<C::Transport>, RestoreError> {
        self.client
            .as_mut()
            .ok_or_else(|| RestoreError::ProtocolViolation("no open bootloader connection".into()))
    }

    /// Close the bootloader session, if one is open.
    pub(crate) fn release_client(&mut self) {
        if let Some(client) = self.client.take() {
            client.close();
            self.progress = None;
            self.emit(RestoreEvent::DeviceDisconnected);
        }
    }

    /// Upload `data` and forward the client's progress reports.
    pub(crate) fn upload(
        &mut self,
        component: &str,
        data: &[u8],
        notify: bool,
    ) -> Result<(), RestoreError> {
        self.client()?.send_buffer(data, notify)?;
        let updates: Vec<(u64, u64)> = self
            .progress
            .as_ref()
            .map(|rx| rx.try_iter().collect())
            .unwrap_or_default();
        for (current, total) in updates {
            self.emit(RestoreEvent::Progress {
                component: component.to_string(),
                current,
                total,
            });
        }
        Ok(())
    }

    pub(crate) fn settle(&self, millis: u64) {
        if millis > 0 {
            debug!(millis, "Waiting for the device to settle");
            thread::sleep(Duration::from_millis(millis));
        }
    }

    /// Signed builds need a ticket before any component is accepted.
    pub(crate) fn ticket_required(&self) -> bool {
        self.manifest.build_major() > TICKET_MIN_BUILD_MAJOR && !self.config.flags.custom
    }

    pub(crate) fn boot_args(&self) -> Option<&'a str> {
        let config = self.config;
        match config.boot_args.as_deref() {
            Some(args) => Some(args),
            None if self.manifest.build_major() >= TICKET_MIN_BUILD_MAJOR => Some(DEFAULT_BOOT_ARGS),
            None => None,
        }
    }

    /// Build identity for the connected device's chip and board.
    ///
    /// Resolved on first use, after a bootloader connection has reported the
    /// device identity.
    pub(crate) fn build(&mut self) -> Result<&'a BuildIdentity, RestoreError> {
        if let Some(build) = self.build {
            return Ok(build);
        }

        let manifest = self.manifest;
        let chip_id = (self.state.chip_id != 0).then_some(self.state.chip_id);
        let board_id = self.state.board_id;
        let build = manifest.select_identity(chip_id, board_id, self.config.behavior())?;
        info!(
            chip_id = ?chip_id,
            board_id = ?board_id,
            product_version = manifest.product_version(),
            build_version = manifest.build_version(),
            variant = build.variant().unwrap_or("(unnamed)"),
            "Selected build identity"
        );
        self.build = Some(build);
        Ok(build)
    }

    /// Make sure a ticket for the current nonce and build is held,
    /// requesting a new one when needed.
    pub(crate) fn ensure_ticket(&mut self) -> Result<&SigningTicket, RestoreError> {
        let build = self.build()?;
        let unique_build_id = build
            .unique_build_id()
            .ok_or_else(|| TssError::MalformedBuildIdentity("UniqueBuildID".into()))?
            .to_vec();
        let key = TicketKey {
            ecid: self.state.ecid,
            nonce: self.state.nonce.clone(),
            unique_build_id,
        };

        let reusable = self.state.ticket.as_ref().is_some_and(|t| t.matches(&key));
        if !reusable {
            if self.state.ticket.take().is_some() {
                info!("Nonce or build changed, requesting a new signing ticket");
            }
            let request = tss::build_request(
                build,
                self.state.chip_id,
                key.ecid,
                key.nonce.as_deref(),
                None,
            )?;
            let response = tss::send_request(&request, &self.config.url, self.signer)?;
            self.emit(RestoreEvent::TicketReceived { ecid: key.ecid });
            self.state.ticket = Some(SigningTicket::new(key, response));
        }

        self.state
            .ticket
            .as_ref()
            .ok_or_else(|| RestoreError::ProtocolViolation("signing ticket missing".into()))
    }

    /// Read a component's bytes: the ticket's path override first, then the
    /// build identity's path table.
    pub(crate) fn component_source(&mut self, name: &str) -> Result<Vec<u8>, RestoreError> {
        let build = self.build()?;
        let path = self
            .state
            .ticket
            .as_ref()
            .and_then(|t| t.response().component_path(name))
            .or_else(|| build.component_path(name))
            .ok_or_else(|| RestoreError::ComponentNotFound(name.to_string()))?;

        self.archive.component_bytes(path).map_err(|e| {
            warn!(component = name, path, error = %e, "Failed to read component");
            RestoreError::ComponentNotFound(name.to_string())
        })
    }
}

/// Run the handler for the current state.
pub fn handle_state<C: DeviceConnector, O: RestoreObserver>(
    ctx: &mut HandlerContext<'_, C, O>,
) -> Result<HandleResult, RestoreError> {
    ctx.check_quit()?;
    match ctx.state.state {
        RestoreState::Detecting => detect::handle_detecting(ctx),
        RestoreState::NormalMode => detect::handle_normal_mode(ctx),
        RestoreState::RecoveryMode => recovery::handle_recovery_mode(ctx),
        RestoreState::DfuMode => dfu::handle_dfu_mode(ctx),
        RestoreState::WtfMode => dfu::handle_wtf_mode(ctx),
        RestoreState::EnteringRecovery => recovery::handle_entering_recovery(ctx),
        RestoreState::RecoveryReady => recovery::handle_recovery_ready(ctx),
        RestoreState::StagingComponents => staging::handle_staging(ctx),
        RestoreState::Rebooting => staging::handle_rebooting(ctx),
        RestoreState::Done | RestoreState::Failed => Ok(HandleResult::Finished),
    }
}

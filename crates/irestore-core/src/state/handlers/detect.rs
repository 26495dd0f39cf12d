//! Device discovery and the normal-mode hop into recovery.

use tracing::{debug, info, warn};

use crate::error::RestoreError;
use crate::events::{LogLevel, RestoreEvent, RestoreObserver};
use crate::lockdown::ChannelError;
use crate::protocol::DeviceMode;
use crate::state::machine::RestoreState;
use crate::transport::{DeviceConnector, TransportError};

use super::{HandleResult, HandlerContext};

/// Detection may restart after a WTF upload or a restore-mode reboot.
pub(super) const MAX_REDETECTS: u32 = 4;

pub(super) fn count_redetect<C: DeviceConnector, O: RestoreObserver>(
    ctx: &mut HandlerContext<'_, C, O>,
) -> Result<(), RestoreError> {
    ctx.state.redetects += 1;
    if ctx.state.redetects > MAX_REDETECTS {
        return Err(RestoreError::ProtocolViolation(format!(
            "device not in a usable mode after {MAX_REDETECTS} restarts"
        )));
    }
    Ok(())
}

/// Probe for the device and branch on its mode.
pub(super) fn handle_detecting<C: DeviceConnector, O: RestoreObserver>(
    ctx: &mut HandlerContext<'_, C, O>,
) -> Result<HandleResult, RestoreError> {
    let config = ctx.config;
    let mut mode = ctx.wait_for_mode("a device", |_| true, &config.connect_retry)?;

    // Restore mode shares the normal PID range; only lockdown can tell.
    if mode == DeviceMode::Normal {
        match ctx.channel.is_restore_mode() {
            Ok(true) => mode = DeviceMode::Restore,
            Ok(false) => {}
            Err(e) => debug!(error = %e, "Cannot query restore mode"),
        }
    }

    info!(mode = %mode, "Device detected");
    ctx.emit(RestoreEvent::DeviceDetected { mode });

    if config.flags.no_action {
        ctx.log(LogLevel::Info, "No action requested, stopping after detection");
        return Ok(HandleResult::Finished);
    }

    let next = match mode {
        DeviceMode::Normal => RestoreState::NormalMode,
        DeviceMode::Recovery(_) => RestoreState::RecoveryMode,
        DeviceMode::Dfu => RestoreState::DfuMode,
        DeviceMode::Wtf => RestoreState::WtfMode,
        DeviceMode::Restore => {
            count_redetect(ctx)?;
            warn!("Device is already in restore mode, rebooting it");
            ctx.log(LogLevel::Warn, "Device is in restore mode, rebooting");
            ctx.channel.reboot().map_err(|e| match e {
                ChannelError::Unavailable => RestoreError::ProtocolViolation(
                    "device is in restore mode and cannot be rebooted without a normal-mode channel"
                        .into(),
                ),
                e => e.into(),
            })?;
            RestoreState::Detecting
        }
        DeviceMode::Unknown => {
            return Err(RestoreError::ProtocolViolation(
                "device reports an unknown mode".into(),
            ));
        }
    };
    Ok(HandleResult::Next(next))
}

/// Ask a normally booted device to reboot into recovery and wait for it.
pub(super) fn handle_normal_mode<C: DeviceConnector, O: RestoreObserver>(
    ctx: &mut HandlerContext<'_, C, O>,
) -> Result<HandleResult, RestoreError> {
    let config = ctx.config;

    match ctx.channel.read_identity() {
        Ok(identity) => {
            if let Some(wanted) = config.ecid
                && identity.has_ecid()
                && identity.ecid != wanted
            {
                warn!(
                    wanted = %format!("{wanted:016X}"),
                    found = %format!("{:016X}", identity.ecid),
                    "Normal-mode device has a different ECID"
                );
                return Err(TransportError::NoDevice {
                    ecid: Some(wanted),
                }
                .into());
            }
            if identity.has_ecid() {
                ctx.state.ecid = identity.ecid;
            }
            if identity.chip_id != 0 {
                ctx.state.chip_id = identity.chip_id;
            }
            info!(identity = %identity, udid = ?identity.udid, "Normal mode device");
        }
        Err(ChannelError::Unavailable) => debug!("Normal-mode identity unavailable"),
        Err(e) => return Err(e.into()),
    }

    if let Ok(Some(nonce)) = ctx.channel.read_nonce() {
        debug!(nonce = %hex::encode(&nonce), "Normal-mode nonce");
    }

    info!("Entering recovery mode");
    ctx.log(LogLevel::Info, "Requesting recovery mode");
    ctx.channel.enter_recovery()?;

    let mode = ctx.wait_for_mode("recovery mode", DeviceMode::is_recovery, &config.recovery_poll)?;
    ctx.emit(RestoreEvent::DeviceDetected { mode });
    Ok(HandleResult::Next(RestoreState::EnteringRecovery))
}

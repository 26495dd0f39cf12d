//! DFU and WTF boot stages.

use tracing::{info, warn};

use crate::error::RestoreError;
use crate::events::{LogLevel, RestoreObserver};
use crate::protocol::{COMPONENT_IBEC, COMPONENT_IBSS, DeviceMode, TICKET_MIN_BUILD_MAJOR};
use crate::state::machine::RestoreState;
use crate::transport::DeviceConnector;

use super::detect::count_redetect;
use super::{HandleResult, HandlerContext};

/// Boot iBSS (and iBEC on newer builds) from DFU, then wait for recovery.
pub(super) fn handle_dfu_mode<C: DeviceConnector, O: RestoreObserver>(
    ctx: &mut HandlerContext<'_, C, O>,
) -> Result<HandleResult, RestoreError> {
    let config = ctx.config;
    ctx.open_client()?;

    let signed = ctx.ticket_required() && !config.flags.exploit;
    if signed {
        ctx.ensure_ticket()?;
    }

    info!("Sending iBSS");
    ctx.log(LogLevel::Info, "Sending iBSS");
    let ibss = ctx.component_source(COMPONENT_IBSS)?;
    ctx.upload(COMPONENT_IBSS, &ibss, true)?;
    ctx.release_client();

    if ctx.manifest.build_major() > TICKET_MIN_BUILD_MAJOR {
        ctx.settle(config.dfu_reconnect_delay_ms);
        ctx.wait_for_mode("iBSS", DeviceMode::is_bootloader, &config.reconnect_poll)?;
        ctx.open_client()?;

        // iBSS hands out a fresh nonce; a changed one needs a new ticket.
        if signed {
            ctx.ensure_ticket()?;
        }

        info!("Sending iBEC");
        ctx.log(LogLevel::Info, "Sending iBEC");
        let ibec = ctx.component_source(COMPONENT_IBEC)?;
        ctx.upload(COMPONENT_IBEC, &ibec, true)?;
        ctx.release_client();
    }

    ctx.settle(config.ibec_delay_ms);
    let mode = ctx.wait_for_mode("recovery mode", DeviceMode::is_recovery, &config.recovery_poll)?;
    info!(mode = %mode, "Device left DFU");
    Ok(HandleResult::Next(RestoreState::EnteringRecovery))
}

/// Push the WTF stage so the device re-enumerates in DFU, then detect again.
pub(super) fn handle_wtf_mode<C: DeviceConnector, O: RestoreObserver>(
    ctx: &mut HandlerContext<'_, C, O>,
) -> Result<HandleResult, RestoreError> {
    let config = ctx.config;
    count_redetect(ctx)?;
    ctx.open_client()?;

    let cpid = ctx.client()?.identity().chip_id;
    let path = format!("Firmware/dfu/WTF.s5l{cpid:04x}xall.RELEASE.dfu");
    let payload = ctx.archive.component_bytes(&path).map_err(|e| {
        warn!(path = %path, error = %e, "Failed to read WTF payload");
        RestoreError::ComponentNotFound(path.clone())
    })?;

    info!(path = %path, "Sending WTF payload");
    ctx.log(LogLevel::Info, "Sending WTF payload");
    ctx.upload("WTF", &payload, true)?;
    ctx.release_client();

    ctx.settle(config.dfu_reconnect_delay_ms);
    Ok(HandleResult::Next(RestoreState::Detecting))
}

//! Recovery connection, signing ticket and auto-boot.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::client::RecoveryClient;
use crate::error::RestoreError;
use crate::events::{LogLevel, RestoreEvent, RestoreObserver};
use crate::protocol::{
    COMPONENT_IBEC, DFU_DNLOAD, DeviceMode, ENV_AUTO_BOOT, ENV_BUILD_STYLE, ENV_BUILD_VERSION,
    ENV_RADIO_ERROR, ENV_RADIO_ERROR_STRING, HANDSHAKE_TIMEOUT_MS, REQ_DFU_OUT,
};
use crate::state::machine::RestoreState;
use crate::transport::{DeviceConnector, UsbTransport};

use super::{HandleResult, HandlerContext};

pub(super) fn handle_recovery_mode<C: DeviceConnector, O: RestoreObserver>(
    ctx: &mut HandlerContext<'_, C, O>,
) -> Result<HandleResult, RestoreError> {
    info!("Device already in recovery mode");
    ctx.log(LogLevel::Info, "Device is in recovery mode");
    Ok(HandleResult::Next(RestoreState::EnteringRecovery))
}

/// Open the recovery session and read its environment for diagnostics.
pub(super) fn handle_entering_recovery<C: DeviceConnector, O: RestoreObserver>(
    ctx: &mut HandlerContext<'_, C, O>,
) -> Result<HandleResult, RestoreError> {
    if ctx.client.is_none() {
        ctx.open_client()?;
    }

    let mode = ctx.client()?.mode();
    if !mode.is_recovery() {
        return Err(RestoreError::ProtocolViolation(format!(
            "expected recovery mode, device is in {mode}"
        )));
    }

    if ctx.config.boot_ibec && !ctx.state.ibec_loaded {
        load_ibec(ctx)?;
        return Ok(HandleResult::Next(RestoreState::EnteringRecovery));
    }

    read_diagnostics(ctx);
    Ok(HandleResult::Next(RestoreState::RecoveryReady))
}

/// Send the ticket if the build needs one, then disable auto-boot.
pub(super) fn handle_recovery_ready<C: DeviceConnector, O: RestoreObserver>(
    ctx: &mut HandlerContext<'_, C, O>,
) -> Result<HandleResult, RestoreError> {
    if ctx.ticket_required() {
        send_ticket(ctx)?;
    } else {
        debug!(
            build_major = ctx.manifest.build_major(),
            custom = ctx.config.flags.custom,
            "No signing ticket needed"
        );
    }

    disable_autoboot(ctx.client()?)?;
    ctx.log(LogLevel::Info, "Auto-boot disabled");
    Ok(HandleResult::Next(RestoreState::StagingComponents))
}

/// Turn auto-boot off and persist it, then read it back.
///
/// A read-back other than `false` is a protocol violation. An empty
/// read-back is accepted since some bootloaders do not echo the value.
pub fn disable_autoboot<T: UsbTransport>(
    client: &mut RecoveryClient<T>,
) -> Result<(), RestoreError> {
    client.setenv(ENV_AUTO_BOOT, "false")?;
    client.saveenv()?;

    match client.getenv(ENV_AUTO_BOOT)? {
        Some(value) if value == "false" => {
            debug!("auto-boot disabled and verified");
            Ok(())
        }
        Some(value) => Err(RestoreError::ProtocolViolation(format!(
            "auto-boot reads back {value:?} after disabling"
        ))),
        None => {
            warn!("auto-boot read-back returned nothing, assuming disabled");
            Ok(())
        }
    }
}

fn send_ticket<C: DeviceConnector, O: RestoreObserver>(
    ctx: &mut HandlerContext<'_, C, O>,
) -> Result<(), RestoreError> {
    let ticket = ctx.ensure_ticket()?.response().ticket()?.to_vec();
    info!(bytes = ticket.len(), "Sending APTicket");
    ctx.upload("APTicket", &ticket, false)?;
    ctx.client()?.send_command("ticket")?;
    Ok(())
}

/// Load iBEC from stock recovery and wait for it to come up.
fn load_ibec<C: DeviceConnector, O: RestoreObserver>(
    ctx: &mut HandlerContext<'_, C, O>,
) -> Result<(), RestoreError> {
    let config = ctx.config;
    if ctx.ticket_required() {
        send_ticket(ctx)?;
    }

    info!("Loading iBEC");
    ctx.log(LogLevel::Info, "Loading iBEC");
    let ibec = ctx.component_source(COMPONENT_IBEC)?;
    ctx.upload(COMPONENT_IBEC, &ibec, false)?;

    let client = ctx.client()?;
    client.send_command("go")?;
    client.control_transfer(
        REQ_DFU_OUT,
        DFU_DNLOAD,
        0,
        0,
        &mut [],
        Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
    )?;
    ctx.release_client();
    ctx.state.ibec_loaded = true;

    ctx.settle(config.ibec_delay_ms);
    ctx.wait_for_mode("iBEC", DeviceMode::is_recovery, &config.recovery_poll)?;
    Ok(())
}

fn read_env<C: DeviceConnector, O: RestoreObserver>(
    ctx: &mut HandlerContext<'_, C, O>,
    name: &str,
) -> Option<String> {
    let value = match ctx.client.as_mut().map(|c| c.getenv(name)) {
        Some(Ok(value)) => value,
        Some(Err(e)) => {
            warn!(name, error = %e, "Failed to read bootloader variable");
            None
        }
        None => None,
    };
    ctx.emit(RestoreEvent::EnvironmentRead {
        name: name.to_string(),
        value: value.clone(),
    });
    value
}

/// Parse a C-style unsigned number ("0x1f", "017", "12").
fn parse_c_ulong(text: &str) -> u64 {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).unwrap_or(0)
    } else if text.len() > 1 && text.starts_with('0') {
        u64::from_str_radix(&text[1..], 8).unwrap_or(0)
    } else {
        text.parse().unwrap_or(0)
    }
}

fn read_diagnostics<C: DeviceConnector, O: RestoreObserver>(ctx: &mut HandlerContext<'_, C, O>) {
    let version = read_env(ctx, ENV_BUILD_VERSION);
    let style = read_env(ctx, ENV_BUILD_STYLE);
    info!(
        build_version = version.as_deref().unwrap_or("(unknown)"),
        build_style = style.as_deref().unwrap_or("(unknown)"),
        "Recovery mode environment"
    );

    let radio_error = read_env(ctx, ENV_RADIO_ERROR)
        .map(|v| parse_c_ulong(&v))
        .unwrap_or(0);
    if radio_error > 0 {
        let detail = read_env(ctx, ENV_RADIO_ERROR_STRING);
        warn!(radio_error, detail = ?detail, "Baseband reported an error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[test]
    fn test_disable_autoboot_verifies() {
        let mock = MockTransport::recovery();
        mock.set_env(ENV_AUTO_BOOT, "true");
        let mut client = RecoveryClient::new(mock.clone());

        disable_autoboot(&mut client).unwrap();
        assert_eq!(client.getenv(ENV_AUTO_BOOT).unwrap().as_deref(), Some("false"));
        assert!(mock.is_saved());
        assert_eq!(
            mock.commands(),
            vec![
                "setenv auto-boot false",
                "saveenv",
                "getenv auto-boot",
                "getenv auto-boot"
            ]
        );
    }

    #[test]
    fn test_disable_autoboot_without_echo() {
        let mock = MockTransport::recovery();
        mock.set_echo_env(false);
        let mut client = RecoveryClient::new(mock);
        disable_autoboot(&mut client).unwrap();
    }

    #[test]
    fn test_disable_autoboot_setenv_failure() {
        let mock = MockTransport::recovery();
        mock.fail_on_command("setenv");
        let mut client = RecoveryClient::new(mock.clone());
        let err = disable_autoboot(&mut client).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UsbTransferFailure);
        assert!(!mock.is_saved());
    }

    #[test]
    fn test_parse_c_ulong() {
        assert_eq!(parse_c_ulong("0x1f"), 31);
        assert_eq!(parse_c_ulong("017"), 15);
        assert_eq!(parse_c_ulong("12"), 12);
        assert_eq!(parse_c_ulong("0"), 0);
        assert_eq!(parse_c_ulong("junk"), 0);
    }
}

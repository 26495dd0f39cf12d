//! Ordered component staging and the final boot trigger.

use std::time::Duration;

use tracing::{debug, info};

use crate::error::RestoreError;
use crate::events::{LogLevel, RestoreEvent, RestoreObserver};
use crate::protocol::{
    COMPONENT_APPLE_LOGO, COMPONENT_DEVICE_TREE, COMPONENT_KERNEL_CACHE, COMPONENT_RAMDISK,
    DFU_DNLOAD, ENV_BOOT_ARGS, ENV_RAMDISK_DELAY, HANDSHAKE_TIMEOUT_MS, REQ_DFU_OUT,
};
use crate::state::machine::RestoreState;
use crate::transport::DeviceConnector;

use super::{HandleResult, HandlerContext};

/// What the bootloader is told to do with an uploaded component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadAction {
    /// Show the image (`setpicture`, `bgcolor`).
    Display,
    /// `devicetree`
    DeviceTree,
    /// `ramdisk`, then a settle delay.
    Ramdisk,
    /// Handshake, boot-args, `bootx`. Starts execution.
    KernelCache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingStep {
    pub component: &'static str,
    pub action: LoadAction,
}

/// Fixed upload order. The kernel cache must come last since loading it
/// starts execution.
pub const STAGING_PLAN: [StagingStep; 4] = [
    StagingStep {
        component: COMPONENT_APPLE_LOGO,
        action: LoadAction::Display,
    },
    StagingStep {
        component: COMPONENT_DEVICE_TREE,
        action: LoadAction::DeviceTree,
    },
    StagingStep {
        component: COMPONENT_RAMDISK,
        action: LoadAction::Ramdisk,
    },
    StagingStep {
        component: COMPONENT_KERNEL_CACHE,
        action: LoadAction::KernelCache,
    },
];

pub(super) fn handle_staging<C: DeviceConnector, O: RestoreObserver>(
    ctx: &mut HandlerContext<'_, C, O>,
) -> Result<HandleResult, RestoreError> {
    for step in &STAGING_PLAN {
        ctx.check_quit()?;
        stage(ctx, step)?;
    }
    Ok(HandleResult::Next(RestoreState::Rebooting))
}

fn stage<C: DeviceConnector, O: RestoreObserver>(
    ctx: &mut HandlerContext<'_, C, O>,
    step: &StagingStep,
) -> Result<(), RestoreError> {
    let config = ctx.config;
    let boot_args = ctx.boot_args();
    let data = ctx.component_source(step.component)?;

    info!(component = step.component, bytes = data.len(), "Sending component");
    ctx.log(LogLevel::Info, format!("Sending {}", step.component));
    ctx.upload(step.component, &data, false)?;

    let client = ctx.client()?;
    match step.action {
        LoadAction::Display => {
            client.send_command("setpicture 0")?;
            client.send_command("bgcolor 0 0 0")?;
        }
        LoadAction::DeviceTree => client.send_command("devicetree")?,
        LoadAction::Ramdisk => {
            if let Some(delay) = client.getenv(ENV_RAMDISK_DELAY)? {
                debug!(delay = %delay, "Bootloader ramdisk-delay");
            }
            client.send_command("ramdisk")?;
            ctx.settle(config.ramdisk_delay_ms);
        }
        LoadAction::KernelCache => {
            client.control_transfer(
                REQ_DFU_OUT,
                DFU_DNLOAD,
                0,
                0,
                &mut [],
                Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
            )?;
            if let Some(args) = boot_args {
                client.setenv(ENV_BOOT_ARGS, args)?;
            }
            client.send_command("bootx")?;
        }
    }

    ctx.state.staged.push(step.component);
    ctx.emit(RestoreEvent::ComponentStaged {
        component: step.component.to_string(),
        bytes: data.len(),
    });
    Ok(())
}

/// The kernel is running; release the bootloader session.
pub(super) fn handle_rebooting<C: DeviceConnector, O: RestoreObserver>(
    ctx: &mut HandlerContext<'_, C, O>,
) -> Result<HandleResult, RestoreError> {
    ctx.release_client();
    info!("Restore ramdisk is booting");
    ctx.log(LogLevel::Info, "Device is booting the restore ramdisk");
    Ok(HandleResult::Finished)
}

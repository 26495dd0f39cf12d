//! Boot mode detection from the USB product ID.

use std::fmt;

use super::constants::*;

/// Boot stage a device is currently exposing over USB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceMode {
    /// Booted into the normal OS.
    Normal,
    /// iBoot recovery, with the USB variant (1-4).
    Recovery(u8),
    /// Boot ROM DFU.
    Dfu,
    /// Pre-DFU stage on the oldest chips.
    Wtf,
    /// Restore ramdisk running.
    Restore,
    Unknown,
}

impl DeviceMode {
    /// Classify an Apple product ID.
    pub fn from_product_id(pid: u16) -> Self {
        match pid {
            WTF_PRODUCT_ID => DeviceMode::Wtf,
            DFU_PRODUCT_ID => DeviceMode::Dfu,
            RECOVERY_1_PRODUCT_ID..=RECOVERY_4_PRODUCT_ID => {
                DeviceMode::Recovery((pid - RECOVERY_1_PRODUCT_ID + 1) as u8)
            }
            NORMAL_PRODUCT_ID_MIN..=NORMAL_PRODUCT_ID_MAX => DeviceMode::Normal,
            _ => DeviceMode::Unknown,
        }
    }

    /// Check if this is any recovery variant.
    pub fn is_recovery(&self) -> bool {
        matches!(self, DeviceMode::Recovery(_))
    }

    /// DFU and WTF share the control-transfer upload path.
    pub fn is_dfu_like(&self) -> bool {
        matches!(self, DeviceMode::Dfu | DeviceMode::Wtf)
    }

    /// Whether the bootloader client can talk to this mode.
    pub fn is_bootloader(&self) -> bool {
        self.is_recovery() || self.is_dfu_like()
    }

    /// Recovery variants 3 and 4 expose the bulk interface separately.
    pub fn needs_bulk_interface(&self) -> bool {
        matches!(self, DeviceMode::Recovery(v) if *v > 2)
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceMode::Normal => write!(f, "Normal"),
            DeviceMode::Recovery(v) => write!(f, "Recovery{}", v),
            DeviceMode::Dfu => write!(f, "DFU"),
            DeviceMode::Wtf => write!(f, "WTF"),
            DeviceMode::Restore => write!(f, "Restore"),
            DeviceMode::Unknown => write!(f, "Unknown"),
        }
    }
}

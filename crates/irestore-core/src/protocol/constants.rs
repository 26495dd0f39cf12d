//! Protocol constants for the Apple iBoot/DFU USB interface.
//!
//! Values match what the boot ROM and iBoot expect on the wire.

// ============================================================================
// Device Identification
// ============================================================================

/// Apple Inc. Vendor ID
pub const APPLE_VENDOR_ID: u16 = 0x05AC;

/// WTF mode (S5L8900 pre-DFU stage)
pub const WTF_PRODUCT_ID: u16 = 0x1222;
/// DFU mode (boot ROM)
pub const DFU_PRODUCT_ID: u16 = 0x1227;
/// Recovery mode variants 1-4 (iBoot)
pub const RECOVERY_1_PRODUCT_ID: u16 = 0x1280;
pub const RECOVERY_2_PRODUCT_ID: u16 = 0x1281;
pub const RECOVERY_3_PRODUCT_ID: u16 = 0x1282;
pub const RECOVERY_4_PRODUCT_ID: u16 = 0x1283;

/// PID range used by devices booted into the normal OS.
pub const NORMAL_PRODUCT_ID_MIN: u16 = 0x1290;
pub const NORMAL_PRODUCT_ID_MAX: u16 = 0x12AF;

/// All PIDs the bootloader client can talk to.
pub const BOOTLOADER_PIDS: &[u16] = &[
    WTF_PRODUCT_ID,
    DFU_PRODUCT_ID,
    RECOVERY_1_PRODUCT_ID,
    RECOVERY_2_PRODUCT_ID,
    RECOVERY_3_PRODUCT_ID,
    RECOVERY_4_PRODUCT_ID,
];

// ============================================================================
// USB Layout
// ============================================================================

pub const USB_CONFIGURATION: u8 = 1;
pub const CONTROL_INTERFACE: u8 = 0;
pub const BULK_INTERFACE: u8 = 1;
pub const BULK_ALT_SETTING: u8 = 1;

/// Bulk OUT endpoint for recovery uploads.
pub const BULK_OUT_ENDPOINT: u8 = 0x04;
/// Bulk IN endpoint for console output.
pub const BULK_IN_ENDPOINT: u8 = 0x81;

/// Default USB transfer timeout.
pub const USB_TIMEOUT_MS: u64 = 10_000;
/// Timeout for console drains.
pub const RECEIVE_TIMEOUT_MS: u64 = 500;
/// Timeout for the kernel cache handshake.
pub const HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

// ============================================================================
// Request Types (bmRequestType)
// ============================================================================

/// Vendor | Device | Host-to-device (command)
pub const REQ_VENDOR_OUT: u8 = 0x40;
/// Vendor | Interface | Host-to-device (upload start)
pub const REQ_VENDOR_IFACE_OUT: u8 = 0x41;
/// Vendor | Device | Device-to-host (command response)
pub const REQ_VENDOR_IN: u8 = 0xC0;
/// Class | Interface | Host-to-device (DFU requests)
pub const REQ_DFU_OUT: u8 = 0x21;
/// Class | Interface | Device-to-host (DFU requests)
pub const REQ_DFU_IN: u8 = 0xA1;

/// Direction bit of bmRequestType.
pub const REQ_DIRECTION_IN: u8 = 0x80;

// ============================================================================
// DFU Class Requests
// ============================================================================

pub const DFU_DNLOAD: u8 = 1;
pub const DFU_GETSTATUS: u8 = 3;
pub const DFU_CLRSTATUS: u8 = 4;
pub const DFU_GETSTATE: u8 = 5;
pub const DFU_ABORT: u8 = 6;

pub const DFU_STATE_IDLE: u8 = 2;
pub const DFU_STATE_ERROR: u8 = 10;
/// GETSTATUS byte 4 once a block has been manifested.
pub const DFU_STATUS_OK: u8 = 5;
pub const DFU_STATUS_LEN: usize = 6;
pub const DFU_STATUS_POLLS: u32 = 20;
pub const DFU_STATUS_POLL_INTERVAL_MS: u64 = 1_000;

/// Fixed trailer appended to the last DFU block before the CRC.
pub const DFU_TRAILER: [u8; 12] = [
    0xff, 0xff, 0xff, 0xff, 0xac, 0x05, 0x00, 0x01, 0x55, 0x46, 0x44, 0x10,
];

// ============================================================================
// Size Constants
// ============================================================================

pub const RECOVERY_PACKET_SIZE: usize = 0x8000;
pub const DFU_PACKET_SIZE: usize = 0x800;
pub const MAX_COMMAND_LEN: usize = 0xFF;
pub const ENV_RESPONSE_LEN: usize = 0xFF;
pub const RECEIVE_CHUNK_SIZE: usize = 0x1000;

// ============================================================================
// Firmware Components
// ============================================================================

pub const COMPONENT_APPLE_LOGO: &str = "AppleLogo";
pub const COMPONENT_DEVICE_TREE: &str = "RestoreDeviceTree";
pub const COMPONENT_RAMDISK: &str = "RestoreRamDisk";
pub const COMPONENT_KERNEL_CACHE: &str = "RestoreKernelCache";
pub const COMPONENT_IBSS: &str = "iBSS";
pub const COMPONENT_IBEC: &str = "iBEC";

// ============================================================================
// Environment and Commands
// ============================================================================

pub const ENV_AUTO_BOOT: &str = "auto-boot";
pub const ENV_BUILD_VERSION: &str = "build-version";
pub const ENV_BUILD_STYLE: &str = "build-style";
pub const ENV_RADIO_ERROR: &str = "radio-error";
pub const ENV_RADIO_ERROR_STRING: &str = "radio-error-string";
pub const ENV_RAMDISK_DELAY: &str = "ramdisk-delay";
pub const ENV_BOOT_ARGS: &str = "boot-args";

/// Builds above this major version need a signing ticket before any upload.
pub const TICKET_MIN_BUILD_MAJOR: u32 = 8;
/// Boot arguments for builds with major version 8 and later.
pub const DEFAULT_BOOT_ARGS: &str = "rd=md0 nand-enable-reformat=1 -progress";

//! Device identity as reported by the boot ROM / iBoot serial string.
//!
//! The USB serial descriptor of a device in DFU or recovery mode carries
//! its chip identity as space separated `TAG:VALUE` pairs, e.g.
//!
//! ```text
//! CPID:8960 CPRV:11 CPFM:03 SCEP:01 BDID:00 ECID:000012345678ABCD IBFL:03 SRNM:[F2LN1234ABCD] NONC:0011.. SNON:aabb..
//! ```

use std::fmt;

/// Chip and board identity of one physical device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Unique chip identifier.
    pub ecid: u64,
    /// Chip platform ID (CPID).
    pub chip_id: u32,
    pub chip_rev: u32,
    /// Fuse bits (CPFM).
    pub fuses: u32,
    pub security_domain: u32,
    /// Board ID (BDID).
    pub board_id: u32,
    pub iboot_flags: u32,
    pub serial_number: Option<String>,
    pub imei: Option<String>,
    /// Unique device identifier, only available from the normal-mode channel.
    pub udid: Option<String>,
    /// Anti-replay nonce for the application processor.
    pub ap_nonce: Option<Vec<u8>>,
    pub sep_nonce: Option<Vec<u8>>,
    /// Raw serial string this identity was parsed from.
    pub raw: String,
}

impl DeviceIdentity {
    /// Parse a bootloader serial string. Unknown tags are ignored and
    /// missing ones stay at their defaults.
    pub fn parse(serial: &str) -> Self {
        let mut identity = DeviceIdentity {
            raw: serial.to_string(),
            ..Default::default()
        };

        for token in serial.split_whitespace() {
            let Some((tag, value)) = token.split_once(':') else {
                continue;
            };
            let bracketed = value.trim_start_matches('[').trim_end_matches(']');
            match tag {
                "CPID" => identity.chip_id = parse_hex_u32(value),
                "CPRV" => identity.chip_rev = parse_hex_u32(value),
                "CPFM" => identity.fuses = parse_hex_u32(value),
                "SCEP" => identity.security_domain = parse_hex_u32(value),
                "BDID" => identity.board_id = parse_hex_u32(value),
                "IBFL" => identity.iboot_flags = parse_hex_u32(value),
                "ECID" => identity.ecid = u64::from_str_radix(value, 16).unwrap_or(0),
                "SRNM" if !bracketed.is_empty() => {
                    identity.serial_number = Some(bracketed.to_string())
                }
                "IMEI" if !bracketed.is_empty() => identity.imei = Some(bracketed.to_string()),
                "NONC" => identity.ap_nonce = hex::decode(value).ok(),
                "SNON" => identity.sep_nonce = hex::decode(value).ok(),
                _ => {}
            }
        }

        identity
    }

    /// WTF mode reports no ECID.
    pub fn has_ecid(&self) -> bool {
        self.ecid != 0
    }
}

fn parse_hex_u32(value: &str) -> u32 {
    u32::from_str_radix(value, 16).unwrap_or(0)
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CPID:{:04x} BDID:{:02x} ECID:{:016X}",
            self.chip_id, self.board_id, self.ecid
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_recovery_serial() {
        let id = DeviceIdentity::parse(
            "CPID:8930 CPRV:20 CPFM:03 SCEP:01 BDID:02 ECID:000003A2B1C4D5E6 IBFL:1B SRNM:[88014ABCDEF]",
        );
        assert_eq!(id.chip_id, 0x8930);
        assert_eq!(id.board_id, 0x02);
        assert_eq!(id.ecid, 0x3A2B1C4D5E6);
        assert_eq!(id.iboot_flags, 0x1B);
        assert_eq!(id.serial_number.as_deref(), Some("88014ABCDEF"));
        assert!(id.ap_nonce.is_none());
    }

    #[test]
    fn test_parse_nonces() {
        let id = DeviceIdentity::parse("CPID:8950 ECID:1234 NONC:deadbeef SNON:0102");
        assert_eq!(id.ap_nonce, Some(vec![0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(id.sep_nonce, Some(vec![0x01, 0x02]));
    }

    #[test]
    fn test_parse_wtf_has_no_ecid() {
        let id = DeviceIdentity::parse("CPID:8900 CPRV:01 SRNM:[]");
        assert!(!id.has_ecid());
        assert_eq!(id.chip_id, 0x8900);
        assert!(id.serial_number.is_none());
    }
}

use plist::{Dictionary, Value};
use rand::Rng;
use tracing::{debug, warn};

use super::TssError;
use crate::manifest::BuildIdentity;

const HOST_IP_ADDRESS: &str = "192.168.0.1";
const HOST_PLATFORM_INFO: &str = "mac";
const LOCALITY: &str = "en_US";
const VERSION_INFO: &str = "libauthinstall-107.3";

/// Baseband key-hash fields copied when present.
const BB_OPTIONAL_KEYS: [&str; 4] = [
    "BbSkeyId",
    "BbActivationManifestKeyHash",
    "BbCalibrationManifestKeyHash",
    "BbProvisioningManifestKeyHash",
];

/// Device-side baseband parameters for a baseband ticket request.
#[derive(Debug, Clone, Default)]
pub struct BasebandParams {
    pub gold_cert_id: u32,
    pub nonce: Option<Vec<u8>>,
    pub snum: Option<Vec<u8>>,
}

/// A signing request document.
#[derive(Debug, Clone, PartialEq)]
pub struct TssRequest {
    dict: Dictionary,
}

impl TssRequest {
    pub fn as_dictionary(&self) -> &Dictionary {
        &self.dict
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.dict.get(key)
    }

    pub fn to_xml(&self) -> Result<Vec<u8>, TssError> {
        let mut out = Vec::new();
        Value::Dictionary(self.dict.clone()).to_writer_xml(&mut out)?;
        Ok(out)
    }
}

/// AP identity values every request carries.
struct ApIdentity<'a> {
    board_id: u64,
    chip_id: u64,
    security_domain: u64,
    unique_build_id: &'a [u8],
}

fn required_hex(identity: &BuildIdentity, key: &str) -> Result<u64, TssError> {
    identity
        .hex_field(key)
        .ok_or_else(|| TssError::MalformedBuildIdentity(key.to_string()))
}

fn ap_identity<'a>(
    identity: &'a BuildIdentity,
    chip_id: u32,
    ecid: u64,
) -> Result<ApIdentity<'a>, TssError> {
    let unique_build_id = identity
        .unique_build_id()
        .ok_or_else(|| TssError::MalformedBuildIdentity("UniqueBuildID".into()))?;
    let manifest_chip = required_hex(identity, "ApChipID")?;
    let board_id = required_hex(identity, "ApBoardID")?;
    let security_domain = required_hex(identity, "ApSecurityDomain")?;

    if ecid == 0 {
        return Err(TssError::MalformedBuildIdentity("ECID (zero)".into()));
    }
    if chip_id != 0 && u64::from(chip_id) != manifest_chip {
        return Err(TssError::ChipMismatch {
            device: chip_id,
            manifest: manifest_chip as u32,
        });
    }

    Ok(ApIdentity {
        board_id,
        chip_id: manifest_chip,
        security_domain,
        unique_build_id,
    })
}

fn uuid() -> String {
    let b: [u8; 16] = rand::thread_rng().r#gen();
    format!(
        "{}-{}-{}-{}-{}",
        hex::encode_upper(&b[0..4]),
        hex::encode_upper(&b[4..6]),
        hex::encode_upper(&b[6..8]),
        hex::encode_upper(&b[8..10]),
        hex::encode_upper(&b[10..16]),
    )
}

fn host_fields(dict: &mut Dictionary) {
    dict.insert("@BBTicket".into(), Value::Boolean(true));
    dict.insert("@HostIpAddress".into(), Value::String(HOST_IP_ADDRESS.into()));
    dict.insert("@HostPlatformInfo".into(), Value::String(HOST_PLATFORM_INFO.into()));
    dict.insert("@Locality".into(), Value::String(LOCALITY.into()));
    dict.insert("@UUID".into(), Value::String(uuid()));
    dict.insert("@VersionInfo".into(), Value::String(VERSION_INFO.into()));
}

fn identity_fields(dict: &mut Dictionary, ap: &ApIdentity<'_>, ecid: u64) {
    dict.insert("ApBoardID".into(), Value::Integer(ap.board_id.into()));
    dict.insert("ApChipID".into(), Value::Integer(ap.chip_id.into()));
    dict.insert("ApECID".into(), Value::String(ecid.to_string()));
    dict.insert("ApProductionMode".into(), Value::Boolean(true));
    dict.insert(
        "ApSecurityDomain".into(),
        Value::Integer(ap.security_domain.into()),
    );
    dict.insert(
        "UniqueBuildID".into(),
        Value::Data(ap.unique_build_id.to_vec()),
    );
}

/// Build the AP ticket request for `identity` on the device `ecid`.
///
/// Every entry of the identity's `Manifest` except `BasebandFirmware` is
/// copied in full, so all digest and trust fields reach the server. A
/// `chip_id` of zero skips the chip consistency check.
pub fn build_request(
    identity: &BuildIdentity,
    chip_id: u32,
    ecid: u64,
    nonce: Option<&[u8]>,
    baseband: Option<&BasebandParams>,
) -> Result<TssRequest, TssError> {
    let ap = ap_identity(identity, chip_id, ecid)?;
    let manifest = identity
        .manifest()
        .ok_or_else(|| TssError::MalformedBuildIdentity("Manifest".into()))?;

    let mut dict = Dictionary::new();
    dict.insert("@APTicket".into(), Value::Boolean(true));
    host_fields(&mut dict);
    identity_fields(&mut dict, &ap, ecid);
    if let Some(nonce) = nonce {
        dict.insert("ApNonce".into(), Value::Data(nonce.to_vec()));
    }

    for (name, entry) in manifest {
        if name == "BasebandFirmware" {
            continue;
        }
        if entry.as_dictionary().is_none() {
            return Err(TssError::MalformedBuildIdentity(format!("Manifest/{name}")));
        }
        dict.insert(name.clone(), entry.clone());
    }

    if let Some(params) = baseband {
        add_baseband_fields(&mut dict, identity, params)?;
    }

    debug!(
        ecid = %format!("{ecid:016X}"),
        entries = dict.len(),
        has_nonce = nonce.is_some(),
        "Built signing request"
    );
    Ok(TssRequest { dict })
}

/// Build the baseband-only ticket request.
pub fn build_baseband_request(
    identity: &BuildIdentity,
    chip_id: u32,
    ecid: u64,
    params: &BasebandParams,
) -> Result<TssRequest, TssError> {
    let ap = ap_identity(identity, chip_id, ecid)?;
    let mut dict = Dictionary::new();
    host_fields(&mut dict);
    identity_fields(&mut dict, &ap, ecid);
    add_baseband_fields(&mut dict, identity, params)?;
    Ok(TssRequest { dict })
}

fn add_baseband_fields(
    dict: &mut Dictionary,
    identity: &BuildIdentity,
    params: &BasebandParams,
) -> Result<(), TssError> {
    let firmware = identity
        .component("BasebandFirmware")
        .ok_or_else(|| TssError::MalformedBuildIdentity("Manifest/BasebandFirmware".into()))?;
    dict.insert(
        "BasebandFirmware".into(),
        Value::Dictionary(firmware.clone()),
    );

    for key in BB_OPTIONAL_KEYS {
        match identity.data(key) {
            Some(data) => {
                dict.insert(key.into(), Value::Data(data.to_vec()));
            }
            None => warn!(field = key, "Baseband field not present in build identity"),
        }
    }

    let bb_chip = required_hex(identity, "BbChipID")?;
    dict.insert("BbChipID".into(), Value::Integer(bb_chip.into()));
    dict.insert(
        "BbGoldCertId".into(),
        Value::Integer(u64::from(params.gold_cert_id).into()),
    );
    if let Some(nonce) = &params.nonce {
        dict.insert("BbNonce".into(), Value::Data(nonce.clone()));
    }
    if let Some(snum) = &params.snum {
        dict.insert("BbSNUM".into(), Value::Data(snum.clone()));
    }
    Ok(())
}

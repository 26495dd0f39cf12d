use std::io::Cursor;

use plist::{Dictionary, Value};
use tracing::{debug, warn};

use super::TssError;

const STATUS_TAG: &str = "STATUS=";
const MESSAGE_TAG: &str = "MESSAGE=";
const PLIST_MARKER: &str = "<?xml";

/// Entries the server may leave empty, with the entry to fill them from.
const FIXUP_SOURCES: [(&str, &str); 3] = [
    ("RestoreLogo", "AppleLogo"),
    ("RestoreDeviceTree", "DeviceTree"),
    ("RestoreKernelCache", "KernelCache"),
];

/// Parsed signing server answer.
#[derive(Debug, Clone, PartialEq)]
pub struct TssResponse {
    dict: Dictionary,
}

fn tag_value<'a>(body: &'a str, tag: &str) -> Option<&'a str> {
    let start = body.find(tag)? + tag.len();
    let rest = &body[start..];
    Some(rest.split('&').next().unwrap_or(rest))
}

/// Parse a raw server body of the form
/// `STATUS=<n>&MESSAGE=<text>&REQUEST_STRING=<plist>`.
pub fn parse_response(body: &[u8]) -> Result<TssResponse, TssError> {
    let text = String::from_utf8_lossy(body);

    let status = tag_value(&text, STATUS_TAG)
        .ok_or_else(|| TssError::MalformedResponse("no STATUS field".into()))?;
    let status: i64 = status
        .trim()
        .parse()
        .map_err(|_| TssError::MalformedResponse(format!("bad STATUS {status:?}")))?;
    let message = tag_value(&text, MESSAGE_TAG).unwrap_or_default().to_string();

    if status != 0 {
        warn!(status, message = %message, "Signing server returned an error");
        return Err(TssError::ServerRejected { status, message });
    }

    let start = text
        .find(PLIST_MARKER)
        .ok_or_else(|| TssError::MalformedResponse("no property list in response".into()))?;
    let value = Value::from_reader(Cursor::new(text[start..].as_bytes()))?;
    let dict = value
        .into_dictionary()
        .ok_or_else(|| TssError::MalformedResponse("response is not a dictionary".into()))?;

    debug!(entries = dict.len(), "Parsed signing response");
    Ok(TssResponse { dict })
}

impl TssResponse {
    pub fn from_dictionary(dict: Dictionary) -> Self {
        Self { dict }
    }

    pub fn as_dictionary(&self) -> &Dictionary {
        &self.dict
    }

    /// Serialize in the server's wire framing with a success status.
    pub fn to_body(&self) -> Result<Vec<u8>, TssError> {
        let mut body = b"STATUS=0&MESSAGE=SUCCESS&REQUEST_STRING=".to_vec();
        Value::Dictionary(self.dict.clone()).to_writer_xml(&mut body)?;
        Ok(body)
    }

    fn entry(&self, name: &str) -> Result<&Dictionary, TssError> {
        self.dict
            .get(name)
            .and_then(Value::as_dictionary)
            .ok_or_else(|| TssError::NotPresent(name.to_string()))
    }

    /// Overall boot ticket (`APTicket`).
    pub fn ticket(&self) -> Result<&[u8], TssError> {
        self.dict
            .get("APTicket")
            .and_then(Value::as_data)
            .ok_or_else(|| TssError::NotPresent("APTicket".into()))
    }

    pub fn component_blob(&self, name: &str) -> Result<&[u8], TssError> {
        self.entry(name)?
            .get("Blob")
            .and_then(Value::as_data)
            .ok_or_else(|| TssError::NotPresent(format!("{name} blob")))
    }

    /// Archive path the server associates with a component, if any.
    pub fn component_path(&self, name: &str) -> Option<&str> {
        self.entry(name).ok()?.get("Path")?.as_string()
    }

    pub fn blob_by_path(&self, path: &str) -> Result<&[u8], TssError> {
        self.dict
            .values()
            .filter_map(Value::as_dictionary)
            .find(|d| d.get("Path").and_then(Value::as_string) == Some(path))
            .and_then(|d| d.get("Blob"))
            .and_then(Value::as_data)
            .ok_or_else(|| TssError::NotPresent(format!("blob for {path}")))
    }

    /// Fill empty restore entries from their non-restore counterparts.
    pub fn fixup(&mut self) {
        for (target, source) in FIXUP_SOURCES {
            let empty = self
                .dict
                .get(target)
                .and_then(Value::as_dictionary)
                .is_none_or(Dictionary::is_empty);
            if !empty {
                continue;
            }
            if let Some(src) = self.dict.get(source).cloned() {
                debug!(target, source, "Filling empty signing response entry");
                self.dict.insert(target.to_string(), src);
            }
        }
    }
}

/// Read the boot ticket out of a response.
pub fn extract_ticket(response: &TssResponse) -> Result<Vec<u8>, TssError> {
    response.ticket().map(<[u8]>::to_vec)
}

/// Read one component's authorization blob out of a response.
pub fn extract_component_blob(response: &TssResponse, name: &str) -> Result<Vec<u8>, TssError> {
    response.component_blob(name).map(<[u8]>::to_vec)
}

/// What a ticket was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketKey {
    pub ecid: u64,
    pub nonce: Option<Vec<u8>>,
    pub unique_build_id: Vec<u8>,
}

/// A signing response bound to the device nonce and build it was requested for.
#[derive(Debug, Clone)]
pub struct SigningTicket {
    key: TicketKey,
    response: TssResponse,
}

impl SigningTicket {
    pub fn new(key: TicketKey, response: TssResponse) -> Self {
        Self { key, response }
    }

    pub fn key(&self) -> &TicketKey {
        &self.key
    }

    pub fn response(&self) -> &TssResponse {
        &self.response
    }

    /// Whether this ticket is valid for `key`. A ticket must not be reused
    /// once the nonce or the build changes.
    pub fn matches(&self, key: &TicketKey) -> bool {
        self.key == *key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, blob: &[u8]) -> Value {
        let mut d = Dictionary::new();
        d.insert("Path".into(), Value::String(path.into()));
        d.insert("Blob".into(), Value::Data(blob.to_vec()));
        Value::Dictionary(d)
    }

    fn sample() -> TssResponse {
        let mut dict = Dictionary::new();
        dict.insert("APTicket".into(), Value::Data(vec![0xAA; 32]));
        dict.insert("AppleLogo".into(), entry("Firmware/all_flash/applelogo.img3", &[1, 2, 3]));
        dict.insert("RestoreRamDisk".into(), entry("038-1234-001.dmg", &[4, 5]));
        dict.insert("iBEC".into(), entry("Firmware/dfu/iBEC.n90ap.RELEASE.dfu", &[6]));
        TssResponse::from_dictionary(dict)
    }

    #[test]
    fn test_roundtrip_three_blobs() {
        let body = sample().to_body().unwrap();
        let parsed = parse_response(&body).unwrap();

        assert_eq!(extract_component_blob(&parsed, "AppleLogo").unwrap(), vec![1, 2, 3]);
        assert_eq!(extract_component_blob(&parsed, "RestoreRamDisk").unwrap(), vec![4, 5]);
        assert_eq!(extract_component_blob(&parsed, "iBEC").unwrap(), vec![6]);
        assert!(matches!(
            extract_component_blob(&parsed, "RestoreKernelCache"),
            Err(TssError::NotPresent(_))
        ));
        assert_eq!(extract_ticket(&parsed).unwrap(), vec![0xAA; 32]);
    }

    #[test]
    fn test_readers_are_pure() {
        let resp = sample();
        let before = resp.clone();
        assert_eq!(
            extract_component_blob(&resp, "AppleLogo").unwrap(),
            extract_component_blob(&resp, "AppleLogo").unwrap()
        );
        assert_eq!(extract_ticket(&resp).unwrap(), extract_ticket(&resp).unwrap());
        assert_eq!(resp, before);
    }

    #[test]
    fn test_rejection_status() {
        let body = b"STATUS=94&MESSAGE=This device isn't eligible for the requested build.";
        match parse_response(body) {
            Err(TssError::ServerRejected { status, message }) => {
                assert_eq!(status, 94);
                assert!(message.contains("eligible"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_malformed_bodies() {
        assert!(matches!(
            parse_response(b"<html>oops</html>"),
            Err(TssError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_response(b"STATUS=0&MESSAGE=SUCCESS"),
            Err(TssError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_path_lookups() {
        let resp = sample();
        assert_eq!(resp.component_path("RestoreRamDisk"), Some("038-1234-001.dmg"));
        assert_eq!(resp.blob_by_path("038-1234-001.dmg").unwrap(), &[4, 5]);
        assert!(resp.blob_by_path("nope").is_err());
        assert!(resp.component_path("Missing").is_none());
    }

    #[test]
    fn test_fixup_fills_empty_entries() {
        let mut dict = Dictionary::new();
        dict.insert("KernelCache".into(), entry("kc", &[7]));
        dict.insert("RestoreKernelCache".into(), Value::Dictionary(Dictionary::new()));
        dict.insert("DeviceTree".into(), entry("dt", &[8]));
        dict.insert("RestoreDeviceTree".into(), entry("rdt", &[9]));
        let mut resp = TssResponse::from_dictionary(dict);
        resp.fixup();

        assert_eq!(resp.component_blob("RestoreKernelCache").unwrap(), &[7]);
        assert_eq!(resp.component_blob("RestoreDeviceTree").unwrap(), &[9]);
        assert!(resp.component_blob("RestoreLogo").is_err());
    }

    #[test]
    fn test_ticket_key_matching() {
        let key = TicketKey {
            ecid: 0x1234,
            nonce: Some(vec![0xde, 0xad, 0xbe, 0xef]),
            unique_build_id: vec![1; 20],
        };
        let ticket = SigningTicket::new(key.clone(), sample());
        assert!(ticket.matches(&key));

        let other_nonce = TicketKey {
            nonce: Some(vec![0; 4]),
            ..key.clone()
        };
        assert!(!ticket.matches(&other_nonce));

        let other_build = TicketKey {
            unique_build_id: vec![2; 20],
            ..key
        };
        assert!(!ticket.matches(&other_build));
    }
}

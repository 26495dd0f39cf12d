use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE};
use tracing::{debug, info, instrument};

use super::{TssError, TssRequest, TssResponse, parse_response};

pub const DEFAULT_TSS_URL: &str = "http://gs.apple.com/TSS/controller?action=2";

const USER_AGENT: &str = "InetURL/1.0";
const CONTENT_TYPE_XML: &str = "text/xml; charset=\"utf-8\"";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Carries a serialized request to the signing server and returns the raw body.
pub trait TssTransport {
    fn post(&self, url: &str, body: &[u8]) -> Result<Vec<u8>, TssError>;
}

impl<F> TssTransport for F
where
    F: Fn(&str, &[u8]) -> Result<Vec<u8>, TssError>,
{
    fn post(&self, url: &str, body: &[u8]) -> Result<Vec<u8>, TssError> {
        self(url, body)
    }
}

/// HTTP(S) POST transport.
pub struct HttpTssTransport {
    client: Client,
}

impl HttpTssTransport {
    pub fn new() -> Result<Self, TssError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TssError::Network(e.to_string()))?;
        Ok(Self { client })
    }
}

impl TssTransport for HttpTssTransport {
    fn post(&self, url: &str, body: &[u8]) -> Result<Vec<u8>, TssError> {
        let response = self
            .client
            .post(url)
            .header(CACHE_CONTROL, "no-cache")
            .header(CONTENT_TYPE, CONTENT_TYPE_XML)
            .body(body.to_vec())
            .send()
            .map_err(|e| TssError::Network(e.to_string()))?
            .error_for_status()
            .map_err(|e| TssError::Network(e.to_string()))?;
        let bytes = response
            .bytes()
            .map_err(|e| TssError::Network(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Send `request` to `url` once and parse the answer.
///
/// There is no retry: a rejection repeats for the same build and nonce.
#[instrument(skip(request, transport))]
pub fn send_request<S: TssTransport + ?Sized>(
    request: &TssRequest,
    url: &str,
    transport: &S,
) -> Result<TssResponse, TssError> {
    let body = request.to_xml()?;
    debug!(bytes = body.len(), "Sending signing request");
    let raw = transport.post(url, &body)?;
    let mut response = parse_response(&raw)?;
    response.fixup();
    info!("Signing request accepted");
    Ok(response)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::manifest::fixtures;
    use crate::tss::build_request;

    #[test]
    fn test_send_through_closure() {
        let identity = fixtures::identity("Erase");
        let request = build_request(&identity, 0x8930, 0x1234, Some(&[1, 2]), None).unwrap();
        let calls = Cell::new(0);

        let server = |url: &str, body: &[u8]| -> Result<Vec<u8>, TssError> {
            calls.set(calls.get() + 1);
            assert_eq!(url, DEFAULT_TSS_URL);
            assert!(body.starts_with(b"<?xml"));
            let mut dict = plist::Dictionary::new();
            dict.insert("APTicket".into(), plist::Value::Data(vec![7; 8]));
            TssResponse::from_dictionary(dict).to_body()
        };

        let response = send_request(&request, DEFAULT_TSS_URL, &server).unwrap();
        assert_eq!(response.ticket().unwrap(), &[7; 8]);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_rejection_is_not_retried() {
        let identity = fixtures::identity("Erase");
        let request = build_request(&identity, 0, 0x1234, None, None).unwrap();
        let calls = Cell::new(0);
        let server = |_: &str, _: &[u8]| -> Result<Vec<u8>, TssError> {
            calls.set(calls.get() + 1);
            Ok(b"STATUS=94&MESSAGE=Not eligible".to_vec())
        };

        let err = send_request(&request, DEFAULT_TSS_URL, &server).unwrap_err();
        assert!(matches!(err, TssError::ServerRejected { status: 94, .. }));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_network_error_passes_through() {
        let identity = fixtures::identity("Erase");
        let request = build_request(&identity, 0, 0x1234, None, None).unwrap();
        let server =
            |_: &str, _: &[u8]| -> Result<Vec<u8>, TssError> { Err(TssError::Network("refused".into())) };
        assert!(matches!(
            send_request(&request, DEFAULT_TSS_URL, &server),
            Err(TssError::Network(_))
        ));
    }
}

//! Login reply handling.
//!
//! A successful `POST /services/auth/login` answers with
//!
//! ```xml
//! <response>
//!   <sessionKey>192fd3e46a31246da7ea7f109e7f95fd</sessionKey>
//! </response>
//! ```
//!
//! while a rejected login carries `<messages><msg type="WARN">...</msg></messages>`
//! and no key.

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{Result, SearchError};

/// An opaque session token issued by the login endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value of the `Authorization` header for this key.
    pub fn authorization(&self) -> String {
        format!("Splunk {}", self.0)
    }
}

// Keep the token out of logs.
impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey(****{})", self.0.len())
    }
}

/// Extract the session key from a login reply body.
///
/// The key must sit directly inside `<response><sessionKey>` and be a
/// non-empty hex string. Anything else yields
/// [`SearchError::MissingSessionKey`], carrying the first `<msg>` text from
/// the reply when the service explained the failure.
pub fn parse_login_response(body: &str) -> Result<SessionKey> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut key: Option<String> = None;
    let mut message: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                path.push(e.name().as_ref().to_vec());
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(ref e)) => {
                let text = String::from_utf8_lossy(e.as_ref()).trim().to_string();
                match path.last().map(Vec::as_slice) {
                    Some(b"sessionKey")
                        if path.len() == 2 && path[0] == b"response" && key.is_none() =>
                    {
                        key = Some(text);
                    }
                    Some(b"msg") if message.is_none() && !text.is_empty() => {
                        message = Some(text);
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    match key {
        Some(k) if !k.is_empty() && k.bytes().all(|b| b.is_ascii_hexdigit()) => Ok(SessionKey(k)),
        _ => Err(SearchError::MissingSessionKey { message }),
    }
}

//! WebSocket upgrade handshake (RFC 6455 Section 4), server side.
//!
//! Validation runs over a parsed [`Request`]; the first failing rule
//! picks the reply status. On success the reply is:
//!
//! ```http
//! HTTP/1.1 101 Switching Protocols
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=
//! ```
//!
//! Failures answer with a bare status line and nothing else.

use base64::Engine;
use sha1::{Digest, Sha1};

use crate::http::{Method, Request, Status, Version};

/// RFC 6455 GUID appended to the client key before hashing.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes the `Sec-WebSocket-Accept` value for a client key.
///
/// The key is used verbatim (base64 text, padding and all) per RFC 6455
/// Section 4.2.2: base64(SHA1(key ∥ GUID)).
#[must_use]
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Applies the upgrade rules in order; the first violation wins.
#[must_use]
pub fn validate(request: &Request) -> Status {
    if request.method != Method::Get {
        return Status::MethodNotAllowed;
    }
    if request.path != "/" {
        return Status::NotFound;
    }
    if request.version != Version::V1_1 {
        return Status::HttpVersionNotSupported;
    }
    if request.sec_websocket_version != 13 {
        return Status::NotImplemented;
    }
    if !request.connection.iter().any(|token| token == "upgrade") {
        return Status::BadRequest;
    }
    if !request.upgrade.iter().any(|p| p.name == "websocket") {
        return Status::BadRequest;
    }
    Status::Ok
}

/// Runs the whole handshake over raw request bytes.
///
/// Returns the outcome and the exact reply to write back. The connection
/// proceeds only on [`Status::Ok`].
#[must_use]
pub fn respond(request_bytes: &[u8]) -> (Status, Vec<u8>) {
    let status = match Request::parse(request_bytes) {
        Ok(request) => {
            let status = validate(&request);
            if status == Status::Ok {
                let reply = format!(
                    "HTTP/1.1 101 Switching Protocols\r\n\
                     Upgrade: websocket\r\n\
                     Connection: Upgrade\r\n\
                     Sec-WebSocket-Accept: {}\r\n\
                     \r\n",
                    accept_key(&request.sec_websocket_key)
                );
                return (Status::Ok, reply.into_bytes());
            }
            status
        }
        Err(err) => {
            tracing::debug!(error = %err, "upgrade request parse failed");
            Status::BadRequest
        }
    };

    let reply = format!("HTTP/1.1 {} :(\r\n\r\n", status.code());
    (status, reply.into_bytes())
}

//! The slice of HTTP/1.1 the WebSocket handshake consults.
//!
//! Parses the request line and the four header fields the upgrade
//! validation reads, per RFC 2616 §4.2 / §5.1: `Upgrade` (`1#product`),
//! `Connection` (`1#token`), `Sec-WebSocket-Version` (integer) and
//! `Sec-WebSocket-Key` (raw base64, padding kept verbatim). Everything
//! else is tokenized far enough to be skipped.
//!
//! Lines must end `\r\n`. A field line whose recognized value is followed
//! by anything but optional whitespace fails the parse, as does any byte
//! after the blank line that ends the header block.

use std::fmt;

/// Request method. Only GET upgrades; POST is recognized so the
/// validation can answer 405 instead of 400.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// Anything else.
    Unsupported,
}

/// HTTP version from the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// `HTTP/1.0`
    V1_0,
    /// `HTTP/1.1`
    V1_1,
    /// Anything else.
    Unsupported,
}

/// One element of an `Upgrade: 1#product` list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Product {
    /// Product name, lowercased.
    pub name: String,
    /// Optional version after `/`, lowercased; empty if absent.
    pub version: String,
}

/// Reply status for the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Request acceptable; the reply will be 101.
    Ok,
    /// 400
    BadRequest,
    /// 404
    NotFound,
    /// 405
    MethodNotAllowed,
    /// 501
    NotImplemented,
    /// 505
    HttpVersionNotSupported,
}

impl Status {
    /// Numeric status code for the reply line.
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::NotImplemented => 501,
            Self::HttpVersionNotSupported => 505,
        }
    }
}

/// Parse failures. All of them turn into a 400 reply; the variants exist
/// for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Request is not valid UTF-8.
    Encoding,
    /// Malformed request line.
    RequestLine,
    /// Malformed header field line.
    HeaderLine,
    /// A line was not terminated by `\r\n`, or the blank line is missing.
    UnexpectedEnd,
    /// Bytes present after the end of the header block.
    TrailingBytes,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encoding => write!(f, "request is not valid UTF-8"),
            Self::RequestLine => write!(f, "malformed request line"),
            Self::HeaderLine => write!(f, "malformed header line"),
            Self::UnexpectedEnd => write!(f, "unterminated request"),
            Self::TrailingBytes => write!(f, "unexpected bytes after headers"),
        }
    }
}

impl std::error::Error for ParseError {}

/// The fields of an upgrade request that validation consults.
#[derive(Debug, Clone)]
pub struct Request {
    /// Request method.
    pub method: Method,
    /// Request target, verbatim.
    pub path: String,
    /// HTTP version.
    pub version: Version,
    /// `Upgrade` products, accumulated across repeated header lines.
    pub upgrade: Vec<Product>,
    /// `Connection` tokens, lowercased, accumulated likewise.
    pub connection: Vec<String>,
    /// `Sec-WebSocket-Version` value; 0 when absent.
    pub sec_websocket_version: u32,
    /// `Sec-WebSocket-Key` exactly as sent, padding included.
    pub sec_websocket_key: String,
}

impl Request {
    /// Parses a complete upgrade request (everything up to and including
    /// the `\r\n\r\n` terminator; no body may follow).
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let text = std::str::from_utf8(data).map_err(|_| ParseError::Encoding)?;

        let (line, mut rest) = split_line(text)?;
        let (method, path, version) = parse_request_line(line)?;

        let mut request = Self {
            method,
            path,
            version,
            upgrade: Vec::new(),
            connection: Vec::new(),
            sec_websocket_version: 0,
            sec_websocket_key: String::new(),
        };

        loop {
            let (line, remainder) = split_line(rest)?;
            rest = remainder;

            if line.is_empty() {
                if !rest.is_empty() {
                    return Err(ParseError::TrailingBytes);
                }
                return Ok(request);
            }

            // A line starting with SP/HT continues the previous field.
            // None of the consulted fields use folding, so the
            // continuation is skipped.
            if line.starts_with(' ') || line.starts_with('\t') {
                continue;
            }

            request.parse_header_line(line)?;
        }
    }

    fn parse_header_line(&mut self, line: &str) -> Result<(), ParseError> {
        let tail = if let Some(value) = strip_field(line, "upgrade:") {
            let upgrade = &mut self.upgrade;
            parse_list(value, |s| {
                let (product, rest) = parse_product(s)?;
                upgrade.push(product);
                Some(rest)
            })?
        } else if let Some(value) = strip_field(line, "connection:") {
            let connection = &mut self.connection;
            parse_list(value, |s| {
                let (token, rest) = parse_token(s)?;
                connection.push(token);
                Some(rest)
            })?
        } else if let Some(value) = strip_field(line, "sec-websocket-version:") {
            let value = eat_whitespace(value);
            let digits = value.len() - value.trim_start_matches(|c: char| c.is_ascii_digit()).len();
            self.sec_websocket_version = value[..digits].parse().unwrap_or(u32::MAX);
            &value[digits..]
        } else if let Some(value) = strip_field(line, "sec-websocket-key:") {
            let value = eat_whitespace(value);
            let (key, rest) = parse_base64_raw(value).ok_or(ParseError::HeaderLine)?;
            self.sec_websocket_key = key;
            rest
        } else {
            // Unknown field: ignored wholesale.
            ""
        };

        if eat_whitespace(tail).is_empty() {
            Ok(())
        } else {
            Err(ParseError::HeaderLine)
        }
    }
}

/// Splits off one `\r\n`-terminated line, returning it without the
/// terminator together with the remainder.
fn split_line(text: &str) -> Result<(&str, &str), ParseError> {
    let newline = text.find('\n').ok_or(ParseError::UnexpectedEnd)?;
    let line = &text[..newline];
    let line = line.strip_suffix('\r').ok_or(ParseError::UnexpectedEnd)?;
    Ok((line, &text[newline + 1..]))
}

fn parse_request_line(line: &str) -> Result<(Method, String, Version), ParseError> {
    let (method, rest) = line.split_once(' ').ok_or(ParseError::RequestLine)?;
    let (path, version) = rest.split_once(' ').ok_or(ParseError::RequestLine)?;

    if method.is_empty() || path.is_empty() || version.is_empty() {
        return Err(ParseError::RequestLine);
    }

    let method = match method {
        "GET" => Method::Get,
        "POST" => Method::Post,
        _ => Method::Unsupported,
    };

    let version = match version {
        "HTTP/1.1" => Version::V1_1,
        "HTTP/1.0" => Version::V1_0,
        _ => Version::Unsupported,
    };

    Ok((method, path.to_string(), version))
}

/// Case-insensitively strips a `name:` field prefix.
fn strip_field<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        line.get(prefix.len()..)
    } else {
        None
    }
}

/// Trims leading `*( SP | HT )`.
fn eat_whitespace(s: &str) -> &str {
    s.trim_start_matches([' ', '\t'])
}

fn is_separator(c: char) -> bool {
    "()<>@,;:\\\"/[]?={} \t".contains(c)
}

fn is_control(c: char) -> bool {
    (c as u32) <= 31 || (c as u32) >= 127
}

/// Parses one RFC 2616 token, lowercased. Fails on an empty token.
fn parse_token(s: &str) -> Option<(String, &str)> {
    let end = s
        .find(|c| is_control(c) || is_separator(c))
        .unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    Some((s[..end].to_ascii_lowercase(), &s[end..]))
}

/// Parses one `product` element: `token [ "/" token ]`.
fn parse_product(s: &str) -> Option<(Product, &str)> {
    let (name, rest) = parse_token(s)?;
    if let Some(rest) = rest.strip_prefix('/') {
        let (version, rest) = parse_token(rest)?;
        Some((Product { name, version }, rest))
    } else {
        Some((
            Product {
                name,
                version: String::new(),
            },
            rest,
        ))
    }
}

/// Parses a `1#element` list, feeding each element to `parse_elem`, which
/// consumes one element and returns the remaining input. Returns the
/// input left after the list.
fn parse_list<'a>(
    mut s: &'a str,
    mut parse_elem: impl FnMut(&'a str) -> Option<&'a str>,
) -> Result<&'a str, ParseError> {
    loop {
        s = eat_whitespace(s);
        s = parse_elem(s).ok_or(ParseError::HeaderLine)?;
        s = eat_whitespace(s);

        match s.strip_prefix(',') {
            Some(rest) => s = rest,
            None => return Ok(s),
        }
    }
}

/// Captures a run of base64 characters plus any trailing `=` padding,
/// verbatim. Fails on an empty capture.
fn parse_base64_raw(s: &str) -> Option<(String, &str)> {
    let is_base64_char =
        |c: char| c.is_ascii_alphanumeric() || c == '+' || c == '/';

    let end = s.find(|c| !is_base64_char(c)).unwrap_or(s.len());
    let mut captured = s[..end].to_string();
    let mut rest = &s[end..];
    while let Some(r) = rest.strip_prefix('=') {
        captured.push('=');
        rest = r;
    }
    if captured.is_empty() {
        None
    } else {
        Some((captured, rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_request(headers: &str) -> Vec<u8> {
        format!("GET / HTTP/1.1\r\n{headers}\r\n").into_bytes()
    }

    #[test]
    fn request_line() {
        let request = Request::parse(b"GET /chat HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.path, "/chat");
        assert_eq!(request.version, Version::V1_1);
    }

    #[test]
    fn request_line_variants() {
        let request = Request::parse(b"POST / HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.version, Version::V1_0);

        let request = Request::parse(b"PATCH / HTTP/2.0\r\n\r\n").unwrap();
        assert_eq!(request.method, Method::Unsupported);
        assert_eq!(request.version, Version::Unsupported);

        assert_eq!(
            Request::parse(b"GET /\r\n\r\n").unwrap_err(),
            ParseError::RequestLine
        );
    }

    #[test]
    fn headers() {
        let request = Request::parse(&full_request(
            "Connection: keep-alive, Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             some-name: some-value\r\n",
        ))
        .unwrap();

        assert_eq!(request.upgrade.len(), 1);
        assert_eq!(request.upgrade[0].name, "websocket");
        assert_eq!(request.upgrade[0].version, "");

        assert_eq!(request.connection, ["keep-alive", "upgrade"]);
        assert_eq!(request.sec_websocket_version, 13);
        assert_eq!(request.sec_websocket_key, "dGhlIHNhbXBsZSBub25jZQ==");
    }

    #[test]
    fn field_names_are_case_insensitive() {
        let request = Request::parse(&full_request(
            "CONNECTION: Upgrade\r\nUPGRADE: WebSocket/13\r\n",
        ))
        .unwrap();
        assert_eq!(request.connection, ["upgrade"]);
        assert_eq!(request.upgrade[0].name, "websocket");
        assert_eq!(request.upgrade[0].version, "13");
    }

    #[test]
    fn repeated_fields_accumulate() {
        let request = Request::parse(&full_request(
            "Connection: keep-alive\r\nConnection: Upgrade\r\n",
        ))
        .unwrap();
        assert_eq!(request.connection, ["keep-alive", "upgrade"]);
    }

    #[test]
    fn folded_continuation_lines_are_skipped() {
        let request = Request::parse(&full_request(
            "some-name: some-value\r\n\
             \tcontinued on the next line\r\n\
             Connection: Upgrade\r\n",
        ))
        .unwrap();
        assert_eq!(request.connection, ["upgrade"]);
    }

    #[test]
    fn trailing_junk_after_recognized_field_fails() {
        let err =
            Request::parse(&full_request("Sec-WebSocket-Version: 13 extra\r\n")).unwrap_err();
        assert_eq!(err, ParseError::HeaderLine);
    }

    #[test]
    fn unknown_fields_are_ignored_wholesale() {
        let request =
            Request::parse(&full_request("X-Whatever: a, b; c = d {junk}\r\n")).unwrap();
        assert!(request.connection.is_empty());
    }

    #[test]
    fn missing_crlf_fails() {
        assert_eq!(
            Request::parse(b"GET / HTTP/1.1\nConnection: Upgrade\r\n\r\n").unwrap_err(),
            ParseError::UnexpectedEnd
        );
        assert_eq!(
            Request::parse(b"GET / HTTP/1.1\r\nConnection: Upgrade\r\n").unwrap_err(),
            ParseError::UnexpectedEnd
        );
    }

    #[test]
    fn bytes_after_the_blank_line_fail() {
        assert_eq!(
            Request::parse(b"GET / HTTP/1.1\r\n\r\n\x81\x80KKKK").unwrap_err(),
            ParseError::TrailingBytes
        );
    }

    #[test]
    fn version_field_edge_cases() {
        let request = Request::parse(&full_request("Sec-WebSocket-Version: 13\r\n")).unwrap();
        assert_eq!(request.sec_websocket_version, 13);

        // Absent digits leave the default, which validation then rejects.
        let request = Request::parse(&full_request("Other: 13\r\n")).unwrap();
        assert_eq!(request.sec_websocket_version, 0);

        // Overflowing values collapse to a sentinel that can never be 13.
        let request =
            Request::parse(&full_request("Sec-WebSocket-Version: 99999999999\r\n")).unwrap();
        assert_eq!(request.sec_websocket_version, u32::MAX);
    }

    #[test]
    fn key_keeps_padding_verbatim() {
        let request = Request::parse(&full_request("Sec-WebSocket-Key: AA==\r\n")).unwrap();
        assert_eq!(request.sec_websocket_key, "AA==");
    }

    #[test]
    fn empty_key_fails() {
        let err = Request::parse(&full_request("Sec-WebSocket-Key: \r\n")).unwrap_err();
        assert_eq!(err, ParseError::HeaderLine);
    }

    #[test]
    fn status_codes() {
        assert_eq!(Status::Ok.code(), 200);
        assert_eq!(Status::BadRequest.code(), 400);
        assert_eq!(Status::NotFound.code(), 404);
        assert_eq!(Status::MethodNotAllowed.code(), 405);
        assert_eq!(Status::NotImplemented.code(), 501);
        assert_eq!(Status::HttpVersionNotSupported.code(), 505);
    }
}

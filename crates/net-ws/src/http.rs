//! A deliberately minimal HTTP/1.1 request/response codec, scoped to what
//! the WebSocket opening handshake needs: a first line, `Key: Value`
//! headers, and nothing past the empty-line terminator. Chunked and
//! content-length bodies are never read.
//!
//! Grounded on `websocket/Http.cpp`: first line capped at 512 bytes, whole
//! message capped at 8192 bytes, header keys compared case-insensitively.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Options,
    Trace,
    Put,
    Delete,
    Post,
    Patch,
    Connect,
}

impl Method {
    fn parse(s: &str) -> Option<Self> {
        match_ignore_ascii_case(s, "GET", Method::Get)
            .or_else(|| match_ignore_ascii_case(s, "HEAD", Method::Head))
            .or_else(|| match_ignore_ascii_case(s, "OPTIONS", Method::Options))
            .or_else(|| match_ignore_ascii_case(s, "TRACE", Method::Trace))
            .or_else(|| match_ignore_ascii_case(s, "PUT", Method::Put))
            .or_else(|| match_ignore_ascii_case(s, "DELETE", Method::Delete))
            .or_else(|| match_ignore_ascii_case(s, "POST", Method::Post))
            .or_else(|| match_ignore_ascii_case(s, "PATCH", Method::Patch))
            .or_else(|| match_ignore_ascii_case(s, "CONNECT", Method::Connect))
    }

    fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Post => "POST",
            Method::Patch => "PATCH",
            Method::Connect => "CONNECT",
        }
    }
}

fn match_ignore_ascii_case<T: Copy>(s: &str, candidate: &str, value: T) -> Option<T> {
    s.eq_ignore_ascii_case(candidate).then_some(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    pub fn is_at_least(self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) >= (major, minor)
    }

    fn parse(s: &str) -> Option<Self> {
        let rest = s.strip_prefix("HTTP/").or_else(|| {
            // Case-insensitive "http/" prefix match without an owned String.
            if s.len() > 5 && s[..5].eq_ignore_ascii_case("HTTP/") { Some(&s[5..]) } else { None }
        })?;
        match rest.split_once('.') {
            Some((major, minor)) => Some(Version { major: major.parse().ok()?, minor: minor.parse().ok()? }),
            None => Some(Version { major: rest.parse().ok()?, minor: 0 }),
        }
    }
}

/// Insertion-ordered, case-insensitive header bag, matching the source's
/// linear-scan `Headers` (handshake messages only ever carry a handful of
/// headers, so an O(n) `set`/`get` is not worth a hash map).
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        for (existing_key, existing_value) in &mut self.entries {
            if existing_key.eq_ignore_ascii_case(&key) {
                *existing_value = value.into();
                return;
            }
        }
        self.entries.push((key, value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(existing_key, _)| existing_key.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    pub fn has_value_ignore_case(&self, key: &str, value: &str) -> bool {
        self.get(key).is_some_and(|v| v.eq_ignore_ascii_case(value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub version: Version,
    pub headers: Headers,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub version: Version,
    pub status: u32,
    pub headers: Headers,
}

const LINE_DELIM: &str = "\r\n";
const BODY_DELIM: &str = "\r\n\r\n";
const MAX_FIRST_LINE: usize = 512;
const MAX_MESSAGE: usize = 8_192;

fn status_text(status: u32) -> &'static str {
    match status {
        100 => "100 Continue",
        101 => "101 Switching Protocols",
        200 => "200 OK",
        204 => "204 No Content",
        400 => "400 Bad Request",
        401 => "401 Unauthorized",
        403 => "403 Forbidden",
        404 => "404 Not Found",
        426 => "426 Upgrade Required",
        500 => "500 Internal Server Error",
        _ => "000 Unsupported",
    }
}

fn serialize_version(version: Version) -> String {
    if version.minor == 0 { format!("HTTP/{}", version.major) } else { format!("HTTP/{}.{}", version.major, version.minor) }
}

fn serialize_message(first_line: &str, headers: &Headers) -> String {
    let mut out = String::with_capacity(first_line.len() + 64);
    out.push_str(first_line);
    out.push_str(LINE_DELIM);
    for (key, value) in headers.iter() {
        out.push_str(key);
        out.push_str(": ");
        out.push_str(value);
        out.push_str(LINE_DELIM);
    }
    out.push_str(LINE_DELIM);
    out
}

pub fn serialize_request(request: &Request) -> String {
    let first_line =
        format!("{} {} {}", request.method.as_str(), request.uri, serialize_version(request.version));
    serialize_message(&first_line, &request.headers)
}

pub fn serialize_response(response: &Response) -> String {
    let first_line = format!("{} {}", serialize_version(response.version), status_text(response.status));
    serialize_message(&first_line, &response.headers)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    NotEnoughData,
    TooLarge,
    MalformedFirstLine,
    InvalidMethod,
    InvalidVersion,
    InvalidStatus,
    InvalidHeaders,
}

pub struct Parsed<T> {
    pub value: T,
    pub consumed: usize,
}

fn parse_headers(raw: &str) -> Result<Headers, ParseError> {
    let mut headers = Headers::new();
    for line in raw.split(LINE_DELIM) {
        if line.is_empty() {
            continue;
        }
        let (key, value) = line.split_once(':').ok_or(ParseError::InvalidHeaders)?;
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() {
            continue;
        }
        headers.set(key, value);
    }
    Ok(headers)
}

fn find_message_bounds(data: &str) -> Result<(usize, usize), ParseError> {
    let first_line_end = data.find(LINE_DELIM).ok_or_else(|| {
        if data.len() > MAX_FIRST_LINE { ParseError::TooLarge } else { ParseError::NotEnoughData }
    })?;
    if first_line_end > MAX_FIRST_LINE {
        return Err(ParseError::TooLarge);
    }

    let body_delim_start = data.find(BODY_DELIM).ok_or_else(|| {
        if data.len() > MAX_MESSAGE { ParseError::TooLarge } else { ParseError::NotEnoughData }
    })?;

    let consumed = body_delim_start + BODY_DELIM.len();
    if consumed > MAX_MESSAGE {
        return Err(ParseError::TooLarge);
    }

    Ok((first_line_end, consumed))
}

pub fn parse_request(data: &[u8]) -> Result<Parsed<Request>, ParseError> {
    let text = std::str::from_utf8(data).map_err(|_| ParseError::MalformedFirstLine)?;
    let (first_line_end, consumed) = find_message_bounds(text)?;

    let first_line = &text[..first_line_end];
    let mut parts = first_line.splitn(3, ' ');
    let (Some(method_str), Some(uri), Some(version_str)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::MalformedFirstLine);
    };
    let method = Method::parse(method_str).ok_or(ParseError::InvalidMethod)?;
    let version = Version::parse(version_str).ok_or(ParseError::InvalidVersion)?;

    let headers_raw = &text[first_line_end + LINE_DELIM.len()..consumed - BODY_DELIM.len()];
    let headers = parse_headers(headers_raw)?;

    Ok(Parsed { value: Request { method, uri: uri.to_owned(), version, headers }, consumed })
}

pub fn parse_response(data: &[u8]) -> Result<Parsed<Response>, ParseError> {
    let text = std::str::from_utf8(data).map_err(|_| ParseError::MalformedFirstLine)?;
    let (first_line_end, consumed) = find_message_bounds(text)?;

    let first_line = &text[..first_line_end];
    let (version_str, rest) = first_line.split_once(' ').ok_or(ParseError::MalformedFirstLine)?;
    let version = Version::parse(version_str).ok_or(ParseError::InvalidVersion)?;

    let status_str = rest.split_whitespace().next().ok_or(ParseError::InvalidStatus)?;
    let status: u32 = status_str.parse().map_err(|_| ParseError::InvalidStatus)?;

    let headers_raw = &text[first_line_end + LINE_DELIM.len()..consumed - BODY_DELIM.len()];
    let headers = parse_headers(headers_raw)?;

    Ok(Parsed { value: Response { version, status, headers }, consumed })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialize_then_parse_round_trips() {
        let mut headers = Headers::new();
        headers.set("Upgrade", "websocket");
        headers.set("Sec-WebSocket-Key", "abc123==");
        let request =
            Request { method: Method::Get, uri: "/chat".to_owned(), version: Version { major: 1, minor: 1 }, headers };

        let serialized = serialize_request(&request);
        let parsed = parse_request(serialized.as_bytes()).expect("parse should succeed");

        assert_eq!(parsed.value.method, Method::Get);
        assert_eq!(parsed.value.uri, "/chat");
        assert_eq!(parsed.value.version, Version { major: 1, minor: 1 });
        assert_eq!(parsed.value.headers.get("upgrade"), Some("websocket"));
        assert_eq!(parsed.consumed, serialized.len());
    }

    #[test]
    fn response_serialize_then_parse_round_trips() {
        let mut headers = Headers::new();
        headers.set("Sec-WebSocket-Accept", "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        let response = Response { version: Version { major: 1, minor: 1 }, status: 101, headers };

        let serialized = serialize_response(&response);
        let parsed = parse_response(serialized.as_bytes()).expect("parse should succeed");

        assert_eq!(parsed.value.status, 101);
        assert_eq!(parsed.value.headers.get("Sec-WebSocket-Accept"), Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.set("Connection", "Upgrade");
        assert!(headers.has_value_ignore_case("connection", "upgrade"));
    }

    #[test]
    fn incomplete_message_reports_not_enough_data() {
        let partial = b"GET / HTTP/1.1\r\nHost: example\r\n";
        assert_eq!(parse_request(partial).unwrap_err(), ParseError::NotEnoughData);
    }

    #[test]
    fn oversized_first_line_is_rejected() {
        let long_uri = "a".repeat(600);
        let data = format!("GET /{long_uri} HTTP/1.1\r\n\r\n");
        assert_eq!(parse_request(data.as_bytes()).unwrap_err(), ParseError::TooLarge);
    }
}

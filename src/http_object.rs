use std::collections::HashMap;

use bytes::Bytes;

use crate::http_status::HttpStatus;
use crate::http_type::Method;

/// A parsed HTTP/1.1 request as seen by registered handlers.
///
/// `relative_url` keeps the query string; header keys are lowercased at
/// parse time so lookups are case-insensitive.
pub struct HttpRequest {
    pub method: Method,
    pub relative_url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn new(
        method: Method,
        relative_url: String,
        headers: HashMap<String, String>,
        body: Option<Bytes>,
    ) -> Self {
        HttpRequest { method, relative_url, headers, body }
    }

    /// The request path with any query string stripped.
    pub fn path(&self) -> &str {
        self.relative_url.split('?').next().unwrap_or("/")
    }

    pub fn query(&self) -> Option<&str> {
        self.relative_url.split_once('?').map(|(_, q)| q)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// A response to be serialized back to the peer.
///
/// When `raw_header_block` is set it replaces the status line and header
/// section verbatim, so tests can serve arbitrary or malformed headers.
pub struct HttpResponse {
    status_code: HttpStatus,
    headers: Vec<(String, String)>,
    body: Bytes,
    raw_header_block: Option<String>,
}

impl Default for HttpResponse {
    fn default() -> Self {
        HttpResponse {
            status_code: HttpStatus::OK,
            headers: Vec::new(),
            body: Bytes::new(),
            raw_header_block: None,
        }
    }
}

impl HttpResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status_code(status_code: HttpStatus) -> Self {
        HttpResponse { status_code, ..Self::default() }
    }

    pub fn set_status_code(&mut self, status_code: HttpStatus) {
        self.status_code = status_code;
    }

    pub fn get_status_code(&self) -> HttpStatus {
        self.status_code
    }

    pub fn set_content(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.add_header("Content-Type", content_type);
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn set_raw_header_block(&mut self, block: impl Into<String>) {
        self.raw_header_block = Some(block.into());
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Serializes the response to its wire format, ready for a single
    /// `write_all`.
    pub fn to_bytes(&self) -> Bytes {
        let mut out: Vec<u8> = Vec::with_capacity(128 + self.body.len());

        if let Some(block) = &self.raw_header_block {
            // Normalize the block's trailing newlines to exactly one blank
            // line before the body.
            let trimmed = block.trim_end_matches(&['\r', '\n'][..]);
            out.extend_from_slice(trimmed.as_bytes());
            out.extend_from_slice(b"\r\n\r\n");
        } else {
            let code: u16 = self.status_code.into();
            let reason: String = self.status_code.into();
            out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", code, reason).as_bytes());
            for (name, value) in &self.headers {
                out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
            }
            if !self.has_header("Content-Length") {
                out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
            }
            if !self.has_header("Connection") {
                out.extend_from_slice(b"Connection: close\r\n");
            }
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(&self.body);
        out.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn request_with_url(relative_url: &str) -> HttpRequest {
        HttpRequest::new(Method::GET, relative_url.to_string(), HashMap::new(), None)
    }

    #[test]
    fn path_strips_the_query_string() {
        let req = request_with_url("/test?q=foo");
        assert_eq!(req.path(), "/test");
        assert_eq!(req.query(), Some("q=foo"));

        let bare = request_with_url("/test");
        assert_eq!(bare.path(), "/test");
        assert_eq!(bare.query(), None);
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "text/plain".to_string());
        let req = HttpRequest::new(Method::GET, "/".to_string(), headers, None);
        assert_eq!(req.header("Content-Type"), Some("text/plain"));
        assert_eq!(req.header("X-Missing"), None);
    }

    #[test]
    fn serializes_status_line_headers_and_body() {
        let mut res = HttpResponse::new();
        res.set_content_type("text/html");
        res.set_content("<b>Worked!</b>");

        let wire = String::from_utf8(res.to_bytes().to_vec()).unwrap();
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(wire.contains("Content-Type: text/html\r\n"));
        assert!(wire.contains("Content-Length: 14\r\n"));
        assert!(wire.contains("Connection: close\r\n"));
        assert!(wire.ends_with("\r\n\r\n<b>Worked!</b>"));
    }

    #[test]
    fn raw_header_block_is_emitted_verbatim() {
        let mut res = HttpResponse::new();
        res.set_raw_header_block("HTTP/1.1 301 Moved Permanently\r\nLocation: /elsewhere\r\n");
        res.set_content("gone");

        let wire = String::from_utf8(res.to_bytes().to_vec()).unwrap();
        assert_eq!(
            wire,
            "HTTP/1.1 301 Moved Permanently\r\nLocation: /elsewhere\r\n\r\ngone"
        );
    }
}

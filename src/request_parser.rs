use std::collections::HashMap;

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;

use crate::http_object::HttpRequest;
use crate::http_type::Method;

/// Incremental HTTP/1.1 request parser.
///
/// Runs over the connection's accumulated receive buffer after every read.
/// `Ok(None)` means more bytes are needed; `Ok(Some(..))` is a complete
/// request; `Err` means the peer sent something this server will not answer.
pub fn parse_request(buf: &[u8]) -> Result<Option<HttpRequest>> {
    let Some(head_end) = find_header_terminator(buf) else {
        return Ok(None);
    };

    let head = std::str::from_utf8(&buf[..head_end]).context("request head is not valid UTF-8")?;
    let mut lines = head.split("\r\n");

    let request_line = lines.next().unwrap_or("");
    let (method, relative_url) = parse_request_line(request_line)?;
    let headers = parse_headers(lines);

    let body = match headers.get("content-length") {
        None => None,
        Some(value) => {
            let content_length = value
                .parse::<usize>()
                .context("content-length is not a number")?;
            let body_start = head_end + 4;
            if buf.len() < body_start + content_length {
                return Ok(None);
            }
            if content_length == 0 {
                None
            } else {
                Some(Bytes::copy_from_slice(&buf[body_start..body_start + content_length]))
            }
        }
    };

    Ok(Some(HttpRequest::new(method, relative_url, headers, body)))
}

fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

// e.g. "GET /index.html?q=foo HTTP/1.1"
fn parse_request_line(line: &str) -> Result<(Method, String)> {
    let mut it = line.split_whitespace();
    let (method, url, version) = match (it.next(), it.next(), it.next()) {
        (Some(m), Some(u), Some(v)) => (m, u, v),
        _ => bail!("request line needs at least 3 tokens"),
    };

    if !version.starts_with("HTTP/1") {
        bail!("unsupported protocol version: {}", version);
    }
    if !url.starts_with('/') {
        bail!("request URL must be origin-form: {}", url);
    }

    let method = method
        .parse()
        .map_err(|_| anyhow!("unsupported HTTP method: {}", method))?;
    Ok((method, url.to_string()))
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        // splitn instead of split(": ") so headers without the space
        // after the colon still parse.
        let mut kv = line.splitn(2, ':');
        match (kv.next(), kv.next()) {
            (Some(key), Some(value)) => {
                headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string())
            }
            _ => continue,
        };
    }
    headers
}

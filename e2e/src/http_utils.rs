//! Request building and response parsing helpers for the test clients.

/// A serialized HTTP/1.1 request with a Host header and, when a body is
/// given, a Content-Length.
pub fn http_request<S: Into<String>>(method: &str, path: &str, host: &str, body: S) -> String {
    let body = body.into();
    if body.is_empty() {
        format!("{method} {path} HTTP/1.1\r\nHost: {host}\r\n\r\n")
    } else {
        format!(
            "{method} {path} HTTP/1.1\r\nHost: {host}\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        )
    }
}

#[derive(Debug)]
pub struct ParsedResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ParsedResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Parse one response from the front of `raw`. Returns the response and
/// the number of consumed bytes, or `None` when more bytes are needed.
/// `eof` enables close-delimited bodies.
pub fn parse_response(raw: &[u8], eof: bool) -> Option<(ParsedResponse, usize)> {
    let head_end = find(raw, b"\r\n\r\n")?;
    let head = std::str::from_utf8(&raw[..head_end]).ok()?;
    let mut lines = head.split("\r\n");

    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next()?;
    let status: u16 = parts.next()?.parse().ok()?;
    let reason = parts.next().unwrap_or("").to_string();

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line.split_once(':')?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let body_start = head_end + 4;
    let header = |name: &str| {
        headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    };

    let (body, consumed) = if let Some(length) = header("content-length") {
        let length: usize = length.parse().ok()?;
        if raw.len() < body_start + length {
            return None;
        }
        (
            raw[body_start..body_start + length].to_vec(),
            body_start + length,
        )
    } else if header("transfer-encoding").is_some_and(|value| value.eq_ignore_ascii_case("chunked"))
    {
        let (body, used) = decode_chunked(&raw[body_start..])?;
        (body, body_start + used)
    } else if eof {
        (raw[body_start..].to_vec(), raw.len())
    } else if status < 200 || matches!(status, 204 | 304) {
        (Vec::new(), body_start)
    } else {
        return None;
    };

    Some((
        ParsedResponse {
            status,
            reason,
            headers,
            body,
        },
        consumed,
    ))
}

fn decode_chunked(raw: &[u8]) -> Option<(Vec<u8>, usize)> {
    let mut body = Vec::new();
    let mut offset = 0;
    loop {
        let line_end = find(&raw[offset..], b"\r\n")? + offset;
        let size = usize::from_str_radix(
            std::str::from_utf8(&raw[offset..line_end]).ok()?.trim(),
            16,
        )
        .ok()?;
        offset = line_end + 2;
        if size == 0 {
            // the terminal chunk ends with one more blank line
            if raw.len() < offset + 2 {
                return None;
            }
            return Some((body, offset + 2));
        }
        if raw.len() < offset + size + 2 {
            return None;
        }
        body.extend_from_slice(&raw[offset..offset + size]);
        offset += size + 2;
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

//! Minimal HTTP-like request assembler, per spec.md §4.3: same
//! three-function framing contract as every other codec, with the
//! `Content-Length` header deciding how many body bytes follow the
//! `\r\n\r\n` terminator.

use std::collections::HashMap;

use wireframe_codec::{DecodedMessage, FrameCodec, FrameLength};
use wireframe_core::error::{CoreError, ErrorKind};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn content_length(headers: &HashMap<String, String>) -> usize {
    headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn parse_headers(head: &str) -> Result<(String, String, String, HashMap<String, String>), ()> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or(())?;
    let mut parts = request_line.split(' ');
    let method = parts.next().ok_or(())?.to_string();
    let target = parts.next().ok_or(())?.to_string();
    let version = parts.next().unwrap_or("HTTP/1.1").to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or(())?;
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }
    Ok((method, target, version, headers))
}

#[derive(Debug, Default)]
pub struct HttpCodec;

impl HttpCodec {
    pub fn new() -> Self {
        Self
    }
}

impl FrameCodec for HttpCodec {
    fn name(&self) -> &'static str {
        "http"
    }

    fn input(&self, buffer: &[u8]) -> FrameLength {
        let Some(split) = find_header_terminator(buffer) else {
            return FrameLength::Incomplete;
        };
        let head = match std::str::from_utf8(&buffer[..split]) {
            Ok(h) => h,
            Err(_) => return FrameLength::Fatal,
        };
        let Ok((_, _, _, headers)) = parse_headers(head) else {
            return FrameLength::Fatal;
        };
        let body_len = content_length(&headers);
        let total = split + 4 + body_len;
        if buffer.len() < total {
            FrameLength::Incomplete
        } else {
            FrameLength::Complete(total)
        }
    }

    fn decode(&self, frame: &[u8]) -> Result<DecodedMessage, CoreError> {
        let split = find_header_terminator(frame)
            .ok_or_else(|| CoreError::new(ErrorKind::ProtocolError, "missing header terminator"))?;
        let head = std::str::from_utf8(&frame[..split])
            .map_err(|_| CoreError::new(ErrorKind::ProtocolError, "request head is not UTF-8"))?;
        let (method, target, version, headers) = parse_headers(head)
            .map_err(|_| CoreError::new(ErrorKind::ProtocolError, "malformed request line"))?;
        let body = frame[split + 4..].to_vec();
        Ok(Box::new(HttpRequest {
            method,
            target,
            version,
            headers,
            body,
        }))
    }

    fn encode(&self, message: &DecodedMessage) -> Result<Vec<u8>, CoreError> {
        let request = message
            .downcast_ref::<HttpRequest>()
            .ok_or_else(|| CoreError::new(ErrorKind::ProtocolError, "expected an HttpRequest"))?;
        let mut out = format!(
            "{} {} {}\r\n",
            request.method, request.target, request.version
        )
        .into_bytes();
        for (name, value) in &request.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        if !request.headers.contains_key("content-length") {
            out.extend_from_slice(format!("content-length: {}\r\n", request.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&request.body);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_request_with_body() {
        let codec = HttpCodec::new();
        let raw = b"POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        assert_eq!(codec.input(raw), FrameLength::Complete(raw.len()));
        let decoded = codec.decode(raw).unwrap();
        let req = decoded.downcast_ref::<HttpRequest>().unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.target, "/submit");
        assert_eq!(req.body, b"hello");
    }

    #[test]
    fn waits_for_full_body() {
        let codec = HttpCodec::new();
        let raw = b"POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel";
        assert_eq!(codec.input(raw), FrameLength::Incomplete);
    }

    #[test]
    fn request_without_body_completes_at_terminator() {
        let codec = HttpCodec::new();
        let raw = b"GET / HTTP/1.1\r\nHost: example\r\n\r\n";
        assert_eq!(codec.input(raw), FrameLength::Complete(raw.len()));
    }
}

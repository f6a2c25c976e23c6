//! FastCGI response-record codec, per spec.md §4.3: a stream of records
//! from the upstream application is accumulated across reads until the
//! terminating `FCGI_END_REQUEST` record closes out a single response.

use std::collections::HashMap;

use wireframe_codec::{DecodedMessage, FrameCodec, FrameLength};
use wireframe_core::error::{CoreError, ErrorKind};

const HEADER_LEN: usize = 8;
const FCGI_VERSION_1: u8 = 1;
const FCGI_END_REQUEST: u8 = 3;
const FCGI_STDOUT: u8 = 6;
const FCGI_STDERR: u8 = 7;

/// One fully accumulated FastCGI response: everything written to
/// `FCGI_STDOUT`/`FCGI_STDERR` across the record stream for a single
/// request, split into the synthesized HTTP-style status, headers, and
/// body.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FastCgiResponse {
    pub request_id: u16,
    /// Default 200; -1 if the stdout stream never contained a
    /// `\r\n\r\n` header terminator.
    pub status: i32,
    pub stderr: Vec<u8>,
    /// Repeated header names collect into a list, in arrival order.
    pub headers: HashMap<String, Vec<String>>,
    pub body: Vec<u8>,
}

fn scan_records(buffer: &[u8]) -> Result<Option<usize>, ()> {
    let mut pos = 0;
    loop {
        if buffer.len() < pos + HEADER_LEN {
            return Ok(None);
        }
        let header = &buffer[pos..pos + HEADER_LEN];
        if header[0] != FCGI_VERSION_1 {
            return Err(());
        }
        let record_type = header[1];
        let content_len = ((header[4] as usize) << 8) | header[5] as usize;
        let padding_len = header[6] as usize;
        let total = HEADER_LEN + content_len + padding_len;
        if buffer.len() < pos + total {
            return Ok(None);
        }
        pos += total;
        if record_type == FCGI_END_REQUEST {
            return Ok(Some(pos));
        }
    }
}

fn parse_status_line(value: &str) -> i32 {
    value
        .split_whitespace()
        .next()
        .and_then(|tok| tok.parse::<i32>().ok())
        .unwrap_or(200)
}

fn parse_response(frame: &[u8]) -> FastCgiResponse {
    let mut pos = 0;
    let mut request_id = 0u16;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    loop {
        if frame.len() < pos + HEADER_LEN {
            break;
        }
        let header = &frame[pos..pos + HEADER_LEN];
        let record_type = header[1];
        let id = ((header[2] as u16) << 8) | header[3] as u16;
        let content_len = ((header[4] as usize) << 8) | header[5] as usize;
        let padding_len = header[6] as usize;
        let content_start = pos + HEADER_LEN;
        let content_end = content_start + content_len;
        request_id = id;
        match record_type {
            FCGI_STDOUT => stdout.extend_from_slice(&frame[content_start..content_end]),
            FCGI_STDERR => stderr.extend_from_slice(&frame[content_start..content_end]),
            _ => {}
        }
        pos = content_end + padding_len;
        if record_type == FCGI_END_REQUEST {
            break;
        }
    }

    let mut headers: HashMap<String, Vec<String>> = HashMap::new();
    let mut status = -1;
    let mut body = Vec::new();

    if let Some(split) = find_header_terminator(&stdout) {
        status = 200;
        let head = String::from_utf8_lossy(&stdout[..split]);
        for line in head.split("\r\n") {
            if let Some((name, value)) = line.split_once(':') {
                let name = name.trim().to_string();
                let value = value.trim().to_string();
                if name.eq_ignore_ascii_case("status") {
                    status = parse_status_line(&value);
                }
                headers.entry(name).or_default().push(value);
            }
        }
        body = stdout[split + 4..].to_vec();
    }

    FastCgiResponse {
        request_id,
        status,
        stderr,
        headers,
        body,
    }
}

fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn encode_record(record_type: u8, request_id: u16, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + content.len());
    out.push(FCGI_VERSION_1);
    out.push(record_type);
    out.push((request_id >> 8) as u8);
    out.push((request_id & 0xff) as u8);
    out.push((content.len() >> 8) as u8);
    out.push((content.len() & 0xff) as u8);
    out.push(0); // padding_len
    out.push(0); // reserved
    out.extend_from_slice(content);
    out
}

#[derive(Debug, Default)]
pub struct FastCgiCodec;

impl FastCgiCodec {
    pub fn new() -> Self {
        Self
    }
}

impl FrameCodec for FastCgiCodec {
    fn name(&self) -> &'static str {
        "fastcgi"
    }

    fn input(&self, buffer: &[u8]) -> FrameLength {
        match scan_records(buffer) {
            Ok(Some(n)) => FrameLength::Complete(n),
            Ok(None) => FrameLength::Incomplete,
            Err(()) => FrameLength::Fatal,
        }
    }

    fn decode(&self, frame: &[u8]) -> Result<DecodedMessage, CoreError> {
        if scan_records(frame) != Ok(Some(frame.len())) {
            return Err(CoreError::new(
                ErrorKind::ProtocolError,
                "frame is not a complete FastCGI record stream",
            ));
        }
        Ok(Box::new(parse_response(frame)))
    }

    fn encode(&self, message: &DecodedMessage) -> Result<Vec<u8>, CoreError> {
        let response = message.downcast_ref::<FastCgiResponse>().ok_or_else(|| {
            CoreError::new(ErrorKind::ProtocolError, "expected a FastCgiResponse")
        })?;

        let mut stdout = Vec::new();
        if response.status != -1 {
            if response.status != 200 {
                stdout.extend_from_slice(format!("Status: {}\r\n", response.status).as_bytes());
            }
            for (name, values) in &response.headers {
                if name.eq_ignore_ascii_case("status") {
                    continue;
                }
                for value in values {
                    stdout.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
                }
            }
            stdout.extend_from_slice(b"\r\n");
        }
        stdout.extend_from_slice(&response.body);

        let mut out = Vec::new();
        for chunk in stdout.chunks(0xFFFF) {
            out.extend_from_slice(&encode_record(FCGI_STDOUT, response.request_id, chunk));
        }
        out.extend_from_slice(&encode_record(FCGI_STDOUT, response.request_id, &[]));
        if !response.stderr.is_empty() {
            out.extend_from_slice(&encode_record(
                FCGI_STDERR,
                response.request_id,
                &response.stderr,
            ));
        }
        out.extend_from_slice(&encode_record(
            FCGI_END_REQUEST,
            response.request_id,
            &[0, 0, 0, 0, 0, 0, 0, 0],
        ));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_stream(request_id: u16, stdout: &[u8], stderr: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in stdout.chunks(8) {
            out.extend_from_slice(&encode_record(FCGI_STDOUT, request_id, chunk));
        }
        if !stderr.is_empty() {
            out.extend_from_slice(&encode_record(FCGI_STDERR, request_id, stderr));
        }
        out.extend_from_slice(&encode_record(
            FCGI_END_REQUEST,
            request_id,
            &[0, 0, 0, 0, 0, 0, 0, 0],
        ));
        out
    }

    #[test]
    fn accumulates_across_records_and_parses_headers() {
        let codec = FastCgiCodec::new();
        let body = b"Content-Type: text/plain\r\nX-Foo: a\r\nX-Foo: b\r\n\r\nhello world";
        let stream = build_stream(1, body, b"warn: slow query");
        assert_eq!(codec.input(&stream), FrameLength::Complete(stream.len()));
        let decoded = codec.decode(&stream).unwrap();
        let response = decoded.downcast_ref::<FastCgiResponse>().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hello world");
        assert_eq!(
            response.headers.get("X-Foo").unwrap(),
            &vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(response.stderr, b"warn: slow query");
    }

    #[test]
    fn status_header_overrides_default() {
        let codec = FastCgiCodec::new();
        let body = b"Status: 404 Not Found\r\nContent-Type: text/plain\r\n\r\nmissing";
        let stream = build_stream(2, body, b"");
        let decoded = codec.decode(&stream).unwrap();
        let response = decoded.downcast_ref::<FastCgiResponse>().unwrap();
        assert_eq!(response.status, 404);
    }

    #[test]
    fn missing_terminator_yields_status_negative_one() {
        let codec = FastCgiCodec::new();
        let stream = build_stream(3, b"no header terminator here", b"");
        let decoded = codec.decode(&stream).unwrap();
        let response = decoded.downcast_ref::<FastCgiResponse>().unwrap();
        assert_eq!(response.status, -1);
    }

    #[test]
    fn partial_stream_is_incomplete() {
        let codec = FastCgiCodec::new();
        let stream = build_stream(4, b"hi", b"");
        assert_eq!(codec.input(&stream[..stream.len() - 1]), FrameLength::Incomplete);
    }
}

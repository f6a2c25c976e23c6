//! Proxy handshake byte sequences (spec.md §4.2). Pure builders/parsers;
//! the client-connect state machine in `client.rs` drives the actual
//! reads/writes and feeds bytes through these.

use wireframe_core::error::{CoreError, ErrorKind};

/// Step 1 of a SOCKS5 handshake: offer "no authentication".
pub fn socks5_greeting() -> [u8; 3] {
    [0x05, 0x01, 0x00]
}

/// Parses the server's reply to [`socks5_greeting`]. Expects `{0x05,
/// 0x00}` (version 5, no-auth accepted).
pub fn parse_socks5_greeting_reply(reply: &[u8]) -> Result<(), CoreError> {
    if reply.len() < 2 || reply[0] != 0x05 || reply[1] != 0x00 {
        return Err(CoreError::new(
            ErrorKind::ConnectFail,
            "SOCKS5 server rejected no-auth greeting",
        ));
    }
    Ok(())
}

/// Step 2: request a CONNECT to `host:port` via the domain-name address
/// type.
pub fn socks5_connect_request(host: &str, port: u16) -> Result<Vec<u8>, CoreError> {
    if host.len() > 255 {
        return Err(CoreError::new(
            ErrorKind::ConnectFail,
            "SOCKS5 target hostname exceeds 255 bytes",
        ));
    }
    let mut req = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    req.extend_from_slice(host.as_bytes());
    req.extend_from_slice(&port.to_be_bytes());
    Ok(req)
}

/// Parses the server's reply to [`socks5_connect_request`]; only the
/// status byte is checked, the rest (bound address) is accepted as-is.
pub fn parse_socks5_connect_reply(reply: &[u8]) -> Result<(), CoreError> {
    if reply.len() < 4 || reply[0] != 0x05 {
        return Err(CoreError::new(
            ErrorKind::ConnectFail,
            "malformed SOCKS5 connect reply",
        ));
    }
    if reply[1] != 0x00 {
        return Err(CoreError::new(
            ErrorKind::ConnectFail,
            format!("SOCKS5 connect rejected, status {}", reply[1]),
        ));
    }
    Ok(())
}

/// Builds an HTTP `CONNECT host:port` proxy request.
pub fn http_connect_request(host: &str, port: u16) -> Vec<u8> {
    format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Connection: keep-alive\r\n\r\n"
    )
    .into_bytes()
}

/// Parses an HTTP CONNECT response's status line, succeeding on any 2xx.
pub fn parse_http_connect_status(response: &[u8]) -> Result<(), CoreError> {
    let line = response
        .split(|&b| b == b'\n')
        .next()
        .ok_or_else(|| CoreError::new(ErrorKind::ConnectFail, "empty CONNECT response"))?;
    let line = String::from_utf8_lossy(line);
    let status = line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| CoreError::new(ErrorKind::ConnectFail, "malformed CONNECT status line"))?;
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(CoreError::new(
            ErrorKind::ConnectFail,
            format!("CONNECT proxy rejected with status {status}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socks5_connect_request_encodes_domain_name() {
        let req = socks5_connect_request("example.com", 443).unwrap();
        assert_eq!(req[0..4], [0x05, 0x01, 0x00, 0x03]);
        assert_eq!(req[4], 11);
        assert_eq!(&req[5..16], b"example.com");
        assert_eq!(&req[16..18], &443u16.to_be_bytes());
    }

    #[test]
    fn http_connect_status_accepts_2xx() {
        parse_http_connect_status(b"HTTP/1.1 200 Connection Established\r\n\r\n").unwrap();
        assert!(parse_http_connect_status(b"HTTP/1.1 407 Proxy Auth Required\r\n\r\n").is_err());
    }

    #[test]
    fn socks5_greeting_reply_rejects_auth_required() {
        assert!(parse_socks5_greeting_reply(&[0x05, 0xFF]).is_err());
        assert!(parse_socks5_greeting_reply(&[0x05, 0x00]).is_ok());
    }
}

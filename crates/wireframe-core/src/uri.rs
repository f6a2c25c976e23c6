use std::fmt;

/// The built-in transport schemes. Anything else (a custom protocol name)
/// resolves to a codec of the same name instead — see
/// [`EndpointUri::codec_name`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportScheme {
    Tcp,
    Udp,
    Unix,
    Ssl,
    Tls,
}

impl TransportScheme {
    fn from_str(s: &str) -> Option<Self> {
        match s {
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            "unix" => Some(Self::Unix),
            "ssl" => Some(Self::Ssl),
            "tls" => Some(Self::Tls),
            _ => None,
        }
    }

    pub fn is_tls(self) -> bool {
        matches!(self, Self::Ssl | Self::Tls)
    }
}

/// A parsed `<scheme>://<host>:<port>[/<path>[?<query>]]` endpoint, as used
/// for both listener binds and client connects. Unix paths take the form
/// `unix:///abs/path` — the "host" there is empty and the path carries the
/// socket path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointUri {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
    pub query: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UriParseError {
    #[error("missing \"://\" separator in endpoint uri")]
    MissingSeparator,
    #[error("empty scheme in endpoint uri")]
    EmptyScheme,
    #[error("invalid port {0:?}")]
    InvalidPort(String),
}

impl EndpointUri {
    pub fn parse(raw: &str) -> Result<Self, UriParseError> {
        let (scheme, rest) = raw
            .split_once("://")
            .ok_or(UriParseError::MissingSeparator)?;
        if scheme.is_empty() {
            return Err(UriParseError::EmptyScheme);
        }

        let (authority_and_path, query) = match rest.split_once('?') {
            Some((a, q)) => (a, Some(q.to_string())),
            None => (rest, None),
        };

        if scheme == "unix" {
            // unix:///abs/path — no host/port, everything after `://` is the path.
            return Ok(Self {
                scheme: scheme.to_string(),
                host: String::new(),
                port: None,
                path: authority_and_path.to_string(),
                query,
            });
        }

        let (authority, path) = match authority_and_path.split_once('/') {
            Some((a, p)) => (a, format!("/{p}")),
            None => (authority_and_path, String::new()),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => {
                let parsed = p
                    .parse::<u16>()
                    .map_err(|_| UriParseError::InvalidPort(p.to_string()))?;
                (h.to_string(), Some(parsed))
            }
            None => (authority.to_string(), None),
        };

        Ok(Self {
            scheme: scheme.to_string(),
            host,
            port,
            path,
            query,
        })
    }

    pub fn transport(&self) -> Option<TransportScheme> {
        TransportScheme::from_str(&self.scheme)
    }

    /// Per spec.md §4.2 / §9 open-question resolution: the transport
    /// scheme always wins. A codec is attached only when the scheme is
    /// *not* one of the built-in transports.
    pub fn codec_name(&self) -> Option<&str> {
        if self.transport().is_some() {
            None
        } else {
            Some(self.scheme.as_str())
        }
    }
}

impl fmt::Display for EndpointUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scheme == "unix" {
            return write!(f, "unix://{}", self.path);
        }
        write!(f, "{}://{}", self.scheme, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        write!(f, "{}", self.path)?;
        if let Some(q) = &self.query {
            write!(f, "?{q}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_endpoint() {
        let uri = EndpointUri::parse("tcp://127.0.0.1:8080").unwrap();
        assert_eq!(uri.scheme, "tcp");
        assert_eq!(uri.host, "127.0.0.1");
        assert_eq!(uri.port, Some(8080));
        assert_eq!(uri.transport(), Some(TransportScheme::Tcp));
        assert_eq!(uri.codec_name(), None);
    }

    #[test]
    fn parses_unix_path() {
        let uri = EndpointUri::parse("unix:///tmp/wireframe.sock").unwrap();
        assert_eq!(uri.path, "/tmp/wireframe.sock");
        assert_eq!(uri.transport(), Some(TransportScheme::Unix));
    }

    #[test]
    fn custom_scheme_resolves_to_codec_not_transport() {
        let uri = EndpointUri::parse("resp://127.0.0.1:6379").unwrap();
        assert_eq!(uri.transport(), None);
        assert_eq!(uri.codec_name(), Some("resp"));
    }

    #[test]
    fn rejects_missing_separator() {
        assert_eq!(
            EndpointUri::parse("127.0.0.1:80").unwrap_err(),
            UriParseError::MissingSeparator
        );
    }

    #[test]
    fn parses_query_string() {
        let uri = EndpointUri::parse("ws://host:80/chat?room=1").unwrap();
        assert_eq!(uri.path, "/chat");
        assert_eq!(uri.query.as_deref(), Some("room=1"));
    }
}

//! Address parsing, formatting, and the loop wakeup pair.
//!
//! Listen and connect endpoints travel as `scheme://host:port` strings
//! (`tcp://0.0.0.0:8090`, `ssl://example.com:443`, `unix:///run/app.sock`);
//! a bare `host:port` is accepted and treated as `tcp`. `*` as a host means
//! "all interfaces".

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::ErrorCode;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedAddress {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl ParsedAddress {
    /// Schemes that imply TLS on the connection.
    pub fn is_tls(&self) -> bool {
        matches!(self.scheme.as_str(), "ssl" | "tls" | "wss" | "https")
    }

    pub fn is_unix(&self) -> bool {
        self.scheme == "unix"
    }
}

/// Parses `scheme://host:port`, `host:port` or `unix://path`.
pub fn parse_address(input: &str) -> Result<ParsedAddress, ErrorCode> {
    let (scheme, rest) = match input.find("://") {
        Some(i) => (&input[..i], &input[i + 3..]),
        None => ("tcp", input),
    };
    if scheme.is_empty() || rest.is_empty() {
        return Err(ErrorCode::UriUnrecognized);
    }
    if scheme == "unix" {
        return Ok(ParsedAddress {
            scheme: scheme.to_string(),
            host: rest.to_string(),
            port: 0,
        });
    }
    // Anything after the authority is ignored.
    let authority = rest.split('/').next().unwrap_or("");
    let (host, port) = authority
        .rsplit_once(':')
        .ok_or(ErrorCode::UriUnrecognized)?;
    if host.is_empty() {
        return Err(ErrorCode::UriUnrecognized);
    }
    let port: u16 = port.parse().map_err(|_| ErrorCode::UriUnrecognized)?;
    let host = if host == "*" { "0.0.0.0" } else { host };
    Ok(ParsedAddress {
        scheme: scheme.to_string(),
        host: host.to_string(),
        port,
    })
}

pub fn format_address(scheme: &str, host: &str, port: u16) -> String {
    format!("{}://{}:{}", scheme, host, port)
}

/// Resolves `host:port` to the first usable socket address.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, ErrorCode> {
    // Fast path for literal addresses, no resolver involved.
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|_| ErrorCode::NetGetAddrInfo)?
        .next()
        .ok_or(ErrorCode::NetGetAddrInfo)
}

#[cfg(unix)]
pub(crate) type WakeStream = std::os::unix::net::UnixStream;
#[cfg(windows)]
pub(crate) type WakeStream = std::net::TcpStream;

/// Creates the `(rx, tx)` pair the loop uses to interrupt its backend wait
/// from other threads. Both ends are non-blocking.
#[cfg(unix)]
pub(crate) fn wake_pair() -> io::Result<(WakeStream, WakeStream)> {
    let (rx, tx) = std::os::unix::net::UnixStream::pair()?;
    rx.set_nonblocking(true)?;
    tx.set_nonblocking(true)?;
    Ok((rx, tx))
}

#[cfg(windows)]
pub(crate) fn wake_pair() -> io::Result<(WakeStream, WakeStream)> {
    use std::net::{TcpListener, TcpStream};
    // No socketpair on Windows; a loopback connection stands in.
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let tx = TcpStream::connect(listener.local_addr()?)?;
    let (rx, _) = listener.accept()?;
    rx.set_nonblocking(true)?;
    tx.set_nonblocking(true)?;
    Ok((rx, tx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_host_port() {
        let addr = parse_address("127.0.0.1:8090").unwrap();
        assert_eq!(addr.scheme, "tcp");
        assert_eq!(addr.host, "127.0.0.1");
        assert_eq!(addr.port, 8090);
        assert!(!addr.is_tls());
    }

    #[test]
    fn test_parse_scheme_and_wildcard() {
        let addr = parse_address("tcp://*:7000").unwrap();
        assert_eq!(addr.host, "0.0.0.0");
        assert_eq!(addr.port, 7000);
    }

    #[test]
    fn test_tls_schemes() {
        for url in ["ssl://a:1", "tls://a:1", "wss://a:1", "https://a:1"] {
            assert!(parse_address(url).unwrap().is_tls(), "{url}");
        }
        assert!(!parse_address("ws://a:1").unwrap().is_tls());
    }

    #[test]
    fn test_parse_strips_path() {
        let addr = parse_address("wss://example.com:443/chat").unwrap();
        assert_eq!(addr.host, "example.com");
        assert_eq!(addr.port, 443);
    }

    #[test]
    fn test_parse_unix() {
        let addr = parse_address("unix:///run/app.sock").unwrap();
        assert!(addr.is_unix());
        assert_eq!(addr.host, "/run/app.sock");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "host", "host:", "host:notaport", "://x:1", ":90"] {
            assert!(parse_address(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn test_format_roundtrip() {
        let text = format_address("tcp", "10.0.0.1", 99);
        assert_eq!(parse_address(&text).unwrap().port, 99);
    }

    #[test]
    fn test_resolve_literal() {
        let addr = resolve("127.0.0.1", 80).unwrap();
        assert!(addr.is_ipv4());
        assert_eq!(addr.port(), 80);
    }
}

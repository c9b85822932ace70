//! Stable error codes shared by every layer of the crate.
//!
//! Errors cross callback boundaries as plain codes rather than boxed error
//! types: a channel error handed to an `on_error` callback is the same value
//! a remote peer would put on the wire. `strerror` resolves a code to a
//! human-readable description through a static descriptor table.

/// Every failure class the crate reports, grouped by subsystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    Failed = 1,
    InvalidArgument = 2,

    EventLoopRegister = 100,

    SocketCreate = 200,
    SocketBind = 201,
    SocketListen = 202,
    SocketAccept = 203,
    SocketConnect = 204,
    SocketConnectTimeout = 205,
    SocketConnectionRefused = 206,
    SocketClosedByPeer = 207,
    SocketRead = 208,
    SocketWrite = 209,
    SocketSetNonBlocking = 210,
    SocketReuseAddr = 211,
    SocketReusePort = 212,
    SocketSetIpv6Only = 213,
    SocketNotConnected = 214,
    SocketClosed = 215,

    NetGetAddrInfo = 300,
    UriUnrecognized = 301,

    TlsLoadCertificate = 400,
    TlsLoadKey = 401,
    TlsHandshake = 402,
    TlsProtocol = 403,

    ServerStarted = 500,

    RpcRequestCanceled = 600,
    RpcDecodeError = 601,
    RpcSequenceError = 602,
    RpcMethodNotFound = 603,
    RpcChannelError = 604,
    RpcMessageTooLong = 605,

    TnsNoStub = 700,
    TnsServiceRedirect = 701,
    TnsMethodNotFound = 702,
    TnsUnrecognizedFormat = 703,
    TnsNameNotFound = 704,

    TdcServiceMoved = 800,
    TdcMessageQueueOverflow = 801,
    TdcMessageOutOfSequence = 802,
}

struct ErrorDescriptor {
    code: ErrorCode,
    message: &'static str,
}

static DESCRIPTORS: &[ErrorDescriptor] = &[
    ErrorDescriptor { code: ErrorCode::Ok, message: "ok" },
    ErrorDescriptor { code: ErrorCode::Failed, message: "operation failed" },
    ErrorDescriptor { code: ErrorCode::InvalidArgument, message: "invalid argument" },
    ErrorDescriptor { code: ErrorCode::EventLoopRegister, message: "failed to register event with the event loop" },
    ErrorDescriptor { code: ErrorCode::SocketCreate, message: "failed to create socket" },
    ErrorDescriptor { code: ErrorCode::SocketBind, message: "failed to bind socket" },
    ErrorDescriptor { code: ErrorCode::SocketListen, message: "failed to listen on socket" },
    ErrorDescriptor { code: ErrorCode::SocketAccept, message: "failed to accept incoming connection" },
    ErrorDescriptor { code: ErrorCode::SocketConnect, message: "failed to connect" },
    ErrorDescriptor { code: ErrorCode::SocketConnectTimeout, message: "connect timed out" },
    ErrorDescriptor { code: ErrorCode::SocketConnectionRefused, message: "connection refused" },
    ErrorDescriptor { code: ErrorCode::SocketClosedByPeer, message: "connection closed by peer" },
    ErrorDescriptor { code: ErrorCode::SocketRead, message: "socket read error" },
    ErrorDescriptor { code: ErrorCode::SocketWrite, message: "socket write error" },
    ErrorDescriptor { code: ErrorCode::SocketSetNonBlocking, message: "failed to set socket non-blocking" },
    ErrorDescriptor { code: ErrorCode::SocketReuseAddr, message: "failed to set SO_REUSEADDR" },
    ErrorDescriptor { code: ErrorCode::SocketReusePort, message: "failed to set SO_REUSEPORT" },
    ErrorDescriptor { code: ErrorCode::SocketSetIpv6Only, message: "failed to set IPV6_V6ONLY" },
    ErrorDescriptor { code: ErrorCode::SocketNotConnected, message: "socket not connected" },
    ErrorDescriptor { code: ErrorCode::SocketClosed, message: "socket closed" },
    ErrorDescriptor { code: ErrorCode::NetGetAddrInfo, message: "address lookup failed" },
    ErrorDescriptor { code: ErrorCode::UriUnrecognized, message: "unrecognized address format" },
    ErrorDescriptor { code: ErrorCode::TlsLoadCertificate, message: "failed to load TLS certificate" },
    ErrorDescriptor { code: ErrorCode::TlsLoadKey, message: "failed to load TLS private key" },
    ErrorDescriptor { code: ErrorCode::TlsHandshake, message: "TLS handshake failed" },
    ErrorDescriptor { code: ErrorCode::TlsProtocol, message: "TLS protocol error" },
    ErrorDescriptor { code: ErrorCode::ServerStarted, message: "server already started" },
    ErrorDescriptor { code: ErrorCode::RpcRequestCanceled, message: "RPC request canceled" },
    ErrorDescriptor { code: ErrorCode::RpcDecodeError, message: "failed to decode RPC message" },
    ErrorDescriptor { code: ErrorCode::RpcSequenceError, message: "RPC response does not match any pending request" },
    ErrorDescriptor { code: ErrorCode::RpcMethodNotFound, message: "RPC method not found" },
    ErrorDescriptor { code: ErrorCode::RpcChannelError, message: "RPC channel error" },
    ErrorDescriptor { code: ErrorCode::RpcMessageTooLong, message: "RPC message too long" },
    ErrorDescriptor { code: ErrorCode::TnsNoStub, message: "no naming server configured" },
    ErrorDescriptor { code: ErrorCode::TnsServiceRedirect, message: "naming service redirected the request" },
    ErrorDescriptor { code: ErrorCode::TnsMethodNotFound, message: "naming reply carries an unknown opcode" },
    ErrorDescriptor { code: ErrorCode::TnsUnrecognizedFormat, message: "naming reply address has an unrecognized format" },
    ErrorDescriptor { code: ErrorCode::TnsNameNotFound, message: "name not found" },
    ErrorDescriptor { code: ErrorCode::TdcServiceMoved, message: "remote service moved to another address" },
    ErrorDescriptor { code: ErrorCode::TdcMessageQueueOverflow, message: "message queue overflow" },
    ErrorDescriptor { code: ErrorCode::TdcMessageOutOfSequence, message: "acknowledgement out of sequence" },
];

/// Resolves an error code to its description, `"Unknown error"` for codes
/// the table does not know.
pub fn strerror(code: i32) -> &'static str {
    for desc in DESCRIPTORS {
        if desc.code as i32 == code {
            return desc.message;
        }
    }
    "Unknown error"
}

impl ErrorCode {
    /// The stable numeric value carried on the wire and in logs.
    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }

    #[inline]
    pub fn is_ok(self) -> bool {
        self == ErrorCode::Ok
    }

    /// Reverse lookup from a wire code.
    pub fn from_code(code: i32) -> Option<ErrorCode> {
        DESCRIPTORS
            .iter()
            .find(|desc| desc.code as i32 == code)
            .map(|desc| desc.code)
    }

    pub fn message(self) -> &'static str {
        strerror(self as i32)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message(), *self as i32)
    }
}

impl std::error::Error for ErrorCode {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strerror_known_codes() {
        assert_eq!(strerror(0), "ok");
        assert_eq!(strerror(205), "connect timed out");
        assert_eq!(strerror(802), "acknowledgement out of sequence");
    }

    #[test]
    fn test_strerror_unknown_code() {
        assert_eq!(strerror(-1), "Unknown error");
        assert_eq!(strerror(99999), "Unknown error");
    }

    #[test]
    fn test_from_code_roundtrip() {
        for code in [
            ErrorCode::Ok,
            ErrorCode::SocketConnectionRefused,
            ErrorCode::TnsServiceRedirect,
            ErrorCode::TdcMessageQueueOverflow,
        ] {
            assert_eq!(ErrorCode::from_code(code.code()), Some(code));
        }
        assert_eq!(ErrorCode::from_code(12345), None);
    }

    #[test]
    fn test_display_includes_code() {
        let text = ErrorCode::SocketConnectTimeout.to_string();
        assert!(text.contains("205"));
        assert!(text.contains("connect timed out"));
    }
}

use std::collections::HashMap;
use std::io;
use std::string::FromUtf8Error;
use std::sync::{LazyLock, Mutex};
use thiserror::Error;
use tokio::time::error::Elapsed;
use url::ParseError;

#[derive(Error, Debug)]
pub enum Error {
    // General Errors
    #[error("{source}")]
    Timeout {
        #[from]
        source: Elapsed,
    },

    #[error("IO Error happened: {source}")]
    IOError {
        #[from]
        source: io::Error,
    },

    #[error("{source}")]
    FromUtf8Error {
        #[from]
        source: FromUtf8Error,
    },

    #[error("channel communication error")]
    CommunicationError,

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    // Protocol Errors, fatal to the offending connection
    #[error("packet of `{0}` bytes exceeds the `{1}` bytes limit")]
    PacketTooLarge(usize, usize),

    #[error("frame of `{0}` bytes exceeds the `{1}` bytes limit")]
    FrameTooLarge(usize, usize),

    #[error("{0}")]
    ProtocolError(String),

    #[error("couldn't decode packet meta under parser tag `{0}`")]
    DecodeError(u8),

    #[error("couldn't encode value under parser tag `{0}`")]
    EncodeError(u8),

    #[error("Invalid Opcode")]
    InvalidOpcode,

    // Liveness Errors
    #[error("no traffic from peer `{peer}` after {timeouts} heartbeat intervals")]
    HeartbeatTimeout { peer: String, timeouts: u32 },

    // Remote Errors, carried back from the peer in an error envelope
    #[error("[{name}][code|{code}][message|{message}]")]
    Remote {
        name: &'static str,
        code: i32,
        message: String,
    },

    #[error("duplicated error code: {0}")]
    DuplicatedErrorCode(i32),

    // Caller Errors
    #[error("no connection available for this call")]
    NoConnection,

    // Handshake Errors
    #[error("Invalid handshake request method and version")]
    InvalidHTTPHandshake,

    #[error("Connection: Upgrade header missing in the request")]
    NoConnectionHeaderPresent,

    #[error("Upgrade: websocket header missing in the request")]
    NoUpgradeHeaderPresent,

    #[error("unsupported Sec-WebSocket-Version")]
    UnsupportedVersion,

    #[error("Couldn't find Sec-WebSocket-Key header in the request")]
    NoSecWebsocketKey,

    #[error("Server didn't upgrade the connection")]
    NoUpgrade,

    #[error("Sever didn't send a valid Sec-WebSocket-Accept key")]
    InvalidAcceptKey,

    #[error("{source}")]
    HttpParseError {
        #[from]
        source: httparse::Error,
    },

    #[error("Incomplete HTTP request")]
    IncompleteHTTPRequest,

    // HTTP Errors
    #[error("{source}")]
    URLParseError {
        #[from]
        source: ParseError,
    },

    #[error("Invalid scheme in WebSocket URL")]
    InvalidSchemeURL,

    #[error("URL has no host")]
    URLNoHost,
}

impl Error {
    /// Numeric code sent in the error envelope of a failed response.
    /// Remote errors keep their registered code, anything else is reported
    /// as a plain handler failure.
    pub fn remote_code(&self) -> i32 {
        match self {
            Error::Remote { code, .. } => *code,
            _ => codes::HANDLER_FAILED,
        }
    }
}

/// Builtin error codes, registered before any user code runs.
pub mod codes {
    pub const REMOTE_ERROR: i32 = 1;
    pub const METHOD_NOT_FOUND: i32 = 2;
    pub const HANDLER_FAILED: i32 = 3;
}

/// Process-wide registry tying numeric error codes to error class names, so
/// a failed response can be re-instantiated on the caller side as the error
/// the remote handler raised.
pub struct ErrorCodeRegistry {
    names: Mutex<HashMap<i32, &'static str>>,
}

impl ErrorCodeRegistry {
    fn with_builtin_codes() -> Self {
        let mut names = HashMap::new();
        names.insert(codes::REMOTE_ERROR, "RemoteError");
        names.insert(codes::METHOD_NOT_FOUND, "MethodNotFound");
        names.insert(codes::HANDLER_FAILED, "HandlerFailed");
        ErrorCodeRegistry {
            names: Mutex::new(names),
        }
    }

    /// Binds a code to an error class name. Duplicated codes are rejected,
    /// since two classes answering for one code would make re-instantiation
    /// ambiguous.
    pub fn register(&self, code: i32, name: &'static str) -> Result<(), Error> {
        let mut names = self.names.lock().unwrap();
        if names.contains_key(&code) {
            return Err(Error::DuplicatedErrorCode(code));
        }
        names.insert(code, name);
        Ok(())
    }

    pub fn name_for(&self, code: i32) -> Option<&'static str> {
        self.names.lock().unwrap().get(&code).copied()
    }

    /// Builds the error carried by a failed response. Codes nobody
    /// registered fall back to the generic remote error class.
    pub fn error_for_code(&self, code: i32, message: String) -> Error {
        Error::Remote {
            name: self.name_for(code).unwrap_or("RemoteError"),
            code,
            message,
        }
    }
}

static REGISTRY: LazyLock<ErrorCodeRegistry> = LazyLock::new(ErrorCodeRegistry::with_builtin_codes);

pub fn registry() -> &'static ErrorCodeRegistry {
    &REGISTRY
}

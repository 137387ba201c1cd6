//! FTP reply rendering and status codes

/// An FTP reply, single- or multi-line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// 3-digit reply code
    pub code: u16,
    /// First (or only) text line
    pub text: String,
    /// Additional lines for multi-line replies
    pub extra: Vec<String>,
}

impl Reply {
    /// A single-line reply
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
            extra: Vec::new(),
        }
    }

    /// A multi-line reply; `lines` render between the opening and closing
    /// code lines per RFC 959 §4.2
    pub fn multiline(code: u16, text: impl Into<String>, lines: Vec<String>) -> Self {
        Self {
            code,
            text: text.into(),
            extra: lines,
        }
    }

    /// Render with CRLF terminators, ready for the wire
    pub fn to_wire(&self) -> String {
        if self.extra.is_empty() {
            return format!("{} {}\r\n", self.code, self.text);
        }
        let mut out = format!("{}-{}\r\n", self.code, self.text);
        for line in &self.extra {
            out.push(' ');
            out.push_str(line);
            out.push_str("\r\n");
        }
        out.push_str(&format!("{} End\r\n", self.code));
        out
    }

    /// Whether this reply indicates success (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

/// FTP reply codes (RFC 959, RFC 2228, RFC 4217)
#[allow(dead_code)]
pub mod codes {
    // 1xx - Positive preliminary
    /// File status okay; about to open data connection
    pub const OPENING_DATA: u16 = 150;

    // 2xx - Positive completion
    /// Command okay
    pub const OK: u16 = 200;
    /// Command not implemented, superfluous at this site (ACCT)
    pub const SUPERFLUOUS: u16 = 202;
    /// System status / FEAT list
    pub const SYSTEM_STATUS: u16 = 211;
    /// File status (SIZE, MDTM, STAT)
    pub const FILE_STATUS: u16 = 213;
    /// Help message
    pub const HELP: u16 = 214;
    /// System type
    pub const SYSTEM_TYPE: u16 = 215;
    /// Service ready
    pub const READY: u16 = 220;
    /// Service closing control connection
    pub const CLOSING: u16 = 221;
    /// Closing data connection; transfer complete
    pub const TRANSFER_COMPLETE: u16 = 226;
    /// Entering passive mode
    pub const PASSIVE_MODE: u16 = 227;
    /// Entering extended passive mode (RFC 2428)
    pub const EXTENDED_PASSIVE_MODE: u16 = 229;
    /// User logged in
    pub const LOGGED_IN: u16 = 230;
    /// Security data exchange complete (RFC 2228)
    pub const AUTH_OK: u16 = 234;
    /// Requested file action okay
    pub const FILE_ACTION_OK: u16 = 250;
    /// Pathname created
    pub const PATH_CREATED: u16 = 257;

    // 3xx - Positive intermediate
    /// User name okay, need password
    pub const NEED_PASSWORD: u16 = 331;
    /// Requested file action pending further information (RNFR, REST)
    pub const PENDING_FURTHER_INFO: u16 = 350;

    // 4xx - Transient negative
    /// Service not available, closing control connection
    pub const SERVICE_NOT_AVAILABLE: u16 = 421;
    /// Can't open data connection
    pub const CANT_OPEN_DATA: u16 = 425;
    /// Connection closed; transfer aborted
    pub const TRANSFER_ABORTED: u16 = 426;
    /// Requested file action not taken (file busy)
    pub const FILE_ACTION_NOT_TAKEN: u16 = 450;
    /// Requested action aborted: local error in processing
    pub const LOCAL_ERROR: u16 = 451;

    // 5xx - Permanent negative
    /// Syntax error, command unrecognized
    pub const SYNTAX_ERROR: u16 = 500;
    /// Syntax error in parameters or arguments
    pub const SYNTAX_ERROR_ARGS: u16 = 501;
    /// Command not implemented
    pub const NOT_IMPLEMENTED: u16 = 502;
    /// Bad sequence of commands
    pub const BAD_SEQUENCE: u16 = 503;
    /// Command not implemented for that parameter
    pub const NOT_IMPLEMENTED_FOR_PARAM: u16 = 504;
    /// Not logged in
    pub const NOT_LOGGED_IN: u16 = 530;
    /// Request denied for policy reasons (RFC 2228); TLS required
    pub const POLICY_REQUIRES_TLS: u16 = 534;
    /// Requested action not taken; file unavailable
    pub const FILE_UNAVAILABLE: u16 = 550;
    /// Requested action not taken; file name not allowed
    pub const NAME_NOT_ALLOWED: u16 = 553;
}

//! FTP reply types and reply codes

/// FTP reply with code, final-line text, and any interior multi-line content
///
/// Multi-line replies (`NNN-first ... NNN last`) keep the interior lines in
/// `lines`; `text` is always the terminating line's text. The reply code is
/// the three-digit value of the terminating line, or 0 if the line did not
/// start with a digit.
#[derive(Debug, Clone)]
pub struct FtpResponse {
    /// 3-digit FTP reply code (0 if malformed)
    pub code: u16,
    /// Text of the (final) reply line, code stripped
    pub text: String,
    /// Interior lines of a multi-line reply (full lines, untrimmed)
    pub lines: Vec<String>,
}

impl FtpResponse {
    /// Leading digit of the reply code: 1 intermediate, 2 success,
    /// 3 continue, 4 transient failure, 5 permanent failure, 0 malformed.
    pub fn category(&self) -> u16 {
        self.code / 100
    }

    /// Check if reply indicates success (2xx)
    pub fn is_success(&self) -> bool {
        self.category() == 2
    }

    /// Check if reply asks for the next command of an exchange (3xx)
    pub fn is_continuation(&self) -> bool {
        self.category() == 3
    }

    /// Check if reply is an intermediate mark (1xx), not a final reply
    pub fn is_intermediate(&self) -> bool {
        self.category() == 1
    }

    /// Success or continuation; the usual "command accepted" check
    pub fn is_positive(&self) -> bool {
        let c = self.category();
        c == 2 || c == 3
    }

    /// Check if reply indicates error (4xx or 5xx)
    pub fn is_error(&self) -> bool {
        self.category() >= 4
    }

    /// Check if reply indicates a permanent error (5xx)
    pub fn is_permanent_error(&self) -> bool {
        self.category() == 5
    }

    /// The full reply line as the server sent it (code and text)
    pub fn full_line(&self) -> String {
        format!("{:03} {}", self.code, self.text)
    }
}

/// FTP reply codes (RFC 959, RFC 2228, RFC 3659)
#[allow(dead_code)]
pub mod codes {
    // 1xx - Positive preliminary
    /// File status okay; about to open data connection
    pub const FILE_STATUS_OK: u16 = 150;

    // 2xx - Positive completion
    /// Command okay
    pub const COMMAND_OK: u16 = 200;
    /// Service ready for new user
    pub const SERVICE_READY: u16 = 220;
    /// Service closing control connection
    pub const CLOSING_CONTROL: u16 = 221;
    /// Closing data connection; transfer successful
    pub const TRANSFER_COMPLETE: u16 = 226;
    /// Entering passive mode (RFC 959 Section 4.1.2)
    pub const ENTERING_PASSIVE: u16 = 227;
    /// Entering extended passive mode (RFC 2428 Section 3)
    pub const ENTERING_EXTENDED_PASSIVE: u16 = 229;
    /// User logged in
    pub const LOGGED_IN: u16 = 230;
    /// Security data exchange complete (RFC 2228)
    pub const SECURITY_EXCHANGE_OK: u16 = 234;
    /// Requested file action okay, completed
    pub const FILE_ACTION_OK: u16 = 250;
    /// "PATHNAME" created / current directory reply
    pub const PATHNAME_CREATED: u16 = 257;
    /// File status (SIZE/MDTM replies)
    pub const FILE_STATUS: u16 = 213;
    /// System type reply
    pub const SYSTEM_TYPE: u16 = 215;
    /// FEAT list follows (RFC 2389 Section 3)
    pub const FEATURE_LIST: u16 = 211;

    // 3xx - Positive intermediate
    /// User name okay, need password
    pub const NEED_PASSWORD: u16 = 331;
    /// Need account for login
    pub const NEED_ACCOUNT: u16 = 332;
    /// Requested file action pending further information (REST, RNFR)
    pub const FILE_ACTION_PENDING: u16 = 350;

    // 4xx - Transient negative
    /// Can't open data connection
    pub const CANT_OPEN_DATA: u16 = 425;
    /// Connection closed; transfer aborted
    pub const TRANSFER_ABORTED: u16 = 426;
    /// Requested file action not taken (file busy)
    pub const FILE_ACTION_NOT_TAKEN: u16 = 450;

    // 5xx - Permanent negative
    /// Syntax error, command unrecognized
    pub const COMMAND_UNRECOGNIZED: u16 = 500;
    /// Syntax error in parameters
    pub const SYNTAX_ERROR: u16 = 501;
    /// Command not implemented
    pub const NOT_IMPLEMENTED: u16 = 502;
    /// Not logged in
    pub const NOT_LOGGED_IN: u16 = 530;
    /// Requested action not taken; file unavailable
    pub const FILE_UNAVAILABLE: u16 = 550;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(code: u16) -> FtpResponse {
        FtpResponse {
            code,
            text: String::new(),
            lines: vec![],
        }
    }

    #[test]
    fn test_categories() {
        assert!(reply(150).is_intermediate());
        assert!(reply(226).is_success());
        assert!(reply(331).is_continuation());
        assert!(reply(450).is_error());
        assert!(!reply(450).is_permanent_error());
        assert!(reply(550).is_permanent_error());
    }

    #[test]
    fn test_positive() {
        assert!(reply(200).is_positive());
        assert!(reply(350).is_positive());
        assert!(!reply(150).is_positive());
        assert!(!reply(550).is_positive());
    }

    #[test]
    fn test_malformed_code() {
        let r = reply(0);
        assert_eq!(r.category(), 0);
        assert!(!r.is_positive());
        assert!(!r.is_error());
    }

    #[test]
    fn test_full_line() {
        let r = FtpResponse {
            code: 230,
            text: "Logged in".to_string(),
            lines: vec![],
        };
        assert_eq!(r.full_line(), "230 Logged in");
    }
}

//! FTP server configuration and engine options

use crate::path::ServerType;

/// Wire protocol for the control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Protocol {
    /// Plain FTP
    #[default]
    Ftp,
    /// Implicit TLS: the whole connection is wrapped before the greeting
    Ftps,
    /// Explicit TLS: plain connection upgraded via AUTH TLS
    Ftpes,
}

/// How credentials are obtained and presented during login
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LogonType {
    /// USER anonymous, password is an email-ish token
    Anonymous,
    /// Stored username and password
    #[default]
    Normal,
    /// Username stored, password asked per session
    Ask,
    /// Server issues a challenge, password prompted interactively
    Interactive,
    /// Normal plus an ACCT step
    Account,
}

/// Character encoding policy for command text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CharsetEncoding {
    /// UTF-8 when the server advertises it, local charset otherwise
    #[default]
    Auto,
    /// Always UTF-8
    Utf8,
    /// Always the local (Latin-1) charset
    Local,
}

/// Preference for the data-connection setup mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PassiveMode {
    /// Follow the engine-wide `use_pasv` option
    #[default]
    Default,
    /// Force PASV/EPSV
    Passive,
    /// Force PORT/EPRT
    Active,
}

/// FTP server configuration
///
/// Contains everything needed to connect and log in to one server.
///
/// # Example
///
/// ```
/// use ftp_rs::ServerConfig;
///
/// let config = ServerConfig::ftpes("ftp.example.com", "user", "pass");
/// assert_eq!(config.port, 21);
/// ```
#[must_use]
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServerConfig {
    /// Server hostname
    pub host: String,

    /// Server port (21 for FTP/FTPES, 990 for implicit FTPS)
    pub port: u16,

    /// Control-connection protocol
    #[cfg_attr(feature = "serde", serde(default))]
    pub protocol: Protocol,

    /// Username for authentication
    pub username: String,

    /// Password for authentication
    pub password: String,

    /// Account for servers that require an ACCT step
    #[cfg_attr(feature = "serde", serde(default))]
    pub account: String,

    /// How credentials are presented
    #[cfg_attr(feature = "serde", serde(default))]
    pub logon_type: LogonType,

    /// Command-text encoding policy
    #[cfg_attr(feature = "serde", serde(default))]
    pub encoding: CharsetEncoding,

    /// Server filesystem flavor hint; refined from SYST when `Default`
    #[cfg_attr(feature = "serde", serde(default))]
    pub server_type: ServerType,

    /// Data-connection mode preference
    #[cfg_attr(feature = "serde", serde(default))]
    pub passive_mode: PassiveMode,

    /// Skip any configured FTP proxy for this server
    #[cfg_attr(feature = "serde", serde(default))]
    pub bypass_proxy: bool,

    /// Fixed server timezone offset in minutes, applied to listing times
    #[cfg_attr(feature = "serde", serde(default))]
    pub timezone_offset_minutes: i32,

    /// Commands sent verbatim after a successful login, in order
    #[cfg_attr(feature = "serde", serde(default))]
    pub post_login_commands: Vec<String>,

    /// Allow insecure TLS connections (self-signed, expired certificates)
    ///
    /// **Security Warning:** Setting this to `true` disables certificate
    /// validation, making the connection vulnerable to man-in-the-middle
    /// attacks. Only use this for testing or with servers you trust on a
    /// secure network.
    #[cfg_attr(feature = "serde", serde(default))]
    pub allow_insecure_tls: bool,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(
        host: impl Into<String>,
        port: u16,
        protocol: Protocol,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
            username: username.into(),
            password: password.into(),
            account: String::new(),
            logon_type: LogonType::Normal,
            encoding: CharsetEncoding::Auto,
            server_type: ServerType::Default,
            passive_mode: PassiveMode::Default,
            bypass_proxy: false,
            timezone_offset_minutes: 0,
            post_login_commands: Vec::new(),
            allow_insecure_tls: false,
        }
    }

    /// Plain FTP on the standard port (21)
    ///
    /// **Warning:** Plain connections transmit credentials in clear text.
    pub fn ftp(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::new(host, 21, Protocol::Ftp, username, password)
    }

    /// Explicit TLS (AUTH TLS upgrade) on the standard port (21)
    pub fn ftpes(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::new(host, 21, Protocol::Ftpes, username, password)
    }

    /// Implicit TLS on the standard secure port (990)
    pub fn ftps(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::new(host, 990, Protocol::Ftps, username, password)
    }

    /// Anonymous login over plain FTP
    pub fn anonymous(host: impl Into<String>) -> Self {
        let mut config = Self::ftp(host, "anonymous", "anonymous@");
        config.logon_type = LogonType::Anonymous;
        config
    }

    /// Host formatted for proxy login commands (`host` or `host:port`)
    pub fn format_host(&self) -> String {
        if self.port == 21 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// FTP proxy flavor for the login sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FtpProxyType {
    /// No FTP proxy
    #[default]
    None,
    /// `USER user@host`
    UserAtHost,
    /// `SITE host` before the regular login
    Site,
    /// `OPEN host` before the regular login
    Open,
    /// Custom sequence with `%h`/`%u`/`%p`/`%s`/`%w`/`%a` placeholders
    Custom,
}

/// How the external IP for active-mode transfers is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ExternalIpMode {
    /// Use the local address of the control connection
    #[default]
    Default,
    /// Use the configured `external_ip`
    Fixed,
    /// Ask the configured resolver service
    Resolver,
}

/// Engine-wide options consumed by the session
///
/// These correspond to the knobs a hosting application persists; one
/// instance is shared by every session of an engine.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineOptions {
    /// Request hidden files in directory listings (LIST -a probing)
    pub view_hidden_files: bool,
    /// Default to passive mode when the server has no preference
    pub use_pasv: bool,
    /// Flip PASV<->PORT once when the chosen mode is rejected
    pub allow_transfer_mode_fallback: bool,
    /// On an unroutable PASV address, substitute the peer IP instead of failing
    pub pasv_reply_fallback_mode: bool,
    /// How to obtain the external IP for PORT/EPRT
    pub external_ip_mode: ExternalIpMode,
    /// Fixed external IP, used when `external_ip_mode` is `Fixed`
    pub external_ip: String,
    /// Resolver service location, used when `external_ip_mode` is `Resolver`
    pub external_ip_resolver: String,
    /// Use the local address when the peer itself is not routable
    pub no_external_on_local: bool,
    /// Cached result of the last resolver run
    pub last_resolved_ip: String,
    /// Carry remote timestamps onto downloaded files and MFMT uploads
    pub preserve_timestamps: bool,
    /// FTP proxy flavor
    pub ftp_proxy_type: FtpProxyType,
    /// FTP proxy `host` or `host:port`
    pub ftp_proxy_host: String,
    /// Optional proxy credentials
    pub ftp_proxy_user: String,
    /// Optional proxy credentials
    pub ftp_proxy_pass: String,
    /// Newline-separated custom login sequence for `FtpProxyType::Custom`
    pub ftp_proxy_custom_login_sequence: String,
    /// A generic (SOCKS/HTTP) proxy is configured; forces passive mode
    pub generic_proxy: bool,
    /// Send NOOP/TYPE/PWD keepalives on idle control connections
    pub ftp_send_keepalive: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            view_hidden_files: false,
            use_pasv: true,
            allow_transfer_mode_fallback: true,
            pasv_reply_fallback_mode: false,
            external_ip_mode: ExternalIpMode::Default,
            external_ip: String::new(),
            external_ip_resolver: String::new(),
            no_external_on_local: true,
            last_resolved_ip: String::new(),
            preserve_timestamps: false,
            ftp_proxy_type: FtpProxyType::None,
            ftp_proxy_host: String::new(),
            ftp_proxy_user: String::new(),
            ftp_proxy_pass: String::new(),
            ftp_proxy_custom_login_sequence: String::new(),
            generic_proxy: false,
            ftp_send_keepalive: true,
        }
    }
}

impl EngineOptions {
    /// Split `ftp_proxy_host` into host and port, defaulting to port 21
    ///
    /// Returns `None` when a proxy is configured but host or port is
    /// unusable.
    pub fn proxy_host_port(&self) -> Option<(String, u16)> {
        let raw = self.ftp_proxy_host.trim();
        if raw.is_empty() {
            return None;
        }
        match raw.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port.parse().ok().filter(|p| *p > 0)?;
                if host.is_empty() {
                    return None;
                }
                Some((host.to_string(), port))
            }
            None => Some((raw.to_string(), 21)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new() {
        let config = ServerConfig::new("ftp.example.com", 21, Protocol::Ftp, "user", "pass");
        assert_eq!(config.host, "ftp.example.com");
        assert_eq!(config.port, 21);
        assert_eq!(config.protocol, Protocol::Ftp);
        assert_eq!(config.username, "user");
        assert_eq!(config.password, "pass");
        assert!(!config.allow_insecure_tls);
    }

    #[test]
    fn test_ftpes_helper() {
        let config = ServerConfig::ftpes("ftp.example.com", "user", "pass");
        assert_eq!(config.port, 21);
        assert_eq!(config.protocol, Protocol::Ftpes);
    }

    #[test]
    fn test_ftps_helper() {
        let config = ServerConfig::ftps("ftp.example.com", "user", "pass");
        assert_eq!(config.port, 990);
        assert_eq!(config.protocol, Protocol::Ftps);
    }

    #[test]
    fn test_anonymous_helper() {
        let config = ServerConfig::anonymous("ftp.example.com");
        assert_eq!(config.username, "anonymous");
        assert_eq!(config.logon_type, LogonType::Anonymous);
    }

    #[test]
    fn test_format_host() {
        let config = ServerConfig::ftp("ftp.example.com", "u", "p");
        assert_eq!(config.format_host(), "ftp.example.com");

        let config = ServerConfig::new("ftp.example.com", 2121, Protocol::Ftp, "u", "p");
        assert_eq!(config.format_host(), "ftp.example.com:2121");
    }

    #[test]
    fn test_proxy_host_port() {
        let mut options = EngineOptions::default();
        assert_eq!(options.proxy_host_port(), None);

        options.ftp_proxy_host = "proxy.example.com".to_string();
        assert_eq!(
            options.proxy_host_port(),
            Some(("proxy.example.com".to_string(), 21))
        );

        options.ftp_proxy_host = "proxy.example.com:2121".to_string();
        assert_eq!(
            options.proxy_host_port(),
            Some(("proxy.example.com".to_string(), 2121))
        );

        options.ftp_proxy_host = "proxy.example.com:bogus".to_string();
        assert_eq!(options.proxy_host_port(), None);

        options.ftp_proxy_host = ":21".to_string();
        assert_eq!(options.proxy_host_port(), None);
    }
}

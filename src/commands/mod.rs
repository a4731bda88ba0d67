//! FTP command builders and reply parsers

pub mod metadata;
pub mod simple;
pub mod transfer;

pub use metadata::*;
pub use simple::*;
pub use transfer::*;

// Login and session management commands

/// Build USER command
pub fn user(username: &str) -> String {
    format!("USER {}", username)
}

/// Build PASS command
pub fn pass(password: &str) -> String {
    format!("PASS {}", password)
}

/// Build ACCT command
pub fn acct(account: &str) -> String {
    format!("ACCT {}", account)
}

/// Build AUTH TLS command (RFC 4217)
pub fn auth_tls() -> &'static str {
    "AUTH TLS"
}

/// Build AUTH SSL command (RFC 2228), the legacy explicit-TLS spelling
/// tried when a server rejects AUTH TLS
pub fn auth_ssl() -> &'static str {
    "AUTH SSL"
}

/// Build SYST command
pub fn syst() -> &'static str {
    "SYST"
}

/// Build FEAT command (RFC 2389 §3)
pub fn feat() -> &'static str {
    "FEAT"
}

/// Build CLNT command
///
/// Some servers refuse to enable UTF-8 unless a CLNT command arrives first;
/// sent whenever the server advertises CLNT and UTF-8 is negotiated.
pub fn clnt(client_name: &str) -> String {
    format!("CLNT {}", client_name)
}

/// Build OPTS UTF8 ON command
///
/// Servers following the pre-RFC 2640 draft list UTF8 in FEAT but only
/// switch after an explicit OPTS UTF8 ON.
pub fn opts_utf8_on() -> &'static str {
    "OPTS UTF8 ON"
}

/// Build OPTS MLST command with the fact list to enable
pub fn opts_mlst(facts: &str) -> String {
    format!("OPTS MLST {}", facts)
}

/// Build PBSZ command (RFC 2228); always 0 for TLS
pub fn pbsz_zero() -> &'static str {
    "PBSZ 0"
}

/// Build PROT P command (RFC 2228/4217): protect the data channel
pub fn prot_private() -> &'static str {
    "PROT P"
}

/// Build NOOP command
pub fn noop() -> &'static str {
    "NOOP"
}

/// Build PWD command
pub fn pwd() -> &'static str {
    "PWD"
}

/// Build CWD command
pub fn cwd(path: &str) -> String {
    format!("CWD {}", path)
}

/// Build CDUP command
pub fn cdup() -> &'static str {
    "CDUP"
}

/// Build QUIT command
pub fn quit() -> &'static str {
    "QUIT"
}

/// Mask the arguments of a command for logging
///
/// Everything after the first space is replaced by one asterisk per
/// character, so transcripts show `PASS ******` instead of the secret.
pub fn mask_arguments(command: &str) -> String {
    match command.find(' ') {
        Some(pos) => {
            let stars = "*".repeat(command.len() - pos - 1);
            format!("{}{}", &command[..=pos], stars)
        }
        None => command.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_builders() {
        assert_eq!(user("alice"), "USER alice");
        assert_eq!(pass("secret"), "PASS secret");
        assert_eq!(acct("acc1"), "ACCT acc1");
        assert_eq!(auth_tls(), "AUTH TLS");
        assert_eq!(clnt("ftp-rs"), "CLNT ftp-rs");
        assert_eq!(opts_utf8_on(), "OPTS UTF8 ON");
        assert_eq!(opts_mlst("type;size;"), "OPTS MLST type;size;");
        assert_eq!(pbsz_zero(), "PBSZ 0");
        assert_eq!(prot_private(), "PROT P");
        assert_eq!(cwd("/pub"), "CWD /pub");
        assert_eq!(cdup(), "CDUP");
        assert_eq!(quit(), "QUIT");
    }

    #[test]
    fn test_mask_arguments() {
        assert_eq!(mask_arguments("PASS secret"), "PASS ******");
        assert_eq!(mask_arguments("NOOP"), "NOOP");
        assert_eq!(mask_arguments("ACCT x"), "ACCT *");
    }
}

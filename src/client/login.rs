//! Login orchestration: welcome, TLS upgrade, credential sequence, SYST,
//! FEAT, charset negotiation, PROT, OPTS MLST, post-login commands

use tracing::{debug, warn};

use super::FtpClient;
use crate::capabilities::{Capability, CapabilityState};
use crate::commands;
use crate::config::{CharsetEncoding, FtpProxyType, LogonType, Protocol, ServerConfig};
use crate::config::EngineOptions;
use crate::error::{FtpError, Result};
use crate::path::ServerType;

/// Name sent with CLNT for servers that gate UTF-8 on it
const CLIENT_NAME: &str = "ftp-rs";

/// MLST facts this client understands
const KNOWN_MLST_FACTS: &[&str] = &[
    "type",
    "size",
    "modify",
    "perm",
    "unix.mode",
    "unix.owner",
    "unix.user",
    "unix.group",
    "unix.uid",
    "unix.gid",
    "x.hidden",
];

/// Verb class of one login-sequence element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoginCommandKind {
    User,
    Pass,
    Account,
    Other,
}

/// One element of the credential exchange
#[derive(Debug, Clone)]
pub(crate) struct LoginCommand {
    pub kind: LoginCommandKind,
    /// Literal command; empty means "build the default for the kind"
    pub command: String,
    /// Skipped when an earlier step already returned 2xx
    pub optional: bool,
    /// Mask arguments in the transcript
    pub hide_arguments: bool,
}

/// Build the credential exchange for the configured proxy type
pub(crate) fn build_login_sequence(
    config: &ServerConfig,
    options: &EngineOptions,
) -> Result<Vec<LoginCommand>> {
    let proxy = if config.bypass_proxy || options.generic_proxy {
        FtpProxyType::None
    } else {
        options.ftp_proxy_type
    };

    let mut sequence = Vec::new();

    let push_proxy_credentials = |sequence: &mut Vec<LoginCommand>| {
        if !options.ftp_proxy_user.is_empty() {
            sequence.push(LoginCommand {
                kind: LoginCommandKind::Other,
                command: format!("USER {}", options.ftp_proxy_user),
                optional: false,
                hide_arguments: false,
            });
            sequence.push(LoginCommand {
                kind: LoginCommandKind::Other,
                command: format!("PASS {}", options.ftp_proxy_pass),
                optional: true,
                hide_arguments: true,
            });
        }
    };

    let push_standard_tail = |sequence: &mut Vec<LoginCommand>, user_command: String| {
        sequence.push(LoginCommand {
            kind: LoginCommandKind::User,
            command: user_command,
            optional: false,
            hide_arguments: false,
        });
        sequence.push(LoginCommand {
            kind: LoginCommandKind::Pass,
            command: String::new(),
            optional: true,
            hide_arguments: true,
        });
        if !config.account.is_empty() {
            sequence.push(LoginCommand {
                kind: LoginCommandKind::Account,
                command: String::new(),
                optional: true,
                hide_arguments: false,
            });
        }
    };

    match proxy {
        FtpProxyType::None => {
            push_standard_tail(&mut sequence, String::new());
        }
        FtpProxyType::UserAtHost => {
            push_proxy_credentials(&mut sequence);
            push_standard_tail(
                &mut sequence,
                format!("USER {}@{}", config.username, config.format_host()),
            );
        }
        FtpProxyType::Site | FtpProxyType::Open => {
            push_proxy_credentials(&mut sequence);
            let verb = if proxy == FtpProxyType::Site {
                "SITE"
            } else {
                "OPEN"
            };
            sequence.push(LoginCommand {
                kind: LoginCommandKind::User,
                command: format!("{} {}", verb, config.format_host()),
                optional: false,
                hide_arguments: false,
            });
            push_standard_tail(&mut sequence, String::new());
        }
        FtpProxyType::Custom => {
            build_custom_sequence(config, options, &mut sequence)?;
        }
    }

    Ok(sequence)
}

/// Expand the newline-separated custom proxy login sequence
///
/// Placeholders: `%h` host, `%u` user, `%p` pass (substituted at send
/// time), `%s` proxy user, `%w` proxy pass, `%a` account, `%%` literal
/// percent. Lines carrying only proxy credentials are dropped when no
/// proxy user is configured; `%a` lines are dropped when the account is
/// empty.
fn build_custom_sequence(
    config: &ServerConfig,
    options: &EngineOptions,
    sequence: &mut Vec<LoginCommand>,
) -> Result<()> {
    let escape = |s: &str| s.replace('%', "%%");
    let proxy_user = escape(&options.ftp_proxy_user);
    let proxy_pass = escape(&options.ftp_proxy_pass);
    let host = escape(&config.format_host());
    let user = escape(&config.username);
    let account = escape(&config.account);

    for raw in options.ftp_proxy_custom_login_sequence.lines() {
        let token = raw.trim();
        if token.is_empty() {
            continue;
        }

        let has_host = token.contains("%h");
        let has_user = token.contains("%u");
        let has_pass = token.contains("%p");
        let has_proxy_user = token.contains("%s");
        let has_proxy_pass = token.contains("%w");

        let has_account = if token.contains("%a") {
            if config.account.is_empty() {
                continue;
            }
            true
        } else {
            false
        };

        if (has_proxy_user || has_proxy_pass)
            && !has_host
            && !has_user
            && options.ftp_proxy_user.is_empty()
        {
            continue;
        }

        let mut command = token
            .replace("%s", &proxy_user)
            .replace("%w", &proxy_pass)
            .replace("%h", &host)
            .replace("%u", &user)
            .replace("%a", &account);

        // %p is substituted when the command is sent, so an interactive
        // login can still change the password; the %% unescape is deferred
        // with it.
        if !has_pass {
            command = command.replace("%%", "%");
        }

        let (kind, optional) = if has_user && !has_pass && !has_account {
            (LoginCommandKind::User, false)
        } else if has_pass && !has_user && !has_account {
            (LoginCommandKind::Pass, true)
        } else if has_account && !has_user && !has_pass {
            (LoginCommandKind::Account, true)
        } else {
            (LoginCommandKind::Other, false)
        };

        sequence.push(LoginCommand {
            kind,
            command,
            optional,
            hide_arguments: has_pass || has_proxy_pass,
        });
    }

    if sequence.is_empty() {
        return Err(FtpError::Other(
            "Could not generate custom login sequence".to_string(),
        ));
    }
    Ok(())
}

/// Render one sequence element into the command line to send
fn render_login_command(
    cmd: &LoginCommand,
    config: &ServerConfig,
    password: &str,
) -> String {
    match cmd.kind {
        LoginCommandKind::User => {
            if cmd.command.is_empty() {
                commands::user(&config.username)
            } else {
                cmd.command.clone()
            }
        }
        LoginCommandKind::Pass => {
            if cmd.command.is_empty() {
                commands::pass(password)
            } else {
                let escaped = password.replace('%', "%%");
                cmd.command.replace("%p", &escaped).replace("%%", "%")
            }
        }
        LoginCommandKind::Account => {
            if cmd.command.is_empty() {
                commands::acct(&config.account)
            } else {
                cmd.command.clone()
            }
        }
        LoginCommandKind::Other => cmd.command.clone(),
    }
}

/// Map a FEAT continuation line onto capability facts
///
/// Returns the capability updates as (capability, payload) pairs so the
/// caller can apply them against its registry.
fn parse_feat_line(line: &str) -> Option<(Capability, Option<String>)> {
    let trimmed = line.trim_start();
    let upper = trimmed.to_uppercase();

    let matches_word = |word: &str| {
        upper == word || upper.starts_with(&format!("{} ", word))
    };

    if matches_word("UTF8") {
        Some((Capability::Utf8Command, None))
    } else if matches_word("CLNT") {
        Some((Capability::ClntCommand, None))
    } else if matches_word("MLSD") {
        Some((Capability::MlsdCommand, None))
    } else if matches_word("MLST") {
        let facts = trimmed.strip_prefix("MLST").map(|s| s.trim_start().to_string());
        Some((Capability::MlsdCommand, facts))
    } else if upper == "MODE Z" || upper.starts_with("MODE Z ") {
        Some((Capability::ModeZSupport, None))
    } else if matches_word("MFMT") {
        Some((Capability::MfmtCommand, None))
    } else if matches_word("PRET") {
        Some((Capability::PretCommand, None))
    } else if matches_word("MDTM") {
        Some((Capability::MdtmCommand, None))
    } else if matches_word("SIZE") {
        Some((Capability::SizeCommand, None))
    } else if matches_word("TVFS") {
        Some((Capability::TvfsSupport, None))
    } else if upper == "REST STREAM" {
        Some((Capability::RestStream, None))
    } else {
        None
    }
}

/// Work out which MLST facts to enable
///
/// The FEAT fact list marks default-enabled facts with a trailing `*`.
/// When every fact we understand is already enabled there is nothing to
/// send; otherwise the returned string goes out as `OPTS MLST <facts>`.
fn negotiate_mlst_facts(fact_list: &str) -> Option<String> {
    let mut wanted = String::new();
    let mut had_unset = false;

    for fact in fact_list.to_lowercase().split(';') {
        let fact = fact.trim();
        if fact.is_empty() {
            continue;
        }
        let (name, enabled) = match fact.strip_suffix('*') {
            Some(name) => (name, true),
            None => (fact, false),
        };
        if name.is_empty() {
            continue;
        }
        if KNOWN_MLST_FACTS.contains(&name) {
            had_unset |= !enabled;
            wanted.push_str(name);
            wanted.push(';');
        }
    }

    had_unset.then_some(wanted)
}

/// Infer the server flavor from a SYST answer
fn infer_server_type(syst: &str) -> Option<ServerType> {
    let upper = syst.to_uppercase();
    if syst.starts_with("MVS") {
        Some(ServerType::Mvs)
    } else if upper.starts_with("Z/VM") {
        Some(ServerType::Zvm)
    } else if upper.starts_with("NONSTOP ") {
        Some(ServerType::HpNonStop)
    } else {
        None
    }
}

fn credentials_are_ascii(config: &ServerConfig) -> bool {
    config
        .username
        .chars()
        .chain(config.password.chars())
        .chain(config.account.chars())
        .all(|c| (c as u32) <= 127)
}

impl FtpClient {
    /// Run the full login orchestration
    ///
    /// Welcome, AUTH TLS upgrade (FTPES), the credential sequence, SYST and
    /// FEAT discovery, charset negotiation, PBSZ/PROT for TLS sessions,
    /// OPTS MLST fact selection, and the configured post-login commands.
    ///
    /// # Errors
    ///
    /// - [`FtpError::WrongProtocol`] - the server greeted with an SSH banner
    /// - [`FtpError::AuthFailed`] - the server rejected the password
    /// - [`FtpError::LoginIncomplete`] - sequence exhausted on a 3xx reply
    /// - [`FtpError::Tls`] - AUTH TLS upgrade or certificate trust failed
    /// - [`FtpError::Cancelled`] - an interactive login was dismissed
    pub async fn login(&mut self) -> Result<()> {
        self.begin_op().await?;
        let result = self.login_inner().await;
        if result.is_ok() {
            self.logged_in = true;
            self.ctx.notifier.status("Connected");
        }
        self.end_op(result)
    }

    async fn login_inner(&mut self) -> Result<()> {
        self.state.use_utf8 = match self.config.encoding {
            CharsetEncoding::Utf8 => true,
            CharsetEncoding::Local => false,
            CharsetEncoding::Auto => {
                self.ctx.capabilities.get(&self.server_key, Capability::Utf8Command)
                    != CapabilityState::No
            }
        };

        self.read_welcome().await?;

        if self.config.protocol == Protocol::Ftpes && !self.state.tls_active {
            self.explicit_tls_upgrade().await?;
        }

        self.run_login_sequence().await?;
        let skip_client_hints = self.discover_syst().await?;
        self.discover_feat().await?;

        if self.state.use_utf8 && !skip_client_hints {
            if self.ctx.capabilities.get(&self.server_key, Capability::ClntCommand)
                == CapabilityState::Yes
            {
                let _ = self.exchange(&commands::clnt(CLIENT_NAME), false).await?;
            }
            if self.ctx.capabilities.get(&self.server_key, Capability::Utf8Command)
                == CapabilityState::Yes
            {
                let _ = self.exchange(commands::opts_utf8_on(), false).await?;
            }
        }

        if matches!(self.config.protocol, Protocol::Ftps | Protocol::Ftpes) {
            let _ = self.exchange(commands::pbsz_zero(), false).await?;
            let reply = self.exchange(commands::prot_private(), false).await?;
            if reply.is_positive() {
                self.state.protect_data_channel = true;
            }
        }

        self.negotiate_mlst().await?;

        for command in self.config.post_login_commands.clone() {
            let reply = self.exchange(&command, false).await?;
            if !reply.is_positive() {
                warn!(command = %command, reply = %reply.full_line(), "post-login command rejected");
            }
        }

        Ok(())
    }

    async fn read_welcome(&mut self) -> Result<()> {
        let welcome = self.read_reply().await?;

        let first_line = welcome
            .lines
            .first()
            .cloned()
            .unwrap_or_else(|| welcome.text.clone());
        if first_line.to_uppercase().starts_with("SSH") {
            self.ctx
                .notifier
                .error("Cannot establish FTP connection to an SFTP server. Please select proper protocol.");
            return Err(FtpError::WrongProtocol);
        }

        if !welcome.is_positive() {
            return Err(FtpError::Protocol {
                code: welcome.code,
                message: welcome.text,
            });
        }
        Ok(())
    }

    async fn explicit_tls_upgrade(&mut self) -> Result<()> {
        let mut reply = self.exchange(commands::auth_tls(), false).await?;
        if !reply.is_positive() {
            // Old servers only know the legacy spelling
            reply = self.exchange(commands::auth_ssl(), false).await?;
            if !reply.is_positive() {
                return Err(FtpError::Tls(format!(
                    "Server refused TLS: {}",
                    reply.full_line()
                )));
            }
        }
        self.ctx.notifier.status("Initializing TLS...");
        self.upgrade_to_tls().await
    }

    async fn run_login_sequence(&mut self) -> Result<()> {
        let mut sequence = build_login_sequence(&self.config, &self.ctx.options)?;
        let mut index = 0;
        let mut challenge: Option<String> = None;
        let mut interactive_password: Option<String> = None;
        let mut tried_local_charset = false;

        while index < sequence.len() {
            let cmd = sequence[index].clone();

            // A pending challenge suspends the sequence until the host
            // supplies the password.
            if cmd.kind == LoginCommandKind::Pass
                && self.config.logon_type == LogonType::Interactive
                && interactive_password.is_none()
            {
                let text = challenge.take().unwrap_or_default();
                match self.ctx.request_handler.interactive_login(&text).await {
                    Some(password) => interactive_password = Some(password),
                    None => return Err(FtpError::Cancelled),
                }
            }

            let password = interactive_password
                .as_deref()
                .unwrap_or(&self.config.password);
            let line = render_login_command(&cmd, &self.config, password);
            let reply = self.exchange(&line, cmd.hide_arguments).await?;

            if !reply.is_positive() {
                // The server may have choked on non-ASCII credentials sent
                // as UTF-8; retry once with the local charset.
                if self.config.encoding == CharsetEncoding::Auto
                    && self.state.use_utf8
                    && !tried_local_charset
                    && !credentials_are_ascii(&self.config)
                {
                    if self.ctx.options.ftp_proxy_type != FtpProxyType::None {
                        self.ctx.notifier.error(
                            "Login data contains non-ASCII characters and server might not be UTF-8 aware. Cannot fall back to local charset since using proxy.",
                        );
                        if cmd.kind == LoginCommandKind::Pass && reply.is_permanent_error() {
                            return Err(FtpError::AuthFailed(reply.text));
                        }
                        return Err(FtpError::Protocol {
                            code: reply.code,
                            message: reply.text,
                        });
                    }
                    self.ctx.notifier.status(
                        "Login data contains non-ASCII characters and server might not be UTF-8 aware. Trying local charset.",
                    );
                    self.state.use_utf8 = false;
                    tried_local_charset = true;
                    sequence = build_login_sequence(&self.config, &self.ctx.options)?;
                    index = 0;
                    continue;
                }

                if cmd.kind == LoginCommandKind::Pass && reply.is_permanent_error() {
                    return Err(FtpError::AuthFailed(reply.text));
                }
                return Err(FtpError::Protocol {
                    code: reply.code,
                    message: reply.text,
                });
            }

            index += 1;

            if reply.is_success() {
                while index < sequence.len() && sequence[index].optional {
                    index += 1;
                }
            } else if reply.is_continuation() {
                if index >= sequence.len() {
                    let hint = if cmd.kind == LoginCommandKind::Pass
                        && self.config.account.is_empty()
                    {
                        "server might require an account"
                    } else {
                        "aborting"
                    };
                    return Err(FtpError::LoginIncomplete(hint.to_string()));
                }
                if cmd.kind == LoginCommandKind::User
                    && self.config.logon_type == LogonType::Interactive
                {
                    let mut text = reply.lines.join("\n");
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(&reply.text);
                    challenge = Some(text);
                }
            }
        }

        Ok(())
    }

    /// SYST discovery; returns whether CLNT/OPTS UTF8 should be skipped
    /// (FileZilla Server already behaves without them)
    async fn discover_syst(&mut self) -> Result<bool> {
        let (cap, cached) = self
            .ctx
            .capabilities
            .get_with_value(&self.server_key, Capability::SystCommand);

        let system = match cap {
            CapabilityState::Unknown => {
                let reply = self.exchange(commands::syst(), false).await?;
                if !reply.is_success() {
                    self.ctx.capabilities.set(
                        &self.server_key,
                        Capability::SystCommand,
                        CapabilityState::No,
                    );
                    return Ok(false);
                }

                // z/VM hides its identity in the first line of a
                // multi-line SYST reply
                let mut system = reply.text.clone();
                if let Some(first) = reply.lines.first() {
                    if first.get(4..8).is_some_and(|s| s.to_uppercase() == "Z/VM") {
                        system = format!("{} {}", &first[4..], reply.text);
                    }
                }
                self.ctx.capabilities.set_with_value(
                    &self.server_key,
                    Capability::SystCommand,
                    CapabilityState::Yes,
                    system.clone(),
                );
                system
            }
            CapabilityState::Yes => cached.unwrap_or_default(),
            CapabilityState::No => return Ok(false),
        };

        if self.config.server_type == ServerType::Default
            && self.server_type == ServerType::Default
        {
            if let Some(inferred) = infer_server_type(&system) {
                debug!(?inferred, "server type inferred from SYST");
                self.server_type = inferred;
            }
        }

        Ok(system.contains("FileZilla"))
    }

    async fn discover_feat(&mut self) -> Result<()> {
        let caps = self.ctx.capabilities.clone();
        if caps.get(&self.server_key, Capability::FeatCommand) == CapabilityState::Unknown {
            let reply = self.exchange(commands::feat(), false).await?;
            if reply.is_success() {
                caps.set(&self.server_key, Capability::FeatCommand, CapabilityState::Yes);
                for line in &reply.lines {
                    if let Some((cap, payload)) = parse_feat_line(line) {
                        match payload {
                            Some(payload) => caps.set_with_value(
                                &self.server_key,
                                cap,
                                CapabilityState::Yes,
                                payload,
                            ),
                            None => caps.set(&self.server_key, cap, CapabilityState::Yes),
                        }
                        // MLST mandates UTC timestamps, no calibration needed
                        if cap == Capability::MlsdCommand {
                            caps.set(
                                &self.server_key,
                                Capability::TimezoneOffset,
                                CapabilityState::No,
                            );
                        }
                    }
                }
                // Absence from FEAT decides these probes negatively
                for cap in [Capability::Utf8Command, Capability::ClntCommand] {
                    if caps.get(&self.server_key, cap) != CapabilityState::Yes {
                        caps.set(&self.server_key, cap, CapabilityState::No);
                    }
                }
            } else {
                caps.set(&self.server_key, Capability::FeatCommand, CapabilityState::No);
            }

            if caps.get(&self.server_key, Capability::TvfsSupport) != CapabilityState::Yes {
                caps.set(&self.server_key, Capability::TvfsSupport, CapabilityState::No);
            }
        }

        if self.config.encoding == CharsetEncoding::Auto
            && caps.get(&self.server_key, Capability::Utf8Command) != CapabilityState::Yes
        {
            self.state.use_utf8 = false;
        }
        Ok(())
    }

    async fn negotiate_mlst(&mut self) -> Result<()> {
        let caps = self.ctx.capabilities.clone();
        let (mlsd, facts) = caps.get_with_value(&self.server_key, Capability::MlsdCommand);
        if mlsd != CapabilityState::Yes {
            return Ok(());
        }

        let (state, stored) = caps.get_with_value(&self.server_key, Capability::OptsMlstCommand);
        let to_send = match state {
            CapabilityState::Unknown => match negotiate_mlst_facts(&facts.unwrap_or_default()) {
                Some(wanted) => {
                    caps.set_with_value(
                        &self.server_key,
                        Capability::OptsMlstCommand,
                        CapabilityState::Yes,
                        wanted.clone(),
                    );
                    Some(wanted)
                }
                None => {
                    caps.set(
                        &self.server_key,
                        Capability::OptsMlstCommand,
                        CapabilityState::No,
                    );
                    None
                }
            },
            CapabilityState::Yes => stored,
            CapabilityState::No => None,
        };

        if let Some(facts) = to_send {
            let _ = self.exchange(&commands::opts_mlst(&facts), false).await?;
        }
        Ok(())
    }
}

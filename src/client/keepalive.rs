//! Idle-connection keepalive
//!
//! Routers and stateful firewalls drop FTP control connections that stay
//! silent for a few minutes. An idle session sends a harmless command and
//! discards its reply via the skip counter, so a user operation arriving
//! in the meantime is never confused by a stray reply.

use std::time::Duration;

use rand::Rng;

use super::FtpClient;
use super::state::TypeMode;
use crate::commands;
use crate::error::Result;

/// Idle time after the last completed operation before a keepalive is due
pub const KEEPALIVE_DELAY: Duration = Duration::from_secs(30);

/// Sessions idle longer than this stop sending keepalives altogether
pub const KEEPALIVE_IDLE_CEILING: Duration = Duration::from_secs(30 * 60);

impl FtpClient {
    /// Whether an idle keepalive should be sent right now
    ///
    /// True only when keepalives are enabled, the session is logged in and
    /// quiet (no pending or skipped replies), the last operation finished
    /// at least [`KEEPALIVE_DELAY`] ago, and the session has not been
    /// abandoned for longer than [`KEEPALIVE_IDLE_CEILING`].
    pub fn keepalive_due(&self) -> bool {
        if !self.ctx.options.ftp_send_keepalive || !self.logged_in {
            return false;
        }
        if self.state.pending_replies != 0 || self.state.replies_to_skip != 0 {
            return false;
        }
        match self.state.last_completion {
            Some(completed) => {
                let idle = completed.elapsed();
                idle >= KEEPALIVE_DELAY && idle < KEEPALIVE_IDLE_CEILING
            }
            None => false,
        }
    }

    /// Send one keepalive command if one is due
    ///
    /// The command is chosen uniformly among NOOP, a TYPE matching the
    /// session's last mode, and PWD; its reply is accounted into the skip
    /// counter and never surfaces. Hosts call this from their idle timer.
    pub async fn send_keepalive(&mut self) -> Result<()> {
        if !self.keepalive_due() {
            return Ok(());
        }

        self.ctx.notifier.status("Sending keep-alive command");

        let command = match rand::thread_rng().gen_range(0..3) {
            0 => commands::noop(),
            1 => match self.state.last_type {
                Some(TypeMode::Ascii) => commands::type_ascii(),
                _ => commands::type_binary(),
            },
            _ => commands::pwd(),
        };

        self.send_command(command, false).await?;
        self.state.replies_to_skip += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_windows() {
        assert_eq!(KEEPALIVE_DELAY, Duration::from_secs(30));
        assert_eq!(KEEPALIVE_IDLE_CEILING, Duration::from_secs(1800));
        assert!(KEEPALIVE_IDLE_CEILING > KEEPALIVE_DELAY);
    }
}

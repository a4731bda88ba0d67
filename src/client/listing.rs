//! Directory-listing orchestration: cache consult, list lock, MLSD/LIST,
//! hidden-file probing, and timezone calibration

use std::time::Instant;

use chrono::Utc;
use tracing::debug;

use super::FtpClient;
use super::data::{DataTarget, TransferEndReason};
use crate::cache::LockKind;
use crate::capabilities::{Capability, CapabilityState};
use crate::commands;
use crate::error::{FtpError, Result};
use crate::listing::{DirectoryListing, ListingParser, TimestampPrecision, check_inclusion};
use crate::path::ServerPath;

/// Options for a directory-listing request
#[derive(Debug, Clone, Copy, Default)]
pub struct ListFlags {
    /// Bypass the directory cache even when it has a fresh entry
    pub refresh: bool,
    /// On a failed CWD, list the current directory instead of failing
    pub fallback_to_current: bool,
    /// Treat a failing CWD into the target as "symlink to a file"
    pub link_discovery: bool,
}

/// How one LIST/MLSD transfer ended
enum ListOutcome {
    /// Data arrived and is buffered in the parser
    Parsed,
    /// Server answered "550 no files" instead of an empty listing
    MisleadingEmpty,
    /// Command rejected before data started
    FailedImmediate(FtpError),
    /// Any other failure
    Failed(FtpError),
}

/// Broken servers answer these instead of sending an empty listing
fn is_misleading_list_response(code: u16, text: &str) -> bool {
    code == crate::response::codes::FILE_UNAVAILABLE
        && ["No members found.", "No data sets found.", "No files found."]
            .iter()
            .any(|m| text.eq_ignore_ascii_case(m))
}

impl FtpClient {
    /// Retrieve the listing of a remote directory
    ///
    /// Changes into the target first, consults the shared directory cache
    /// (unless `refresh`), serializes against concurrent sessions with the
    /// list lock, probes `LIST -a` support when hidden files are requested,
    /// and calibrates the server timezone via MDTM on first contact. The
    /// final listing is stored in the cache and announced through the
    /// notifier.
    pub async fn list(
        &mut self,
        path: Option<ServerPath>,
        subdir: &str,
        flags: ListFlags,
    ) -> Result<DirectoryListing> {
        self.begin_op().await?;
        let result = self.list_inner(path, subdir, flags, true).await;
        if let Err(err) = &result {
            if !matches!(err, FtpError::Cancelled) {
                if let Some(path) = self.state.current_path.clone() {
                    self.ctx.notifier.directory_listing(path, true, true, true);
                }
            }
        }
        self.end_op(result)
    }

    pub(crate) async fn list_inner(
        &mut self,
        path: Option<ServerPath>,
        subdir: &str,
        flags: ListFlags,
        primary: bool,
    ) -> Result<DirectoryListing> {
        self.ctx.notifier.status("Retrieving directory listing...");

        let factory = self.ctx.listing_parser_factory.clone().ok_or_else(|| {
            FtpError::Internal("no listing parser configured".to_string())
        })?;

        let cwd_result = self
            .change_dir_inner(path.clone(), subdir, flags.link_discovery, false)
            .await;
        if let Err(err) = cwd_result {
            if matches!(err, FtpError::LinkNotDir) || !flags.fallback_to_current || path.is_none()
            {
                return Err(err);
            }
            self.change_dir_inner(None, "", false, false).await?;
        }

        let resolved = self
            .state
            .current_path
            .clone()
            .ok_or_else(|| FtpError::Internal("current path unknown after CWD".to_string()))?;

        if !flags.refresh {
            if let Some((unsure, outdated)) =
                self.ctx.directory_cache.does_exist(&self.server_key, &resolved)
            {
                if !unsure && !outdated {
                    let (listing, _) = self
                        .ctx
                        .directory_cache
                        .lookup(&self.server_key, &resolved)
                        .ok_or_else(|| {
                            FtpError::Internal("cache entry vanished".to_string())
                        })?;
                    self.ctx
                        .notifier
                        .directory_listing(resolved, primary, false, false);
                    return Ok(listing);
                }
            }
        }

        // Serialize listings of the same directory across sessions; when
        // another session listed it while we waited, its result is ours.
        let guard = match self
            .ctx
            .cache_locks
            .try_lock(&self.server_key, &resolved, LockKind::List)
        {
            Some(guard) => guard,
            None => {
                let before_locking = Instant::now();
                let locks = self.ctx.cache_locks.clone();
                let guard = tokio::select! {
                    _ = self.cancel.cancelled() => return Err(FtpError::Cancelled),
                    guard = locks.lock(&self.server_key, &resolved, LockKind::List) => guard,
                };
                if let Some((listing, outdated)) =
                    self.ctx.directory_cache.lookup(&self.server_key, &resolved)
                {
                    let age = before_locking.elapsed();
                    let fresh = Utc::now()
                        .signed_duration_since(listing.first_list_time)
                        .to_std()
                        .map(|d| d < age)
                        .unwrap_or(false);
                    if !outdated && !listing.has_unsure_entries && fresh {
                        drop(guard);
                        self.ctx.notifier.directory_listing(
                            resolved,
                            primary,
                            false,
                            false,
                        );
                        return Ok(listing);
                    }
                }
                guard
            }
        };

        let mut parser = factory();
        let listing = self
            .perform_listing(&resolved, parser.as_mut())
            .await;
        drop(guard);
        let mut listing = listing?;

        self.calibrate_timezone(&mut listing).await?;

        self.ctx
            .directory_cache
            .store(&self.server_key, listing.clone());
        self.ctx
            .notifier
            .directory_listing(resolved, primary, true, false);
        Ok(listing)
    }

    /// Run the LIST/MLSD transfer(s), including the hidden-file probe
    async fn perform_listing(
        &mut self,
        path: &ServerPath,
        parser: &mut dyn ListingParser,
    ) -> Result<DirectoryListing> {
        let caps = self.ctx.capabilities.clone();
        let use_mlsd =
            caps.get(&self.server_key, Capability::MlsdCommand) == CapabilityState::Yes;

        let mut hidden_check = false;
        let mut hidden = false;
        if !use_mlsd && self.ctx.options.view_hidden_files {
            match caps.get(&self.server_key, Capability::ListHiddenSupport) {
                CapabilityState::Unknown => hidden_check = true,
                CapabilityState::Yes => hidden = true,
                CapabilityState::No => {
                    debug!("View hidden option set, but unsupported by server");
                }
            }
        }

        let first_command = if use_mlsd {
            commands::mlsd()
        } else if hidden {
            commands::list_hidden()
        } else {
            commands::list()
        };

        let mut listing = match self.run_list_transfer(first_command, parser).await {
            ListOutcome::Parsed => parser.parse(path.clone())?,
            ListOutcome::MisleadingEmpty => DirectoryListing::empty(path.clone()),
            ListOutcome::FailedImmediate(err) | ListOutcome::Failed(err) => return Err(err),
        };

        if hidden_check {
            parser.reset();
            match self.run_list_transfer(commands::list_hidden(), parser).await {
                ListOutcome::Parsed => {
                    let with_hidden = parser.parse(path.clone())?;
                    if check_inclusion(&with_hidden, &listing) {
                        debug!("Server seems to support LIST -a");
                        caps.set(
                            &self.server_key,
                            Capability::ListHiddenSupport,
                            CapabilityState::Yes,
                        );
                        listing = with_hidden;
                    } else {
                        debug!("Server does not seem to support LIST -a");
                        caps.set(
                            &self.server_key,
                            Capability::ListHiddenSupport,
                            CapabilityState::No,
                        );
                    }
                }
                ListOutcome::MisleadingEmpty => {
                    // Fewer entries with -a than without: not supported
                    let state = if listing.is_empty() {
                        CapabilityState::Yes
                    } else {
                        CapabilityState::No
                    };
                    caps.set(&self.server_key, Capability::ListHiddenSupport, state);
                }
                ListOutcome::FailedImmediate(_) => {
                    // Rejected outright; fall back to the plain result
                    caps.set(
                        &self.server_key,
                        Capability::ListHiddenSupport,
                        CapabilityState::No,
                    );
                }
                ListOutcome::Failed(err) => return Err(err),
            }
        }

        Ok(listing)
    }

    async fn run_list_transfer(
        &mut self,
        command: &str,
        parser: &mut dyn ListingParser,
    ) -> ListOutcome {
        match self
            .raw_transfer(command, false, 0, DataTarget::Listing(parser))
            .await
        {
            Ok(_) => ListOutcome::Parsed,
            Err(failure) => {
                if let (Some(code), Some(text)) = (failure.reply_code, &failure.reply_text) {
                    if is_misleading_list_response(code, text) {
                        return ListOutcome::MisleadingEmpty;
                    }
                }
                if failure.reason == TransferEndReason::TransferCommandFailureImmediate {
                    ListOutcome::FailedImmediate(failure.error)
                } else {
                    ListOutcome::Failed(failure.error)
                }
            }
        }
    }

    /// Work out the server's timezone from one MDTM probe
    ///
    /// MDTM answers in UTC while LIST timestamps are server-local; the
    /// difference (with any configured offset removed) shifts every
    /// minute-precision-or-finer entry, and the offset sticks in the
    /// capability registry for the rest of the process.
    async fn calibrate_timezone(&mut self, listing: &mut DirectoryListing) -> Result<()> {
        let caps = self.ctx.capabilities.clone();
        if caps.get(&self.server_key, Capability::TimezoneOffset) != CapabilityState::Unknown {
            return Ok(());
        }
        if caps.get(&self.server_key, Capability::MdtmCommand) != CapabilityState::Yes {
            caps.set(
                &self.server_key,
                Capability::TimezoneOffset,
                CapabilityState::No,
            );
            return Ok(());
        }

        let Some(candidate) = listing.entries.iter().position(|e| {
            !e.is_dir() && e.precision >= TimestampPrecision::Time && e.time.is_some()
        }) else {
            return Ok(());
        };
        let name = listing.entries[candidate].name.clone();
        let precision = listing.entries[candidate].precision;
        let listed_time = listing.entries[candidate].time.unwrap();

        self.ctx
            .notifier
            .status("Calculating timezone offset of server...");
        let file = listing.path.format_filename(&name, true);
        let reply = self.exchange(&commands::mdtm(&file), false).await?;

        let parsed = if reply.code == crate::response::codes::FILE_STATUS
            && reply.text.trim().len() >= 14
        {
            commands::parse_mdtm_reply(&reply.text)
        } else {
            None
        };

        match parsed {
            Some(server_utc) => {
                let configured = i64::from(self.config.timezone_offset_minutes) * 60;
                let listed = listed_time - chrono::Duration::seconds(configured);
                let mut offset = server_utc.signed_duration_since(listed).num_seconds();
                if precision != TimestampPrecision::Seconds {
                    // Round to whole minutes, towards minus infinity
                    if offset < 0 {
                        offset -= 59;
                    }
                    offset -= offset % 60;
                }
                self.ctx.notifier.status(format!(
                    "Timezone offset of server is {} seconds.",
                    offset
                ));
                listing.apply_time_offset(offset);
                caps.set_number(
                    &self.server_key,
                    Capability::TimezoneOffset,
                    CapabilityState::Yes,
                    offset,
                );
            }
            None => {
                caps.set(
                    &self.server_key,
                    Capability::MdtmCommand,
                    CapabilityState::No,
                );
                caps.set(
                    &self.server_key,
                    Capability::TimezoneOffset,
                    CapabilityState::No,
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_misleading_responses() {
        assert!(is_misleading_list_response(550, "No members found."));
        assert!(is_misleading_list_response(550, "no data sets found."));
        assert!(is_misleading_list_response(550, "NO FILES FOUND."));
        assert!(!is_misleading_list_response(550, "Permission denied"));
        assert!(!is_misleading_list_response(450, "No files found."));
        assert!(!is_misleading_list_response(550, "No files found"));
    }
}

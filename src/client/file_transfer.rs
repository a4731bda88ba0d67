//! File transfer orchestration: metadata discovery, overwrite decisions,
//! resume handling, the RETR/STOR/APPE transfer, and timestamp preservation

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use tokio::io::AsyncSeekExt;
use tracing::{debug, warn};

use super::FtpClient;
use super::data::{DataTarget, TransferEndReason};
use super::listing::ListFlags;
use super::requests::FileExistsAction;
use crate::capabilities::{Capability, CapabilityState};
use crate::commands;
use crate::error::{FtpError, Result};
use crate::listing::TimestampPrecision;
use crate::notify::FileExistsPrompt;
use crate::path::ServerPath;

/// Files at or above this size hit the 4 GiB resume bug class
const RESUME_LIMIT_4GB: u64 = 1 << 32;
/// Files at or above this size hit the 2 GiB resume bug class
const RESUME_LIMIT_2GB: u64 = 1 << 31;

/// One file transfer request
#[derive(Debug, Clone)]
pub struct FileTransferSpec {
    /// Local file path
    pub local_file: PathBuf,
    /// Remote directory
    pub remote_path: ServerPath,
    /// Remote file name
    pub remote_file: String,
    /// Direction: `true` retrieves, `false` stores
    pub download: bool,
    /// TYPE I transfer (vs. TYPE A)
    pub binary: bool,
}

/// Whether a failed SIZE reply tells us the file is missing, which makes a
/// follow-up MDTM pointless
fn size_failure_skips_mdtm(size_supported: bool, reply_text: &str, filename: &str) -> bool {
    if size_supported {
        return true;
    }
    let reply = reply_text.to_lowercase();
    if reply == "file not found" {
        return true;
    }
    // Trust the substring only when the file name cannot have introduced it
    !filename.to_lowercase().contains("file not found") && reply.contains("file not found")
}

fn system_time_from(time: DateTime<Utc>) -> Option<SystemTime> {
    let secs = time.timestamp();
    if secs < 0 {
        return None;
    }
    Some(UNIX_EPOCH + std::time::Duration::from_secs(secs as u64))
}

#[derive(Debug, Default)]
struct TransferState {
    local_size: Option<u64>,
    remote_size: Option<u64>,
    /// Remote modification time, shifted to the server's configured offset
    file_time: Option<DateTime<Utc>>,
    /// CWD into the remote directory failed; use absolute filenames
    try_absolute: bool,
    resume: bool,
    /// The local target existed before the transfer touched it
    file_did_exist: bool,
}

impl FtpClient {
    /// Download a remote file
    pub async fn download(
        &mut self,
        local_file: impl Into<PathBuf>,
        remote_path: ServerPath,
        remote_file: impl Into<String>,
    ) -> Result<()> {
        self.transfer_file(FileTransferSpec {
            local_file: local_file.into(),
            remote_path,
            remote_file: remote_file.into(),
            download: true,
            binary: true,
        })
        .await
    }

    /// Upload a local file
    pub async fn upload(
        &mut self,
        local_file: impl Into<PathBuf>,
        remote_path: ServerPath,
        remote_file: impl Into<String>,
    ) -> Result<()> {
        self.transfer_file(FileTransferSpec {
            local_file: local_file.into(),
            remote_path,
            remote_file: remote_file.into(),
            download: false,
            binary: true,
        })
        .await
    }

    /// Run one file transfer
    ///
    /// Orchestrates directory change (creating remote directories for
    /// uploads), metadata discovery through the cache and SIZE/MDTM,
    /// the overwrite/resume decision via the request handler, the
    /// large-file resume probe, the transfer itself, and timestamp
    /// preservation afterwards.
    pub async fn transfer_file(&mut self, spec: FileTransferSpec) -> Result<()> {
        self.begin_op().await?;
        let result = self.transfer_file_inner(spec).await;
        self.end_op(result)
    }

    async fn transfer_file_inner(&mut self, mut spec: FileTransferSpec) -> Result<()> {
        if spec.local_file.as_os_str().is_empty() {
            return Err(FtpError::Other("no local file given".to_string()));
        }
        spec.remote_path = self.resolve_path_type(spec.remote_path.clone());

        if spec.download {
            self.ctx.notifier.status(format!(
                "Starting download of {}",
                spec.remote_path.format_filename(&spec.remote_file, false)
            ));
        } else {
            self.ctx.notifier.status(format!(
                "Starting upload of {}",
                spec.local_file.display()
            ));
        }

        let mut state = TransferState::default();
        state.local_size = match tokio::fs::metadata(&spec.local_file).await {
            Ok(meta) if meta.is_file() => Some(meta.len()),
            _ => None,
        };

        if self
            .change_dir_inner(Some(spec.remote_path.clone()), "", false, !spec.download)
            .await
            .is_err()
        {
            debug!("CWD to transfer directory failed, using absolute paths");
            state.try_absolute = true;
        }

        self.discover_remote_metadata(&spec, &mut state).await?;

        // The overwrite decision may rename either side, which restarts
        // metadata discovery for the new name.
        loop {
            match self.check_overwrite(&spec, &mut state).await? {
                None => break,
                Some(FileExistsAction::Skip) => {
                    self.ctx.notifier.status("File transfer skipped");
                    return Ok(());
                }
                Some(FileExistsAction::Rename(name)) => {
                    if spec.download {
                        spec.local_file = spec.local_file.with_file_name(&name);
                        state.local_size = match tokio::fs::metadata(&spec.local_file).await {
                            Ok(meta) if meta.is_file() => Some(meta.len()),
                            _ => None,
                        };
                    } else {
                        spec.remote_file = name;
                        state.remote_size = None;
                        state.file_time = None;
                        self.discover_remote_metadata(&spec, &mut state).await?;
                    }
                }
                Some(_) => break,
            }
        }

        if spec.download && state.resume {
            if let Some(done) = self.test_resume_capability(&spec, &mut state).await? {
                if done {
                    return Ok(());
                }
            }
        }

        self.run_file_transfer(&spec, &mut state).await?;
        self.preserve_timestamps(&spec, &state).await;
        Ok(())
    }

    /// Fill in remote size and time from the cache, a refreshing LIST, or
    /// SIZE/MDTM probes
    async fn discover_remote_metadata(
        &mut self,
        spec: &FileTransferSpec,
        state: &mut TransferState,
    ) -> Result<()> {
        let dir = if state.try_absolute {
            spec.remote_path.clone()
        } else {
            self.state
                .current_path
                .clone()
                .unwrap_or_else(|| spec.remote_path.clone())
        };

        let mut lookup =
            self.ctx
                .directory_cache
                .lookup_file(&self.server_key, &dir, &spec.remote_file);

        // An unknown directory or an unsure entry warrants one refreshing
        // listing before falling back to SIZE probing.
        let needs_list = (!lookup.dir_did_exist
            || lookup.entry.as_ref().is_some_and(|e| e.unsure))
            && self.ctx.listing_parser_factory.is_some()
            && !state.try_absolute;
        if needs_list {
            let flags = ListFlags {
                refresh: true,
                ..ListFlags::default()
            };
            if let Err(err) = self.list_inner(None, "", flags, false).await {
                debug!(error = %err, "refreshing listing before transfer failed");
            }
            lookup =
                self.ctx
                    .directory_cache
                    .lookup_file(&self.server_key, &dir, &spec.remote_file);
        }

        let mut need_size = false;
        let mut need_mdtm = false;
        match &lookup.entry {
            Some(entry) if lookup.matched_case && !entry.unsure => {
                state.remote_size = entry.size;
                if entry.precision != TimestampPrecision::None {
                    state.file_time = entry.time;
                }
                need_mdtm = spec.download && entry.precision < TimestampPrecision::Time;
            }
            Some(_) => need_size = true,
            None => {
                if lookup.dir_did_exist {
                    need_mdtm = spec.download;
                } else {
                    need_size = true;
                }
            }
        }

        if need_size {
            need_mdtm = self.probe_size(spec, state).await? && spec.download;
        }

        let preserve = self.ctx.options.preserve_timestamps;
        let mdtm_supported = self
            .ctx
            .capabilities
            .get(&self.server_key, Capability::MdtmCommand)
            == CapabilityState::Yes;
        if need_mdtm && preserve && mdtm_supported {
            self.probe_mdtm(spec, state).await?;
        }
        Ok(())
    }

    /// SIZE probe; returns whether MDTM is still worth trying
    async fn probe_size(&mut self, spec: &FileTransferSpec, state: &mut TransferState) -> Result<bool> {
        let filename = spec
            .remote_path
            .format_filename(&spec.remote_file, !state.try_absolute);
        let reply = self.exchange(&commands::size(&filename), false).await?;

        if reply.is_positive() {
            if reply.code == crate::response::codes::FILE_STATUS {
                if self
                    .ctx
                    .capabilities
                    .get(&self.server_key, Capability::SizeCommand)
                    == CapabilityState::Unknown
                {
                    self.ctx.capabilities.set(
                        &self.server_key,
                        Capability::SizeCommand,
                        CapabilityState::Yes,
                    );
                }
                match commands::parse_size_reply(&reply.text) {
                    Some(size) => state.remote_size = Some(size),
                    None => debug!("Invalid SIZE reply"),
                }
            } else {
                debug!("Invalid SIZE reply");
            }
            return Ok(true);
        }

        let size_supported = self
            .ctx
            .capabilities
            .get(&self.server_key, Capability::SizeCommand)
            == CapabilityState::Yes;
        Ok(!size_failure_skips_mdtm(
            size_supported,
            &reply.text,
            &filename,
        ))
    }

    async fn probe_mdtm(&mut self, spec: &FileTransferSpec, state: &mut TransferState) -> Result<()> {
        let filename = spec
            .remote_path
            .format_filename(&spec.remote_file, !state.try_absolute);
        let reply = self.exchange(&commands::mdtm(&filename), false).await?;
        if reply.code == crate::response::codes::FILE_STATUS && reply.text.trim().len() >= 12 {
            if let Some(time) = commands::parse_mdtm_reply(&reply.text) {
                let offset =
                    chrono::Duration::minutes(i64::from(self.config.timezone_offset_minutes));
                state.file_time = Some(time + offset);
            }
        }
        Ok(())
    }

    /// Ask the host what to do when the transfer target already exists
    ///
    /// `None` means "proceed with a fresh transfer"; otherwise the chosen
    /// action is returned for the caller to apply.
    async fn check_overwrite(
        &mut self,
        spec: &FileTransferSpec,
        state: &mut TransferState,
    ) -> Result<Option<FileExistsAction>> {
        let target_exists = if spec.download {
            state.local_size.is_some()
        } else {
            state.remote_size.is_some() || state.file_time.is_some()
        };
        if !target_exists {
            state.resume = false;
            return Ok(None);
        }

        let local_time = tokio::fs::metadata(&spec.local_file)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);

        let prompt = FileExistsPrompt {
            download: spec.download,
            local_file: spec.local_file.display().to_string(),
            remote_file: spec.remote_file.clone(),
            local_size: state.local_size,
            remote_size: state.remote_size,
            local_time,
            remote_time: state.file_time,
        };

        let action = self.ctx.request_handler.file_exists(prompt).await;
        match action {
            FileExistsAction::Overwrite => {
                state.resume = false;
                Ok(Some(FileExistsAction::Overwrite))
            }
            FileExistsAction::Resume => {
                state.resume = true;
                Ok(Some(FileExistsAction::Resume))
            }
            other => Ok(Some(other)),
        }
    }

    /// Probe servers with unknown large-file resume behavior
    ///
    /// Returns `Ok(Some(true))` when the transfer is already complete
    /// (sizes match on a server that cannot resume), `Ok(None)` when the
    /// transfer should proceed.
    async fn test_resume_capability(
        &mut self,
        spec: &FileTransferSpec,
        state: &mut TransferState,
    ) -> Result<Option<bool>> {
        let Some(local_size) = state.local_size else {
            return Ok(None);
        };

        for (limit, limit_gb, cap) in [
            (RESUME_LIMIT_4GB, 4u8, Capability::Resume4GbBug),
            (RESUME_LIMIT_2GB, 2u8, Capability::Resume2GbBug),
        ] {
            if local_size < limit {
                continue;
            }
            match self.ctx.capabilities.get(&self.server_key, cap) {
                CapabilityState::No => {}
                CapabilityState::Yes => {
                    if state.remote_size == Some(local_size) {
                        debug!("resume not supported but sizes match, nothing to transfer");
                        return Ok(Some(true));
                    }
                    self.ctx.notifier.error(format!(
                        "Server does not support resume of files > {} GB.",
                        limit_gb
                    ));
                    return Err(FtpError::ResumeUnsupported { limit_gb });
                }
                CapabilityState::Unknown => {
                    let Some(remote_size) = state.remote_size else {
                        continue;
                    };
                    if remote_size < local_size {
                        continue;
                    }
                    if remote_size == local_size {
                        debug!("sizes match, ending transfer without resume probe");
                        return Ok(Some(true));
                    }

                    self.ctx
                        .notifier
                        .status("Testing resume capabilities of server");
                    let filename = spec
                        .remote_path
                        .format_filename(&spec.remote_file, !state.try_absolute);
                    let probe = self
                        .raw_transfer(
                            &commands::retr(&filename),
                            spec.binary,
                            remote_size - 1,
                            DataTarget::ResumeProbe,
                        )
                        .await;
                    match probe {
                        Ok(_) => {
                            self.ctx.capabilities.set(&self.server_key, cap, CapabilityState::No);
                        }
                        Err(failure)
                            if failure.reason == TransferEndReason::FailedResumeTest =>
                        {
                            self.ctx.capabilities.set(&self.server_key, cap, CapabilityState::Yes);
                            self.ctx.notifier.error(format!(
                                "Server does not support resume of files > {} GB.",
                                limit_gb
                            ));
                            return Err(FtpError::ResumeUnsupported { limit_gb });
                        }
                        Err(failure) => return Err(failure.into()),
                    }
                }
            }
        }
        Ok(None)
    }

    /// Open the local file, pick RETR/STOR/APPE, and run the transfer
    async fn run_file_transfer(
        &mut self,
        spec: &FileTransferSpec,
        state: &mut TransferState,
    ) -> Result<()> {
        let filename = spec
            .remote_path
            .format_filename(&spec.remote_file, !state.try_absolute);

        if spec.download {
            state.file_did_exist = tokio::fs::metadata(&spec.local_file).await.is_ok();
            if let Some(parent) = spec.local_file.parent() {
                if !parent.as_os_str().is_empty() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
            }

            let mut file = if state.resume {
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&spec.local_file)
                    .await
                    .map_err(|e| {
                        self.ctx.notifier.error(format!(
                            "Failed to open \"{}\" for appending/writing",
                            spec.local_file.display()
                        ));
                        FtpError::WriteFailed(e.to_string())
                    })?
            } else {
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&spec.local_file)
                    .await
                    .map_err(|e| {
                        self.ctx.notifier.error(format!(
                            "Failed to open \"{}\" for writing",
                            spec.local_file.display()
                        ));
                        FtpError::WriteFailed(e.to_string())
                    })?
            };

            let resume_offset = if state.resume {
                file.metadata().await.map(|m| m.len()).unwrap_or(0)
            } else {
                0
            };

            let result = self
                .raw_transfer(
                    &commands::retr(&filename),
                    spec.binary,
                    resume_offset,
                    DataTarget::Download(&mut file),
                )
                .await;
            drop(file);

            if let Err(failure) = result {
                // A freshly created file that never received a byte is
                // just clutter
                if !state.file_did_exist {
                    if let Ok(meta) = tokio::fs::metadata(&spec.local_file).await {
                        if meta.len() == 0 {
                            debug!("Deleting empty file");
                            let _ = tokio::fs::remove_file(&spec.local_file).await;
                        }
                    }
                }
                return Err(failure.into());
            }
        } else {
            let mut file = tokio::fs::File::open(&spec.local_file).await.map_err(|e| {
                self.ctx.notifier.error(format!(
                    "Failed to open \"{}\" for reading",
                    spec.local_file.display()
                ));
                FtpError::Io(e)
            })?;

            let start_offset = if state.resume {
                state.remote_size.unwrap_or(0)
            } else {
                0
            };
            if start_offset > 0 {
                file.seek(std::io::SeekFrom::Start(start_offset))
                    .await
                    .map_err(FtpError::Io)?;
            }

            let rest_stream = self
                .ctx
                .capabilities
                .get(&self.server_key, Capability::RestStream)
                == CapabilityState::Yes;
            let (command, resume_offset) = if state.resume {
                if rest_stream {
                    (commands::stor(&filename), start_offset)
                } else {
                    // Play it safe, append instead of REST on servers
                    // without stream-mode REST
                    (commands::appe(&filename), 0)
                }
            } else {
                (commands::stor(&filename), 0)
            };

            self.raw_transfer(
                &command,
                spec.binary,
                resume_offset,
                DataTarget::Upload(&mut file),
            )
            .await?;
        }

        self.ctx.notifier.status("File transfer successful");
        Ok(())
    }

    /// Carry timestamps across after a successful transfer
    async fn preserve_timestamps(&mut self, spec: &FileTransferSpec, state: &TransferState) {
        if !self.ctx.options.preserve_timestamps {
            return;
        }

        if spec.download {
            let Some(time) = state.file_time else { return };
            let Some(system_time) = system_time_from(time) else {
                return;
            };
            let path = spec.local_file.clone();
            let result = tokio::task::spawn_blocking(move || {
                let file = std::fs::File::options().write(true).open(&path)?;
                let times = std::fs::FileTimes::new()
                    .set_accessed(system_time)
                    .set_modified(system_time);
                file.set_times(times)
            })
            .await;
            match result {
                Ok(Err(e)) => warn!(error = %e, "failed to set local file times"),
                Err(e) => warn!(error = %e, "failed to set local file times"),
                Ok(Ok(())) => {}
            }
        } else {
            let mfmt_supported = self
                .ctx
                .capabilities
                .get(&self.server_key, Capability::MfmtCommand)
                == CapabilityState::Yes;
            if !mfmt_supported {
                return;
            }
            let Some(mtime) = tokio::fs::metadata(&spec.local_file)
                .await
                .ok()
                .and_then(|m| m.modified().ok())
            else {
                return;
            };
            let time = DateTime::<Utc>::from(mtime);
            let filename = spec
                .remote_path
                .format_filename(&spec.remote_file, !state.try_absolute);
            match self.exchange(&commands::mfmt(time, &filename), false).await {
                Ok(reply) if !reply.is_positive() => {
                    debug!(reply = %reply.full_line(), "MFMT rejected");
                }
                Err(e) => debug!(error = %e, "MFMT failed"),
                Ok(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_failure_skip_logic() {
        // Server known to support SIZE: failure means the file is gone
        assert!(size_failure_skips_mdtm(true, "Some error", "a.txt"));

        // Exact "file not found" text
        assert!(size_failure_skips_mdtm(false, "File not found", "a.txt"));

        // Substring match, file name unrelated
        assert!(size_failure_skips_mdtm(
            false,
            "550 file not found on disk",
            "a.txt"
        ));

        // The file name itself contains the phrase; reply echoes the path
        assert!(!size_failure_skips_mdtm(
            false,
            "/data/file not found here: denied",
            "file not found here"
        ));

        // Unrelated error on a server with unknown SIZE support
        assert!(!size_failure_skips_mdtm(false, "Permission denied", "a.txt"));
    }

    #[test]
    fn test_resume_limits() {
        assert_eq!(RESUME_LIMIT_2GB, 2_147_483_648);
        assert_eq!(RESUME_LIMIT_4GB, 4_294_967_296);
        assert!(RESUME_LIMIT_4GB > RESUME_LIMIT_2GB);
    }

    #[test]
    fn test_system_time_conversion() {
        let time = DateTime::parse_from_rfc3339("2024-03-05T14:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let system = system_time_from(time).unwrap();
        assert_eq!(
            system.duration_since(UNIX_EPOCH).unwrap().as_secs(),
            time.timestamp() as u64
        );

        let ancient = DateTime::parse_from_rfc3339("1960-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(system_time_from(ancient).is_none());
    }
}

//! Simple remote operations: delete, remove dir, recursive mkdir, rename,
//! chmod, and raw commands
//!
//! Every mutation keeps the shared caches honest: entries are invalidated
//! before the command goes out (a failure leaves them unsure, not wrong)
//! and removed or updated once the server confirms.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::debug;

use super::FtpClient;
use crate::cache::LockKind;
use crate::commands;
use crate::error::{FtpError, Result};
use crate::listing::EntryKind;
use crate::path::ServerPath;
use crate::response::FtpResponse;

/// Directory-listing notifications during multi-file deletes are batched
/// to at most one per second
const DELETE_NOTIFY_INTERVAL: Duration = Duration::from_secs(1);

impl FtpClient {
    /// Delete files from one remote directory
    ///
    /// Failures on individual files do not stop the sequence; the operation
    /// fails afterwards if any DELE was rejected. Listing notifications for
    /// the affected directory are batched to once per second.
    pub async fn delete_files(&mut self, path: ServerPath, files: Vec<String>) -> Result<()> {
        self.begin_op().await?;
        let result = self.delete_files_inner(path, files).await;
        self.end_op(result)
    }

    async fn delete_files_inner(&mut self, path: ServerPath, files: Vec<String>) -> Result<()> {
        if files.is_empty() {
            return Err(FtpError::Internal("no files to delete".to_string()));
        }
        let path = self.resolve_path_type(path);

        let mut omit_path = true;
        if self
            .change_dir_inner(Some(path.clone()), "", false, false)
            .await
            .is_err()
        {
            omit_path = false;
        }

        let mut last_notified = Instant::now();
        let mut need_final_notification = false;
        let mut any_failed = false;

        let total = files.len();
        for file in files {
            if file.is_empty() {
                return Err(FtpError::Internal("empty filename".to_string()));
            }
            let filename = path.format_filename(&file, omit_path);

            self.ctx
                .directory_cache
                .invalidate_file(&self.server_key, &path, &file);

            let outcome = self.exchange(&commands::dele(&filename), false).await;
            let reply = match outcome {
                Ok(reply) => reply,
                Err(err) => {
                    if need_final_notification && !err.is_disconnect() {
                        self.ctx
                            .notifier
                            .directory_listing(path.clone(), false, true, false);
                    }
                    return Err(err);
                }
            };

            if !reply.is_positive() {
                any_failed = true;
                continue;
            }

            self.ctx
                .directory_cache
                .remove_file(&self.server_key, &path, &file);
            if last_notified.elapsed() >= DELETE_NOTIFY_INTERVAL {
                self.ctx
                    .notifier
                    .directory_listing(path.clone(), false, true, false);
                last_notified = Instant::now();
                need_final_notification = false;
            } else {
                need_final_notification = true;
            }
        }

        if need_final_notification {
            self.ctx
                .notifier
                .directory_listing(path.clone(), false, true, false);
        }

        if any_failed {
            Err(FtpError::Other(format!(
                "failed to delete one or more of {} files",
                total
            )))
        } else {
            Ok(())
        }
    }

    /// Remove a remote directory
    pub async fn remove_dir(&mut self, path: ServerPath, subdir: impl Into<String>) -> Result<()> {
        self.begin_op().await?;
        let result = self.remove_dir_inner(path, subdir.into()).await;
        self.end_op(result)
    }

    async fn remove_dir_inner(&mut self, path: ServerPath, subdir: String) -> Result<()> {
        let requested = self.resolve_path_type(path);
        let full_path = requested.joined(&subdir);

        let mut omit_path = true;
        let mut path = requested.clone();
        match self
            .change_dir_inner(Some(requested.clone()), "", false, false)
            .await
        {
            Ok(()) => {
                if let Some(current) = self.state.current_path.clone() {
                    path = current;
                }
            }
            Err(_) => omit_path = false,
        }

        self.ctx
            .directory_cache
            .invalidate_file(&self.server_key, &path, &subdir);
        self.ctx
            .path_cache
            .invalidate_path(&self.server_key, &path, &subdir);

        let command = if omit_path {
            commands::rmd(&subdir)
        } else {
            commands::rmd(&full_path.format())
        };
        let reply = self.exchange(&command, false).await?;
        if !reply.is_positive() {
            return Err(FtpError::Protocol {
                code: reply.code,
                message: reply.text,
            });
        }

        self.ctx
            .directory_cache
            .remove_dir(&self.server_key, &path, &subdir);
        self.ctx
            .notifier
            .directory_listing(path, false, true, false);
        Ok(())
    }

    /// Create a remote directory, including missing parents
    pub async fn make_dir(&mut self, path: ServerPath) -> Result<()> {
        self.begin_op().await?;
        let path = self.resolve_path_type(path);
        self.ctx
            .notifier
            .status(format!("Creating directory '{}'...", path.format()));
        let result = self.mkdir_inner(path).await;
        self.end_op(result)
    }

    /// Directory creation works like this: first find a parent directory
    /// into which we can CWD, then create the subdirs one by one. If either
    /// part fails, try MKD with the full path directly.
    pub(crate) async fn mkdir_inner(&mut self, path: ServerPath) -> Result<()> {
        let path = self.resolve_path_type(path);

        let mut common_parent: Option<ServerPath> = None;
        if let Some(current) = self.state.current_path.clone() {
            // Unless the server is broken, a directory already exists if the
            // current directory is a subdir of it.
            if current == path || current.is_subdir_of(&path, false) {
                return Ok(());
            }
            common_parent = if current.is_parent_of(&path, false) {
                Some(current)
            } else {
                path.common_parent(&current)
            };
        }

        // Concurrent sessions racing to create the same directory would
        // both see "already exists" failures halfway through.
        let locks = self.ctx.cache_locks.clone();
        let _guard = tokio::select! {
            _ = self.cancel.cancelled() => return Err(FtpError::Cancelled),
            guard = locks.lock(&self.server_key, &path, LockKind::Mkdir) => guard,
        };

        let mut segments: VecDeque<String> = VecDeque::new();
        let mut walk_path;
        let mut find_parent;
        match path.parent() {
            None => return self.mkdir_try_full(&path).await,
            Some(parent) => {
                segments.push_back(
                    path.last_segment()
                        .ok_or_else(|| FtpError::Internal("path without segments".to_string()))?
                        .to_string(),
                );
                walk_path = parent;
                find_parent = self.state.current_path.as_ref() != Some(&walk_path);
            }
        }

        // Walk upwards until some ancestor accepts a CWD
        while find_parent {
            self.cancel.check()?;
            self.state.current_path = None;
            let reply = self
                .exchange(&commands::cwd(&walk_path.format()), false)
                .await?;
            if reply.is_positive() {
                self.state.current_path = Some(walk_path.clone());
                find_parent = false;
            } else if common_parent.as_ref() == Some(&walk_path) {
                return self.mkdir_try_full(&path).await;
            } else if let Some(parent) = walk_path.parent() {
                segments.push_front(
                    walk_path
                        .last_segment()
                        .ok_or_else(|| FtpError::Internal("path without segments".to_string()))?
                        .to_string(),
                );
                walk_path = parent;
            } else {
                return self.mkdir_try_full(&path).await;
            }
        }

        // Create the missing chain one segment at a time
        while let Some(segment) = segments.pop_front() {
            self.cancel.check()?;
            let reply = self.exchange(&commands::mkd(&segment), false).await?;
            if !reply.is_positive()
                && !commands::mkd_reply_means_exists(&reply.text, &path.format())
            {
                return self.mkdir_try_full(&path).await;
            }

            self.ctx.directory_cache.update_file(
                &self.server_key,
                &walk_path,
                &segment,
                true,
                Some(EntryKind::Directory),
            );
            self.ctx
                .notifier
                .directory_listing(walk_path.clone(), false, true, false);

            walk_path.add_segment(&segment);
            if segments.is_empty() {
                return Ok(());
            }

            self.state.current_path = None;
            let reply = self
                .exchange(&commands::cwd(&walk_path.format()), false)
                .await?;
            if !reply.is_positive() {
                return self.mkdir_try_full(&path).await;
            }
            self.state.current_path = Some(walk_path.clone());
        }

        Ok(())
    }

    /// Last resort: one MKD with the absolute path
    async fn mkdir_try_full(&mut self, path: &ServerPath) -> Result<()> {
        debug!(path = %path, "creating directory with full path");
        let reply = self.exchange(&commands::mkd(&path.format()), false).await?;
        if reply.is_positive() {
            Ok(())
        } else {
            Err(FtpError::Protocol {
                code: reply.code,
                message: reply.text,
            })
        }
    }

    /// Rename or move a remote file or directory
    pub async fn rename(
        &mut self,
        from_path: ServerPath,
        from_file: impl Into<String>,
        to_path: ServerPath,
        to_file: impl Into<String>,
    ) -> Result<()> {
        self.begin_op().await?;
        let result = self
            .rename_inner(from_path, from_file.into(), to_path, to_file.into())
            .await;
        self.end_op(result)
    }

    async fn rename_inner(
        &mut self,
        from_path: ServerPath,
        from_file: String,
        to_path: ServerPath,
        to_file: String,
    ) -> Result<()> {
        let from_path = self.resolve_path_type(from_path);
        let to_path = self.resolve_path_type(to_path);

        self.ctx.notifier.status(format!(
            "Renaming '{}' to '{}'",
            from_path.format_filename(&from_file, false),
            to_path.format_filename(&to_file, false)
        ));

        let use_absolute = self
            .change_dir_inner(Some(from_path.clone()), "", false, false)
            .await
            .is_err();

        let reply = self
            .exchange(
                &commands::rnfr(&from_path.format_filename(&from_file, !use_absolute)),
                false,
            )
            .await?;
        if !reply.is_positive() {
            return Err(FtpError::Protocol {
                code: reply.code,
                message: reply.text,
            });
        }

        // Both names become untrustworthy the moment RNTO goes out
        self.ctx
            .directory_cache
            .invalidate_file(&self.server_key, &from_path, &from_file);
        self.ctx
            .directory_cache
            .invalidate_file(&self.server_key, &to_path, &to_file);
        self.ctx
            .path_cache
            .invalidate_path(&self.server_key, &from_path, &from_file);
        self.ctx
            .path_cache
            .invalidate_path(&self.server_key, &to_path, &to_file);

        let omit = !use_absolute && from_path == to_path;
        let reply = self
            .exchange(&commands::rnto(&to_path.format_filename(&to_file, omit)), false)
            .await?;
        if !reply.is_positive() {
            return Err(FtpError::Protocol {
                code: reply.code,
                message: reply.text,
            });
        }

        self.ctx.directory_cache.rename(
            &self.server_key,
            &from_path,
            &from_file,
            &to_path,
            &to_file,
        );
        self.ctx
            .notifier
            .directory_listing(from_path.clone(), false, true, false);
        if from_path != to_path {
            self.ctx
                .notifier
                .directory_listing(to_path, false, true, false);
        }
        Ok(())
    }

    /// Change permissions of a remote file via SITE CHMOD
    pub async fn chmod(
        &mut self,
        path: ServerPath,
        file: impl Into<String>,
        permissions: impl Into<String>,
    ) -> Result<()> {
        self.begin_op().await?;
        let result = self.chmod_inner(path, file.into(), permissions.into()).await;
        self.end_op(result)
    }

    async fn chmod_inner(
        &mut self,
        path: ServerPath,
        file: String,
        permissions: String,
    ) -> Result<()> {
        let path = self.resolve_path_type(path);
        self.ctx.notifier.status(format!(
            "Set permissions of '{}' to '{}'",
            path.format_filename(&file, false),
            permissions
        ));

        let use_absolute = self
            .change_dir_inner(Some(path.clone()), "", false, false)
            .await
            .is_err();

        let reply = self
            .exchange(
                &commands::site_chmod(&permissions, &path.format_filename(&file, !use_absolute)),
                false,
            )
            .await?;
        if !reply.is_positive() {
            return Err(FtpError::Protocol {
                code: reply.code,
                message: reply.text,
            });
        }

        // The entry's metadata is stale now; a later listing refreshes it
        self.ctx
            .directory_cache
            .invalidate_file(&self.server_key, &path, &file);
        Ok(())
    }

    /// Send a literal command line
    ///
    /// The engine cannot know what the command did, so everything cached
    /// for this server is invalidated and the current directory forgotten.
    pub async fn raw_command(&mut self, command: impl Into<String>) -> Result<FtpResponse> {
        self.begin_op().await?;
        let command = command.into();
        let result = self.raw_command_inner(&command).await;
        self.end_op(result)
    }

    async fn raw_command_inner(&mut self, command: &str) -> Result<FtpResponse> {
        if command.is_empty() {
            return Err(FtpError::Internal("empty command".to_string()));
        }

        self.ctx.directory_cache.invalidate_server(&self.server_key);
        self.state.current_path = None;

        let reply = self.exchange(command, false).await?;
        if reply.is_positive() {
            Ok(reply)
        } else {
            Err(FtpError::Protocol {
                code: reply.code,
                message: reply.text,
            })
        }
    }
}

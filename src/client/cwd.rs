//! Change-directory orchestration with path caching
//!
//! Every CWD is confirmed with a PWD so the server's canonical spelling of
//! the target lands in the path cache; later requests for the same
//! (path, subdir) pair short-circuit without touching the wire. The
//! confirmed current path is cleared right before any CWD/CDUP goes out so
//! an overlapping reply can never leave a stale value behind.

use tracing::{debug, warn};

use super::FtpClient;
use crate::commands;
use crate::error::{FtpError, Result};
use crate::path::ServerPath;

impl FtpClient {
    /// Change the remote working directory
    ///
    /// `path` of `None` means "confirm wherever we are" (a bare PWD when
    /// the current directory is unknown). A non-empty `subdir` is entered
    /// after `path`, with `..` mapped to CDUP. With `link_discovery` a
    /// failing CWD into the target reports [`FtpError::LinkNotDir`],
    /// signalling the caller that a suspected symlinked directory is
    /// actually a file.
    pub async fn change_dir(
        &mut self,
        path: Option<ServerPath>,
        subdir: &str,
        link_discovery: bool,
    ) -> Result<()> {
        self.begin_op().await?;
        let result = self
            .change_dir_inner(path, subdir, link_discovery, false)
            .await;
        self.end_op(result)
    }

    pub(crate) async fn change_dir_inner(
        &mut self,
        path: Option<ServerPath>,
        subdir: &str,
        link_discovery: bool,
        try_mkd_on_fail: bool,
    ) -> Result<()> {
        self.cancel.check()?;

        let Some(path) = path else {
            if self.state.current_path.is_some() {
                return Ok(());
            }
            return self.confirm_current_dir().await;
        };
        let path = self.resolve_path_type(path);

        let mut subdir = subdir.to_string();
        let mut target;
        let mut enter_parent = true;
        let mut request = path.clone();

        if !subdir.is_empty() {
            target = self
                .ctx
                .path_cache
                .lookup(&self.server_key, &path, &subdir);
            if let Some(found) = target.take() {
                if self.state.current_path.as_ref() == Some(&found) {
                    return Ok(());
                }
                // The combined target is known; one CWD suffices and the
                // canonical answer is already cached
                request = found.clone();
                subdir.clear();
                target = Some(found);
            } else {
                let parent_target = self.ctx.path_cache.lookup(&self.server_key, &path, "");
                let already_in_parent = self.state.current_path.as_ref() == Some(&path)
                    || (parent_target.is_some()
                        && parent_target.as_ref() == self.state.current_path.as_ref());
                if already_in_parent {
                    enter_parent = false;
                } else {
                    target = parent_target;
                }
            }
        } else {
            target = self.ctx.path_cache.lookup(&self.server_key, &path, "");
            if self.state.current_path.as_ref() == Some(&path)
                || (target.is_some() && target.as_ref() == self.state.current_path.as_ref())
            {
                return Ok(());
            }
        }

        if enter_parent {
            self.enter_path(&request, target, try_mkd_on_fail).await?;
            if subdir.is_empty() {
                return Ok(());
            }
        }

        self.enter_subdir(&path, &subdir, link_discovery).await
    }

    /// Bare PWD to learn the current directory
    async fn confirm_current_dir(&mut self) -> Result<()> {
        let reply = self.exchange(commands::pwd(), false).await?;
        if !reply.is_positive() {
            return Err(FtpError::Protocol {
                code: reply.code,
                message: reply.text,
            });
        }
        let parsed = commands::parse_pwd_reply(&reply.text)
            .and_then(|raw| ServerPath::parse_with_type(&raw, self.server_type).ok())
            .ok_or_else(|| FtpError::InvalidResponse(reply.full_line()))?;
        self.state.current_path = Some(parsed);
        Ok(())
    }

    /// CWD to `request` and confirm with PWD
    async fn enter_path(
        &mut self,
        request: &ServerPath,
        target: Option<ServerPath>,
        try_mkd_on_fail: bool,
    ) -> Result<()> {
        self.state.current_path = None;
        let mut reply = self
            .exchange(&commands::cwd(&request.format()), false)
            .await?;

        if !reply.is_positive() && try_mkd_on_fail {
            // Upload into a missing directory: create it, then retry once
            debug!(path = %request, "CWD failed, attempting to create directory");
            if let Err(err) = self.mkdir_inner(request.clone()).await {
                debug!(error = %err, "directory creation before CWD failed");
            }
            self.state.current_path = None;
            reply = self
                .exchange(&commands::cwd(&request.format()), false)
                .await?;
        }

        if !reply.is_positive() {
            return Err(FtpError::Protocol {
                code: reply.code,
                message: reply.text,
            });
        }

        if let Some(target) = target {
            // Cached resolution; skip the PWD round trip
            self.state.current_path = Some(target);
            return Ok(());
        }

        // Confirm what the server actually made of the path
        let reply = self.exchange(commands::pwd(), false).await?;
        let confirmed = if reply.is_positive() {
            commands::parse_pwd_reply(&reply.text)
                .and_then(|raw| ServerPath::parse_with_type(&raw, self.server_type).ok())
        } else {
            None
        };
        let current = match confirmed {
            Some(path) => path,
            None => {
                warn!(path = %request, "PWD failed, assuming requested path");
                request.clone()
            }
        };
        self.ctx
            .path_cache
            .store(&self.server_key, current.clone(), request, "");
        self.state.current_path = Some(current);
        Ok(())
    }

    /// Enter `subdir` relative to `parent` and confirm with PWD
    async fn enter_subdir(
        &mut self,
        parent: &ServerPath,
        subdir: &str,
        link_discovery: bool,
    ) -> Result<()> {
        let mut tried_cdup = false;
        loop {
            self.state.current_path = None;
            let command = if subdir == ".." && !tried_cdup {
                commands::cdup().to_string()
            } else {
                commands::cwd(&parent.format_subdir(subdir))
            };
            let reply = self.exchange(&command, false).await?;

            if reply.is_positive() {
                break;
            }
            // CDUP is optional; a 50x means "not implemented", retry as CWD
            if subdir == ".." && !tried_cdup && reply.code / 10 == 50 {
                tried_cdup = true;
                continue;
            }
            if link_discovery {
                debug!("Symlink does not link to a directory, probably a file");
                return Err(FtpError::LinkNotDir);
            }
            return Err(FtpError::Protocol {
                code: reply.code,
                message: reply.text,
            });
        }

        let assumed = if subdir == ".." {
            parent.parent()
        } else {
            Some(parent.joined(subdir))
        };

        let reply = self.exchange(commands::pwd(), false).await?;
        let confirmed = if reply.is_positive() {
            commands::parse_pwd_reply(&reply.text)
                .and_then(|raw| ServerPath::parse_with_type(&raw, self.server_type).ok())
        } else {
            None
        };

        let current = match (confirmed, assumed) {
            (Some(path), _) => path,
            (None, Some(assumed)) => {
                warn!(path = %assumed, "PWD failed, assuming path");
                assumed
            }
            (None, None) => {
                warn!("PWD failed, unable to guess current path");
                return Err(FtpError::Protocol {
                    code: reply.code,
                    message: reply.text,
                });
            }
        };

        self.ctx
            .path_cache
            .store(&self.server_key, current.clone(), parent, subdir);
        self.state.current_path = Some(current);
        Ok(())
    }
}

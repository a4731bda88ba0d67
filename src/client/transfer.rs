//! Raw transfer orchestration: TYPE, PASV/EPSV or PORT/EPRT, REST, the
//! payload command, and the two-sided completion handshake
//!
//! A transfer only counts as finished once BOTH the final control reply and
//! the data-side end have been observed; the payload phase therefore runs
//! concurrently with the control reader. Mode failures flip between passive
//! and active once in each direction when the fallback option allows it.

use std::net::{IpAddr, SocketAddr};

use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::{debug, warn};

use super::FtpClient;
use super::data::{DataConnection, DataTarget, TransferEndReason, TransferFailure};
use super::state::TypeMode;
use crate::commands;
use crate::config::{ExternalIpMode, PassiveMode};
use crate::error::{FtpError, Result};

type TransferResult<T> = std::result::Result<T, TransferFailure>;

impl FtpClient {
    /// Run one complete data transfer for `command` (RETR/STOR/APPE/LIST/
    /// MLSD), returning the transferred byte count
    pub(crate) async fn raw_transfer(
        &mut self,
        command: &str,
        binary: bool,
        resume_offset: u64,
        target: DataTarget<'_>,
    ) -> TransferResult<u64> {
        self.apply_type(binary).await?;
        let data_conn = self.setup_data_connection().await?;
        self.apply_rest(resume_offset).await?;
        self.run_payload(command, data_conn, target).await
    }

    /// TYPE I / TYPE A, skipped when the last acknowledged TYPE matches
    async fn apply_type(&mut self, binary: bool) -> TransferResult<()> {
        let wanted = if binary {
            TypeMode::Binary
        } else {
            TypeMode::Ascii
        };
        if self.state.last_type == Some(wanted) {
            return Ok(());
        }

        self.state.last_type = None;
        let cmd = if binary {
            commands::type_binary()
        } else {
            commands::type_ascii()
        };
        let reply = self
            .exchange(cmd, false)
            .await
            .map_err(|e| TransferFailure::new(TransferEndReason::PreTransferCommandFailure, e))?;
        if !reply.is_positive() {
            return Err(TransferFailure::with_reply(
                TransferEndReason::PreTransferCommandFailure,
                FtpError::Protocol {
                    code: reply.code,
                    message: reply.text.clone(),
                },
                reply.code,
                &reply.text,
            ));
        }
        self.state.last_type = Some(wanted);
        Ok(())
    }

    /// Negotiate the data-connection mode, flipping between passive and
    /// active once each way if the fallback option permits
    async fn setup_data_connection(&mut self) -> TransferResult<DataConnection> {
        // A generic proxy only supports outgoing connections
        let mut passive;
        let mut tried_active = false;
        let mut tried_passive = false;
        if self.ctx.options.generic_proxy {
            passive = true;
            tried_active = true;
        } else {
            passive = match self.config.passive_mode {
                PassiveMode::Passive => true,
                PassiveMode::Active => false,
                PassiveMode::Default => self.ctx.options.use_pasv,
            };
        }

        loop {
            let attempt = if passive {
                tried_passive = true;
                self.try_passive_setup(tried_active).await
            } else {
                tried_active = true;
                self.try_active_setup().await
            };

            match attempt {
                Ok(conn) => return Ok(conn),
                Err(failure) => {
                    let can_flip = self.ctx.options.allow_transfer_mode_fallback
                        && !matches!(failure.error, FtpError::Cancelled)
                        && if passive { !tried_active } else { !tried_passive };
                    if !can_flip {
                        return Err(failure);
                    }
                    debug!(
                        from_passive = passive,
                        "data connection setup failed, trying the other mode"
                    );
                    passive = !passive;
                }
            }
        }
    }

    async fn try_passive_setup(&mut self, tried_active: bool) -> TransferResult<DataConnection> {
        let ipv6 = self.peer_addr.is_ipv6();
        let cmd = if ipv6 {
            commands::epsv()
        } else {
            commands::pasv()
        };
        let reply = self
            .exchange(cmd, false)
            .await
            .map_err(|e| TransferFailure::new(TransferEndReason::PreTransferCommandFailure, e))?;
        if !reply.is_positive() {
            return Err(TransferFailure::with_reply(
                TransferEndReason::PreTransferCommandFailure,
                FtpError::Protocol {
                    code: reply.code,
                    message: reply.text.clone(),
                },
                reply.code,
                &reply.text,
            ));
        }

        let addr = if ipv6 {
            let port = commands::parse_epsv_reply(&reply.text).ok_or_else(|| {
                TransferFailure::new(
                    TransferEndReason::PreTransferCommandFailure,
                    FtpError::InvalidResponse(reply.full_line()),
                )
            })?;
            SocketAddr::new(self.peer_addr.ip(), port)
        } else {
            let (host, port) = commands::parse_pasv_reply(&reply.text).ok_or_else(|| {
                TransferFailure::new(
                    TransferEndReason::PreTransferCommandFailure,
                    FtpError::InvalidResponse(reply.full_line()),
                )
            })?;
            let mut host = IpAddr::V4(host);

            // Servers behind NAT tend to advertise their internal address
            let peer = self.peer_addr.ip();
            if !self.ctx.options.generic_proxy
                && !commands::is_routable_address(&host)
                && commands::is_routable_address(&peer)
            {
                if self.ctx.options.pasv_reply_fallback_mode || tried_active {
                    self.ctx.notifier.status(
                        "Server sent passive reply with unroutable address. Using server address instead.",
                    );
                    debug!(advertised = %host, %peer, "substituting peer address");
                    host = peer;
                } else {
                    self.ctx.notifier.status(
                        "Server sent passive reply with unroutable address. Passive mode failed.",
                    );
                    return Err(TransferFailure::new(
                        TransferEndReason::PreTransferCommandFailure,
                        FtpError::InvalidResponse(reply.full_line()),
                    ));
                }
            }
            SocketAddr::new(host, port)
        };

        DataConnection::connect_passive(addr, self.data_tls()?)
            .await
            .map_err(|e| TransferFailure::new(TransferEndReason::PreTransferCommandFailure, e))
    }

    async fn try_active_setup(&mut self) -> TransferResult<DataConnection> {
        let external = self.external_ip_for_active().await.map_err(|e| {
            TransferFailure::new(TransferEndReason::PreTransferCommandFailure, e)
        })?;

        let tls = self.data_tls()?;
        let (conn, port) =
            DataConnection::listen_active(self.local_addr.ip(), self.peer_addr.ip(), tls)
                .await
                .map_err(|e| {
                    TransferFailure::new(TransferEndReason::PreTransferCommandFailure, e)
                })?;

        let cmd = match external {
            IpAddr::V6(_) => commands::eprt(&commands::format_eprt_argument(external, port)),
            IpAddr::V4(v4) => commands::port(&commands::format_port_argument(v4, port)),
        };
        let reply = self
            .exchange(&cmd, false)
            .await
            .map_err(|e| TransferFailure::new(TransferEndReason::PreTransferCommandFailure, e))?;
        if !reply.is_positive() {
            return Err(TransferFailure::with_reply(
                TransferEndReason::PreTransferCommandFailure,
                FtpError::Protocol {
                    code: reply.code,
                    message: reply.text.clone(),
                },
                reply.code,
                &reply.text,
            ));
        }
        Ok(conn)
    }

    /// REST, sent when resuming or when a previous nonzero REST is sticky
    async fn apply_rest(&mut self, resume_offset: u64) -> TransferResult<()> {
        if resume_offset == 0 && !self.state.sent_restart_offset {
            return Ok(());
        }

        let reply = self
            .exchange(&commands::rest(resume_offset), false)
            .await
            .map_err(|e| TransferFailure::new(TransferEndReason::PreTransferCommandFailure, e))?;

        if resume_offset == 0 {
            self.state.sent_restart_offset = false;
            return Ok(());
        }
        if !reply.is_positive() {
            return Err(TransferFailure::with_reply(
                TransferEndReason::PreTransferCommandFailure,
                FtpError::Protocol {
                    code: reply.code,
                    message: reply.text.clone(),
                },
                reply.code,
                &reply.text,
            ));
        }
        self.state.sent_restart_offset = true;
        Ok(())
    }

    /// Send the payload command, then drive data and control to completion
    async fn run_payload(
        &mut self,
        command: &str,
        data_conn: DataConnection,
        target: DataTarget<'_>,
    ) -> TransferResult<u64> {
        let is_probe = matches!(target, DataTarget::ResumeProbe);

        self.send_command(command, false)
            .await
            .map_err(|e| TransferFailure::new(TransferEndReason::PreTransferCommandFailure, e))?;

        let first = self
            .read_reply()
            .await
            .map_err(|e| TransferFailure::new(TransferEndReason::Failure, e))?;
        if !first.is_intermediate() {
            let reason = if is_probe && first.is_error() {
                TransferEndReason::FailedResumeTest
            } else {
                TransferEndReason::TransferCommandFailureImmediate
            };
            return Err(TransferFailure::with_reply(
                reason,
                FtpError::TransferCommandFailed(first.full_line()),
                first.code,
                &first.text,
            ));
        }

        // Both sides must finish: the data stream closing and the final
        // control reply, in either order.
        let cancel = self.cancel.clone();
        let data_fut = async {
            tokio::select! {
                _ = cancel.cancelled() => Err(FtpError::Cancelled),
                result = data_conn.drive(target) => result,
            }
        };
        let (data_result, reply_result) = tokio::join!(data_fut, self.read_final_reply());

        match (data_result, reply_result) {
            (Ok(bytes), Ok(reply)) if reply.is_positive() => {
                if is_probe && bytes != 1 {
                    debug!(bytes, "resume probe returned unexpected byte count");
                    return Err(TransferFailure::with_reply(
                        TransferEndReason::FailedResumeTest,
                        FtpError::TransferCommandFailed(
                            "resume probe did not yield the expected byte".to_string(),
                        ),
                        reply.code,
                        &reply.text,
                    ));
                }
                Ok(bytes)
            }
            (Ok(bytes), Ok(reply)) => {
                let reason = if is_probe && bytes == 0 {
                    TransferEndReason::FailedResumeTest
                } else {
                    TransferEndReason::TransferCommandFailure
                };
                Err(TransferFailure::with_reply(
                    reason,
                    FtpError::TransferCommandFailed(reply.full_line()),
                    reply.code,
                    &reply.text,
                ))
            }
            (Err(data_err), reply_result) => {
                let reason = match &data_err {
                    FtpError::WriteFailed(_) => TransferEndReason::TransferFailureCritical,
                    FtpError::Timeout => TransferEndReason::Timeout,
                    _ if is_probe => TransferEndReason::FailedResumeTest,
                    _ => TransferEndReason::Failure,
                };
                if let Err(reply_err) = reply_result {
                    debug!(error = %reply_err, "control reply also failed");
                }
                Err(TransferFailure::new(reason, data_err))
            }
            (Ok(_), Err(reply_err)) => {
                let reason = match &reply_err {
                    FtpError::Timeout => TransferEndReason::Timeout,
                    _ => TransferEndReason::Failure,
                };
                Err(TransferFailure::new(reason, reply_err))
            }
        }
    }

    /// TLS context for the data connection, when PROT P is in effect
    fn data_tls(&self) -> TransferResult<Option<(TlsConnector, ServerName<'static>)>> {
        if !self.state.protect_data_channel {
            return Ok(None);
        }
        let name = ServerName::try_from(self.config.host.as_str())
            .map_err(|e| {
                TransferFailure::new(
                    TransferEndReason::PreTransferCommandFailure,
                    FtpError::Tls(format!("Invalid domain: {}", e)),
                )
            })?
            .to_owned();
        Ok(Some((TlsConnector::from(self.tls_config.clone()), name)))
    }

    /// Pick the address to advertise in PORT/EPRT
    ///
    /// IPv6 connections always use the local address; NAT for IPv6 is not a
    /// configuration worth supporting.
    pub(crate) async fn external_ip_for_active(&mut self) -> Result<IpAddr> {
        let local_ip = self.local_addr.ip();
        if local_ip.is_ipv6() {
            return Ok(local_ip);
        }

        let options = &self.ctx.options;
        let mode = options.external_ip_mode;
        if mode != ExternalIpMode::Default
            && options.no_external_on_local
            && !commands::is_routable_address(&self.peer_addr.ip())
        {
            // Talking to a machine on our own network: external IP useless
            return Ok(local_ip);
        }

        match mode {
            ExternalIpMode::Default => Ok(local_ip),
            ExternalIpMode::Fixed => match options.external_ip.parse::<IpAddr>() {
                Ok(ip) => Ok(ip),
                Err(_) => {
                    warn!("No external IP address set, trying default.");
                    Ok(local_ip)
                }
            },
            ExternalIpMode::Resolver => {
                let Some(resolver) = self.ctx.external_ip_resolver.clone() else {
                    warn!("External IP resolver mode set but no resolver provided");
                    return Ok(local_ip);
                };
                let service = options.external_ip_resolver.clone();
                debug!(service = %service, "retrieving external IP address");
                match resolver.resolve(&service).await {
                    Ok(ip) => Ok(ip),
                    Err(e) => {
                        warn!(error = %e, "failed to retrieve external IP, using local address");
                        Ok(local_ip)
                    }
                }
            }
        }
    }
}

//! Login orchestration against a scripted server
//!
//! Covers the welcome/credential/SYST/FEAT flow, capability discovery,
//! UTF-8 negotiation, and the login failure modes.

mod common;

use std::sync::Arc;

use common::*;
use ftp_rs::{
    Capability, CapabilityState, FtpClient, FtpError, ServerKey,
};

#[tokio::test]
async fn test_plain_login_negotiates_features() {
    let server = MockServer::start(login_steps(&[" UTF8", " MLSD", " MDTM", " SIZE"])).await;
    let ctx = test_context();
    let caps = ctx.capabilities.clone();
    let key = ServerKey::new(server.addr.ip().to_string(), server.addr.port());

    let client = connect_and_login(&server, ctx).await;

    assert!(client.is_logged_in());
    assert!(client.uses_utf8());
    assert!(!client.is_tls());
    assert_eq!(client.pending_replies(), 0);

    assert_eq!(caps.get(&key, Capability::Utf8Command), CapabilityState::Yes);
    assert_eq!(caps.get(&key, Capability::MlsdCommand), CapabilityState::Yes);
    assert_eq!(caps.get(&key, Capability::MdtmCommand), CapabilityState::Yes);
    assert_eq!(caps.get(&key, Capability::SizeCommand), CapabilityState::Yes);
    assert_eq!(caps.get(&key, Capability::FeatCommand), CapabilityState::Yes);
    // Not advertised: demoted to No, not left Unknown
    assert_eq!(caps.get(&key, Capability::ClntCommand), CapabilityState::No);
    assert_eq!(caps.get(&key, Capability::TvfsSupport), CapabilityState::No);
    // The SYST answer is recorded with its payload
    let (state, payload) = caps.get_with_value(&key, Capability::SystCommand);
    assert_eq!(state, CapabilityState::Yes);
    assert_eq!(payload.as_deref(), Some("UNIX Type: L8"));

    server.finish().await;
}

#[tokio::test]
async fn test_login_without_utf8_falls_back_to_local_charset() {
    let server = MockServer::start(login_steps(&[" MDTM"])).await;
    let client = connect_and_login(&server, test_context()).await;

    assert!(!client.uses_utf8());
    server.finish().await;
}

#[tokio::test]
async fn test_feat_failure_is_not_fatal() {
    let steps = vec![
        send("220 Mock FTP ready"),
        expect("USER testuser"),
        send("331 Password required"),
        expect("PASS testpass"),
        send("230 Logged in"),
        expect("SYST"),
        send("215 UNIX Type: L8"),
        expect("FEAT"),
        send("502 Command not implemented"),
    ];
    let server = MockServer::start(steps).await;
    let ctx = test_context();
    let caps = ctx.capabilities.clone();
    let key = ServerKey::new(server.addr.ip().to_string(), server.addr.port());

    let client = connect_and_login(&server, ctx).await;
    assert!(client.is_logged_in());
    assert_eq!(caps.get(&key, Capability::FeatCommand), CapabilityState::No);

    server.finish().await;
}

#[tokio::test]
async fn test_password_rejected() {
    let steps = vec![
        send("220 Mock FTP ready"),
        expect("USER testuser"),
        send("331 Password required"),
        expect("PASS testpass"),
        send("530 Login incorrect"),
    ];
    let server = MockServer::start(steps).await;

    let config = Arc::new(test_config(server.addr));
    let mut client = FtpClient::connect_with(config, test_context()).await.unwrap();
    let err = client.login().await.unwrap_err();

    assert!(matches!(err, FtpError::AuthFailed(_)), "got {err:?}");
    assert!(!client.is_logged_in());
    server.finish().await;
}

#[tokio::test]
async fn test_ssh_banner_rejected() {
    let steps = vec![send("SSH-2.0-OpenSSH_9.6")];
    let server = MockServer::start(steps).await;

    let config = Arc::new(test_config(server.addr));
    let mut client = FtpClient::connect_with(config, test_context()).await.unwrap();
    let err = client.login().await.unwrap_err();

    assert!(matches!(err, FtpError::WrongProtocol), "got {err:?}");
    server.finish().await;
}

#[tokio::test]
async fn test_exhausted_sequence_reports_missing_account() {
    let steps = vec![
        send("220 Mock FTP ready"),
        expect("USER testuser"),
        send("331 Password required"),
        expect("PASS testpass"),
        send("332 Need account for login"),
    ];
    let server = MockServer::start(steps).await;

    let config = Arc::new(test_config(server.addr));
    let mut client = FtpClient::connect_with(config, test_context()).await.unwrap();
    let err = client.login().await.unwrap_err();

    assert!(matches!(err, FtpError::LoginIncomplete(_)), "got {err:?}");
    server.finish().await;
}

#[tokio::test]
async fn test_user_accepted_without_password_skips_pass() {
    // A 230 straight after USER must skip the optional PASS step
    let steps = vec![
        send("220 Mock FTP ready"),
        expect("USER testuser"),
        send("230 Logged in"),
        expect("SYST"),
        send("215 UNIX Type: L8"),
        expect("FEAT"),
        send("502 No features"),
    ];
    let server = MockServer::start(steps).await;

    let client = connect_and_login(&server, test_context()).await;
    assert!(client.is_logged_in());
    server.finish().await;
}

#[tokio::test]
async fn test_post_login_commands_sent_in_order() {
    let mut steps = login_steps(&[" UTF8"]);
    steps.push(expect("SITE UMASK 002"));
    steps.push(send("200 OK"));
    steps.push(expect("SITE IDLE 60"));
    steps.push(send("200 OK"));
    let server = MockServer::start(steps).await;

    let mut config = test_config(server.addr);
    config.post_login_commands =
        vec!["SITE UMASK 002".to_string(), "SITE IDLE 60".to_string()];
    let mut client = FtpClient::connect_with(Arc::new(config), test_context())
        .await
        .unwrap();
    client.login().await.unwrap();

    assert!(client.is_logged_in());
    server.finish().await;
}

#[tokio::test]
async fn test_syst_server_type_inference() {
    let steps = vec![
        send("220 Mock FTP ready"),
        expect("USER testuser"),
        send("331 Password required"),
        expect("PASS testpass"),
        send("230 Logged in"),
        expect("SYST"),
        send("215 MVS is the operating system of this server."),
        expect("FEAT"),
        send("502 No features"),
    ];
    let server = MockServer::start(steps).await;

    let client = connect_and_login(&server, test_context()).await;
    assert_eq!(client.server_type(), ftp_rs::ServerType::Mvs);
    server.finish().await;
}

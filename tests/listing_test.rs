//! Directory-listing orchestration against a scripted server

mod common;

use std::sync::Arc;

use common::*;
use ftp_rs::{
    Capability, CapabilityState, EngineEvent, EngineOptions, ListFlags, Notifier, ServerKey,
};

fn listing_events(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<EngineEvent>,
) -> Vec<(bool, bool, bool)> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let EngineEvent::DirectoryListing {
            primary,
            modified,
            failed,
            ..
        } = event
        {
            events.push((primary, modified, failed));
        }
    }
    events
}

#[tokio::test]
async fn test_passive_mlsd_listing() {
    let server = MockServer::start_deferred(|server| {
        let mut steps = login_steps(&[" UTF8", " MLSD"]);
        steps.extend([
            expect("CWD /pub"),
            send("250 Directory changed"),
            expect("PWD"),
            send("257 \"/pub\" is current directory"),
            expect("TYPE A"),
            send("200 Type set to A"),
            expect("PASV"),
            send(&server.pasv_reply()),
            expect("MLSD"),
            send("150 Opening data connection"),
            Step::AcceptData(b"F readme.txt 100\r\nF data.bin 2048\r\nD sub\r\n".to_vec()),
            send("226 Transfer complete"),
        ]);
        steps
    })
    .await;

    let (notifier, mut rx) = Notifier::channel();
    let mut ctx = test_context();
    ctx.notifier = notifier;
    let caps = ctx.capabilities.clone();
    let key = ServerKey::new(server.addr.ip().to_string(), server.addr.port());
    let dir_cache = ctx.directory_cache.clone();

    let mut client = connect_and_login(&server, ctx).await;
    let listing = client
        .list(Some(unix_path("/pub")), "", ListFlags::default())
        .await
        .unwrap();

    assert_eq!(listing.len(), 3);
    assert_eq!(listing.entries[0].name, "readme.txt");
    assert!(listing.entries[2].is_dir());

    // The listing landed in the shared cache
    let (cached, outdated) = dir_cache.lookup(&key, &unix_path("/pub")).unwrap();
    assert_eq!(cached.len(), 3);
    assert!(!outdated);

    // Exactly one primary, modified, successful notification
    assert_eq!(listing_events(&mut rx), vec![(true, true, false)]);

    // MLSD timestamps are UTC; calibration must have been skipped
    assert_eq!(
        caps.get(&key, Capability::TimezoneOffset),
        CapabilityState::No
    );

    // A second listing of the same directory is served from the cache
    // without touching the wire (the script has no further steps).
    let again = client
        .list(Some(unix_path("/pub")), "", ListFlags::default())
        .await
        .unwrap();
    assert_eq!(again.len(), 3);
    assert_eq!(listing_events(&mut rx), vec![(true, false, false)]);

    server.finish().await;
}

#[tokio::test]
async fn test_timezone_calibration_via_mdtm() {
    let server = MockServer::start_deferred(|server| {
        let mut steps = login_steps(&[" MDTM"]);
        steps.extend([
            expect("CWD /logs"),
            send("250 OK"),
            expect("PWD"),
            send("257 \"/logs\""),
            expect("TYPE A"),
            send("200 OK"),
            expect("PASV"),
            send(&server.pasv_reply()),
            expect("LIST"),
            send("150 Here it comes"),
            Step::AcceptData(b"F app.log 100 202403051200\r\n".to_vec()),
            send("226 Transfer complete"),
            expect("MDTM app.log"),
            send("213 20240305130000"),
        ]);
        steps
    })
    .await;

    let ctx = test_context();
    let caps = ctx.capabilities.clone();
    let key = ServerKey::new(server.addr.ip().to_string(), server.addr.port());

    let mut client = connect_and_login(&server, ctx).await;
    let listing = client
        .list(Some(unix_path("/logs")), "", ListFlags::default())
        .await
        .unwrap();

    // Server is one hour ahead of the timestamps it lists
    assert_eq!(caps.get_number(&key, Capability::TimezoneOffset), Some(3600));
    assert_eq!(
        caps.get(&key, Capability::TimezoneOffset),
        CapabilityState::Yes
    );

    let entry = listing.find("app.log").unwrap();
    let expected = chrono::DateTime::parse_from_rfc3339("2024-03-05T13:00:00Z").unwrap();
    assert_eq!(entry.time.unwrap(), expected);

    server.finish().await;
}

#[tokio::test]
async fn test_misleading_empty_reply_yields_empty_listing() {
    let server = MockServer::start_deferred(|server| {
        let mut steps = login_steps(&[]);
        steps.extend([
            expect("CWD /empty"),
            send("250 OK"),
            expect("PWD"),
            send("257 \"/empty\""),
            expect("TYPE A"),
            send("200 OK"),
            expect("PASV"),
            send(&server.pasv_reply()),
            expect("LIST"),
            send("550 No files found."),
        ]);
        steps
    })
    .await;

    let mut client = connect_and_login(&server, test_context()).await;
    let listing = client
        .list(Some(unix_path("/empty")), "", ListFlags::default())
        .await
        .unwrap();

    assert!(listing.is_empty());
    server.finish().await;
}

#[tokio::test]
async fn test_hidden_file_probe_marks_support() {
    let server = MockServer::start_deferred(|server| {
        let mut steps = login_steps(&[]);
        steps.extend([
            expect("CWD /pub"),
            send("250 OK"),
            expect("PWD"),
            send("257 \"/pub\""),
            expect("TYPE A"),
            send("200 OK"),
            expect("PASV"),
            send(&server.pasv_reply()),
            expect("LIST"),
            send("150 Opening"),
            Step::AcceptData(b"F a 1\r\nF b 1\r\n".to_vec()),
            send("226 Done"),
            // Unknown hidden support: the engine repeats with LIST -a
            expect("PASV"),
            send(&server.pasv_reply()),
            expect("LIST -a"),
            send("150 Opening"),
            Step::AcceptData(b"F .hidden 1\r\nF a 1\r\nF b 1\r\n".to_vec()),
            send("226 Done"),
        ]);
        steps
    })
    .await;

    let mut ctx = test_context();
    let mut options = EngineOptions::default();
    options.view_hidden_files = true;
    ctx.options = Arc::new(options);
    let caps = ctx.capabilities.clone();
    let key = ServerKey::new(server.addr.ip().to_string(), server.addr.port());
    // LIST timestamps here carry no time, keep calibration out of the way
    caps.set(&key, Capability::TimezoneOffset, CapabilityState::No);

    let mut client = connect_and_login(&server, ctx).await;
    let listing = client
        .list(Some(unix_path("/pub")), "", ListFlags::default())
        .await
        .unwrap();

    // LIST output was a subset of LIST -a: hidden listing wins
    assert_eq!(listing.len(), 3);
    assert!(listing.find(".hidden").is_some());
    assert_eq!(
        caps.get(&key, Capability::ListHiddenSupport),
        CapabilityState::Yes
    );

    server.finish().await;
}

#[tokio::test]
async fn test_listing_failure_notifies() {
    let server = MockServer::start_deferred(|_server| {
        let mut steps = login_steps(&[]);
        steps.extend([
            expect("CWD /secret"),
            send("550 Permission denied"),
        ]);
        steps
    })
    .await;

    let (notifier, mut rx) = Notifier::channel();
    let mut ctx = test_context();
    ctx.notifier = notifier;

    let mut client = connect_and_login(&server, ctx).await;
    let err = client
        .list(Some(unix_path("/secret")), "", ListFlags::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ftp_rs::FtpError::Protocol { code: 550, .. }));
    // No current path was established, so no failure notification can name
    // a directory; the error itself is the signal.
    assert!(listing_events(&mut rx).is_empty());

    server.finish().await;
}

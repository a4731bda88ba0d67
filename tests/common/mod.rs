//! Shared mock-server harness for the integration tests
//!
//! Each test scripts one FTP session: lines the server sends, lines it
//! expects, and what happens on the data connection. The mock runs on real
//! sockets so the engine exercises its actual connection and framing code.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};

use ftp_rs::{
    DirectoryListing, EngineContext, EntryKind, FtpClient, ListingEntry, ListingParser,
    Protocol, Result, ServerConfig, ServerPath, ServerType, TimestampPrecision,
};

/// One scripted step of the mock session
#[allow(dead_code)]
pub enum Step {
    /// Send a control line (CRLF appended); may contain embedded CRLFs for
    /// multi-line replies
    Send(String),
    /// Read one control line and assert it matches exactly
    Expect(String),
    /// Read one control line and assert its prefix
    ExpectPrefix(String),
    /// Accept one data connection, send the payload, close
    AcceptData(Vec<u8>),
    /// Accept one data connection, send the payload, hold it open for the
    /// given time, then close
    AcceptDataHold(Vec<u8>, u64),
    /// Accept one data connection, read to EOF, assert the byte count
    RecvData(usize),
    /// Connect to the port of the most recent PORT command, send the
    /// payload, close
    ConnectAndSend(Vec<u8>),
    /// Pause the script
    Sleep(u64),
}

/// Convenience constructors so scripts read naturally
#[allow(dead_code)]
pub fn send(line: &str) -> Step {
    Step::Send(line.to_string())
}

#[allow(dead_code)]
pub fn expect(line: &str) -> Step {
    Step::Expect(line.to_string())
}

#[allow(dead_code)]
pub fn expect_prefix(line: &str) -> Step {
    Step::ExpectPrefix(line.to_string())
}

pub struct MockServer {
    pub addr: SocketAddr,
    pub data_port: u16,
    handle: Option<JoinHandle<()>>,
}

impl MockServer {
    /// Bind the control and data listeners and run the script
    pub async fn start(steps: Vec<Step>) -> MockServer {
        Self::start_deferred(move |_| steps).await
    }

    /// Like [`MockServer::start`], but the script is built after the ports
    /// are known, so PASV replies can embed the real data port
    pub async fn start_deferred<F>(build: F) -> MockServer
    where
        F: FnOnce(&MockServer) -> Vec<Step>,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let data_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let data_port = data_listener.local_addr().unwrap().port();

        let mut server = MockServer {
            addr,
            data_port,
            handle: None,
        };
        let steps = build(&server);

        server.handle = Some(tokio::spawn(async move {
            let (control, _) = listener.accept().await.unwrap();
            run_script(control, data_listener, steps).await;
        }));
        server
    }

    /// The PASV reply advertising this server's data port
    pub fn pasv_reply(&self) -> String {
        format!(
            "227 Entering Passive Mode (127,0,0,1,{},{})",
            self.data_port / 256,
            self.data_port % 256
        )
    }

    /// Wait for the script to run to completion
    pub async fn finish(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.await.unwrap();
        }
    }
}

async fn run_script(control: TcpStream, data_listener: TcpListener, steps: Vec<Step>) {
    let (read_half, mut write_half) = control.into_split();
    let mut reader = BufReader::new(read_half);
    let mut last_port_line = String::new();

    for (index, step) in steps.into_iter().enumerate() {
        match step {
            Step::Send(line) => {
                write_half
                    .write_all(format!("{line}\r\n").as_bytes())
                    .await
                    .unwrap();
            }
            Step::Expect(expected) => {
                let line = read_line(&mut reader).await;
                assert_eq!(line, expected, "script step {index}");
            }
            Step::ExpectPrefix(prefix) => {
                let line = read_line(&mut reader).await;
                assert!(
                    line.starts_with(&prefix),
                    "script step {index}: got {line:?}, wanted prefix {prefix:?}"
                );
                if prefix.starts_with("PORT") {
                    last_port_line = line;
                }
            }
            Step::AcceptData(payload) => {
                let (mut data, _) = data_listener.accept().await.unwrap();
                data.write_all(&payload).await.unwrap();
            }
            Step::AcceptDataHold(payload, hold_ms) => {
                let (mut data, _) = data_listener.accept().await.unwrap();
                data.write_all(&payload).await.unwrap();
                sleep(Duration::from_millis(hold_ms)).await;
            }
            Step::RecvData(expected_len) => {
                let (mut data, _) = data_listener.accept().await.unwrap();
                let mut received = Vec::new();
                data.read_to_end(&mut received).await.unwrap();
                assert_eq!(received.len(), expected_len, "script step {index}");
            }
            Step::ConnectAndSend(payload) => {
                let port = parse_port_argument(&last_port_line)
                    .unwrap_or_else(|| panic!("no PORT line before step {index}"));
                let mut data = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
                data.write_all(&payload).await.unwrap();
            }
            Step::Sleep(ms) => sleep(Duration::from_millis(ms)).await,
        }
    }
}

async fn read_line(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    line.trim_end().to_string()
}

fn parse_port_argument(line: &str) -> Option<u16> {
    let args = line.strip_prefix("PORT ")?;
    let parts: Vec<u16> = args.split(',').filter_map(|p| p.parse().ok()).collect();
    if parts.len() != 6 {
        return None;
    }
    Some(parts[4] * 256 + parts[5])
}

/// The steps every successful plain-FTP login produces
///
/// `feat_lines` are the FEAT continuation lines (each with its leading
/// space); when UTF8 is among them the OPTS UTF8 ON exchange is included.
pub fn login_steps(feat_lines: &[&str]) -> Vec<Step> {
    let mut feat = String::from("211-Features:\r\n");
    for line in feat_lines {
        feat.push_str(line);
        feat.push_str("\r\n");
    }
    feat.push_str("211 End");

    let mut steps = vec![
        send("220 Mock FTP ready"),
        expect("USER testuser"),
        send("331 Password required"),
        expect("PASS testpass"),
        send("230 Logged in"),
        expect("SYST"),
        send("215 UNIX Type: L8"),
        expect("FEAT"),
        Step::Send(feat),
    ];
    if feat_lines.iter().any(|l| l.trim().eq_ignore_ascii_case("UTF8")) {
        steps.push(expect("OPTS UTF8 ON"));
        steps.push(send("200 OK"));
    }
    steps
}

/// Server config pointing at a mock server
pub fn test_config(addr: SocketAddr) -> ServerConfig {
    ServerConfig::new(
        addr.ip().to_string(),
        addr.port(),
        Protocol::Ftp,
        "testuser",
        "testpass",
    )
}

/// Listing parser for the mock data format: one entry per line,
/// `F name [size [YYYYMMDDHHMM]]` or `D name`
pub struct TestListingParser {
    raw: Vec<u8>,
}

impl ListingParser for TestListingParser {
    fn feed(&mut self, data: &[u8]) {
        self.raw.extend_from_slice(data);
    }

    fn parse(&mut self, path: ServerPath) -> Result<DirectoryListing> {
        let mut listing = DirectoryListing::empty(path);
        let text = String::from_utf8_lossy(&self.raw);
        for line in text.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 2 {
                continue;
            }
            let mut entry = match fields[0] {
                "D" => ListingEntry::directory(fields[1]),
                _ => ListingEntry::file(fields[1]),
            };
            if let Some(size) = fields.get(2).and_then(|s| s.parse().ok()) {
                entry.size = Some(size);
            }
            if let Some(stamp) = fields.get(3) {
                if let Ok(naive) =
                    chrono::NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M")
                {
                    entry.time = Some(chrono::DateTime::from_naive_utc_and_offset(
                        naive,
                        chrono::Utc,
                    ));
                    entry.precision = TimestampPrecision::Time;
                }
            }
            listing.entries.push(entry);
        }
        Ok(listing)
    }

    fn reset(&mut self) {
        self.raw.clear();
    }
}

/// Context with a fresh set of shared services and the test listing parser
pub fn test_context() -> EngineContext {
    EngineContext {
        listing_parser_factory: Some(Arc::new(|| {
            Box::new(TestListingParser { raw: Vec::new() })
        })),
        ..EngineContext::default()
    }
}

/// Connect and log in against a script that starts with [`login_steps`]
#[allow(dead_code)]
pub async fn connect_and_login(server: &MockServer, ctx: EngineContext) -> FtpClient {
    let config = Arc::new(test_config(server.addr));
    let mut client = FtpClient::connect_with(config, ctx).await.unwrap();
    client.login().await.unwrap();
    client
}

/// Unix path helper
#[allow(dead_code)]
pub fn unix_path(raw: &str) -> ServerPath {
    ServerPath::parse_with_type(raw, ServerType::Unix).unwrap()
}

/// A directory entry for pre-seeding the directory cache
#[allow(dead_code)]
pub fn file_entry(name: &str, size: u64) -> ListingEntry {
    let mut entry = ListingEntry::file(name);
    entry.size = Some(size);
    entry.kind = EntryKind::File;
    entry
}

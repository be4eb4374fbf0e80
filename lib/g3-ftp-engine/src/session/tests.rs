/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::collections::VecDeque;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::cache::{FileLookup, NullPathCache};
use crate::caps::{CapabilityStatus, FtpCapability};
use crate::config::{ControlCharset, FtpEngineConfig, FtpProtocol};
use crate::error::{FtpTlsError, FtpTransferError};
use crate::facts::FtpDirEntry;
use crate::notify::{
    CertificateInfo, FileExistsRequest, ListingNotification, OverwriteDecision,
};
use crate::time::ServerDateTime;
use crate::tls::TlsHandshake;

use super::*;

fn test_local_path(name: &str) -> PathBuf {
    static SEQ: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
    let mut p = std::env::temp_dir();
    let id = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let seq = SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    p.push(format!("g3-ftp-engine-{name}-{id}-{seq}"));
    p
}

#[derive(Default)]
struct SinkState {
    listings: Vec<ListingNotification>,
    file_exists: usize,
    logins: usize,
    certs: usize,
}

struct TestSink {
    state: Arc<Mutex<SinkState>>,
    proxy: Arc<Mutex<Option<FtpEventProxy>>>,
    file_exists_reply: OverwriteDecision,
}

impl EventSink for TestSink {
    fn listing_changed(&self, notification: ListingNotification) {
        self.state.lock().unwrap().listings.push(notification);
    }

    fn request_file_exists(&self, _request: FileExistsRequest) {
        self.state.lock().unwrap().file_exists += 1;
        if let Some(proxy) = self.proxy.lock().unwrap().as_ref() {
            proxy.async_reply(AsyncRequestReply::FileExists(self.file_exists_reply));
        }
    }

    fn request_interactive_login(&self, _challenge: &str) {
        self.state.lock().unwrap().logins += 1;
    }

    fn request_certificate_trust(&self, _cert: &CertificateInfo) {
        self.state.lock().unwrap().certs += 1;
    }
}

#[derive(Default)]
struct CacheState {
    lookup: Option<(Option<FtpDirEntry>, bool, bool)>,
    invalidated: Vec<String>,
    removed: Vec<String>,
    removed_dirs: Vec<String>,
    updated: Vec<String>,
    renamed: Vec<(String, String)>,
    stored: Vec<(String, usize)>,
    server_invalidations: usize,
}

#[derive(Clone)]
struct TestCache(Arc<Mutex<CacheState>>);

impl DirectoryCache for TestCache {
    fn lookup_file(&self, _path: &RemotePath, _name: &str) -> FileLookup {
        match self.0.lock().unwrap().lookup.clone() {
            Some((entry, dir_was_cached, case_matched)) => FileLookup {
                entry,
                dir_was_cached,
                case_matched,
            },
            None => FileLookup::miss(false),
        }
    }

    fn store_listing(&mut self, path: &RemotePath, entries: Vec<FtpDirEntry>) {
        self.0
            .lock()
            .unwrap()
            .stored
            .push((path.to_string(), entries.len()));
    }

    fn invalidate_file(&mut self, _path: &RemotePath, name: &str) {
        self.0.lock().unwrap().invalidated.push(name.to_string());
    }

    fn remove_file(&mut self, _path: &RemotePath, name: &str) {
        self.0.lock().unwrap().removed.push(name.to_string());
    }

    fn remove_dir(&mut self, _path: &RemotePath, name: &str) {
        self.0.lock().unwrap().removed_dirs.push(name.to_string());
    }

    fn update_file(&mut self, _path: &RemotePath, name: &str) {
        self.0.lock().unwrap().updated.push(name.to_string());
    }

    fn rename(
        &mut self,
        _from_path: &RemotePath,
        from_name: &str,
        _to_path: &RemotePath,
        to_name: &str,
    ) {
        self.0
            .lock()
            .unwrap()
            .renamed
            .push((from_name.to_string(), to_name.to_string()));
    }

    fn invalidate_server(&mut self) {
        self.0.lock().unwrap().server_invalidations += 1;
    }
}

#[derive(Clone)]
enum MockBehavior {
    /// Deliver these bytes to the io worker, then report success.
    DownloadBytes(&'static [u8]),
    /// Drain the io worker into the shared upload buffer, then success.
    DrainUpload,
    /// Deliver a listing, then success.
    ListEntries(Vec<FtpDirEntry>),
    /// Report this end reason as soon as the data connection starts.
    EndWith(TransferEndReason),
    /// Never report; the test drives completion itself.
    Manual,
}

#[derive(Default)]
struct FactoryState {
    behaviors: Mutex<VecDeque<MockBehavior>>,
    created: Mutex<Vec<TransferMode>>,
    connected: Mutex<Vec<SocketAddr>>,
    uploads: Mutex<Vec<u8>>,
}

#[derive(Clone)]
struct MockFactory(Arc<FactoryState>);

struct MockSocket {
    mode: TransferMode,
    behavior: MockBehavior,
    events: FtpEventProxy,
    worker: Option<IoWorkerHandle>,
    listing: Option<Vec<FtpDirEntry>>,
    state: Arc<FactoryState>,
    end_reason: TransferEndReason,
}

impl TransferSocketFactory for MockFactory {
    fn create(
        &mut self,
        mode: TransferMode,
        _binary: bool,
        _protected: bool,
        events: FtpEventProxy,
    ) -> Box<dyn TransferSocket> {
        self.0.created.lock().unwrap().push(mode);
        let behavior = self
            .0
            .behaviors
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(MockBehavior::Manual);
        Box::new(MockSocket {
            mode,
            behavior,
            events,
            worker: None,
            listing: None,
            state: Arc::clone(&self.0),
            end_reason: TransferEndReason::None,
        })
    }
}

impl TransferSocket for MockSocket {
    fn mode(&self) -> TransferMode {
        self.mode
    }

    fn set_binary(&mut self, _binary: bool) {}

    fn set_io_worker(&mut self, worker: IoWorkerHandle) {
        self.worker = Some(worker);
    }

    fn begin_connect(&mut self, addr: SocketAddr) {
        self.state.connected.lock().unwrap().push(addr);
        let events = self.events.clone();
        match self.behavior.clone() {
            MockBehavior::DownloadBytes(bytes) => {
                let tx = self.worker.as_mut().and_then(|w| w.to_file.take());
                tokio::spawn(async move {
                    if let Some(tx) = tx {
                        let _ = tx.send(Bytes::from_static(bytes)).await;
                        drop(tx);
                    }
                    events.transfer_end(TransferEndReason::Successful);
                });
                self.end_reason = TransferEndReason::Successful;
            }
            MockBehavior::DrainUpload => {
                let rx = self.worker.as_mut().and_then(|w| w.from_file.take());
                let state = Arc::clone(&self.state);
                tokio::spawn(async move {
                    if let Some(mut rx) = rx {
                        while let Some(chunk) = rx.recv().await {
                            state.uploads.lock().unwrap().extend_from_slice(&chunk);
                        }
                    }
                    events.transfer_end(TransferEndReason::Successful);
                });
                self.end_reason = TransferEndReason::Successful;
            }
            MockBehavior::ListEntries(entries) => {
                self.listing = Some(entries);
                events.transfer_end(TransferEndReason::Successful);
                self.end_reason = TransferEndReason::Successful;
            }
            MockBehavior::EndWith(reason) => {
                events.transfer_end(reason);
                self.end_reason = reason;
            }
            MockBehavior::Manual => {}
        }
    }

    fn listen(&mut self) -> Result<SocketAddr, FtpTransferError> {
        Ok("0.0.0.0:21001".parse().unwrap())
    }

    fn end_reason(&self) -> TransferEndReason {
        self.end_reason
    }

    fn take_listing(&mut self) -> Option<Vec<FtpDirEntry>> {
        self.listing.take()
    }

    fn close(&mut self) {}
}

struct PassthroughTls;

#[async_trait::async_trait]
impl TlsShim<DuplexStream> for PassthroughTls {
    async fn start_handshake(
        &mut self,
        stream: DuplexStream,
    ) -> Result<TlsHandshake<DuplexStream>, FtpTlsError> {
        Ok(TlsHandshake::Established(stream))
    }
}

struct Harness {
    session: FtpSession<DuplexStream>,
    server: DuplexStream,
    sink: Arc<Mutex<SinkState>>,
    cache: TestCache,
    factory: Arc<FactoryState>,
}

struct HarnessConfig {
    server: FtpServerConfig,
    options: FtpEngineOptions,
    behaviors: Vec<MockBehavior>,
    lookup: Option<(Option<FtpDirEntry>, bool, bool)>,
    file_exists_reply: OverwriteDecision,
    with_tls: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        HarnessConfig {
            server: FtpServerConfig {
                host: "ftp.example.net".to_string(),
                port: 21,
                protocol: FtpProtocol::Ftp,
                username: "user".to_string(),
                password: Some("secret".to_string()),
                account: None,
                timezone_offset_minutes: 0,
                passive_mode: Default::default(),
                charset: ControlCharset::Auto,
            },
            options: FtpEngineOptions::default(),
            behaviors: Vec::new(),
            lookup: None,
            file_exists_reply: OverwriteDecision::Skip,
            with_tls: false,
        }
    }
}

fn build(config: HarnessConfig) -> Harness {
    let (client, server) = tokio::io::duplex(65536);

    let sink_state = Arc::new(Mutex::new(SinkState::default()));
    let sink_proxy = Arc::new(Mutex::new(None));
    let cache = TestCache(Arc::new(Mutex::new(CacheState {
        lookup: config.lookup,
        ..Default::default()
    })));
    let factory_state = Arc::new(FactoryState::default());
    factory_state
        .behaviors
        .lock()
        .unwrap()
        .extend(config.behaviors);

    let parts = FtpSessionParts {
        dir_cache: Box::new(cache.clone()),
        path_cache: Box::new(NullPathCache),
        events: Box::new(TestSink {
            state: Arc::clone(&sink_state),
            proxy: Arc::clone(&sink_proxy),
            file_exists_reply: config.file_exists_reply,
        }),
        socket_factory: Box::new(MockFactory(Arc::clone(&factory_state))),
        resolver: None,
        tls: config.with_tls.then(|| {
            let shim: Box<dyn TlsShim<DuplexStream>> = Box::new(PassthroughTls);
            shim
        }),
        proxied: false,
    };

    let session = FtpSession::new(
        client,
        config.server,
        config.options,
        FtpEngineConfig::default(),
        parts,
        Some("192.0.2.1:20000".parse().unwrap()),
        Some("203.0.113.5:21".parse().unwrap()),
    );
    *sink_proxy.lock().unwrap() = Some(session.event_proxy());

    Harness {
        session,
        server,
        sink: sink_state,
        cache,
        factory: factory_state,
    }
}

async fn script(server: &mut DuplexStream, replies: &[&str]) {
    for r in replies {
        server.write_all(r.as_bytes()).await.unwrap();
        server.write_all(b"\r\n").await.unwrap();
    }
}

async fn read_sent(server: &mut DuplexStream) -> String {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match tokio::time::timeout(Duration::from_millis(50), server.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
            _ => break,
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn commands(sent: &str) -> Vec<&str> {
    sent.split("\r\n").filter(|s| !s.is_empty()).collect()
}

#[tokio::test]
async fn download_with_size_and_mdtm() {
    let local = test_local_path("dl");
    let mut h = build(HarnessConfig {
        server: FtpServerConfig {
            timezone_offset_minutes: 60,
            ..HarnessConfig::default().server
        },
        options: FtpEngineOptions {
            preserve_timestamps: true,
            ..Default::default()
        },
        behaviors: vec![MockBehavior::DownloadBytes(b"0123456789")],
        // a cached entry under a different case forces the SIZE/MDTM probes
        lookup: Some((Some(FtpDirEntry::file("A.TXT")), true, false)),
        ..Default::default()
    });
    h.session
        .core
        .caps
        .set(FtpCapability::EpsvCommand, CapabilityStatus::No);

    script(
        &mut h.server,
        &[
            "250 CWD ok",
            "257 \"/pub\" is current directory",
            "213 42",
            "213 20200101120000",
            "200 Type set to I",
            "227 Entering Passive Mode (203,0,113,5,4,1)",
            "150 Opening data connection",
            "226 Transfer complete",
        ],
    )
    .await;

    let res = h.session.file_transfer(FileTransferRequest {
        download: true,
        local_path: local.clone(),
        remote_path: RemotePath::new("/pub"),
        remote_file: "a.txt".to_string(),
        resume: false,
        binary: true,
    });
    assert_eq!(res.outcome, OpOutcome::WouldBlock);

    let res = h.session.drive().await;
    assert!(res.is_ok(), "unexpected result {res}");

    let sent = read_sent(&mut h.server).await;
    assert_eq!(
        commands(&sent),
        [
            "CWD /pub",
            "PWD",
            "SIZE a.txt",
            "MDTM a.txt",
            "TYPE I",
            "PASV",
            "RETR a.txt"
        ]
    );

    // SIZE succeeded against an unprobed server
    assert_eq!(
        h.session.capabilities().status(FtpCapability::SizeCommand),
        CapabilityStatus::Yes
    );
    assert_eq!(
        h.factory.connected.lock().unwrap().as_slice(),
        ["203.0.113.5:1025".parse::<SocketAddr>().unwrap()]
    );

    let content = std::fs::read(&local).unwrap();
    assert_eq!(content, b"0123456789");

    // MDTM time adjusted by the +60 minute server offset
    let expected = ServerDateTime::parse_mdtm("20200101130000").unwrap();
    let mtime = std::fs::metadata(&local).unwrap().modified().unwrap();
    let expected_st = UNIX_EPOCH
        + Duration::from_millis(expected.datetime().timestamp_millis() as u64);
    assert_eq!(mtime, expected_st);

    std::fs::remove_file(&local).unwrap();
}

#[tokio::test]
async fn upload_resume_uses_rest_and_stor() {
    let local = test_local_path("ul");
    {
        let mut f = std::fs::File::create(&local).unwrap();
        f.write_all(&[7u8; 250]).unwrap();
    }

    let mut h = build(HarnessConfig {
        behaviors: vec![MockBehavior::DrainUpload],
        lookup: Some((Some(FtpDirEntry::file("B.BIN")), true, false)),
        ..Default::default()
    });
    h.session
        .core
        .caps
        .set(FtpCapability::RestStream, CapabilityStatus::Yes);
    h.session
        .core
        .caps
        .set(FtpCapability::EpsvCommand, CapabilityStatus::No);

    script(
        &mut h.server,
        &[
            "250 CWD ok",
            "257 \"/up\" is current directory",
            "213 100",
            "550 MDTM not here",
            "200 Type set to I",
            "227 Entering Passive Mode (203,0,113,5,4,2)",
            "350 Restarting at 100",
            "150 Opening data connection",
            "226 Transfer complete",
        ],
    )
    .await;

    h.session.file_transfer(FileTransferRequest {
        download: false,
        local_path: local.clone(),
        remote_path: RemotePath::new("/up"),
        remote_file: "b.bin".to_string(),
        resume: true,
        binary: true,
    });
    let res = h.session.drive().await;
    assert!(res.is_ok(), "unexpected result {res}");

    let sent = read_sent(&mut h.server).await;
    let cmds = commands(&sent);
    assert!(cmds.contains(&"REST 100"));
    assert!(cmds.contains(&"STOR b.bin"));
    assert!(!sent.contains("APPE"));

    // bytes 100..250 made it to the wire
    let uploaded = h.factory.uploads.lock().unwrap().clone();
    assert_eq!(uploaded.len(), 150);
    assert!(uploaded.iter().all(|b| *b == 7));

    std::fs::remove_file(&local).unwrap();
}

#[tokio::test]
async fn upload_resume_without_rest_stream_uses_appe() {
    let local = test_local_path("appe");
    {
        let mut f = std::fs::File::create(&local).unwrap();
        f.write_all(&[3u8; 200]).unwrap();
    }

    let mut h = build(HarnessConfig {
        behaviors: vec![MockBehavior::DrainUpload],
        lookup: Some((
            Some(FtpDirEntry {
                size: Some(50),
                ..FtpDirEntry::file("c.bin")
            }),
            true,
            true,
        )),
        ..Default::default()
    });
    h.session
        .core
        .caps
        .set(FtpCapability::EpsvCommand, CapabilityStatus::No);

    script(
        &mut h.server,
        &[
            "250 CWD ok",
            "257 \"/up\" is current directory",
            "200 Type set to I",
            "227 Entering Passive Mode (203,0,113,5,4,3)",
            "150 Opening data connection",
            "226 Transfer complete",
        ],
    )
    .await;

    h.session.file_transfer(FileTransferRequest {
        download: false,
        local_path: local.clone(),
        remote_path: RemotePath::new("/up"),
        remote_file: "c.bin".to_string(),
        resume: true,
        binary: true,
    });
    let res = h.session.drive().await;
    assert!(res.is_ok(), "unexpected result {res}");

    let sent = read_sent(&mut h.server).await;
    let cmds = commands(&sent);
    assert!(cmds.contains(&"APPE c.bin"));
    assert!(!sent.contains("REST"));
    // APPE sends from the remote-size offset of the local file
    assert_eq!(h.factory.uploads.lock().unwrap().len(), 150);

    std::fs::remove_file(&local).unwrap();
}

#[tokio::test]
async fn binary_upload_with_equal_sizes_skips_transfer() {
    let local = test_local_path("eq");
    {
        let mut f = std::fs::File::create(&local).unwrap();
        f.write_all(&[1u8; 100]).unwrap();
    }

    let mut h = build(HarnessConfig {
        lookup: Some((
            Some(FtpDirEntry {
                size: Some(100),
                ..FtpDirEntry::file("d.bin")
            }),
            true,
            true,
        )),
        ..Default::default()
    });
    h.session
        .core
        .caps
        .set(FtpCapability::RestStream, CapabilityStatus::Yes);

    script(
        &mut h.server,
        &["250 CWD ok", "257 \"/up\" is current directory"],
    )
    .await;

    h.session.file_transfer(FileTransferRequest {
        download: false,
        local_path: local.clone(),
        remote_path: RemotePath::new("/up"),
        remote_file: "d.bin".to_string(),
        resume: true,
        binary: true,
    });
    let res = h.session.drive().await;
    assert!(res.is_ok(), "unexpected result {res}");

    let sent = read_sent(&mut h.server).await;
    assert!(!sent.contains("STOR"));
    assert!(!sent.contains("APPE"));
    assert!(h.factory.created.lock().unwrap().is_empty());

    std::fs::remove_file(&local).unwrap();
}

#[tokio::test]
async fn ftpes_logon_negotiates_features() {
    let mut h = build(HarnessConfig {
        server: FtpServerConfig {
            protocol: FtpProtocol::Ftpes,
            ..HarnessConfig::default().server
        },
        with_tls: true,
        ..Default::default()
    });

    // the logon interleaves with the TLS handshake, so a canned reply
    // buffer does not do; answer each command as it arrives
    let server = h.server;
    let responder = tokio::spawn(async move {
        let mut server = server;
        server.write_all(b"220 ready\r\n").await.unwrap();
        let mut reader = tokio::io::BufReader::new(server);
        let script: &[(&str, &str)] = &[
            ("AUTH TLS", "234 AUTH TLS successful\r\n"),
            ("USER user", "331 need password\r\n"),
            ("PASS secret", "230 logged in\r\n"),
            (
                "FEAT",
                "211-Features:\r\n CLNT\r\n UTF8\r\n MLST Type*;Size*;Modify*;\r\n MLSD\r\n SIZE\r\n MDTM\r\n MFMT\r\n REST STREAM\r\n211 End\r\n",
            ),
            ("CLNT g3-ftp-engine", "200 noted\r\n"),
            ("OPTS UTF8 ON", "200 utf8 on\r\n"),
            ("PBSZ 0", "200 PBSZ 0\r\n"),
            ("PROT P", "200 PROT P ok\r\n"),
        ];
        for (expect, reply) in script {
            let mut line = String::new();
            tokio::io::AsyncBufReadExt::read_line(&mut reader, &mut line)
                .await
                .unwrap();
            assert_eq!(line.trim_end(), *expect);
            reader
                .get_mut()
                .write_all(reply.as_bytes())
                .await
                .unwrap();
        }
    });

    let res = h.session.connect();
    assert_eq!(res.outcome, OpOutcome::WouldBlock);
    let res = h.session.drive().await;
    assert!(res.is_ok(), "unexpected result {res}");
    responder.await.unwrap();

    let caps = h.session.capabilities();
    assert_eq!(
        caps.status(FtpCapability::MlsdCommand),
        CapabilityStatus::Yes
    );
    // MLST facts take precedence over the bare MLSD line
    assert_eq!(
        caps.payload(FtpCapability::MlsdCommand),
        Some("Type*;Size*;Modify*;")
    );
    assert_eq!(
        caps.status(FtpCapability::TimezoneOffset),
        CapabilityStatus::No
    );
    assert_eq!(caps.status(FtpCapability::MfmtCommand), CapabilityStatus::Yes);
    assert_eq!(caps.status(FtpCapability::RestStream), CapabilityStatus::Yes);
}

#[tokio::test]
async fn welcome_from_ssh_server_closes_critically() {
    let mut h = build(HarnessConfig::default());

    script(&mut h.server, &["SSH-2.0-OpenSSH_9.3"]).await;

    h.session.connect();
    let res = h.session.drive().await;
    assert!(res.is_err());
    assert!(res.has(OpFlags::CRITICAL));
    assert!(res.disconnected());
    assert!(h.session.is_closed());
}

#[tokio::test]
async fn size_not_found_skips_mdtm_and_prompts() {
    let local = test_local_path("nf");
    std::fs::write(&local, b"already here").unwrap();

    let mut h = build(HarnessConfig {
        lookup: Some((Some(FtpDirEntry::file("E.TXT")), true, false)),
        file_exists_reply: OverwriteDecision::Skip,
        ..Default::default()
    });
    h.session
        .core
        .caps
        .set(FtpCapability::SizeCommand, CapabilityStatus::Yes);

    script(
        &mut h.server,
        &[
            "250 CWD ok",
            "257 \"/pub\" is current directory",
            "550 File not found",
        ],
    )
    .await;

    h.session.file_transfer(FileTransferRequest {
        download: true,
        local_path: local.clone(),
        remote_path: RemotePath::new("/pub"),
        remote_file: "e.txt".to_string(),
        resume: false,
        binary: true,
    });
    let res = h.session.drive().await;
    assert!(res.is_ok(), "unexpected result {res}");

    let sent = read_sent(&mut h.server).await;
    assert!(!sent.contains("MDTM"));
    assert_eq!(h.sink.lock().unwrap().file_exists, 1);
    // skip keeps the local file untouched
    assert_eq!(std::fs::read(&local).unwrap(), b"already here");

    std::fs::remove_file(&local).unwrap();
}

#[tokio::test(start_paused = true)]
async fn keepalive_sends_probe_and_absorbs_reply() {
    // pick the seed that draws index 2 (PWD)
    let mut seed = 0u64;
    loop {
        fastrand::seed(seed);
        if fastrand::u32(0..3) == 2 {
            break;
        }
        seed += 1;
    }

    let mut h = build(HarnessConfig::default());

    script(&mut h.server, &["200 noop ok"]).await;
    h.session.raw_command("NOOP".to_string());
    let res = h.session.drive().await;
    assert!(res.is_ok());

    fastrand::seed(seed);
    // the keepalive deadline fires and queues the probe
    h.session.idle_tick().await;
    assert_eq!(h.session.core.replies_to_skip, 1);

    script(&mut h.server, &["257 \"/home/x\""]).await;
    h.session.idle_tick().await;

    assert_eq!(h.session.core.replies_to_skip, 0);
    assert_eq!(h.session.core.pending_replies, 0);
    assert!(h.sink.lock().unwrap().listings.is_empty());

    let sent = read_sent(&mut h.server).await;
    assert_eq!(commands(&sent), ["NOOP", "PWD"]);
}

#[tokio::test]
async fn cancellation_drains_pending_replies() {
    let local = test_local_path("cancel");

    let mut h = build(HarnessConfig {
        behaviors: vec![MockBehavior::Manual],
        lookup: Some((None, true, false)),
        ..Default::default()
    });
    h.session
        .core
        .caps
        .set(FtpCapability::EpsvCommand, CapabilityStatus::No);

    script(
        &mut h.server,
        &[
            "250 CWD ok",
            "257 \"/pub\" is current directory",
            "200 Type set to I",
            "227 Entering Passive Mode (203,0,113,5,4,4)",
            "150 Opening data connection",
        ],
    )
    .await;

    h.session.file_transfer(FileTransferRequest {
        download: true,
        local_path: local.clone(),
        remote_path: RemotePath::new("/pub"),
        remote_file: "f.txt".to_string(),
        resume: false,
        binary: true,
    });
    // the 226 never comes; the drive stalls mid-transfer
    let waited =
        tokio::time::timeout(Duration::from_millis(100), h.session.drive()).await;
    assert!(waited.is_err());

    h.session.cancel();
    assert_eq!(h.session.core.replies_to_skip, 1);
    assert!(h.session.core.transfer_socket.is_none());
    // the download created a new file nothing was written to
    assert!(!local.exists());

    // the late reply is silently absorbed
    script(&mut h.server, &["226 Transfer complete"]).await;
    h.session.idle_tick().await;
    assert_eq!(h.session.core.replies_to_skip, 0);
    assert_eq!(h.session.core.pending_replies, 0);

    let _ = std::fs::remove_file(&local);
}

#[tokio::test]
async fn resume_bug_with_matching_sizes_cancels_as_success() {
    let local = test_local_path("bug2g");
    let size: u64 = (1 << 31) + 10;
    {
        let f = std::fs::File::create(&local).unwrap();
        f.set_len(size).unwrap();
    }

    let mut h = build(HarnessConfig {
        lookup: Some((
            Some(FtpDirEntry {
                size: Some(size),
                ..FtpDirEntry::file("big.bin")
            }),
            true,
            true,
        )),
        ..Default::default()
    });
    h.session
        .core
        .caps
        .set(FtpCapability::Resume2GbBug, CapabilityStatus::Yes);

    script(
        &mut h.server,
        &["250 CWD ok", "257 \"/pub\" is current directory"],
    )
    .await;

    h.session.file_transfer(FileTransferRequest {
        download: true,
        local_path: local.clone(),
        remote_path: RemotePath::new("/pub"),
        remote_file: "big.bin".to_string(),
        resume: true,
        binary: true,
    });
    let res = h.session.drive().await;
    assert_eq!(res.outcome, OpOutcome::Canceled);
    assert!(res.is_success());

    let sent = read_sent(&mut h.server).await;
    assert!(!sent.contains("RETR"));

    std::fs::remove_file(&local).unwrap();
}

#[tokio::test]
async fn failed_resume_probe_records_bug_capability() {
    let local = test_local_path("probe");
    let size: u64 = (1 << 31) + 10;
    {
        let f = std::fs::File::create(&local).unwrap();
        f.set_len(size).unwrap();
    }

    let mut h = build(HarnessConfig {
        behaviors: vec![MockBehavior::EndWith(TransferEndReason::FailedResumeTest)],
        lookup: Some((
            Some(FtpDirEntry {
                size: Some(size + 500),
                ..FtpDirEntry::file("big.bin")
            }),
            true,
            true,
        )),
        ..Default::default()
    });
    h.session
        .core
        .caps
        .set(FtpCapability::EpsvCommand, CapabilityStatus::No);

    script(
        &mut h.server,
        &[
            "250 CWD ok",
            "257 \"/pub\" is current directory",
            "200 Type set to I",
            "227 Entering Passive Mode (203,0,113,5,4,5)",
            "350 Restarting",
            "150 Opening data connection",
            "226 Transfer complete",
        ],
    )
    .await;

    h.session.file_transfer(FileTransferRequest {
        download: true,
        local_path: local.clone(),
        remote_path: RemotePath::new("/pub"),
        remote_file: "big.bin".to_string(),
        resume: true,
        binary: true,
    });
    let res = h.session.drive().await;
    assert!(res.is_err());
    assert!(res.has(OpFlags::CRITICAL));

    // the probe read one byte short of the remote end
    let sent = read_sent(&mut h.server).await;
    assert!(commands(&sent).contains(&format!("REST {}", size + 499).as_str()));
    assert_eq!(
        h.session.capabilities().status(FtpCapability::Resume2GbBug),
        CapabilityStatus::Yes
    );
    assert_eq!(
        h.factory.created.lock().unwrap().as_slice(),
        [TransferMode::ResumeTest]
    );

    std::fs::remove_file(&local).unwrap();
}

#[tokio::test]
async fn active_fallback_after_pasv_failure() {
    let local = test_local_path("active");

    let mut h = build(HarnessConfig {
        behaviors: vec![MockBehavior::Manual],
        lookup: Some((None, true, false)),
        ..Default::default()
    });
    h.session
        .core
        .caps
        .set(FtpCapability::EpsvCommand, CapabilityStatus::No);

    script(
        &mut h.server,
        &[
            "250 CWD ok",
            "257 \"/pub\" is current directory",
            "200 Type set to I",
            "500 no passive for you",
            "200 PORT ok",
            "550 refused",
        ],
    )
    .await;

    h.session.file_transfer(FileTransferRequest {
        download: true,
        local_path: local.clone(),
        remote_path: RemotePath::new("/pub"),
        remote_file: "g.txt".to_string(),
        resume: false,
        binary: true,
    });
    let res = h.session.drive().await;
    // immediate 5xx on RETR without transfer start escalates to critical
    assert!(res.is_err());
    assert!(res.has(OpFlags::CRITICAL));

    let sent = read_sent(&mut h.server).await;
    let cmds = commands(&sent);
    assert!(cmds.contains(&"PASV"));
    // advertised address is the control socket's local one
    assert!(cmds.contains(&"PORT 192,0,2,1,82,9"));

    let _ = std::fs::remove_file(&local);
}

#[tokio::test]
async fn preallocation_grows_file_and_restores_position() {
    let local = test_local_path("prealloc");

    let mut h = build(HarnessConfig {
        options: FtpEngineOptions {
            preallocate_space: true,
            ..Default::default()
        },
        behaviors: vec![MockBehavior::DownloadBytes(b"payload")],
        lookup: Some((
            Some(FtpDirEntry {
                size: Some(1000),
                ..FtpDirEntry::file("p.bin")
            }),
            true,
            true,
        )),
        ..Default::default()
    });
    h.session
        .core
        .caps
        .set(FtpCapability::EpsvCommand, CapabilityStatus::No);

    script(
        &mut h.server,
        &[
            "250 CWD ok",
            "257 \"/pub\" is current directory",
            "200 Type set to I",
            "227 Entering Passive Mode (203,0,113,5,4,8)",
            "150 Opening data connection",
            "226 Transfer complete",
        ],
    )
    .await;

    h.session.file_transfer(FileTransferRequest {
        download: true,
        local_path: local.clone(),
        remote_path: RemotePath::new("/pub"),
        remote_file: "p.bin".to_string(),
        resume: false,
        binary: true,
    });
    let res = h.session.drive().await;
    assert!(res.is_ok(), "unexpected result {res}");

    // grown to the remote size, data written at the restored offset zero
    let content = std::fs::read(&local).unwrap();
    assert_eq!(content.len(), 1000);
    assert_eq!(&content[..7], b"payload");
    assert!(content[7..].iter().all(|b| *b == 0));

    std::fs::remove_file(&local).unwrap();
}

#[tokio::test]
async fn list_stores_entries_and_notifies() {
    let mut h = build(HarnessConfig {
        behaviors: vec![MockBehavior::ListEntries(vec![
            FtpDirEntry::file("a"),
            FtpDirEntry::dir("sub"),
        ])],
        ..Default::default()
    });
    h.session
        .core
        .caps
        .set(FtpCapability::EpsvCommand, CapabilityStatus::No);

    script(
        &mut h.server,
        &[
            "250 CWD ok",
            "257 \"/pub\" is current directory",
            "200 Type set to A",
            "227 Entering Passive Mode (203,0,113,5,4,6)",
            "150 here it comes",
            "226 done",
        ],
    )
    .await;

    let res = h.session.list(Some(RemotePath::new("/pub")), true);
    assert_eq!(res.outcome, OpOutcome::WouldBlock);
    let res = h.session.drive().await;
    assert!(res.is_ok(), "unexpected result {res}");

    let sent = read_sent(&mut h.server).await;
    let cmds = commands(&sent);
    assert!(cmds.contains(&"TYPE A"));
    assert!(cmds.contains(&"LIST"));

    let cache = h.cache.0.lock().unwrap();
    assert_eq!(cache.stored.as_slice(), [("/pub".to_string(), 2)]);
    let sink = h.sink.lock().unwrap();
    assert_eq!(sink.listings.len(), 1);
    assert!(!sink.listings[0].failed);
    assert!(sink.listings[0].modified);
}

#[tokio::test]
async fn mlsd_preferred_when_supported() {
    let mut h = build(HarnessConfig {
        behaviors: vec![MockBehavior::ListEntries(vec![FtpDirEntry::file("x")])],
        ..Default::default()
    });
    h.session
        .core
        .caps
        .set(FtpCapability::MlsdCommand, CapabilityStatus::Yes);
    h.session
        .core
        .caps
        .set(FtpCapability::EpsvCommand, CapabilityStatus::No);

    script(
        &mut h.server,
        &[
            "250 CWD ok",
            "257 \"/pub\" is current directory",
            "200 Type set to A",
            "227 Entering Passive Mode (203,0,113,5,4,7)",
            "150 here it comes",
            "226 done",
        ],
    )
    .await;

    h.session.list(Some(RemotePath::new("/pub")), false);
    let res = h.session.drive().await;
    assert!(res.is_ok());

    let sent = read_sent(&mut h.server).await;
    assert!(commands(&sent).contains(&"MLSD"));
}

#[tokio::test]
async fn delete_batch_coalesces_notifications() {
    let mut h = build(HarnessConfig::default());

    script(
        &mut h.server,
        &[
            "250 CWD ok",
            "257 \"/pub\" is current directory",
            "250 deleted",
            "250 deleted",
            "250 deleted",
        ],
    )
    .await;

    h.session.delete_files(
        RemotePath::new("/pub"),
        vec!["a".to_string(), "b".to_string(), "c".to_string()],
    );
    let res = h.session.drive().await;
    assert!(res.is_ok(), "unexpected result {res}");

    let cache = h.cache.0.lock().unwrap();
    assert_eq!(cache.invalidated.as_slice(), ["a", "b", "c"]);
    assert_eq!(cache.removed.as_slice(), ["a", "b", "c"]);

    // one immediate notification, the rest coalesced into the final flush
    let sink = h.sink.lock().unwrap();
    assert_eq!(sink.listings.len(), 2);
}

#[tokio::test]
async fn rename_invalidates_and_notifies_both_parents() {
    let mut h = build(HarnessConfig::default());

    script(
        &mut h.server,
        &[
            "250 CWD ok",
            "257 \"/a\" is current directory",
            "350 ready for RNTO",
            "250 renamed",
        ],
    )
    .await;

    h.session.rename(
        RemotePath::new("/a"),
        "old.txt".to_string(),
        RemotePath::new("/b"),
        "new.txt".to_string(),
    );
    let res = h.session.drive().await;
    assert!(res.is_ok(), "unexpected result {res}");

    let sent = read_sent(&mut h.server).await;
    let cmds = commands(&sent);
    assert!(cmds.contains(&"RNFR old.txt"));
    assert!(cmds.contains(&"RNTO /b/new.txt"));

    let cache = h.cache.0.lock().unwrap();
    assert_eq!(
        cache.renamed.as_slice(),
        [("old.txt".to_string(), "new.txt".to_string())]
    );
    assert_eq!(h.sink.lock().unwrap().listings.len(), 2);
}

#[tokio::test]
async fn raw_command_invalidates_server_caches() {
    let mut h = build(HarnessConfig::default());

    script(&mut h.server, &["200 whatever"]).await;

    h.session.raw_command("SITE IDLE 60".to_string());
    let res = h.session.drive().await;
    assert!(res.is_ok());

    assert_eq!(h.cache.0.lock().unwrap().server_invalidations, 1);
    assert!(h.session.current_path().is_none());
}

/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::cache::{DirectoryCache, PathCache};
use crate::caps::ServerCapabilities;
use crate::config::{ControlCharset, FtpEngineConfig, FtpEngineOptions, FtpServerConfig};
use crate::control::{encode_command, mask_command_args, LineFramer, ResponseAssembler};
use crate::control::FtpReply;
use crate::notify::{
    AsyncRequestReply, EventSink, FtpEventProxy, FtpSessionEvent, ListingNotification,
};
use crate::ops::{
    logon, rawtransfer, transfer, ChmodOpData, DeleteOpData, FtpOpKind, FtpOperation, ListOpData,
    LogonOpData, MkdirOpData, RawCommandOpData, RemoveDirOpData, RenameOpData,
};
use crate::path::RemotePath;
use crate::resolver::{self, ExternalIpResolver};
use crate::result::{OpFlags, OpOutcome, OpResult};
use crate::time::MonotonicDateTime;
use crate::tls::{PendingTlsHandshake, TlsHandshake, TlsShim};
use crate::transfer::{
    IoWorkerHandle, IoWorkerPool, TransferEndReason, TransferMode, TransferSocket,
    TransferSocketFactory,
};

pub use crate::ops::transfer::FileTransferRequest;

#[cfg(test)]
mod tests;

/// Log target of the engine's control-channel tracing, so embedders can
/// route protocol chatter separately from their own output. User-visible
/// status and error messages stay on the default target.
pub const FTP_ENGINE_LOG_TARGET: &str = "ftp_engine";

/// Raw wire logging, with command arguments verbatim: unlike the regular
/// trace, a `PASS` line is not masked here.
#[cfg(feature = "log-raw-io")]
#[inline]
fn log_raw_command(cmd: &str) {
    log::debug!(target: FTP_ENGINE_LOG_TARGET, ">> {cmd}");
}

#[cfg(feature = "log-raw-io")]
#[inline]
fn log_raw_response(rsp: &str) {
    log::debug!(target: FTP_ENGINE_LOG_TARGET, "<< {rsp}");
}

/// Round-trip sampling for the control channel, one measurement per
/// tracked command.
#[derive(Default)]
pub struct RttTracker {
    sent: Option<Instant>,
    last: Option<Duration>,
}

impl RttTracker {
    fn start(&mut self) {
        if self.sent.is_none() {
            self.sent = Some(Instant::now());
        }
    }

    fn stop(&mut self) {
        if let Some(t) = self.sent.take() {
            self.last = Some(t.elapsed());
        }
    }

    pub fn last(&self) -> Option<Duration> {
        self.last
    }
}

/// External collaborators wired into a session at creation.
pub struct FtpSessionParts<S> {
    pub dir_cache: Box<dyn DirectoryCache>,
    pub path_cache: Box<dyn PathCache>,
    pub events: Box<dyn EventSink>,
    pub socket_factory: Box<dyn TransferSocketFactory>,
    pub resolver: Option<Arc<dyn ExternalIpResolver>>,
    pub tls: Option<Box<dyn TlsShim<S>>>,
    /// Proxied control connections only support passive transfers.
    pub proxied: bool,
}

/// Everything of the session except the operation stack, so operation hooks
/// can borrow it while they are themselves part of the stack.
pub(crate) struct SessionCore<S> {
    pub(crate) stream: Option<S>,
    framer: LineFramer,
    assembler: ResponseAssembler,
    charset: ControlCharset,
    send_queue: VecDeque<Vec<u8>>,
    pub(crate) pending_replies: u32,
    pub(crate) replies_to_skip: u32,
    reply: Option<FtpReply>,
    pub(crate) current_path: Option<RemotePath>,
    pub(crate) last_type_binary: Option<bool>,
    last_command_completed: Option<Instant>,
    keepalive_deadline: Option<Instant>,
    inactivity_deadline: Instant,
    pub(crate) server: FtpServerConfig,
    pub(crate) options: FtpEngineOptions,
    pub(crate) config: FtpEngineConfig,
    pub(crate) caps: ServerCapabilities,
    pub(crate) dir_cache: Box<dyn DirectoryCache>,
    pub(crate) path_cache: Box<dyn PathCache>,
    pub(crate) events: Box<dyn EventSink>,
    socket_factory: Box<dyn TransferSocketFactory>,
    pub(crate) io_pool: IoWorkerPool,
    resolver: Option<Arc<dyn ExternalIpResolver>>,
    tls: Option<Box<dyn TlsShim<S>>>,
    pub(crate) transfer_socket: Option<Box<dyn TransferSocket>>,
    event_tx: mpsc::UnboundedSender<FtpSessionEvent>,
    event_rx: mpsc::UnboundedReceiver<FtpSessionEvent>,
    pending_push: Vec<FtpOperation>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    pub(crate) data_protected: bool,
    pub(crate) tls_handshake_requested: bool,
    pending_cert: Option<Box<dyn PendingTlsHandshake<S>>>,
    cert_trusted: bool,
    pub(crate) resolving_ip: bool,
    pub(crate) resolved_external_ip: Option<IpAddr>,
    pub(crate) proxied: bool,
    rtt: RttTracker,
    closed: bool,
}

impl<S> SessionCore<S> {
    /// Queue one command for the wire, CRLF-terminated, counting the reply
    /// it will elicit.
    pub(crate) fn send_command(&mut self, cmd: &str) {
        self.send_command_opts(cmd, false, true);
    }

    pub(crate) fn send_command_opts(&mut self, cmd: &str, mask_args: bool, measure_rtt: bool) {
        let shown = if mask_args {
            mask_command_args(cmd)
        } else {
            cmd.to_string()
        };
        log::debug!(target: FTP_ENGINE_LOG_TARGET, "> {shown}");
        #[cfg(feature = "log-raw-io")]
        log_raw_command(cmd);

        self.send_queue.push_back(encode_command(self.charset, cmd));
        self.pending_replies += 1;
        if measure_rtt {
            self.rtt.start();
        }
    }

    pub(crate) fn reply(&self) -> Option<&FtpReply> {
        self.reply.as_ref()
    }

    pub(crate) fn reply_code(&self) -> u16 {
        self.reply.as_ref().map(|r| r.code).unwrap_or(0)
    }

    pub(crate) fn reply_class(&self) -> u16 {
        self.reply.as_ref().map(|r| r.class()).unwrap_or(0)
    }

    pub(crate) fn reply_is_positive(&self) -> bool {
        self.reply.as_ref().map(|r| r.is_positive()).unwrap_or(false)
    }

    /// Queue an operation push; the dispatcher adopts it onto the stack
    /// after the current hook returns. Pushes stack in call order, so a
    /// parent queued before its child ends up below it.
    pub(crate) fn push_sub(&mut self, op: FtpOperation) {
        self.pending_push.push(op);
    }

    pub(crate) fn set_utf8(&mut self) {
        self.charset = ControlCharset::Utf8;
        self.framer.set_utf8();
    }

    pub(crate) fn local_ip(&self) -> Option<IpAddr> {
        self.local_addr.map(|a| a.ip())
    }

    pub(crate) fn peer_ip(&self) -> Option<IpAddr> {
        self.peer_addr.map(|a| a.ip())
    }

    pub(crate) fn event_proxy(&self) -> FtpEventProxy {
        FtpEventProxy::new(self.event_tx.clone())
    }

    pub(crate) fn create_transfer_socket(&mut self, mode: TransferMode, binary: bool) {
        let proxy = self.event_proxy();
        let socket = self
            .socket_factory
            .create(mode, binary, self.data_protected, proxy);
        self.transfer_socket = Some(socket);
    }

    pub(crate) fn drop_transfer_socket(&mut self) {
        if let Some(mut ts) = self.transfer_socket.take() {
            ts.close();
        }
    }

    pub(crate) fn set_transfer_io_worker(&mut self, handle: IoWorkerHandle) {
        if let Some(ts) = self.transfer_socket.as_mut() {
            ts.set_io_worker(handle);
        }
    }

    pub(crate) fn begin_data_connect(&mut self, addr: SocketAddr) {
        if let Some(ts) = self.transfer_socket.as_mut() {
            ts.begin_connect(addr);
        }
    }

    /// Kick off the one-shot external-IP resolution. Returns false when no
    /// resolver is wired up and the caller should fall back to local.
    pub(crate) fn start_ip_resolution(&mut self) -> bool {
        if self.resolving_ip {
            return true;
        }
        let Some(resolver) = self.resolver.clone() else {
            return false;
        };
        let url = self.options.external_ip_resolver.clone();
        log::debug!("retrieving external IP address from {url}");
        self.resolving_ip = true;
        resolver::start_resolve(resolver, url, self.event_proxy());
        true
    }

    pub(crate) fn notify_listing_changed(&mut self, path: &RemotePath) {
        self.events.listing_changed(ListingNotification {
            path: path.clone(),
            modified: true,
            failed: false,
        });
    }

    pub(crate) fn notify_listing_result(&mut self, path: &RemotePath, modified: bool, failed: bool) {
        self.events.listing_changed(ListingNotification {
            path: path.clone(),
            modified,
            failed,
        });
    }

    fn refresh_inactivity(&mut self) {
        self.inactivity_deadline = Instant::now() + self.config.inactivity_timeout;
    }

    fn start_keepalive_timer(&mut self) {
        if !self.options.ftp_send_keepalive {
            return;
        }
        if self.replies_to_skip > 0 || self.pending_replies > 0 {
            return;
        }
        let Some(last) = self.last_command_completed else {
            return;
        };
        if last.elapsed() >= self.config.keepalive.idle_limit {
            return;
        }
        self.keepalive_deadline = Some(Instant::now() + self.config.keepalive.period);
    }
}

/// The FTP/FTPS control-connection engine: one session per server
/// connection, driving a stack of operations over a line-oriented control
/// channel and one data channel per transfer.
pub struct FtpSession<S> {
    core: SessionCore<S>,
    ops: Vec<FtpOperation>,
    finished: Option<OpResult>,
}

enum Wake {
    Read(std::io::Result<usize>),
    Event(Option<FtpSessionEvent>),
    Keepalive,
    Inactivity,
}

impl<S> FtpSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Create a session over an established control connection. The
    /// connection provider is expected to have applied TCP_NODELAY and, per
    /// `tcp_keepalive_interval`, SO_KEEPALIVE already.
    pub fn new(
        stream: S,
        server: FtpServerConfig,
        options: FtpEngineOptions,
        config: FtpEngineConfig,
        parts: FtpSessionParts<S>,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        // Auto starts on the 8-bit fallback and is promoted once OPTS UTF8
        // goes through; a forced charset is used as-is.
        let charset = server.charset;
        let inactivity_deadline = Instant::now() + config.inactivity_timeout;
        FtpSession {
            core: SessionCore {
                stream: Some(stream),
                framer: LineFramer::new(config.control.max_line_len, charset),
                assembler: ResponseAssembler::new(config.control.max_multi_lines),
                charset,
                send_queue: VecDeque::new(),
                pending_replies: 0,
                replies_to_skip: 0,
                reply: None,
                current_path: None,
                last_type_binary: None,
                last_command_completed: None,
                keepalive_deadline: None,
                inactivity_deadline,
                server,
                options,
                config,
                caps: ServerCapabilities::default(),
                dir_cache: parts.dir_cache,
                path_cache: parts.path_cache,
                events: parts.events,
                socket_factory: parts.socket_factory,
                io_pool: IoWorkerPool::default(),
                resolver: parts.resolver,
                tls: parts.tls,
                transfer_socket: None,
                event_tx,
                event_rx,
                pending_push: Vec::new(),
                local_addr,
                peer_addr,
                data_protected: false,
                tls_handshake_requested: false,
                pending_cert: None,
                cert_trusted: false,
                resolving_ip: false,
                resolved_external_ip: None,
                proxied: parts.proxied,
                rtt: RttTracker::default(),
                closed: false,
            },
            ops: Vec::new(),
            finished: None,
        }
    }

    /// Handle for collaborators and UI threads to post replies and
    /// completion events into the session.
    pub fn event_proxy(&self) -> FtpEventProxy {
        self.core.event_proxy()
    }

    pub fn current_path(&self) -> Option<&RemotePath> {
        self.core.current_path.as_ref()
    }

    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.core.caps
    }

    pub fn options(&self) -> &FtpEngineOptions {
        &self.core.options
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.core.rtt.last()
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed
    }

    /// A strictly increasing stamp for cache-entry ordering.
    pub fn now_stamp(&self) -> MonotonicDateTime {
        MonotonicDateTime::now()
    }

    fn start_check(&mut self) -> Option<OpResult> {
        if self.core.closed {
            return Some(OpResult::error(OpFlags::DISCONNECTED));
        }
        if !self.ops.is_empty() {
            log::debug!("operation started while another one is active");
            return Some(OpResult::error(OpFlags::INTERNAL_ERROR));
        }
        self.finished = None;
        None
    }

    /// Start the connect/logon operation; the greeting is expected next.
    pub fn connect(&mut self) -> OpResult {
        if let Some(r) = self.start_check() {
            return r;
        }
        LogonOpData::push(&mut self.core);
        self.adopt_pushed();
        self.send_next_command()
    }

    pub fn list(&mut self, path: Option<RemotePath>, refresh: bool) -> OpResult {
        if let Some(r) = self.start_check() {
            return r;
        }
        match &path {
            Some(p) => log::info!("retrieving directory listing of \"{p}\""),
            None => log::info!("retrieving directory listing"),
        }
        ListOpData::push(&mut self.core, path, refresh);
        self.adopt_pushed();
        self.send_next_command()
    }

    pub fn file_transfer(&mut self, req: FileTransferRequest) -> OpResult {
        if let Some(r) = self.start_check() {
            return r;
        }
        if req.local_path.as_os_str().is_empty() {
            return if req.download {
                OpResult::error(OpFlags::SYNTAX_ERROR)
            } else {
                OpResult::error(OpFlags::CRITICAL | OpFlags::NOT_SUPPORTED)
            };
        }
        if req.download {
            log::info!(
                "starting download of {}",
                req.remote_path.format_filename(&req.remote_file, false)
            );
        } else {
            log::info!("starting upload of {}", req.local_path.display());
        }
        transfer::FileTransferOpData::push(&mut self.core, req);
        self.adopt_pushed();
        self.send_next_command()
    }

    pub fn delete_files(&mut self, path: RemotePath, files: Vec<String>) -> OpResult {
        if let Some(r) = self.start_check() {
            return r;
        }
        DeleteOpData::push(&mut self.core, path, files);
        self.adopt_pushed();
        self.send_next_command()
    }

    pub fn remove_dir(&mut self, path: RemotePath, sub_dir: String) -> OpResult {
        if let Some(r) = self.start_check() {
            return r;
        }
        RemoveDirOpData::push(&mut self.core, path, sub_dir);
        self.adopt_pushed();
        self.send_next_command()
    }

    pub fn mkdir(&mut self, path: RemotePath) -> OpResult {
        if let Some(r) = self.start_check() {
            return r;
        }
        log::info!("creating directory '{path}'");
        let op = MkdirOpData::start(path);
        self.ops.push(op);
        self.send_next_command()
    }

    pub fn rename(
        &mut self,
        from_path: RemotePath,
        from_file: String,
        to_path: RemotePath,
        to_file: String,
    ) -> OpResult {
        if let Some(r) = self.start_check() {
            return r;
        }
        RenameOpData::push(&mut self.core, from_path, from_file, to_path, to_file);
        self.adopt_pushed();
        self.send_next_command()
    }

    pub fn chmod(&mut self, path: RemotePath, file: String, permission: String) -> OpResult {
        if let Some(r) = self.start_check() {
            return r;
        }
        ChmodOpData::push(&mut self.core, path, file, permission);
        self.adopt_pushed();
        self.send_next_command()
    }

    pub fn raw_command(&mut self, command: String) -> OpResult {
        if let Some(r) = self.start_check() {
            return r;
        }
        if command.is_empty() {
            return OpResult::error(OpFlags::SYNTAX_ERROR);
        }
        self.ops.push(FtpOperation::Raw(RawCommandOpData { command }));
        self.send_next_command()
    }

    /// Cancel whatever is in flight. Outstanding replies are drained
    /// silently; cache invalidations of partially finished work still ran.
    pub fn cancel(&mut self) {
        if self.ops.is_empty() {
            return;
        }
        while !self.ops.is_empty() {
            self.reset_one(OpResult::CANCELED);
        }
        self.finished = Some(OpResult::CANCELED);
    }

    /// Drive the session until the current operation completes.
    pub async fn drive(&mut self) -> OpResult {
        loop {
            if let Some(res) = self.run_io_step(true).await {
                return res;
            }
        }
    }

    /// Service an idle session once: keepalive probes, unsolicited server
    /// chatter, reply draining.
    pub async fn idle_tick(&mut self) {
        let _ = self.run_io_step(false).await;
    }

    async fn run_io_step(&mut self, until_finished: bool) -> Option<OpResult> {
        if until_finished {
            if let Some(res) = self.finished.take() {
                return Some(res);
            }
        }
        if self.core.closed {
            return Some(
                self.finished
                    .take()
                    .unwrap_or(OpResult::error(OpFlags::DISCONNECTED)),
            );
        }

        if self.core.tls_handshake_requested {
            self.core.tls_handshake_requested = false;
            self.do_tls_handshake().await;
            return if until_finished {
                self.finished.take()
            } else {
                None
            };
        }
        if self.core.pending_cert.is_some() && self.core.cert_trusted {
            self.resume_tls_handshake().await;
            return if until_finished {
                self.finished.take()
            } else {
                None
            };
        }

        if let Err(res) = self.flush_send_queue().await {
            return Some(self.do_close(res));
        }
        if until_finished {
            if let Some(res) = self.finished.take() {
                return Some(res);
            }
        }

        let keepalive = self.core.keepalive_deadline;
        let inactivity = (!self.ops.is_empty()).then_some(self.core.inactivity_deadline);

        let mut buf = [0u8; 4096];
        let wake = {
            let SessionCore {
                stream, event_rx, ..
            } = &mut self.core;
            let Some(stream) = stream.as_mut() else {
                return Some(self.do_close(OpResult::error(OpFlags::DISCONNECTED)));
            };

            tokio::select! {
                biased;
                ev = event_rx.recv() => Wake::Event(ev),
                r = stream.read(&mut buf) => Wake::Read(r),
                _ = deadline_sleep(keepalive) => Wake::Keepalive,
                _ = deadline_sleep(inactivity) => Wake::Inactivity,
            }
        };

        match wake {
            Wake::Read(Ok(0)) => {
                let e = crate::error::FtpResponseError::ConnectionClosed;
                if self.ops.is_empty() {
                    log::info!("{e} by server");
                } else {
                    log::error!("{e} by server");
                }
                return Some(self.do_close(OpResult::error(OpFlags::DISCONNECTED)));
            }
            Wake::Read(Ok(n)) => {
                self.core.refresh_inactivity();
                let mut lines = Vec::new();
                self.core.framer.feed(&buf[..n], &mut lines);
                for line in lines {
                    if self.core.closed {
                        break;
                    }
                    self.parse_line(line);
                }
            }
            Wake::Read(Err(e)) => {
                log::error!(
                    "could not read from socket: {}",
                    crate::error::FtpResponseError::ReadFailed(e)
                );
                return Some(self.do_close(OpResult::error(OpFlags::DISCONNECTED)));
            }
            Wake::Event(Some(ev)) => self.handle_event(ev),
            Wake::Event(None) => {}
            Wake::Keepalive => self.on_keepalive_timer(),
            Wake::Inactivity => {
                log::error!("connection timed out");
                return Some(self.do_close(OpResult::error(OpFlags::TIMEOUT)));
            }
        }

        if until_finished {
            self.finished.take()
        } else {
            None
        }
    }

    async fn flush_send_queue(&mut self) -> Result<(), OpResult> {
        if self.core.send_queue.is_empty() {
            return Ok(());
        }
        while let Some(data) = self.core.send_queue.pop_front() {
            let Some(stream) = self.core.stream.as_mut() else {
                return Err(OpResult::error(OpFlags::DISCONNECTED));
            };
            if let Err(e) = stream.write_all(&data).await {
                log::error!("{}", crate::error::FtpResponseError::WriteFailed(e));
                return Err(OpResult::error(OpFlags::DISCONNECTED));
            }
        }
        if let Some(stream) = self.core.stream.as_mut() {
            if let Err(e) = stream.flush().await {
                log::error!("{}", crate::error::FtpResponseError::WriteFailed(e));
                return Err(OpResult::error(OpFlags::DISCONNECTED));
            }
        }
        self.core.refresh_inactivity();
        Ok(())
    }

    async fn do_tls_handshake(&mut self) {
        let Some(stream) = self.core.stream.take() else {
            self.do_close(OpResult::error(OpFlags::DISCONNECTED));
            return;
        };
        let Some(mut tls) = self.core.tls.take() else {
            log::error!("TLS required but no TLS layer is available");
            self.do_close(OpResult::error(OpFlags::CRITICAL));
            return;
        };
        log::info!("initializing TLS...");
        let r = tls.start_handshake(stream).await;
        self.core.tls = Some(tls);
        match r {
            Ok(TlsHandshake::Established(stream)) => {
                log::info!("TLS connection established");
                self.core.stream = Some(stream);
                self.on_tls_established();
            }
            Ok(TlsHandshake::CertPending(pending)) => {
                let cert = pending.certificate();
                self.core.pending_cert = Some(pending);
                self.core.cert_trusted = false;
                if let Some(op) = self.ops.last_mut() {
                    op.set_waiting_async(true);
                }
                self.core.events.request_certificate_trust(&cert);
            }
            Err(e) => {
                log::error!("TLS handshake failed: {e}");
                self.do_close(OpResult::error(OpFlags::CRITICAL));
            }
        }
    }

    async fn resume_tls_handshake(&mut self) {
        let Some(pending) = self.core.pending_cert.take() else {
            return;
        };
        self.core.cert_trusted = false;
        match pending.resolve(true).await {
            Ok(stream) => {
                log::info!("TLS connection established");
                self.core.stream = Some(stream);
                self.on_tls_established();
            }
            Err(e) => {
                log::error!("TLS handshake failed: {e}");
                self.do_close(OpResult::error(OpFlags::CRITICAL));
            }
        }
    }

    fn on_tls_established(&mut self) {
        if let Some(FtpOperation::Connect(d)) = self.ops.last_mut() {
            logon::tls_established(d);
        }
        self.send_next_command();
    }

    fn handle_event(&mut self, event: FtpSessionEvent) {
        match event {
            FtpSessionEvent::AsyncReply(reply) => self.set_async_request_reply(reply),
            FtpSessionEvent::TransferEnd(reason) => self.on_transfer_end(reason),
            FtpSessionEvent::ExternalIp(result) => self.on_external_ip(result),
        }
    }

    /// Route an embedder reply to the operation that suspended for it.
    fn set_async_request_reply(&mut self, reply: AsyncRequestReply) {
        let Some(op) = self.ops.last_mut() else {
            log::debug!("no operation in progress, ignoring request reply");
            return;
        };
        if !op.waiting_async() {
            log::debug!("not waiting for a request reply, ignoring");
            return;
        }
        op.clear_waiting_async();

        match reply {
            AsyncRequestReply::FileExists(decision) => {
                let FtpOperation::Transfer(d) = op else {
                    log::debug!("file exists reply without transfer operation");
                    return;
                };
                let res = transfer::on_overwrite_decision(d, &mut self.core, decision);
                match res.outcome {
                    OpOutcome::Ok => {
                        self.reset_operation(OpResult::OK);
                    }
                    OpOutcome::Continue => {
                        self.send_next_command();
                    }
                    _ => {
                        self.reset_operation(res);
                    }
                }
            }
            AsyncRequestReply::InteractiveLogin(password) => {
                let FtpOperation::Connect(d) = op else {
                    log::debug!("interactive login reply without connect operation");
                    return;
                };
                match password {
                    Some(password) => {
                        logon::password_provided(d);
                        self.core.server.password = Some(password);
                        self.send_next_command();
                    }
                    None => {
                        self.reset_operation(OpResult::CANCELED);
                    }
                }
            }
            AsyncRequestReply::CertificateTrust(trusted) => {
                if self.core.pending_cert.is_none() {
                    log::debug!("no certificate decision pending, ignoring");
                    return;
                }
                if trusted {
                    // the next io step resumes the handshake
                    self.core.cert_trusted = true;
                } else {
                    self.core.pending_cert = None;
                    self.do_close(OpResult::error(OpFlags::CRITICAL));
                }
            }
        }
    }

    /// Data-channel completion event from the transfer socket.
    fn on_transfer_end(&mut self, reason: TransferEndReason) {
        let n = self.ops.len();
        if n == 0
            || self.core.transfer_socket.is_none()
            || self.ops[n - 1].kind() != FtpOpKind::RawTransfer
        {
            log::debug!("transfer end at unusual time, ignoring");
            return;
        }
        if reason == TransferEndReason::None {
            log::debug!("transfer end without reason");
            return;
        }
        if reason == TransferEndReason::Successful {
            self.core.refresh_inactivity();
        }

        // reconcile into the owning operation's bookkeeping
        if n >= 2 {
            if let Some(ctl) = self.ops[n - 2].transfer_ctl_mut() {
                if ctl.end_reason == TransferEndReason::Successful {
                    ctl.end_reason = reason;
                }
            }
        }

        let FtpOperation::RawTransfer(d) = &mut self.ops[n - 1] else {
            return;
        };
        if let Some(res) = rawtransfer::on_transfer_end(d, reason) {
            self.reset_operation(res);
        }
    }

    fn on_external_ip(&mut self, result: Result<IpAddr, crate::error::ExternalIpError>) {
        if !self.core.resolving_ip {
            log::debug!("ignoring stale resolver event");
            return;
        }
        self.core.resolving_ip = false;
        match result {
            Ok(ip) => {
                log::debug!("got external IP address");
                self.core.resolved_external_ip = Some(ip);
                if let Some(local) = self.core.local_ip() {
                    self.core.options.last_resolved_ip = Some(local.to_string());
                }
            }
            Err(e) => {
                log::debug!("failed to retrieve external ip address, using local address: {e}");
                self.core.resolved_external_ip = self.core.local_ip();
            }
        }
        self.send_next_command();
    }

    fn on_keepalive_timer(&mut self) {
        self.core.keepalive_deadline = None;
        if !self.ops.is_empty()
            || self.core.pending_replies > 0
            || self.core.replies_to_skip > 0
        {
            return;
        }

        let cmd = match fastrand::u32(0..3) {
            0 => "NOOP",
            1 => {
                if self.core.last_type_binary != Some(false) {
                    "TYPE I"
                } else {
                    "TYPE A"
                }
            }
            _ => "PWD",
        };
        log::info!(target: FTP_ENGINE_LOG_TARGET, "sending keep-alive command {cmd}");

        self.core.send_command_opts(cmd, false, false);
        self.core.replies_to_skip += 1;
    }

    /// One decoded control-channel line.
    fn parse_line(&mut self, line: String) {
        self.core.rtt.stop();
        log::debug!(target: FTP_ENGINE_LOG_TARGET, "< {line}");
        #[cfg(feature = "log-raw-io")]
        log_raw_response(&line);
        self.core.refresh_inactivity();

        if let Some(op) = self.ops.last_mut() {
            if let Some(res) = op.on_line(&mut self.core, &line) {
                self.do_close(res);
                return;
            }
        }

        match self.core.assembler.feed(line) {
            Ok(Some(reply)) => {
                self.core.reply = Some(reply);
                self.parse_response();
                self.core.reply = None;
            }
            Ok(None) => {}
            Err(e) => {
                log::error!("malformed server reply: {e}");
                self.do_close(OpResult::ERROR);
            }
        }
    }

    /// Dispatch one complete reply per the pending/skip counters.
    fn parse_response(&mut self) {
        let Some(reply) = self.core.reply.as_ref() else {
            return;
        };
        let preliminary = reply.is_preliminary();

        if !preliminary {
            if self.core.pending_replies > 0 {
                self.core.pending_replies -= 1;
            } else {
                log::debug!("unexpected reply, no reply was pending");
                return;
            }
        }

        if self.core.replies_to_skip > 0 {
            log::debug!("skipping reply after cancelled operation or keepalive command");
            if !preliminary {
                self.core.replies_to_skip -= 1;
            }
            if self.core.replies_to_skip == 0 {
                if self.ops.is_empty() {
                    self.core.start_keepalive_timer();
                } else if self.core.pending_replies == 0 {
                    self.send_next_command();
                }
            }
            return;
        }

        let Some(op) = self.ops.last_mut() else {
            log::debug!("skipping reply without active operation");
            return;
        };
        let res = op.parse_response(&mut self.core);
        self.adopt_pushed();

        match res.outcome {
            OpOutcome::Ok => {
                self.reset_operation(OpResult::OK);
            }
            OpOutcome::Canceled => {
                self.reset_operation(res);
            }
            OpOutcome::Continue => {
                self.send_next_command();
            }
            OpOutcome::WouldBlock => {}
            OpOutcome::Error => {
                if self.ops.last().map(|op| op.kind()) == Some(FtpOpKind::Connect) {
                    self.do_close(res.with(OpFlags::DISCONNECTED));
                } else if res.disconnected() {
                    self.do_close(res);
                } else {
                    self.reset_operation(res);
                }
            }
        }
    }

    /// Invoke `send` hooks until something blocks or the stack drains.
    fn send_next_command(&mut self) -> OpResult {
        loop {
            self.adopt_pushed();
            let Some(op) = self.ops.last_mut() else {
                return OpResult::OK;
            };
            if op.waiting_async() {
                log::debug!("waiting for async request, not sending next command");
                return OpResult::WOULD_BLOCK;
            }
            if self.core.replies_to_skip > 0 {
                log::debug!("waiting for replies to skip before sending next command");
                return OpResult::WOULD_BLOCK;
            }

            let res = op.send(&mut self.core);
            self.adopt_pushed();
            match res.outcome {
                OpOutcome::Continue => {}
                OpOutcome::Ok => return self.reset_operation(OpResult::OK),
                OpOutcome::Canceled => return self.reset_operation(res),
                OpOutcome::WouldBlock => return OpResult::WOULD_BLOCK,
                OpOutcome::Error => {
                    if res.disconnected() {
                        return self.do_close(res);
                    }
                    return self.reset_operation(res);
                }
            }
        }
    }

    fn adopt_pushed(&mut self) {
        if !self.core.pending_push.is_empty() {
            self.ops.append(&mut self.core.pending_push);
        }
    }

    /// Pop the top operation with `res`, running its teardown side effects,
    /// and resume the parent.
    fn reset_operation(&mut self, res: OpResult) -> OpResult {
        let res = self.reset_one(res);
        if self.core.closed {
            return res;
        }

        if let Some(parent) = self.ops.last_mut() {
            let r2 = parent.subcommand_result(res, &mut self.core);
            self.adopt_pushed();
            match r2.outcome {
                OpOutcome::WouldBlock => res,
                OpOutcome::Continue => {
                    self.send_next_command();
                    res
                }
                _ => self.reset_operation(r2),
            }
        } else {
            self.finished = Some(res);
            res
        }
    }

    /// The teardown half of a reset: counters, transfer reconciliation,
    /// cache notification flushes. Pops exactly one operation.
    fn reset_one(&mut self, mut res: OpResult) -> OpResult {
        log::debug!("reset operation ({res})");

        self.core.resolving_ip = false;
        self.core.replies_to_skip = self.core.pending_replies;

        let n = self.ops.len();
        match self.ops.last().map(|op| op.kind()) {
            Some(FtpOpKind::Transfer) => {
                let reply_class = self.core.reply_class();
                if let Some(FtpOperation::Transfer(d)) = self.ops.last_mut() {
                    if d.ctl.command_sent {
                        if d.ctl.end_reason == TransferEndReason::TransferFailureCritical {
                            res = res.with(OpFlags::CRITICAL | OpFlags::WRITE_FAILED);
                        }
                        if d.ctl.end_reason != TransferEndReason::TransferCommandFailureImmediate
                            || reply_class != 5
                        {
                            d.ctl.initiated = true;
                        } else if res == OpResult::ERROR {
                            res = res.with(OpFlags::CRITICAL);
                        }
                    }
                    if !res.is_ok() && d.ctl.download && !d.file_did_exist {
                        // a new file nothing was written to only leaves clutter
                        d.io_worker = None;
                        if let Ok(md) = std::fs::metadata(&d.local_path) {
                            if md.is_file() && md.len() == 0 {
                                log::debug!("deleting empty file");
                                let _ = std::fs::remove_file(&d.local_path);
                            }
                        }
                    }
                }
            }
            Some(FtpOpKind::Delete) => {
                if let Some(FtpOperation::Delete(d)) = self.ops.last_mut() {
                    if !res.disconnected() && d.batcher.pending() {
                        let path = d.path.clone();
                        d.batcher.flush(self.core.events.as_ref(), &path);
                    }
                }
            }
            Some(FtpOpKind::RawTransfer) => {
                if n >= 2 {
                    let (parents, child) = self.ops.split_at_mut(n - 1);
                    let FtpOperation::RawTransfer(child) = &mut child[0] else {
                        unreachable!()
                    };
                    let parent = parents.last_mut().unwrap();
                    // a finished listing must leave the socket before it is
                    // torn down
                    if let FtpOperation::List(ld) = &mut *parent {
                        if let Some(ts) = self.core.transfer_socket.as_mut() {
                            if let Some(entries) = ts.take_listing() {
                                ld.entries = Some(entries);
                            }
                        }
                    }
                    if let Some(ctl) = parent.transfer_ctl_mut() {
                        if child.command_sent {
                            ctl.command_sent = true;
                        }
                        if ctl.end_reason == TransferEndReason::Successful {
                            if let Some(reason) = child.failure_reason {
                                ctl.end_reason = reason;
                            }
                        }
                        if !res.is_success() && ctl.end_reason == TransferEndReason::Successful {
                            ctl.end_reason = if res.has(OpFlags::TIMEOUT) {
                                TransferEndReason::Timeout
                            } else if !ctl.command_sent {
                                TransferEndReason::PreTransferCommandFailure
                            } else {
                                TransferEndReason::Failure
                            };
                        }
                    }
                }
            }
            _ => {}
        }

        self.core.drop_transfer_socket();

        self.core.last_command_completed = Some(Instant::now());
        if !res.disconnected() {
            self.core.start_keepalive_timer();
        } else {
            self.core.keepalive_deadline = None;
        }

        self.ops.pop();
        res
    }

    /// Tear the session down; any further operation fails with
    /// `DISCONNECTED`.
    fn do_close(&mut self, res: OpResult) -> OpResult {
        let res = res.with(OpFlags::DISCONNECTED);
        if self.core.closed {
            return res;
        }

        self.core.drop_transfer_socket();
        // io workers join through their drop handlers
        self.ops.clear();
        self.core.pending_push.clear();
        self.core.stream = None;
        self.core.send_queue.clear();
        self.core.pending_replies = 0;
        self.core.replies_to_skip = 0;
        self.core.keepalive_deadline = None;
        self.core.pending_cert = None;
        self.core.closed = true;
        self.finished = Some(res);
        res
    }
}

async fn deadline_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending().await,
    }
}

/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::net::IpAddr;
use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::error::ExternalIpError;
use crate::path::RemotePath;
use crate::time::ServerDateTime;
use crate::transfer::TransferEndReason;

#[derive(Clone, Debug)]
pub struct ListingNotification {
    pub path: RemotePath,
    pub modified: bool,
    pub failed: bool,
}

/// Asks the embedder what to do about an existing target file.
#[derive(Clone, Debug)]
pub struct FileExistsRequest {
    pub download: bool,
    pub local_path: PathBuf,
    pub remote_path: RemotePath,
    pub remote_file: String,
    pub local_size: Option<u64>,
    pub remote_size: Option<u64>,
    pub remote_time: Option<ServerDateTime>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OverwriteDecision {
    Overwrite,
    Resume,
    #[default]
    Skip,
}

#[derive(Clone, Debug, Default)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub fingerprint: String,
}

/// Notification surface toward the embedder. Requests are answered
/// asynchronously through [`FtpEventProxy::async_reply`]; the session
/// suspends the requesting operation until the reply arrives.
pub trait EventSink: Send {
    fn listing_changed(&self, notification: ListingNotification);
    fn request_file_exists(&self, request: FileExistsRequest);
    fn request_interactive_login(&self, challenge: &str);
    fn request_certificate_trust(&self, cert: &CertificateInfo);
}

/// Sink for embedders that do not surface any UI.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn listing_changed(&self, _notification: ListingNotification) {}
    fn request_file_exists(&self, _request: FileExistsRequest) {}
    fn request_interactive_login(&self, _challenge: &str) {}
    fn request_certificate_trust(&self, _cert: &CertificateInfo) {}
}

#[derive(Clone, Debug)]
pub enum AsyncRequestReply {
    FileExists(OverwriteDecision),
    /// The password entered interactively; `None` when the user canceled.
    InteractiveLogin(Option<String>),
    CertificateTrust(bool),
}

/// Events posted back into the session's run loop by collaborators.
#[derive(Debug)]
pub enum FtpSessionEvent {
    AsyncReply(AsyncRequestReply),
    TransferEnd(TransferEndReason),
    ExternalIp(Result<IpAddr, ExternalIpError>),
}

/// Cloneable handle for posting events into a session.
#[derive(Clone)]
pub struct FtpEventProxy {
    tx: mpsc::UnboundedSender<FtpSessionEvent>,
}

impl FtpEventProxy {
    pub(crate) fn new(tx: mpsc::UnboundedSender<FtpSessionEvent>) -> Self {
        FtpEventProxy { tx }
    }

    pub fn send(&self, event: FtpSessionEvent) {
        // The session may already be gone; the event is then moot.
        let _ = self.tx.send(event);
    }

    pub fn async_reply(&self, reply: AsyncRequestReply) {
        self.send(FtpSessionEvent::AsyncReply(reply));
    }

    pub fn transfer_end(&self, reason: TransferEndReason) {
        self.send(FtpSessionEvent::TransferEnd(reason));
    }
}

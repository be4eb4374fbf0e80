/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

mod cache;
mod caps;
mod config;
mod control;
mod error;
mod facts;
mod notify;
mod ops;
mod path;
mod resolver;
mod result;
mod session;
mod time;
mod tls;
mod transfer;

pub use cache::{
    DirectoryCache, FileLookup, ListingChangeBatcher, NullDirectoryCache, NullPathCache, PathCache,
};
pub use caps::{CapabilityStatus, FtpCapability, ServerCapabilities};
pub use config::{
    ControlCharset, ExternalIpMode, FtpControlConfig, FtpEngineConfig, FtpEngineOptions,
    FtpKeepaliveConfig, FtpProtocol, FtpServerConfig, FtpTransferConfig, PassivePreference,
};
pub use control::FtpReply;
pub use error::{
    ExternalIpError, FtpResponseError, FtpTlsError, FtpTransferError, IoWorkerError,
};
pub use facts::FtpDirEntry;
pub use notify::{
    AsyncRequestReply, CertificateInfo, EventSink, FileExistsRequest, FtpEventProxy,
    FtpSessionEvent, ListingNotification, NullEventSink, OverwriteDecision,
};
pub use path::RemotePath;
pub use resolver::ExternalIpResolver;
pub use result::{OpFlags, OpOutcome, OpResult};
pub use session::{
    FTP_ENGINE_LOG_TARGET, FileTransferRequest, FtpSession, FtpSessionParts, RttTracker,
};
pub use time::{MonotonicDateTime, ServerDateTime, TimeAccuracy};
pub use tls::{PendingTlsHandshake, TlsHandshake, TlsShim};
pub use transfer::{
    IoWorker, IoWorkerHandle, IoWorkerPool, TransferEndReason, TransferMode, TransferSocket,
    TransferSocketFactory,
};

/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::net::SocketAddr;

use crate::error::FtpTransferError;
use crate::facts::FtpDirEntry;
use crate::notify::FtpEventProxy;

mod io_worker;

pub use io_worker::{IoWorker, IoWorkerHandle, IoWorkerPool};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferMode {
    Download,
    Upload,
    /// Probe read of the single byte before the remote end, used to
    /// classify resume-past-2/4-GiB server bugs.
    ResumeTest,
    List,
}

/// Canonical classification of why a data-channel transfer ended. It
/// survives operation reset and is the single source of truth for failure
/// reporting.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TransferEndReason {
    #[default]
    None,
    Successful,
    Failure,
    Timeout,
    PreTransferCommandFailure,
    FailedResumeTest,
    TransferCommandFailureImmediate,
    /// Local write failed or the data stream broke irrecoverably.
    TransferFailureCritical,
}

impl TransferEndReason {
    #[inline]
    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            TransferEndReason::None | TransferEndReason::Successful
        )
    }
}

/// One data connection for one transfer. Connection establishment and byte
/// shoveling happen inside the collaborator; completion is reported through
/// the session's event channel as a `TransferEnd` event.
pub trait TransferSocket: Send {
    fn mode(&self) -> TransferMode;

    fn set_binary(&mut self, binary: bool);

    /// Hand over the io worker endpoints; the socket becomes the only
    /// network-side producer/consumer for this transfer.
    fn set_io_worker(&mut self, worker: IoWorkerHandle);

    /// Passive mode: start connecting to the server's advertised address.
    /// Failures surface as a `TransferEnd` event.
    fn begin_connect(&mut self, addr: SocketAddr);

    /// Active mode: bind a listening socket on an ephemeral port and return
    /// its local address for PORT/EPRT.
    fn listen(&mut self) -> Result<SocketAddr, FtpTransferError>;

    fn end_reason(&self) -> TransferEndReason;

    /// List mode: the parsed entries once the listing completed.
    fn take_listing(&mut self) -> Option<Vec<FtpDirEntry>> {
        None
    }

    /// Tear the connection down; used on operation reset and cancel.
    fn close(&mut self);
}

/// Creates transfer sockets. `protected` requests TLS on the data channel
/// (after PROT P).
pub trait TransferSocketFactory: Send {
    fn create(
        &mut self,
        mode: TransferMode,
        binary: bool,
        protected: bool,
        events: FtpEventProxy,
    ) -> Box<dyn TransferSocket>;
}

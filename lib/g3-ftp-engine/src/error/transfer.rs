/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FtpTransferError {
    #[error("unable to bind local data port: {0:?}")]
    ListenFailed(io::Error),
    #[error("data transfer not connected")]
    NotConnected,
    #[error("data transfer connect timeout")]
    ConnectTimeout,
    #[error("data io failed: {0:?}")]
    IoFailed(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum IoWorkerError {
    #[error("unable to spawn io worker thread: {0:?}")]
    SpawnFailed(io::Error),
    #[error("local file io failed: {0:?}")]
    FileIoFailed(io::Error),
    #[error("io worker gone")]
    WorkerGone,
}

#[derive(Debug, Error)]
pub enum FtpTlsError {
    #[error("tls handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("certificate rejected")]
    CertificateRejected,
    #[error("tls io failed: {0:?}")]
    IoFailed(#[from] io::Error),
}

/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use async_trait::async_trait;

use crate::error::FtpTlsError;
use crate::notify::CertificateInfo;

/// Outcome of starting a TLS handshake over the control or data stream.
pub enum TlsHandshake<S> {
    Established(S),
    /// The peer certificate needs an explicit trust decision before the
    /// handshake can complete.
    CertPending(Box<dyn PendingTlsHandshake<S>>),
}

/// TLS layering is a collaborator: the engine only sequences handshakes
/// and trust decisions, the byte-level implementation stays outside.
#[async_trait]
pub trait TlsShim<S>: Send {
    async fn start_handshake(&mut self, stream: S) -> Result<TlsHandshake<S>, FtpTlsError>;
}

#[async_trait]
pub trait PendingTlsHandshake<S>: Send {
    fn certificate(&self) -> CertificateInfo;

    /// Complete the handshake with the given trust decision. Rejecting the
    /// certificate fails with [`FtpTlsError::CertificateRejected`].
    async fn resolve(self: Box<Self>, trusted: bool) -> Result<S, FtpTlsError>;
}

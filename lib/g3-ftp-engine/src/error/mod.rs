/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

mod resolver;
mod response;
mod transfer;

pub use resolver::ExternalIpError;
pub use response::FtpResponseError;
pub use transfer::{FtpTlsError, FtpTransferError, IoWorkerError};

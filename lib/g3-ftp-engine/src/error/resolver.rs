/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExternalIpError {
    #[error("resolver request failed: {0}")]
    FetchFailed(String),
    #[error("resolver returned no usable address")]
    NoAddress,
    #[error("timed out to query resolver")]
    TimedOut,
}

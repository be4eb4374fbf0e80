/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use crate::time::ServerDateTime;

/// One entry as known to the directory cache.
#[derive(Clone, Debug)]
pub struct FtpDirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: Option<u64>,
    pub time: Option<ServerDateTime>,
    /// Metadata may be stale; an unsure entry must not feed transfer
    /// decisions and forces a listing refresh.
    pub unsure: bool,
}

impl FtpDirEntry {
    pub fn file(name: impl Into<String>) -> Self {
        FtpDirEntry {
            name: name.into(),
            is_dir: false,
            size: None,
            time: None,
            unsure: false,
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        FtpDirEntry {
            name: name.into(),
            is_dir: true,
            size: None,
            time: None,
            unsure: false,
        }
    }

    #[inline]
    pub fn has_date(&self) -> bool {
        self.time.is_some()
    }

    #[inline]
    pub fn has_time(&self) -> bool {
        self.time.map(|t| t.has_time()).unwrap_or(false)
    }
}

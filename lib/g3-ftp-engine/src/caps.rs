/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::collections::HashMap;

/// Tri-state knowledge about one server feature: not yet probed, known
/// absent, or known present.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CapabilityStatus {
    #[default]
    Unknown,
    Yes,
    No,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FtpCapability {
    Utf8Command,
    ClntCommand,
    /// Payload holds the MLST fact list from FEAT.
    MlsdCommand,
    MfmtCommand,
    MdtmCommand,
    SizeCommand,
    TvfsSupport,
    ModeZSupport,
    RestStream,
    EpsvCommand,
    /// `No` means the server reports UTC times (MLST/MLSD mandate it).
    TimezoneOffset,
    Resume2GbBug,
    Resume4GbBug,
}

/// Per-session capability knowledge. Persisting it across sessions against
/// the same server is the embedder's concern.
#[derive(Default)]
pub struct ServerCapabilities {
    map: HashMap<FtpCapability, (CapabilityStatus, Option<String>)>,
}

impl ServerCapabilities {
    pub fn status(&self, cap: FtpCapability) -> CapabilityStatus {
        self.map.get(&cap).map(|v| v.0).unwrap_or_default()
    }

    pub fn payload(&self, cap: FtpCapability) -> Option<&str> {
        self.map.get(&cap).and_then(|v| v.1.as_deref())
    }

    pub fn set(&mut self, cap: FtpCapability, status: CapabilityStatus) {
        self.set_with(cap, status, None);
    }

    pub fn set_with(
        &mut self,
        cap: FtpCapability,
        status: CapabilityStatus,
        payload: Option<String>,
    ) {
        // A probed capability is never degraded back to Unknown.
        if status == CapabilityStatus::Unknown && self.status(cap) != CapabilityStatus::Unknown {
            return;
        }
        self.map.insert(cap, (status, payload));
        if cap == FtpCapability::MlsdCommand && status == CapabilityStatus::Yes {
            // MLST/MLSD specs require use of UTC
            self.map
                .insert(FtpCapability::TimezoneOffset, (CapabilityStatus::No, None));
        }
    }

    /// Opportunistic update from a command result; only records knowledge
    /// where none existed.
    pub fn set_if_unknown(&mut self, cap: FtpCapability, status: CapabilityStatus) {
        if self.status(cap) == CapabilityStatus::Unknown {
            self.set(cap, status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_unknown() {
        let caps = ServerCapabilities::default();
        assert_eq!(
            caps.status(FtpCapability::SizeCommand),
            CapabilityStatus::Unknown
        );
        assert!(caps.payload(FtpCapability::MlsdCommand).is_none());
    }

    #[test]
    fn probed_value_not_degraded() {
        let mut caps = ServerCapabilities::default();
        caps.set(FtpCapability::SizeCommand, CapabilityStatus::Yes);
        caps.set(FtpCapability::SizeCommand, CapabilityStatus::Unknown);
        assert_eq!(
            caps.status(FtpCapability::SizeCommand),
            CapabilityStatus::Yes
        );

        caps.set(FtpCapability::SizeCommand, CapabilityStatus::No);
        assert_eq!(
            caps.status(FtpCapability::SizeCommand),
            CapabilityStatus::No
        );
    }

    #[test]
    fn set_if_unknown() {
        let mut caps = ServerCapabilities::default();
        caps.set(FtpCapability::Resume2GbBug, CapabilityStatus::No);
        caps.set_if_unknown(FtpCapability::Resume2GbBug, CapabilityStatus::Yes);
        assert_eq!(
            caps.status(FtpCapability::Resume2GbBug),
            CapabilityStatus::No
        );
        caps.set_if_unknown(FtpCapability::Resume4GbBug, CapabilityStatus::Yes);
        assert_eq!(
            caps.status(FtpCapability::Resume4GbBug),
            CapabilityStatus::Yes
        );
    }

    #[test]
    fn mlsd_implies_utc() {
        let mut caps = ServerCapabilities::default();
        caps.set_with(
            FtpCapability::MlsdCommand,
            CapabilityStatus::Yes,
            Some("Type*;Size*;Modify*;".to_string()),
        );
        assert_eq!(
            caps.status(FtpCapability::TimezoneOffset),
            CapabilityStatus::No
        );
        assert_eq!(
            caps.payload(FtpCapability::MlsdCommand),
            Some("Type*;Size*;Modify*;")
        );
    }
}

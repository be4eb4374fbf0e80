/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::fmt;

use bitflags::bitflags;

/// Base outcome of an operation step. Exactly one base is active at a time;
/// modifiers are carried separately in [`OpFlags`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OpOutcome {
    Ok,
    #[default]
    Error,
    /// Surfaced as success to the caller; used when a transfer is cut short
    /// on purpose (matching local and remote sizes with a known resume bug).
    Canceled,
    /// Internal only: the operation ceded control until the next reply or
    /// writability event.
    WouldBlock,
    /// Internal only: the dispatcher should invoke the next `send` hook.
    Continue,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct OpFlags: u16 {
        /// Do not retry the operation.
        const CRITICAL = 0x0001;
        /// The control connection is gone.
        const DISCONNECTED = 0x0002;
        const TIMEOUT = 0x0004;
        const WRITE_FAILED = 0x0008;
        const NOT_SUPPORTED = 0x0010;
        const SYNTAX_ERROR = 0x0020;
        const INTERNAL_ERROR = 0x0040;
        const PASSWORD_FAILED = 0x0080;
    }
}

/// Tagged result code passed between operation hooks and the dispatcher.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct OpResult {
    pub outcome: OpOutcome,
    pub flags: OpFlags,
}

impl OpResult {
    pub const OK: OpResult = OpResult::new(OpOutcome::Ok);
    pub const ERROR: OpResult = OpResult::new(OpOutcome::Error);
    pub const CANCELED: OpResult = OpResult::new(OpOutcome::Canceled);
    pub const WOULD_BLOCK: OpResult = OpResult::new(OpOutcome::WouldBlock);
    pub const CONTINUE: OpResult = OpResult::new(OpOutcome::Continue);

    pub const fn new(outcome: OpOutcome) -> Self {
        OpResult {
            outcome,
            flags: OpFlags::empty(),
        }
    }

    pub const fn error(flags: OpFlags) -> Self {
        OpResult {
            outcome: OpOutcome::Error,
            flags,
        }
    }

    #[must_use]
    pub fn with(mut self, flags: OpFlags) -> Self {
        self.flags |= flags;
        self
    }

    #[inline]
    pub fn has(&self, flags: OpFlags) -> bool {
        self.flags.contains(flags)
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, OpOutcome::Ok)
    }

    #[inline]
    pub fn is_err(&self) -> bool {
        matches!(self.outcome, OpOutcome::Error)
    }

    /// Whether the caller should treat this as success. `Canceled` is a
    /// deliberate short-circuit and reported as success.
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, OpOutcome::Ok | OpOutcome::Canceled)
    }

    #[inline]
    pub fn disconnected(&self) -> bool {
        self.flags.contains(OpFlags::DISCONNECTED)
    }
}

impl fmt::Display for OpResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.flags.is_empty() {
            write!(f, "{:?}", self.outcome)
        } else {
            write!(f, "{:?}({:?})", self.outcome, self.flags)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_compose() {
        let r = OpResult::ERROR.with(OpFlags::CRITICAL | OpFlags::WRITE_FAILED);
        assert!(r.is_err());
        assert!(r.has(OpFlags::CRITICAL));
        assert!(r.has(OpFlags::WRITE_FAILED));
        assert!(!r.has(OpFlags::TIMEOUT));
    }

    #[test]
    fn canceled_is_success() {
        assert!(OpResult::CANCELED.is_success());
        assert!(!OpResult::CANCELED.is_ok());
        assert!(OpResult::OK.is_success());
        assert!(!OpResult::ERROR.is_success());
    }

    #[test]
    fn disconnect_flag() {
        let r = OpResult::error(OpFlags::DISCONNECTED);
        assert!(r.disconnected());
        assert!(!OpResult::ERROR.disconnected());
    }
}

/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use crate::path::RemotePath;
use crate::result::{OpFlags, OpResult};
use crate::session::SessionCore;

use super::{FtpOperation, MkdirOpData};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CwdState {
    Cwd,
    CwdSub,
    Pwd,
}

pub(crate) struct CwdOpData {
    path: RemotePath,
    sub_dir: Option<String>,
    /// The directory we expect to end up in; PWD verifies it.
    target: RemotePath,
    /// For uploads into a missing directory: try MKD once before failing.
    try_mkd_on_fail: bool,
    mkd_tried: bool,
    state: CwdState,
    sent: bool,
}

/// Queue a change-directory sub-operation on top of the current one.
pub(crate) fn push<S>(
    core: &mut SessionCore<S>,
    path: RemotePath,
    sub_dir: Option<String>,
    try_mkd_on_fail: bool,
) {
    let target = match &sub_dir {
        Some(sub) => path.join(sub),
        None => path.clone(),
    };
    core.push_sub(FtpOperation::ChangeDir(CwdOpData {
        path,
        sub_dir,
        target,
        try_mkd_on_fail,
        mkd_tried: false,
        state: CwdState::Cwd,
        sent: false,
    }));
}

pub(crate) fn send<S>(d: &mut CwdOpData, core: &mut SessionCore<S>) -> OpResult {
    match d.state {
        CwdState::Cwd => {
            if !d.sent && core.current_path.as_ref() == Some(&d.target) {
                // already there
                return OpResult::OK;
            }
            d.sent = true;
            core.send_command(&format!("CWD {}", d.path));
            OpResult::WOULD_BLOCK
        }
        CwdState::CwdSub => {
            let Some(sub) = d.sub_dir.as_deref() else {
                return OpResult::error(OpFlags::INTERNAL_ERROR);
            };
            core.send_command(&format!("CWD {sub}"));
            OpResult::WOULD_BLOCK
        }
        CwdState::Pwd => {
            core.send_command("PWD");
            OpResult::WOULD_BLOCK
        }
    }
}

pub(crate) fn parse_response<S>(d: &mut CwdOpData, core: &mut SessionCore<S>) -> OpResult {
    match d.state {
        CwdState::Cwd => {
            if core.reply_is_positive() {
                core.current_path = Some(d.path.clone());
                d.state = if d.sub_dir.is_some() {
                    CwdState::CwdSub
                } else {
                    CwdState::Pwd
                };
                OpResult::CONTINUE
            } else if d.try_mkd_on_fail && !d.mkd_tried {
                d.mkd_tried = true;
                core.push_sub(MkdirOpData::start(d.path.clone()));
                OpResult::CONTINUE
            } else {
                OpResult::ERROR
            }
        }
        CwdState::CwdSub => {
            if core.reply_is_positive() {
                core.current_path = Some(d.target.clone());
                d.state = CwdState::Pwd;
                OpResult::CONTINUE
            } else {
                OpResult::ERROR
            }
        }
        CwdState::Pwd => {
            if !core.reply_is_positive() {
                return OpResult::ERROR;
            }
            let reported = core
                .reply()
                .and_then(|r| r.parse_257_path())
                .map(RemotePath::new);
            match reported {
                Some(path) => core.current_path = Some(path),
                None => {
                    // servers with unquoted 257 replies; trust the target
                    core.current_path = Some(d.target.clone());
                }
            }
            OpResult::OK
        }
    }
}

pub(crate) fn subcommand_result<S>(
    d: &mut CwdOpData,
    prev: OpResult,
    _core: &mut SessionCore<S>,
) -> OpResult {
    // back from the MKD fallback; retry CWD on success
    if prev.is_ok() {
        d.sent = false;
        OpResult::CONTINUE
    } else {
        prev
    }
}

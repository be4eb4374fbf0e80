/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::collections::VecDeque;

use crate::path::RemotePath;
use crate::result::{OpFlags, OpResult};
use crate::session::SessionCore;

use super::FtpOperation;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum MkdState {
    FindParent,
    MkdSub,
    CwdSub,
    TryFull,
}

/* Directory creation works like this: first find a parent directory into
 * which we can CWD, then create the missing segments one by one. If either
 * part fails, try MKD with the full path directly.
 */
pub(crate) struct MkdirOpData {
    path: RemotePath,
    cur_path: RemotePath,
    todo: VecDeque<String>,
    state: MkdState,
    tried_full: bool,
}

impl MkdirOpData {
    pub(crate) fn start(path: RemotePath) -> FtpOperation {
        let mut todo = VecDeque::new();
        let (cur_path, state) = match path.parent() {
            Some(parent) => {
                let last = path.segments().last().unwrap_or_default().to_string();
                todo.push_back(last);
                (parent, MkdState::FindParent)
            }
            None => (RemotePath::root(), MkdState::TryFull),
        };
        FtpOperation::Mkdir(MkdirOpData {
            path,
            cur_path,
            todo,
            state,
            tried_full: false,
        })
    }
}

pub(crate) fn send<S>(d: &mut MkdirOpData, core: &mut SessionCore<S>) -> OpResult {
    match d.state {
        MkdState::FindParent => {
            core.send_command(&format!("CWD {}", d.cur_path));
        }
        MkdState::MkdSub => {
            let Some(name) = d.todo.front() else {
                return OpResult::error(OpFlags::INTERNAL_ERROR);
            };
            core.send_command(&format!("MKD {name}"));
        }
        MkdState::CwdSub => {
            let Some(name) = d.todo.front() else {
                return OpResult::error(OpFlags::INTERNAL_ERROR);
            };
            core.send_command(&format!("CWD {name}"));
        }
        MkdState::TryFull => {
            core.send_command(&format!("MKD {}", d.path));
        }
    }
    OpResult::WOULD_BLOCK
}

pub(crate) fn parse_response<S>(d: &mut MkdirOpData, core: &mut SessionCore<S>) -> OpResult {
    match d.state {
        MkdState::FindParent => {
            if core.reply_is_positive() {
                core.current_path = Some(d.cur_path.clone());
                d.state = MkdState::MkdSub;
                OpResult::CONTINUE
            } else if let Some(parent) = d.cur_path.parent() {
                let last = d.cur_path.segments().last().unwrap_or_default().to_string();
                d.todo.push_front(last);
                d.cur_path = parent;
                OpResult::CONTINUE
            } else {
                d.state = MkdState::TryFull;
                OpResult::CONTINUE
            }
        }
        MkdState::MkdSub => {
            if core.reply_is_positive() {
                if let Some(name) = d.todo.front() {
                    core.path_cache.invalidate_path(&d.cur_path, name);
                }
                core.notify_listing_changed(&d.cur_path);
                d.state = MkdState::CwdSub;
                OpResult::CONTINUE
            } else if !d.tried_full {
                d.state = MkdState::TryFull;
                OpResult::CONTINUE
            } else {
                OpResult::ERROR
            }
        }
        MkdState::CwdSub => {
            if !core.reply_is_positive() {
                return OpResult::ERROR;
            }
            let name = d.todo.pop_front().unwrap_or_default();
            d.cur_path = d.cur_path.join(&name);
            core.current_path = Some(d.cur_path.clone());
            if d.todo.is_empty() {
                OpResult::OK
            } else {
                d.state = MkdState::MkdSub;
                OpResult::CONTINUE
            }
        }
        MkdState::TryFull => {
            d.tried_full = true;
            if core.reply_is_positive() {
                if let Some(parent) = d.path.parent() {
                    core.notify_listing_changed(&parent);
                }
                OpResult::OK
            } else {
                OpResult::ERROR
            }
        }
    }
}

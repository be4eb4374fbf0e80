/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use crate::caps::{CapabilityStatus, FtpCapability};
use crate::facts::FtpDirEntry;
use crate::path::RemotePath;
use crate::result::OpResult;
use crate::session::SessionCore;
use crate::transfer::{TransferEndReason, TransferMode};

use super::{cwd, rawtransfer, FtpOperation, TransferOpCtl};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ListState {
    WaitCwd,
    WaitTransfer,
}

pub(crate) struct ListOpData {
    pub(crate) ctl: TransferOpCtl,
    path: Option<RemotePath>,
    /// Listing target once CWD resolved it.
    target: Option<RemotePath>,
    pub(crate) refresh: bool,
    /// Parsed entries, dropped off by the dispatcher when the data channel
    /// closes.
    pub(crate) entries: Option<Vec<FtpDirEntry>>,
    state: ListState,
}

impl ListOpData {
    pub(crate) fn push<S>(core: &mut SessionCore<S>, path: Option<RemotePath>, refresh: bool) {
        let cwd_target = path
            .clone()
            .or_else(|| core.current_path.clone())
            .unwrap_or_else(RemotePath::root);
        core.push_sub(FtpOperation::List(ListOpData {
            // directory listings always run in ASCII mode
            ctl: TransferOpCtl::new(true, false),
            path,
            target: None,
            refresh,
            entries: None,
            state: ListState::WaitCwd,
        }));
        cwd::push(core, cwd_target, None, false);
    }
}

pub(crate) fn subcommand_result<S>(
    d: &mut ListOpData,
    prev: OpResult,
    core: &mut SessionCore<S>,
) -> OpResult {
    match d.state {
        ListState::WaitCwd => {
            if !prev.is_ok() {
                return prev;
            }
            let target = core
                .current_path
                .clone()
                .or_else(|| d.path.clone())
                .unwrap_or_else(RemotePath::root);

            let cmd = if core.caps.status(FtpCapability::MlsdCommand) == CapabilityStatus::Yes {
                "MLSD"
            } else {
                "LIST"
            };

            d.target = Some(target);
            d.ctl.end_reason = TransferEndReason::Successful;
            d.ctl.command_sent = false;

            core.create_transfer_socket(TransferMode::List, d.ctl.binary);
            rawtransfer::push(core, cmd.to_string(), &d.ctl);
            d.state = ListState::WaitTransfer;
            OpResult::CONTINUE
        }
        ListState::WaitTransfer => {
            let target = d
                .target
                .clone()
                .unwrap_or_else(|| core.current_path.clone().unwrap_or_else(RemotePath::root));
            if prev.is_ok() {
                if let Some(entries) = d.entries.take() {
                    core.dir_cache.store_listing(&target, entries);
                }
                // a refresh supersedes whatever the embedder had cached
                core.notify_listing_result(&target, d.refresh, false);
                OpResult::OK
            } else {
                core.notify_listing_result(&target, false, true);
                prev
            }
        }
    }
}

/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::collections::VecDeque;

use crate::cache::ListingChangeBatcher;
use crate::path::RemotePath;
use crate::result::{OpOutcome, OpResult};
use crate::session::SessionCore;
use crate::transfer::TransferEndReason;

pub(crate) mod cwd;
pub(crate) mod list;
pub(crate) mod logon;
pub(crate) mod mkd;
pub(crate) mod rawtransfer;
pub(crate) mod transfer;

pub(crate) use cwd::CwdOpData;
pub(crate) use list::ListOpData;
pub(crate) use logon::LogonOpData;
pub(crate) use mkd::MkdirOpData;
pub(crate) use rawtransfer::RawTransferOpData;
pub(crate) use transfer::FileTransferOpData;

/// Identifies the user-level intent of an operation, mainly for logging
/// and the dispatcher's special cases.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FtpOpKind {
    Connect,
    ChangeDir,
    List,
    Transfer,
    RawTransfer,
    Mkdir,
    RemoveDir,
    Delete,
    Rename,
    Chmod,
    Raw,
}

/// Data-transfer bookkeeping shared by the operations that drive a data
/// channel (file transfer and listing). The raw-transfer sub-operation and
/// the dispatcher write into it through the stack.
#[derive(Debug)]
pub(crate) struct TransferOpCtl {
    pub(crate) download: bool,
    pub(crate) binary: bool,
    pub(crate) resume_offset: u64,
    /// The RETR/STOR/APPE/LIST command went out on the wire.
    pub(crate) command_sent: bool,
    /// The server actually started acting on the transfer; immediate
    /// 5xx failures keep this false.
    pub(crate) initiated: bool,
    pub(crate) end_reason: TransferEndReason,
}

impl TransferOpCtl {
    pub(crate) fn new(download: bool, binary: bool) -> Self {
        TransferOpCtl {
            download,
            binary,
            resume_offset: 0,
            command_sent: false,
            initiated: false,
            end_reason: TransferEndReason::None,
        }
    }
}

/// One in-flight operation on the session's LIFO stack.
pub(crate) enum FtpOperation {
    Connect(LogonOpData),
    ChangeDir(CwdOpData),
    List(ListOpData),
    Transfer(FileTransferOpData),
    RawTransfer(RawTransferOpData),
    Mkdir(MkdirOpData),
    RemoveDir(RemoveDirOpData),
    Delete(DeleteOpData),
    Rename(RenameOpData),
    Chmod(ChmodOpData),
    Raw(RawCommandOpData),
}

impl FtpOperation {
    pub(crate) fn kind(&self) -> FtpOpKind {
        match self {
            FtpOperation::Connect(_) => FtpOpKind::Connect,
            FtpOperation::ChangeDir(_) => FtpOpKind::ChangeDir,
            FtpOperation::List(_) => FtpOpKind::List,
            FtpOperation::Transfer(_) => FtpOpKind::Transfer,
            FtpOperation::RawTransfer(_) => FtpOpKind::RawTransfer,
            FtpOperation::Mkdir(_) => FtpOpKind::Mkdir,
            FtpOperation::RemoveDir(_) => FtpOpKind::RemoveDir,
            FtpOperation::Delete(_) => FtpOpKind::Delete,
            FtpOperation::Rename(_) => FtpOpKind::Rename,
            FtpOperation::Chmod(_) => FtpOpKind::Chmod,
            FtpOperation::Raw(_) => FtpOpKind::Raw,
        }
    }

    pub(crate) fn waiting_async(&self) -> bool {
        match self {
            FtpOperation::Connect(d) => d.wait_async,
            FtpOperation::Transfer(d) => d.wait_async,
            _ => false,
        }
    }

    pub(crate) fn clear_waiting_async(&mut self) {
        self.set_waiting_async(false);
    }

    pub(crate) fn set_waiting_async(&mut self, value: bool) {
        match self {
            FtpOperation::Connect(d) => d.wait_async = value,
            FtpOperation::Transfer(d) => d.wait_async = value,
            _ => {}
        }
    }

    /// The transfer bookkeeping of this operation, if it drives one.
    pub(crate) fn transfer_ctl_mut(&mut self) -> Option<&mut TransferOpCtl> {
        match self {
            FtpOperation::Transfer(d) => Some(&mut d.ctl),
            FtpOperation::List(d) => Some(&mut d.ctl),
            _ => None,
        }
    }

    /// Emit the next command or decide completion.
    pub(crate) fn send<S>(&mut self, core: &mut SessionCore<S>) -> OpResult {
        match self {
            FtpOperation::Connect(d) => logon::send(d, core),
            FtpOperation::ChangeDir(d) => cwd::send(d, core),
            FtpOperation::List(_) => OpResult::WOULD_BLOCK,
            FtpOperation::Transfer(d) => transfer::send(d, core),
            FtpOperation::RawTransfer(d) => rawtransfer::send(d, core),
            FtpOperation::Mkdir(d) => mkd::send(d, core),
            FtpOperation::RemoveDir(d) => remove_dir_send(d, core),
            FtpOperation::Delete(d) => delete_send(d, core),
            FtpOperation::Rename(d) => rename_send(d, core),
            FtpOperation::Chmod(d) => chmod_send(d, core),
            FtpOperation::Raw(d) => raw_command_send(d, core),
        }
    }

    /// Consume the reply currently held by the dispatcher.
    pub(crate) fn parse_response<S>(&mut self, core: &mut SessionCore<S>) -> OpResult {
        match self {
            FtpOperation::Connect(d) => logon::parse_response(d, core),
            FtpOperation::ChangeDir(d) => cwd::parse_response(d, core),
            FtpOperation::List(_) => {
                log::debug!("unexpected reply for listing operation");
                OpResult::ERROR
            }
            FtpOperation::Transfer(d) => transfer::parse_response(d, core),
            FtpOperation::RawTransfer(d) => rawtransfer::parse_response(d, core),
            FtpOperation::Mkdir(d) => mkd::parse_response(d, core),
            FtpOperation::RemoveDir(d) => remove_dir_parse_response(d, core),
            FtpOperation::Delete(d) => delete_parse_response(d, core),
            FtpOperation::Rename(d) => rename_parse_response(d, core),
            FtpOperation::Chmod(d) => chmod_parse_response(d, core),
            FtpOperation::Raw(_) => raw_command_parse_response(core),
        }
    }

    /// Resume after a nested operation completed with `prev`.
    pub(crate) fn subcommand_result<S>(
        &mut self,
        prev: OpResult,
        core: &mut SessionCore<S>,
    ) -> OpResult {
        match self {
            FtpOperation::ChangeDir(d) => cwd::subcommand_result(d, prev, core),
            FtpOperation::List(d) => list::subcommand_result(d, prev, core),
            FtpOperation::Transfer(d) => transfer::subcommand_result(d, prev, core),
            FtpOperation::Mkdir(_) => OpResult::CONTINUE,
            FtpOperation::RemoveDir(d) => {
                if !prev.is_ok() {
                    d.omit_path = false;
                } else if let Some(path) = core.current_path.clone() {
                    d.path = path;
                }
                OpResult::CONTINUE
            }
            FtpOperation::Delete(d) => {
                if !prev.is_ok() {
                    d.omit_path = false;
                }
                OpResult::CONTINUE
            }
            FtpOperation::Rename(d) => {
                if !prev.is_ok() {
                    d.use_absolute = true;
                }
                OpResult::CONTINUE
            }
            FtpOperation::Chmod(d) => {
                if !prev.is_ok() {
                    d.use_absolute = true;
                }
                OpResult::CONTINUE
            }
            _ => {
                log::debug!("subcommand result delivered to unexpected operation");
                OpResult {
                    outcome: OpOutcome::Error,
                    flags: crate::result::OpFlags::INTERNAL_ERROR,
                }
            }
        }
    }

    /// Per-line hooks of the logon operation (challenge accumulation, FEAT
    /// parsing, welcome sniffing). A returned result closes the session.
    pub(crate) fn on_line<S>(&mut self, core: &mut SessionCore<S>, line: &str) -> Option<OpResult> {
        match self {
            FtpOperation::Connect(d) => logon::on_line(d, core, line),
            _ => None,
        }
    }
}

pub(crate) struct DeleteOpData {
    pub(crate) path: RemotePath,
    pub(crate) files: VecDeque<String>,
    pub(crate) omit_path: bool,
    pub(crate) batcher: ListingChangeBatcher,
    /// Set when deletion of at least one file failed.
    pub(crate) delete_failed: bool,
}

impl DeleteOpData {
    pub(crate) fn push<S>(core: &mut SessionCore<S>, path: RemotePath, files: Vec<String>) {
        core.push_sub(FtpOperation::Delete(DeleteOpData {
            path: path.clone(),
            files: files.into(),
            omit_path: true,
            batcher: ListingChangeBatcher::default(),
            delete_failed: false,
        }));
        cwd::push(core, path, None, false);
    }
}

fn delete_send<S>(d: &mut DeleteOpData, core: &mut SessionCore<S>) -> OpResult {
    let Some(file) = d.files.front() else {
        log::debug!("delete operation without remaining files");
        return OpResult::error(crate::result::OpFlags::INTERNAL_ERROR);
    };
    if file.is_empty() {
        log::debug!("empty filename");
        return OpResult::error(crate::result::OpFlags::INTERNAL_ERROR);
    }
    let filename = d.path.format_filename(file, d.omit_path);

    core.dir_cache.invalidate_file(&d.path, file);

    core.send_command(&format!("DELE {filename}"));
    OpResult::WOULD_BLOCK
}

fn delete_parse_response<S>(d: &mut DeleteOpData, core: &mut SessionCore<S>) -> OpResult {
    if core.reply_is_positive() {
        if let Some(file) = d.files.front() {
            core.dir_cache.remove_file(&d.path, file);
        }
        d.batcher.changed(core.events.as_ref(), &d.path);
    } else {
        d.delete_failed = true;
    }

    d.files.pop_front();
    if !d.files.is_empty() {
        return OpResult::CONTINUE;
    }

    if d.delete_failed {
        OpResult::ERROR
    } else {
        OpResult::OK
    }
}

pub(crate) struct RemoveDirOpData {
    pub(crate) path: RemotePath,
    pub(crate) sub_dir: String,
    pub(crate) full_path: RemotePath,
    pub(crate) omit_path: bool,
}

impl RemoveDirOpData {
    pub(crate) fn push<S>(core: &mut SessionCore<S>, path: RemotePath, sub_dir: String) {
        let full_path = path.join(&sub_dir);
        core.push_sub(FtpOperation::RemoveDir(RemoveDirOpData {
            path: path.clone(),
            sub_dir,
            full_path,
            omit_path: true,
        }));
        cwd::push(core, path, None, false);
    }
}

fn remove_dir_send<S>(d: &mut RemoveDirOpData, core: &mut SessionCore<S>) -> OpResult {
    core.dir_cache.invalidate_file(&d.path, &d.sub_dir);
    core.path_cache.invalidate_path(&d.path, &d.sub_dir);

    if d.omit_path {
        core.send_command(&format!("RMD {}", d.sub_dir));
    } else {
        core.send_command(&format!("RMD {}", d.full_path));
    }
    OpResult::WOULD_BLOCK
}

fn remove_dir_parse_response<S>(d: &mut RemoveDirOpData, core: &mut SessionCore<S>) -> OpResult {
    if !core.reply_is_positive() {
        return OpResult::ERROR;
    }

    core.dir_cache.remove_dir(&d.path, &d.sub_dir);
    core.notify_listing_changed(&d.path);
    OpResult::OK
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RenameState {
    RnFrom,
    RnTo,
}

pub(crate) struct RenameOpData {
    pub(crate) from_path: RemotePath,
    pub(crate) from_file: String,
    pub(crate) to_path: RemotePath,
    pub(crate) to_file: String,
    pub(crate) use_absolute: bool,
    state: RenameState,
}

impl RenameOpData {
    pub(crate) fn push<S>(
        core: &mut SessionCore<S>,
        from_path: RemotePath,
        from_file: String,
        to_path: RemotePath,
        to_file: String,
    ) {
        core.push_sub(FtpOperation::Rename(RenameOpData {
            from_path: from_path.clone(),
            from_file,
            to_path,
            to_file,
            use_absolute: false,
            state: RenameState::RnFrom,
        }));
        cwd::push(core, from_path, None, false);
    }
}

fn rename_send<S>(d: &mut RenameOpData, core: &mut SessionCore<S>) -> OpResult {
    match d.state {
        RenameState::RnFrom => {
            let name = d.from_path.format_filename(&d.from_file, !d.use_absolute);
            core.send_command(&format!("RNFR {name}"));
        }
        RenameState::RnTo => {
            core.dir_cache.invalidate_file(&d.from_path, &d.from_file);
            core.dir_cache.invalidate_file(&d.to_path, &d.to_file);
            core.path_cache.invalidate_path(&d.from_path, &d.from_file);
            core.path_cache.invalidate_path(&d.to_path, &d.to_file);

            let omit = !d.use_absolute && d.from_path == d.to_path;
            let name = d.to_path.format_filename(&d.to_file, omit);
            core.send_command(&format!("RNTO {name}"));
        }
    }
    OpResult::WOULD_BLOCK
}

fn rename_parse_response<S>(d: &mut RenameOpData, core: &mut SessionCore<S>) -> OpResult {
    if !core.reply_is_positive() {
        return OpResult::ERROR;
    }

    match d.state {
        RenameState::RnFrom => {
            d.state = RenameState::RnTo;
            OpResult::CONTINUE
        }
        RenameState::RnTo => {
            core.dir_cache
                .rename(&d.from_path, &d.from_file, &d.to_path, &d.to_file);
            core.notify_listing_changed(&d.from_path);
            if d.from_path != d.to_path {
                core.notify_listing_changed(&d.to_path);
            }
            OpResult::OK
        }
    }
}

pub(crate) struct ChmodOpData {
    pub(crate) path: RemotePath,
    pub(crate) file: String,
    pub(crate) permission: String,
    pub(crate) use_absolute: bool,
}

impl ChmodOpData {
    pub(crate) fn push<S>(
        core: &mut SessionCore<S>,
        path: RemotePath,
        file: String,
        permission: String,
    ) {
        core.push_sub(FtpOperation::Chmod(ChmodOpData {
            path: path.clone(),
            file,
            permission,
            use_absolute: false,
        }));
        cwd::push(core, path, None, false);
    }
}

fn chmod_send<S>(d: &mut ChmodOpData, core: &mut SessionCore<S>) -> OpResult {
    let name = d.path.format_filename(&d.file, !d.use_absolute);
    core.send_command(&format!("SITE CHMOD {} {name}", d.permission));
    OpResult::WOULD_BLOCK
}

fn chmod_parse_response<S>(d: &mut ChmodOpData, core: &mut SessionCore<S>) -> OpResult {
    if !core.reply_is_positive() {
        return OpResult::ERROR;
    }

    core.dir_cache.update_file(&d.path, &d.file);
    core.notify_listing_changed(&d.path);
    OpResult::OK
}

pub(crate) struct RawCommandOpData {
    pub(crate) command: String,
}

fn raw_command_send<S>(d: &mut RawCommandOpData, core: &mut SessionCore<S>) -> OpResult {
    // A raw command can do anything; all cached knowledge is suspect after it.
    core.dir_cache.invalidate_server();
    core.path_cache.invalidate_server();
    core.current_path = None;
    core.last_type_binary = None;

    core.send_command_opts(&d.command, false, false);
    OpResult::WOULD_BLOCK
}

fn raw_command_parse_response<S>(core: &mut SessionCore<S>) -> OpResult {
    if core.reply_is_positive() {
        OpResult::OK
    } else {
        OpResult::ERROR
    }
}

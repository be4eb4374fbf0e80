/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::fs::{File, FileTimes, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;
use std::time::{Duration as StdDuration, UNIX_EPOCH};

use chrono::{DateTime, Utc};

use crate::caps::{CapabilityStatus, FtpCapability};
use crate::notify::{FileExistsRequest, OverwriteDecision};
use crate::path::RemotePath;
use crate::result::{OpFlags, OpResult};
use crate::session::SessionCore;
use crate::time::{ServerDateTime, TimeAccuracy};
use crate::transfer::{IoWorker, TransferEndReason, TransferMode};

use super::{cwd, list, rawtransfer, FtpOperation, TransferOpCtl};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FileTransferState {
    WaitCwd,
    WaitList,
    Size,
    Mdtm,
    ResumeTest,
    Transfer,
    WaitTransfer,
    WaitResumeTest,
    Mfmt,
}

/// Parameters of a download or upload handed in by the embedder.
#[derive(Clone, Debug)]
pub struct FileTransferRequest {
    pub download: bool,
    pub local_path: PathBuf,
    pub remote_path: RemotePath,
    pub remote_file: String,
    pub resume: bool,
    pub binary: bool,
}

pub(crate) struct FileTransferOpData {
    pub(crate) ctl: TransferOpCtl,
    state: FileTransferState,
    pub(crate) wait_async: bool,
    pub(crate) local_path: PathBuf,
    remote_path: RemotePath,
    remote_file: String,
    resume: bool,
    pub(crate) local_file_size: Option<u64>,
    remote_file_size: Option<u64>,
    file_time: Option<ServerDateTime>,
    try_absolute_path: bool,
    pub(crate) file_did_exist: bool,
    pub(crate) io_worker: Option<IoWorker>,
}

impl FileTransferOpData {
    pub(crate) fn push<S>(core: &mut SessionCore<S>, req: FileTransferRequest) {
        let local_file_size = std::fs::metadata(&req.local_path)
            .ok()
            .filter(|m| m.is_file())
            .map(|m| m.len());

        let remote_path = req.remote_path.clone();
        let download = req.download;
        core.push_sub(FtpOperation::Transfer(FileTransferOpData {
            ctl: TransferOpCtl::new(req.download, req.binary),
            state: FileTransferState::WaitCwd,
            wait_async: false,
            local_path: req.local_path,
            remote_path: req.remote_path,
            remote_file: req.remote_file,
            resume: req.resume,
            local_file_size,
            remote_file_size: None,
            file_time: None,
            try_absolute_path: false,
            file_did_exist: false,
            io_worker: None,
        }));
        // an upload into a missing remote directory may create it
        cwd::push(core, remote_path, None, !download);
    }

    fn format_remote(&self) -> String {
        self.remote_path
            .format_filename(&self.remote_file, !self.try_absolute_path)
    }

    fn lookup_dir(&self, current: &Option<RemotePath>) -> RemotePath {
        if self.try_absolute_path {
            self.remote_path.clone()
        } else {
            current.clone().unwrap_or_else(|| self.remote_path.clone())
        }
    }
}

fn want_mdtm<S>(d: &FileTransferOpData, core: &SessionCore<S>) -> bool {
    d.ctl.download
        && core.options.preserve_timestamps
        && core.caps.status(FtpCapability::MdtmCommand) == CapabilityStatus::Yes
}

/// Consult the listing cache after a CWD or LIST and pick the next probe.
fn pick_state_from_cache<S>(
    d: &mut FileTransferOpData,
    core: &mut SessionCore<S>,
    after_list: bool,
) -> FileTransferState {
    let dir = d.lookup_dir(&core.current_path);
    let lookup = core.dir_cache.lookup_file(&dir, &d.remote_file);

    match lookup.entry {
        None => {
            if !lookup.dir_was_cached {
                if after_list {
                    FileTransferState::Size
                } else {
                    FileTransferState::WaitList
                }
            } else if want_mdtm(d, core) {
                FileTransferState::Mdtm
            } else {
                FileTransferState::ResumeTest
            }
        }
        Some(entry) => {
            if entry.unsure {
                if after_list {
                    FileTransferState::Size
                } else {
                    FileTransferState::WaitList
                }
            } else if lookup.case_matched {
                d.remote_file_size = entry.size;
                if entry.has_date() {
                    d.file_time = entry.time;
                }
                if want_mdtm(d, core) && !entry.has_time() {
                    FileTransferState::Mdtm
                } else {
                    FileTransferState::ResumeTest
                }
            } else {
                FileTransferState::Size
            }
        }
    }
}

/// Synchronous phase before opening the local file: ask the embedder about
/// an existing target unless the caller already decided.
fn check_overwrite_file<S>(d: &mut FileTransferOpData, core: &mut SessionCore<S>) -> OpResult {
    if d.resume {
        return OpResult::OK;
    }
    let conflict = if d.ctl.download {
        d.local_file_size.is_some()
    } else {
        d.remote_file_size.is_some()
    };
    if !conflict {
        return OpResult::OK;
    }

    core.events.request_file_exists(FileExistsRequest {
        download: d.ctl.download,
        local_path: d.local_path.clone(),
        remote_path: d.remote_path.clone(),
        remote_file: d.remote_file.clone(),
        local_size: d.local_file_size,
        remote_size: d.remote_file_size,
        remote_time: d.file_time,
    });
    d.wait_async = true;
    OpResult::WOULD_BLOCK
}

/// The embedder's overwrite decision arrived.
pub(crate) fn on_overwrite_decision<S>(
    d: &mut FileTransferOpData,
    _core: &mut SessionCore<S>,
    decision: OverwriteDecision,
) -> OpResult {
    match decision {
        OverwriteDecision::Skip => OpResult::OK,
        OverwriteDecision::Overwrite => {
            d.resume = false;
            OpResult::CONTINUE
        }
        OverwriteDecision::Resume => {
            d.resume = true;
            OpResult::CONTINUE
        }
    }
}

pub(crate) fn subcommand_result<S>(
    d: &mut FileTransferOpData,
    prev: OpResult,
    core: &mut SessionCore<S>,
) -> OpResult {
    match d.state {
        FileTransferState::WaitCwd => {
            if prev.is_ok() {
                d.state = pick_state_from_cache(d, core, false);
                if d.state == FileTransferState::WaitList {
                    // list the directory CWD left us in
                    list::ListOpData::push(core, None, true);
                    return OpResult::CONTINUE;
                }
                if d.state == FileTransferState::ResumeTest {
                    let r = check_overwrite_file(d, core);
                    if !r.is_ok() {
                        return r;
                    }
                }
            } else {
                d.try_absolute_path = true;
                d.state = FileTransferState::Size;
            }
            OpResult::CONTINUE
        }
        FileTransferState::WaitList => {
            if prev.is_ok() {
                d.state = pick_state_from_cache(d, core, true);
                if d.state == FileTransferState::ResumeTest {
                    let r = check_overwrite_file(d, core);
                    if !r.is_ok() {
                        return r;
                    }
                }
            } else {
                d.state = FileTransferState::Size;
            }
            OpResult::CONTINUE
        }
        FileTransferState::WaitTransfer => {
            if prev.is_ok() && !d.ctl.download {
                // the remote entry changed under us
                let dir = d.lookup_dir(&core.current_path);
                core.dir_cache.update_file(&dir, &d.remote_file);
                core.notify_listing_changed(&dir);
            }
            if prev.is_ok() && core.options.preserve_timestamps {
                if !d.ctl.download
                    && core.caps.status(FtpCapability::MfmtCommand) == CapabilityStatus::Yes
                {
                    if let Some(mtime) = local_modification_time(&d.local_path) {
                        d.file_time = Some(mtime);
                        d.state = FileTransferState::Mfmt;
                        return OpResult::CONTINUE;
                    }
                } else if d.ctl.download {
                    if let Some(t) = d.file_time {
                        // join the worker first so the write is complete
                        d.io_worker = None;
                        if !set_local_modification_time(&d.local_path, &t) {
                            log::debug!("could not set modification time");
                        }
                    }
                }
            }
            prev
        }
        FileTransferState::WaitResumeTest => {
            let local_size = d.local_file_size.unwrap_or(0);
            let cap = if local_size >= (1u64 << 32) {
                FtpCapability::Resume4GbBug
            } else {
                FtpCapability::Resume2GbBug
            };
            if !prev.is_ok() {
                if d.ctl.end_reason == TransferEndReason::FailedResumeTest {
                    core.caps.set(cap, CapabilityStatus::Yes);
                    log::error!(
                        "server does not support resume of files > {} GB",
                        if cap == FtpCapability::Resume4GbBug { 4 } else { 2 }
                    );
                    return prev.with(OpFlags::CRITICAL);
                }
                return prev;
            }
            core.caps.set(cap, CapabilityStatus::No);
            d.state = FileTransferState::Transfer;
            OpResult::CONTINUE
        }
        _ => {
            log::debug!("subcommand result at unexpected transfer state");
            OpResult::error(OpFlags::INTERNAL_ERROR)
        }
    }
}

pub(crate) fn parse_response<S>(d: &mut FileTransferOpData, core: &mut SessionCore<S>) -> OpResult {
    match d.state {
        FileTransferState::Size => {
            if !core.reply_is_positive() {
                let reply_lower = core
                    .reply()
                    .map(|r| r.text.to_lowercase())
                    .unwrap_or_default();
                let tail_lower = core
                    .reply()
                    .and_then(|r| r.tail())
                    .map(|t| t.to_lowercase())
                    .unwrap_or_default();
                let name_lower = d.format_remote().to_lowercase();
                // Heuristic: a missing remote file makes MDTM pointless.
                // Careful with filenames that contain the phrase themselves.
                if core.caps.status(FtpCapability::SizeCommand) == CapabilityStatus::Yes
                    || tail_lower == "file not found"
                    || (!name_lower.contains("file not found")
                        && reply_lower.contains("file not found"))
                {
                    d.state = FileTransferState::ResumeTest;
                    let r = check_overwrite_file(d, core);
                    if !r.is_ok() {
                        return r;
                    }
                } else {
                    d.state = FileTransferState::Mdtm;
                }
            } else {
                d.state = FileTransferState::Mdtm;
                let tail = core.reply().and_then(|r| {
                    if r.text.starts_with("213 ") {
                        r.tail().map(|t| t.to_string())
                    } else {
                        None
                    }
                });
                match tail {
                    Some(tail) => {
                        core.caps
                            .set_if_unknown(FtpCapability::SizeCommand, CapabilityStatus::Yes);
                        if let Some(size) = atoi::atoi::<u64>(tail.as_bytes()) {
                            d.remote_file_size = Some(size);
                        }
                    }
                    None => log::debug!("invalid SIZE reply"),
                }
            }
            OpResult::CONTINUE
        }
        FileTransferState::Mdtm => {
            d.state = FileTransferState::ResumeTest;
            if let Some(r) = core.reply() {
                if r.text.starts_with("213 ") && r.text.len() > 16 {
                    if let Some(t) = ServerDateTime::parse_mdtm(&r.text[4..]) {
                        d.file_time = Some(t.add_minutes(core.server.timezone_offset_minutes));
                    }
                }
            }

            let r = check_overwrite_file(d, core);
            if !r.is_ok() {
                return r;
            }
            OpResult::CONTINUE
        }
        FileTransferState::Mfmt => {
            if core.reply_is_positive() {
                OpResult::OK
            } else {
                // the upload itself went through, only the timestamp didn't
                log::error!("server rejected MFMT");
                OpResult::ERROR
            }
        }
        _ => {
            log::debug!("reply at unexpected transfer state");
            OpResult::ERROR
        }
    }
}

pub(crate) fn send<S>(d: &mut FileTransferOpData, core: &mut SessionCore<S>) -> OpResult {
    match d.state {
        FileTransferState::Size => {
            core.send_command(&format!("SIZE {}", d.format_remote()));
            OpResult::WOULD_BLOCK
        }
        FileTransferState::Mdtm => {
            core.send_command(&format!("MDTM {}", d.format_remote()));
            OpResult::WOULD_BLOCK
        }
        FileTransferState::ResumeTest | FileTransferState::Transfer => open_and_transfer(d, core),
        FileTransferState::Mfmt => {
            let Some(t) = d.file_time else {
                return OpResult::error(OpFlags::INTERNAL_ERROR);
            };
            // MFMT takes UTC; undo the display-side timezone correction
            let t = t.add_minutes(-core.server.timezone_offset_minutes);
            core.send_command(&format!("MFMT {} {}", t.format_mfmt(), d.format_remote()));
            OpResult::WOULD_BLOCK
        }
        _ => {
            log::debug!("send at unexpected transfer state {:?}", d.state);
            OpResult::error(OpFlags::INTERNAL_ERROR)
        }
    }
}

enum ResumeTestOutcome {
    Proceed,
    /// Sizes match despite a (possible) resume bug; surfaced as success.
    Complete,
    ProbeStarted,
    Fail,
}

/// Check resume capabilities around the 2 GiB and 4 GiB server bugs before
/// restarting a download.
fn test_resume_capability<S>(
    d: &mut FileTransferOpData,
    core: &mut SessionCore<S>,
) -> ResumeTestOutcome {
    if !d.ctl.download {
        return ResumeTestOutcome::Proceed;
    }

    let local_size = d.local_file_size.unwrap_or(0);
    let remote_size = d.remote_file_size.unwrap_or(0);

    for (threshold, cap, gb) in [
        (1u64 << 32, FtpCapability::Resume4GbBug, 4u32),
        (1u64 << 31, FtpCapability::Resume2GbBug, 2u32),
    ] {
        if local_size < threshold {
            continue;
        }
        match core.caps.status(cap) {
            CapabilityStatus::Yes => {
                if remote_size == local_size {
                    log::debug!(
                        "server does not support resume of files > {gb} GB, ending transfer since file sizes match"
                    );
                    return ResumeTestOutcome::Complete;
                }
                log::error!("server does not support resume of files > {gb} GB");
                return ResumeTestOutcome::Fail;
            }
            CapabilityStatus::Unknown => {
                if remote_size < local_size {
                    // nothing to probe against
                    continue;
                }
                if remote_size == local_size {
                    log::debug!(
                        "server may not support resume of files > {gb} GB, ending transfer since file sizes match"
                    );
                    return ResumeTestOutcome::Complete;
                }
                log::info!("testing resume capabilities of server");

                d.state = FileTransferState::WaitResumeTest;
                d.ctl.resume_offset = remote_size - 1;
                d.ctl.end_reason = TransferEndReason::Successful;
                d.ctl.command_sent = false;

                core.create_transfer_socket(TransferMode::ResumeTest, d.ctl.binary);
                rawtransfer::push(core, format!("RETR {}", d.format_remote()), &d.ctl);
                return ResumeTestOutcome::ProbeStarted;
            }
            CapabilityStatus::No => {}
        }
    }

    ResumeTestOutcome::Proceed
}

fn open_and_transfer<S>(d: &mut FileTransferOpData, core: &mut SessionCore<S>) -> OpResult {
    core.drop_transfer_socket();

    let did_exist = d.local_path.exists();
    let file = if d.ctl.download {
        let mut start_offset = 0u64;
        let mut file = if d.resume {
            match OpenOptions::new().write(true).open(&d.local_path) {
                Ok(f) => f,
                Err(e) => {
                    log::error!(
                        "failed to open {} for appending/writing: {e}",
                        d.local_path.display()
                    );
                    return OpResult::ERROR;
                }
            }
        } else {
            if let Some(parent) = d.local_path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    log::debug!("could not create local directory: {e}");
                }
            }
            match OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&d.local_path)
            {
                Ok(f) => f,
                Err(e) => {
                    log::error!("failed to open {} for writing: {e}", d.local_path.display());
                    return OpResult::ERROR;
                }
            }
        };
        d.file_did_exist = did_exist;

        if d.resume {
            match file.seek(SeekFrom::End(0)) {
                Ok(offset) => start_offset = offset,
                Err(e) => {
                    log::error!("could not seek to the end of the file: {e}");
                    return OpResult::ERROR;
                }
            }
        }
        d.local_file_size = Some(start_offset);
        d.ctl.resume_offset = if d.resume { start_offset } else { 0 };

        if d.state == FileTransferState::ResumeTest {
            match test_resume_capability(d, core) {
                ResumeTestOutcome::Proceed => {}
                ResumeTestOutcome::Complete => return OpResult::CANCELED,
                ResumeTestOutcome::ProbeStarted => return OpResult::CONTINUE,
                ResumeTestOutcome::Fail => return OpResult::error(OpFlags::CRITICAL),
            }
        }

        if core.options.preallocate_space {
            if let Some(remote_size) = d.remote_file_size {
                // grow the file up front to reduce fragmentation
                if remote_size > start_offset {
                    log::debug!(
                        "preallocating {} bytes for {}",
                        remote_size - start_offset,
                        d.local_path.display()
                    );
                    match file.stream_position() {
                        Ok(old_pos) => {
                            if let Err(e) = file.set_len(remote_size) {
                                log::debug!("could not preallocate the file: {e}");
                            }
                            if let Err(e) = file.seek(SeekFrom::Start(old_pos)) {
                                log::debug!("could not restore the file position: {e}");
                            }
                        }
                        Err(e) => log::debug!("could not query the file position: {e}"),
                    }
                }
            }
        }
        file
    } else {
        let mut file = match File::open(&d.local_path) {
            Ok(f) => f,
            Err(e) => {
                log::error!("failed to open {} for reading: {e}", d.local_path.display());
                return OpResult::ERROR;
            }
        };

        let mut start_offset = 0u64;
        if d.resume {
            if let Some(remote_size) = d.remote_file_size.filter(|s| *s > 0) {
                start_offset = remote_size;

                if d.local_file_size.is_none() {
                    d.local_file_size = file.metadata().ok().map(|m| m.len());
                }

                if Some(start_offset) == d.local_file_size && d.ctl.binary {
                    log::debug!("no need to resume, remote file size matches local file size");
                    if core.options.preserve_timestamps
                        && core.caps.status(FtpCapability::MfmtCommand) == CapabilityStatus::Yes
                    {
                        if let Some(mtime) = local_modification_time(&d.local_path) {
                            d.file_time = Some(mtime);
                            d.state = FileTransferState::Mfmt;
                            return OpResult::CONTINUE;
                        }
                    }
                    return OpResult::OK;
                }

                if let Err(e) = file.seek(SeekFrom::Start(start_offset)) {
                    log::error!("could not seek to offset {start_offset} within file: {e}");
                    return OpResult::ERROR;
                }
            }
        }

        d.ctl.resume_offset =
            if core.caps.status(FtpCapability::RestStream) == CapabilityStatus::Yes {
                // REST + STOR
                start_offset
            } else {
                // play it safe with APPE
                0
            };
        file
    };

    let (worker, handle) = match IoWorker::create(
        &core.io_pool,
        file,
        d.ctl.download,
        d.ctl.binary,
        core.config.transfer.io_buffer_size,
    ) {
        Ok(v) => v,
        Err(e) => {
            log::error!("could not spawn io worker: {e}");
            return OpResult::ERROR;
        }
    };
    d.io_worker = Some(worker);

    let mode = if d.ctl.download {
        TransferMode::Download
    } else {
        TransferMode::Upload
    };
    core.create_transfer_socket(mode, d.ctl.binary);
    core.set_transfer_io_worker(handle);

    let verb = if d.ctl.download {
        "RETR"
    } else if d.resume
        && core.caps.status(FtpCapability::RestStream) != CapabilityStatus::Yes
    {
        "APPE"
    } else {
        // REST was prepared above when resuming
        "STOR"
    };

    d.ctl.end_reason = TransferEndReason::Successful;
    d.ctl.command_sent = false;
    d.state = FileTransferState::WaitTransfer;
    rawtransfer::push(core, format!("{verb} {}", d.format_remote()), &d.ctl);
    OpResult::CONTINUE
}

fn local_modification_time(path: &std::path::Path) -> Option<ServerDateTime> {
    let mtime = std::fs::metadata(path).ok()?.modified().ok()?;
    let dt: DateTime<Utc> = mtime.into();
    Some(ServerDateTime::new(dt, TimeAccuracy::Seconds))
}

fn set_local_modification_time(path: &std::path::Path, t: &ServerDateTime) -> bool {
    let ts = t.datetime().timestamp_millis();
    if ts < 0 {
        return false;
    }
    let st = UNIX_EPOCH + StdDuration::from_millis(ts as u64);
    let Ok(file) = OpenOptions::new().append(true).open(path) else {
        return false;
    };
    file.set_times(FileTimes::new().set_modified(st)).is_ok()
}

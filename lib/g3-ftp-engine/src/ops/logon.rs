/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use crate::caps::{CapabilityStatus, FtpCapability};
use crate::config::{ControlCharset, FtpProtocol};
use crate::result::{OpFlags, OpResult};
use crate::session::SessionCore;

use super::FtpOperation;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
enum LogonState {
    /// Waiting for the server greeting.
    Welcome,
    AuthTls,
    /// TLS handshake and certificate decision in progress.
    AuthWait,
    Logon,
    Feat,
    Clnt,
    OptsUtf8,
    Pbsz,
    Prot,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum LogonCmd {
    User,
    Pass,
    Acct,
}

pub(crate) struct LogonOpData {
    state: LogonState,
    pub(crate) wait_async: bool,
    next_cmd: LogonCmd,
    got_first_welcome_line: bool,
    /// Accumulates greeting and login reply lines for interactive prompts.
    wait_challenge: bool,
    challenge: String,
    auth_ssl_tried: bool,
}

impl LogonOpData {
    pub(crate) fn push<S>(core: &mut SessionCore<S>) {
        if core.server.protocol == FtpProtocol::Ftps {
            // implicit TLS wraps the connection before the greeting
            core.tls_handshake_requested = true;
        }
        core.pending_replies = 1;
        core.replies_to_skip = 0;
        core.push_sub(FtpOperation::Connect(LogonOpData {
            state: LogonState::Welcome,
            wait_async: false,
            next_cmd: LogonCmd::User,
            got_first_welcome_line: false,
            wait_challenge: true,
            challenge: String::new(),
            auth_ssl_tried: false,
        }));
    }
}

fn has_feature(line: &str, feature: &str) -> bool {
    if line == feature {
        return true;
    }
    line.len() > feature.len()
        && line.starts_with(feature)
        && line.as_bytes()[feature.len()] == b' '
}

fn parse_feat<S>(core: &mut SessionCore<S>, line: &str) {
    let line = line.trim();
    let up = line.to_uppercase();

    if has_feature(&up, "UTF8") {
        core.caps
            .set(FtpCapability::Utf8Command, CapabilityStatus::Yes);
    } else if has_feature(&up, "CLNT") {
        core.caps
            .set(FtpCapability::ClntCommand, CapabilityStatus::Yes);
    } else if has_feature(&up, "MLSD") {
        // FEAT output for MLST overrides MLSD
        let mut facts = match (
            core.caps.status(FtpCapability::MlsdCommand),
            core.caps.payload(FtpCapability::MlsdCommand),
        ) {
            (CapabilityStatus::Yes, Some(f)) if !f.is_empty() => f.to_string(),
            _ => String::new(),
        };
        if facts.is_empty() && line.len() > 5 {
            facts = line[5..].to_string();
        }
        core.caps
            .set_with(FtpCapability::MlsdCommand, CapabilityStatus::Yes, Some(facts));
    } else if has_feature(&up, "MLST") {
        let facts = if line.len() > 5 {
            line[5..].to_string()
        } else {
            // keep earlier MLSD facts when MLST lists none
            core.caps
                .payload(FtpCapability::MlsdCommand)
                .unwrap_or_default()
                .to_string()
        };
        core.caps
            .set_with(FtpCapability::MlsdCommand, CapabilityStatus::Yes, Some(facts));
    } else if has_feature(&up, "MODE Z") {
        core.caps
            .set(FtpCapability::ModeZSupport, CapabilityStatus::Yes);
    } else if has_feature(&up, "MFMT") {
        core.caps
            .set(FtpCapability::MfmtCommand, CapabilityStatus::Yes);
    } else if has_feature(&up, "MDTM") {
        core.caps
            .set(FtpCapability::MdtmCommand, CapabilityStatus::Yes);
    } else if has_feature(&up, "SIZE") {
        core.caps
            .set(FtpCapability::SizeCommand, CapabilityStatus::Yes);
    } else if has_feature(&up, "TVFS") {
        core.caps
            .set(FtpCapability::TvfsSupport, CapabilityStatus::Yes);
    } else if has_feature(&up, "REST STREAM") {
        core.caps
            .set(FtpCapability::RestStream, CapabilityStatus::Yes);
    } else if has_feature(&up, "EPSV") {
        core.caps
            .set(FtpCapability::EpsvCommand, CapabilityStatus::Yes);
    }
}

pub(crate) fn on_line<S>(
    d: &mut LogonOpData,
    core: &mut SessionCore<S>,
    line: &str,
) -> Option<OpResult> {
    if d.state == LogonState::Welcome && !d.got_first_welcome_line {
        d.got_first_welcome_line = true;
        if line.to_lowercase().starts_with("ssh") {
            log::error!(
                "cannot establish FTP connection to an SFTP server, select the proper protocol"
            );
            return Some(OpResult::error(OpFlags::CRITICAL));
        }
    }

    if d.wait_challenge {
        if !d.challenge.is_empty() {
            d.challenge.push('\n');
        }
        d.challenge.push_str(line);
    } else if d.state == LogonState::Feat {
        parse_feat(core, line);
    }

    None
}

fn uses_tls<S>(core: &SessionCore<S>) -> bool {
    core.server.protocol != FtpProtocol::Ftp
}

/// The post-login negotiation chain, in order: FEAT, CLNT, OPTS UTF8,
/// PBSZ/PROT for TLS sessions. Returns `None` when nothing is left.
fn next_negotiation<S>(core: &SessionCore<S>, after: LogonState) -> Option<LogonState> {
    if after < LogonState::Clnt
        && core.caps.status(FtpCapability::ClntCommand) == CapabilityStatus::Yes
    {
        return Some(LogonState::Clnt);
    }
    if after < LogonState::OptsUtf8
        && core.caps.status(FtpCapability::Utf8Command) == CapabilityStatus::Yes
        && core.server.charset != ControlCharset::Latin1
    {
        return Some(LogonState::OptsUtf8);
    }
    if after < LogonState::Pbsz && uses_tls(core) {
        return Some(LogonState::Pbsz);
    }
    None
}

pub(crate) fn send<S>(d: &mut LogonOpData, core: &mut SessionCore<S>) -> OpResult {
    match d.state {
        LogonState::Welcome | LogonState::AuthWait => OpResult::WOULD_BLOCK,
        LogonState::AuthTls => {
            if d.auth_ssl_tried {
                core.send_command("AUTH SSL");
            } else {
                core.send_command("AUTH TLS");
            }
            OpResult::WOULD_BLOCK
        }
        LogonState::Logon => match d.next_cmd {
            LogonCmd::User => {
                core.send_command(&format!("USER {}", core.server.username.clone()));
                OpResult::WOULD_BLOCK
            }
            LogonCmd::Pass => match core.server.password.clone() {
                Some(password) => {
                    core.send_command_opts(&format!("PASS {password}"), true, true);
                    OpResult::WOULD_BLOCK
                }
                None => {
                    // the server wants a password and none is configured
                    core.events.request_interactive_login(&d.challenge);
                    d.wait_async = true;
                    OpResult::WOULD_BLOCK
                }
            },
            LogonCmd::Acct => match core.server.account.clone() {
                Some(account) => {
                    core.send_command(&format!("ACCT {account}"));
                    OpResult::WOULD_BLOCK
                }
                None => {
                    log::error!("server requested an account and none is configured");
                    OpResult::error(OpFlags::CRITICAL)
                }
            },
        },
        LogonState::Feat => {
            core.send_command("FEAT");
            OpResult::WOULD_BLOCK
        }
        LogonState::Clnt => {
            core.send_command("CLNT g3-ftp-engine");
            OpResult::WOULD_BLOCK
        }
        LogonState::OptsUtf8 => {
            core.send_command("OPTS UTF8 ON");
            OpResult::WOULD_BLOCK
        }
        LogonState::Pbsz => {
            core.send_command("PBSZ 0");
            OpResult::WOULD_BLOCK
        }
        LogonState::Prot => {
            core.send_command("PROT P");
            OpResult::WOULD_BLOCK
        }
    }
}

fn advance_negotiation<S>(d: &mut LogonOpData, core: &SessionCore<S>) -> OpResult {
    match next_negotiation(core, d.state) {
        Some(state) => {
            d.state = state;
            OpResult::CONTINUE
        }
        None => OpResult::OK,
    }
}

pub(crate) fn parse_response<S>(d: &mut LogonOpData, core: &mut SessionCore<S>) -> OpResult {
    let class = core.reply_class();
    match d.state {
        LogonState::Welcome => {
            if class == 1 {
                // 120: service not ready yet, keep waiting
                return OpResult::WOULD_BLOCK;
            }
            if class != 2 {
                return OpResult::ERROR;
            }
            if core.server.protocol == FtpProtocol::Ftpes {
                d.state = LogonState::AuthTls;
            } else {
                d.state = LogonState::Logon;
            }
            OpResult::CONTINUE
        }
        LogonState::AuthTls => {
            if class == 2 || class == 3 {
                core.tls_handshake_requested = true;
                d.state = LogonState::AuthWait;
                OpResult::WOULD_BLOCK
            } else if !d.auth_ssl_tried {
                d.auth_ssl_tried = true;
                OpResult::CONTINUE
            } else {
                OpResult::error(OpFlags::CRITICAL)
            }
        }
        LogonState::AuthWait => {
            log::debug!("unexpected reply during TLS handshake");
            OpResult::WOULD_BLOCK
        }
        LogonState::Logon => match d.next_cmd {
            LogonCmd::User => {
                if class == 2 {
                    d.wait_challenge = false;
                    d.state = LogonState::Feat;
                    OpResult::CONTINUE
                } else if class == 3 {
                    if core.reply_code() == 332 {
                        d.next_cmd = LogonCmd::Acct;
                    } else {
                        d.next_cmd = LogonCmd::Pass;
                    }
                    OpResult::CONTINUE
                } else {
                    OpResult::ERROR
                }
            }
            LogonCmd::Pass => {
                if class == 2 {
                    d.wait_challenge = false;
                    d.state = LogonState::Feat;
                    OpResult::CONTINUE
                } else if class == 3 {
                    d.next_cmd = LogonCmd::Acct;
                    OpResult::CONTINUE
                } else {
                    OpResult::error(OpFlags::PASSWORD_FAILED)
                }
            }
            LogonCmd::Acct => {
                if class == 2 {
                    d.wait_challenge = false;
                    d.state = LogonState::Feat;
                    OpResult::CONTINUE
                } else {
                    OpResult::ERROR
                }
            }
        },
        LogonState::Feat => {
            // continuation lines were parsed as they arrived; a server
            // without FEAT is fine too
            advance_negotiation(d, core)
        }
        LogonState::Clnt => {
            // result does not matter
            advance_negotiation(d, core)
        }
        LogonState::OptsUtf8 => {
            if class == 2 {
                core.set_utf8();
            }
            advance_negotiation(d, core)
        }
        LogonState::Pbsz => {
            if class != 2 {
                return OpResult::ERROR;
            }
            d.state = LogonState::Prot;
            OpResult::CONTINUE
        }
        LogonState::Prot => {
            if class != 2 {
                return OpResult::ERROR;
            }
            core.data_protected = true;
            OpResult::OK
        }
    }
}

/// Called by the dispatcher once the TLS handshake finished.
pub(crate) fn tls_established(d: &mut LogonOpData) {
    if d.state == LogonState::AuthWait {
        d.state = LogonState::Logon;
    }
}

/// Interactive password arrived; resume the USER/PASS sequence.
pub(crate) fn password_provided(d: &mut LogonOpData) {
    d.next_cmd = LogonCmd::Pass;
}

/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::net::{IpAddr, SocketAddr};

use crate::caps::{CapabilityStatus, FtpCapability};
use crate::config::PassivePreference;
use crate::resolver::{self, ExternalIpChoice};
use crate::result::{OpFlags, OpResult};
use crate::session::SessionCore;
use crate::transfer::TransferEndReason;

use super::{FtpOperation, TransferOpCtl};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RawTransferState {
    Type,
    PortPasv,
    Rest,
    Transfer,
    /// Preliminary reply received, data channel still live.
    WaitFinish,
    /// Data channel done, waiting for the final control reply.
    WaitTransfer,
    /// Final control reply received, waiting for the data channel.
    WaitSocket,
    /// Data channel ended before any reply to the transfer command.
    WaitTransferPre,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PortCmd {
    Epsv,
    Pasv,
    Eprt,
    Port,
}

pub(crate) struct RawTransferOpData {
    cmd: String,
    pub(crate) state: RawTransferState,
    pasv: bool,
    tried_pasv: bool,
    tried_active: bool,
    binary: bool,
    resume_offset: u64,
    /// Mirrored into the parent's [`TransferOpCtl`] when this operation is
    /// popped off the stack.
    pub(crate) command_sent: bool,
    pub(crate) failure_reason: Option<TransferEndReason>,
    pub(crate) socket_end_reason: Option<TransferEndReason>,
    last_port_cmd: Option<PortCmd>,
}

/// Queue the raw-transfer sub-operation. The caller has already created the
/// transfer socket and reset its `TransferOpCtl` for a fresh attempt.
pub(crate) fn push<S>(core: &mut SessionCore<S>, cmd: String, ctl: &TransferOpCtl) {
    let pasv = if core.proxied {
        // only passive works through a proxy
        true
    } else {
        match core.server.passive_mode {
            PassivePreference::Passive => true,
            PassivePreference::Active => false,
            PassivePreference::Default => core.options.use_pasv,
        }
    };

    let state = if core.last_type_binary == Some(ctl.binary) {
        RawTransferState::PortPasv
    } else {
        RawTransferState::Type
    };

    core.push_sub(FtpOperation::RawTransfer(RawTransferOpData {
        cmd,
        state,
        pasv,
        tried_pasv: false,
        tried_active: core.proxied,
        binary: ctl.binary,
        resume_offset: ctl.resume_offset,
        command_sent: false,
        failure_reason: None,
        socket_end_reason: None,
        last_port_cmd: None,
    }));
}

fn control_is_ipv6<S>(core: &SessionCore<S>) -> bool {
    core.local_ip().map(|ip| ip.is_ipv6()).unwrap_or(false)
}

pub(crate) fn send<S>(d: &mut RawTransferOpData, core: &mut SessionCore<S>) -> OpResult {
    match d.state {
        RawTransferState::Type => {
            if d.binary {
                core.send_command("TYPE I");
            } else {
                core.send_command("TYPE A");
            }
            OpResult::WOULD_BLOCK
        }
        RawTransferState::PortPasv => {
            if d.pasv {
                let use_epsv = control_is_ipv6(core)
                    || core.caps.status(FtpCapability::EpsvCommand) != CapabilityStatus::No;
                if use_epsv {
                    d.last_port_cmd = Some(PortCmd::Epsv);
                    core.send_command("EPSV");
                } else {
                    d.last_port_cmd = Some(PortCmd::Pasv);
                    core.send_command("PASV");
                }
                return OpResult::WOULD_BLOCK;
            }

            let local_ip = core.local_ip();
            let listen_addr = {
                let Some(ts) = core.transfer_socket.as_mut() else {
                    log::debug!("no transfer socket for active mode");
                    return OpResult::error(OpFlags::INTERNAL_ERROR);
                };
                match ts.listen() {
                    Ok(addr) => addr,
                    Err(e) => {
                        log::error!("unable to listen for active data connection: {e}");
                        return OpResult::ERROR;
                    }
                }
            };

            if control_is_ipv6(core) {
                let ip = local_ip.unwrap_or(listen_addr.ip());
                d.last_port_cmd = Some(PortCmd::Eprt);
                core.send_command(&format!("EPRT |2|{ip}|{}|", listen_addr.port()));
                return OpResult::WOULD_BLOCK;
            }

            let advertised = match (local_ip, core.peer_ip()) {
                (Some(local), Some(peer)) => {
                    match resolver::choose_external_ip(
                        &core.options,
                        local,
                        peer,
                        core.resolved_external_ip,
                    ) {
                        ExternalIpChoice::Ready(ip) => ip,
                        ExternalIpChoice::Local => local,
                        ExternalIpChoice::NeedResolve => {
                            if core.start_ip_resolution() {
                                return OpResult::WOULD_BLOCK;
                            }
                            // no resolver wired up, fall back to local
                            local
                        }
                    }
                }
                _ => listen_addr.ip(),
            };

            let IpAddr::V4(v4) = advertised else {
                log::debug!("cannot advertise a v6 address in PORT");
                return OpResult::ERROR;
            };
            let [h1, h2, h3, h4] = v4.octets();
            let port = listen_addr.port();
            d.last_port_cmd = Some(PortCmd::Port);
            core.send_command(&format!(
                "PORT {h1},{h2},{h3},{h4},{},{}",
                port >> 8,
                port & 0xff
            ));
            OpResult::WOULD_BLOCK
        }
        RawTransferState::Rest => {
            core.send_command(&format!("REST {}", d.resume_offset));
            OpResult::WOULD_BLOCK
        }
        RawTransferState::Transfer => {
            d.command_sent = true;
            core.send_command(&d.cmd);
            OpResult::WOULD_BLOCK
        }
        RawTransferState::WaitFinish
        | RawTransferState::WaitTransfer
        | RawTransferState::WaitSocket
        | RawTransferState::WaitTransferPre => OpResult::WOULD_BLOCK,
    }
}

fn after_port_established(d: &mut RawTransferOpData) -> OpResult {
    d.state = if d.resume_offset > 0 {
        RawTransferState::Rest
    } else {
        RawTransferState::Transfer
    };
    OpResult::CONTINUE
}

fn fall_back(d: &mut RawTransferOpData) -> OpResult {
    if d.pasv {
        if !d.tried_active {
            d.tried_pasv = true;
            d.pasv = false;
            return OpResult::CONTINUE;
        }
    } else if !d.tried_pasv {
        d.tried_active = true;
        d.pasv = true;
        return OpResult::CONTINUE;
    }
    OpResult::ERROR
}

pub(crate) fn parse_response<S>(d: &mut RawTransferOpData, core: &mut SessionCore<S>) -> OpResult {
    match d.state {
        RawTransferState::Type => {
            if !core.reply_is_positive() {
                return OpResult::ERROR;
            }
            core.last_type_binary = Some(d.binary);
            d.state = RawTransferState::PortPasv;
            OpResult::CONTINUE
        }
        RawTransferState::PortPasv => {
            if !core.reply_is_positive() {
                if d.pasv && d.last_port_cmd == Some(PortCmd::Epsv) && !control_is_ipv6(core) {
                    // server without EPSV, retry plain PASV
                    core.caps
                        .set(FtpCapability::EpsvCommand, CapabilityStatus::No);
                    return OpResult::CONTINUE;
                }
                return fall_back(d);
            }

            match d.last_port_cmd {
                Some(PortCmd::Epsv) => {
                    let Some(port) = core.reply().and_then(|r| r.parse_epsv_229()) else {
                        log::debug!("invalid EPSV reply");
                        return OpResult::ERROR;
                    };
                    let Some(peer) = core.peer_ip() else {
                        return OpResult::error(OpFlags::INTERNAL_ERROR);
                    };
                    core.begin_data_connect(SocketAddr::new(peer, port));
                    after_port_established(d)
                }
                Some(PortCmd::Pasv) => {
                    let Some(mut addr) = core.reply().and_then(|r| r.parse_pasv_227()) else {
                        log::debug!("invalid PASV reply");
                        return OpResult::ERROR;
                    };
                    // Broken NAT setups advertise their private address;
                    // substitute the control peer when that happens.
                    if let Some(peer) = core.peer_ip() {
                        if !resolver::is_routable(addr.ip()) && resolver::is_routable(peer) {
                            log::debug!(
                                "server sent passive reply with unroutable address {}, using {peer}",
                                addr.ip()
                            );
                            addr.set_ip(peer);
                        }
                    }
                    core.begin_data_connect(addr);
                    after_port_established(d)
                }
                Some(PortCmd::Eprt) | Some(PortCmd::Port) => after_port_established(d),
                None => OpResult::error(OpFlags::INTERNAL_ERROR),
            }
        }
        RawTransferState::Rest => {
            if core.reply_is_positive() {
                d.state = RawTransferState::Transfer;
                OpResult::CONTINUE
            } else {
                OpResult::ERROR
            }
        }
        RawTransferState::Transfer => {
            let class = core.reply_class();
            if class == 1 {
                d.state = RawTransferState::WaitFinish;
                OpResult::WOULD_BLOCK
            } else if class == 2 || class == 3 {
                d.state = RawTransferState::WaitSocket;
                OpResult::WOULD_BLOCK
            } else {
                d.failure_reason = Some(TransferEndReason::TransferCommandFailureImmediate);
                OpResult::ERROR
            }
        }
        RawTransferState::WaitFinish => {
            if core.reply_is_positive() {
                d.state = RawTransferState::WaitSocket;
                OpResult::WOULD_BLOCK
            } else {
                OpResult::ERROR
            }
        }
        RawTransferState::WaitTransfer => {
            if core.reply_is_positive()
                && d.socket_end_reason == Some(TransferEndReason::Successful)
            {
                OpResult::OK
            } else {
                OpResult::ERROR
            }
        }
        RawTransferState::WaitTransferPre => {
            let class = core.reply_class();
            if class == 1 {
                d.state = RawTransferState::WaitTransfer;
                OpResult::WOULD_BLOCK
            } else if class == 2 || class == 3 {
                if d.socket_end_reason == Some(TransferEndReason::Successful) {
                    OpResult::OK
                } else {
                    OpResult::ERROR
                }
            } else {
                OpResult::ERROR
            }
        }
        RawTransferState::WaitSocket => {
            log::debug!("unexpected reply while waiting for the data channel");
            OpResult::WOULD_BLOCK
        }
    }
}

/// Data-channel completion delivered by the dispatcher. Returns the final
/// operation result once both sides are reconciled.
pub(crate) fn on_transfer_end(
    d: &mut RawTransferOpData,
    reason: TransferEndReason,
) -> Option<OpResult> {
    d.socket_end_reason = Some(reason);
    match d.state {
        RawTransferState::Transfer => {
            d.state = RawTransferState::WaitTransferPre;
            None
        }
        RawTransferState::WaitFinish => {
            d.state = RawTransferState::WaitTransfer;
            None
        }
        RawTransferState::WaitSocket => {
            if reason == TransferEndReason::Successful {
                Some(OpResult::OK)
            } else {
                Some(OpResult::ERROR)
            }
        }
        _ => {
            log::debug!("data channel ended at unusual state {:?}", d.state);
            None
        }
    }
}

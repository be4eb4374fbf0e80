/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::time::Duration;

#[cfg(feature = "yaml")]
mod yaml;

const MAXIMUM_KEEPALIVE_IDLE_LIMIT: Duration = Duration::from_secs(30 * 60);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FtpEngineConfig {
    pub control: FtpControlConfig,
    pub transfer: FtpTransferConfig,
    pub keepalive: FtpKeepaliveConfig,
    /// Session-wide inactivity timeout, reset on every successful read or
    /// send on the control connection.
    pub inactivity_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for FtpEngineConfig {
    fn default() -> Self {
        FtpEngineConfig {
            control: FtpControlConfig::default(),
            transfer: FtpTransferConfig::default(),
            keepalive: FtpKeepaliveConfig::default(),
            inactivity_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FtpControlConfig {
    pub max_line_len: usize,
    pub max_multi_lines: usize,
}

impl Default for FtpControlConfig {
    fn default() -> Self {
        FtpControlConfig {
            max_line_len: 2048,
            max_multi_lines: 128,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FtpTransferConfig {
    pub end_wait_timeout: Duration,
    /// Buffer size for the io worker's ring buffers.
    pub io_buffer_size: usize,
}

impl Default for FtpTransferConfig {
    fn default() -> Self {
        FtpTransferConfig {
            end_wait_timeout: Duration::from_secs(2),
            io_buffer_size: 64 * 1024,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FtpKeepaliveConfig {
    pub period: Duration,
    /// No probe is sent once the session has been idle longer than this.
    pub idle_limit: Duration,
}

impl Default for FtpKeepaliveConfig {
    fn default() -> Self {
        FtpKeepaliveConfig {
            period: Duration::from_secs(30),
            idle_limit: MAXIMUM_KEEPALIVE_IDLE_LIMIT,
        }
    }
}

impl FtpKeepaliveConfig {
    pub fn set_idle_limit(&mut self, limit: Duration) {
        self.idle_limit = limit.min(MAXIMUM_KEEPALIVE_IDLE_LIMIT);
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FtpProtocol {
    /// Plain FTP.
    #[default]
    Ftp,
    /// Explicit TLS via AUTH TLS after the greeting.
    Ftpes,
    /// Implicit TLS from the first byte.
    Ftps,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PassivePreference {
    /// Follow the engine-wide `use_pasv` option.
    #[default]
    Default,
    Passive,
    Active,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ControlCharset {
    /// UTF-8 when the server advertises it, 8-bit fallback otherwise.
    #[default]
    Auto,
    Utf8,
    Latin1,
}

/// Descriptor of the server a session talks to.
#[derive(Clone, Debug, Default)]
pub struct FtpServerConfig {
    pub host: String,
    pub port: u16,
    pub protocol: FtpProtocol,
    pub username: String,
    pub password: Option<String>,
    pub account: Option<String>,
    /// Correction applied to server-reported times, in minutes.
    pub timezone_offset_minutes: i64,
    pub passive_mode: PassivePreference,
    pub charset: ControlCharset,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ExternalIpMode {
    #[default]
    LocalAddress,
    Configured,
    HttpResolver,
}

/// Engine-wide options supplied by the embedder. `last_resolved_ip` is
/// written back after a successful resolver query.
#[derive(Clone, Debug)]
pub struct FtpEngineOptions {
    /// TCP keepalive interval in minutes, honored by the connection
    /// provider when in 1..10000.
    pub tcp_keepalive_interval: u32,
    pub preserve_timestamps: bool,
    pub preallocate_space: bool,
    pub use_pasv: bool,
    pub external_ip_mode: ExternalIpMode,
    pub external_ip: Option<String>,
    pub external_ip_resolver: String,
    pub no_external_on_local: bool,
    pub last_resolved_ip: Option<String>,
    pub ftp_send_keepalive: bool,
}

impl Default for FtpEngineOptions {
    fn default() -> Self {
        FtpEngineOptions {
            tcp_keepalive_interval: 0,
            preserve_timestamps: false,
            preallocate_space: false,
            use_pasv: true,
            external_ip_mode: ExternalIpMode::LocalAddress,
            external_ip: None,
            external_ip_resolver: String::new(),
            no_external_on_local: true,
            last_resolved_ip: None,
            ftp_send_keepalive: true,
        }
    }
}

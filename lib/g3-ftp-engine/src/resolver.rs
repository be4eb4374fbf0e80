/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{ExternalIpMode, FtpEngineOptions};
use crate::error::ExternalIpError;
use crate::notify::{FtpEventProxy, FtpSessionEvent};

/// Fetches the externally visible address of this host, typically over
/// HTTP. The transport is the embedder's concern.
#[async_trait]
pub trait ExternalIpResolver: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<IpAddr, ExternalIpError>;
}

/// What to advertise in a PORT command.
pub(crate) enum ExternalIpChoice {
    /// Use this address.
    Ready(IpAddr),
    /// Use the control socket's local address.
    Local,
    /// A resolver query must run first.
    NeedResolve,
}

/// Decide the address to advertise for active mode, without performing any
/// network query. IPv6 always uses the local address (EPRT carries it
/// verbatim); so does a peer on a non-routable address when
/// `no_external_on_local` is set.
pub(crate) fn choose_external_ip(
    options: &FtpEngineOptions,
    local_ip: IpAddr,
    peer_ip: IpAddr,
    resolved: Option<IpAddr>,
) -> ExternalIpChoice {
    if local_ip.is_ipv6() {
        return ExternalIpChoice::Local;
    }

    if options.external_ip_mode != ExternalIpMode::LocalAddress
        && options.no_external_on_local
        && !is_routable(peer_ip)
    {
        return ExternalIpChoice::Local;
    }

    match options.external_ip_mode {
        ExternalIpMode::LocalAddress => ExternalIpChoice::Local,
        ExternalIpMode::Configured => match options
            .external_ip
            .as_deref()
            .and_then(|s| IpAddr::from_str(s).ok())
        {
            Some(ip) => ExternalIpChoice::Ready(ip),
            None => {
                log::debug!("no external IP address set, using local address");
                ExternalIpChoice::Local
            }
        },
        ExternalIpMode::HttpResolver => {
            if let Some(ip) = resolved {
                return ExternalIpChoice::Ready(ip);
            }
            // reuse the last answer if the local address did not change
            if let Some(cached) = options
                .last_resolved_ip
                .as_deref()
                .and_then(|s| IpAddr::from_str(s).ok())
            {
                if cached == local_ip {
                    log::debug!("using cached external IP address");
                    return ExternalIpChoice::Ready(cached);
                }
            }
            ExternalIpChoice::NeedResolve
        }
    }
}

/// Spawn the one-shot resolver task; the answer comes back through the
/// session's event channel. At most one may be in flight per session.
pub(crate) fn start_resolve(
    resolver: Arc<dyn ExternalIpResolver>,
    url: String,
    events: FtpEventProxy,
) {
    tokio::spawn(async move {
        let r = resolver.fetch(&url).await;
        events.send(FtpSessionEvent::ExternalIp(r));
    });
}

pub(crate) fn is_routable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified())
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() || v6.is_unspecified() {
                return false;
            }
            let seg = v6.segments();
            // fc00::/7 unique local, fe80::/10 link local
            if (seg[0] & 0xfe00) == 0xfc00 || (seg[0] & 0xffc0) == 0xfe80 {
                return false;
            }
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn options(mode: ExternalIpMode) -> FtpEngineOptions {
        FtpEngineOptions {
            external_ip_mode: mode,
            ..Default::default()
        }
    }

    #[test]
    fn routable_ranges() {
        assert!(!is_routable(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))));
        assert!(!is_routable(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert!(!is_routable(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))));
        assert!(is_routable(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))));
        assert!(!is_routable(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(!is_routable("fe80::1".parse().unwrap()));
        assert!(is_routable("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn local_peer_short_circuits() {
        let mut opts = options(ExternalIpMode::Configured);
        opts.external_ip = Some("203.0.113.9".to_string());
        let local = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10));
        let lan_peer = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));
        assert!(matches!(
            choose_external_ip(&opts, local, lan_peer, None),
            ExternalIpChoice::Local
        ));
        let wan_peer = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1));
        assert!(matches!(
            choose_external_ip(&opts, local, wan_peer, None),
            ExternalIpChoice::Ready(ip) if ip.to_string() == "203.0.113.9"
        ));
    }

    #[test]
    fn ipv6_always_local() {
        let mut opts = options(ExternalIpMode::Configured);
        opts.external_ip = Some("203.0.113.9".to_string());
        let local: IpAddr = "2001:db8::2".parse().unwrap();
        let peer: IpAddr = "2001:db8::1".parse().unwrap();
        assert!(matches!(
            choose_external_ip(&opts, local, peer, None),
            ExternalIpChoice::Local
        ));
    }

    #[test]
    fn resolver_cache_hit() {
        let mut opts = options(ExternalIpMode::HttpResolver);
        opts.no_external_on_local = false;
        let local = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7));
        let peer = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1));

        assert!(matches!(
            choose_external_ip(&opts, local, peer, None),
            ExternalIpChoice::NeedResolve
        ));

        opts.last_resolved_ip = Some("198.51.100.7".to_string());
        assert!(matches!(
            choose_external_ip(&opts, local, peer, None),
            ExternalIpChoice::Ready(ip) if ip == local
        ));

        let resolved = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 99));
        assert!(matches!(
            choose_external_ip(&opts, local, peer, Some(resolved)),
            ExternalIpChoice::Ready(ip) if ip == resolved
        ));
    }
}

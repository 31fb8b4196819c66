//! Process capabilities discovered once at startup.
//!
//! Components receive a `RuntimeContext` instead of probing the OS themselves,
//! so tests can describe hosts without IPv6 or without the trust group.

use nix::unistd::{getegid, geteuid, getgroups, Group};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{Ipv6Addr, SocketAddr};

/// Capabilities of the running process and host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    /// IPv6 sockets can be created.
    pub ipv6: bool,
    /// An IPv6 wildcard socket also accepts IPv4 connections.
    pub dualstack_ipv6: bool,
    /// Effective user id.
    pub uid: u32,
    /// Running as root.
    pub privileged: bool,
    /// Effective and supplementary group ids.
    pub group_ids: Vec<u32>,
    /// The vsock address family is available.
    pub vsock: bool,
}

impl RuntimeContext {
    /// Probe the host.
    pub fn detect() -> Self {
        let ipv6 = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP)).is_ok();
        let dualstack_ipv6 = ipv6 && detect_dualstack();
        let uid = geteuid().as_raw();

        let mut group_ids: Vec<u32> = getgroups()
            .map(|groups| groups.into_iter().map(|gid| gid.as_raw()).collect())
            .unwrap_or_default();
        let egid = getegid().as_raw();
        if !group_ids.contains(&egid) {
            group_ids.push(egid);
        }

        let context = Self {
            ipv6,
            dualstack_ipv6,
            uid,
            privileged: uid == 0,
            group_ids,
            vsock: detect_vsock(),
        };

        tracing::debug!(
            ipv6 = context.ipv6,
            dualstack = context.dualstack_ipv6,
            uid = context.uid,
            vsock = context.vsock,
            "Runtime context detected"
        );
        context
    }

    /// Resolve a group name to its id.
    pub fn group_id(&self, name: &str) -> Option<u32> {
        match Group::from_name(name) {
            Ok(Some(group)) => Some(group.gid.as_raw()),
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(group = %name, error = %e, "Group lookup failed");
                None
            }
        }
    }

    /// Whether this process may hand files over to `gid`.
    pub fn may_use_group(&self, gid: u32) -> bool {
        self.privileged || self.group_ids.contains(&gid)
    }
}

fn detect_dualstack() -> bool {
    let Ok(socket) = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP)) else {
        return false;
    };
    if socket.set_only_v6(false).is_err() {
        return false;
    }
    let addr = SockAddr::from(SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)));
    socket.bind(&addr).is_ok() && matches!(socket.only_v6(), Ok(false))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn detect_vsock() -> bool {
    Socket::new(Domain::VSOCK, Type::STREAM, None).is_ok()
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn detect_vsock() -> bool {
    false
}

//! Watches the host's set of `(interface, ip, netmask)` tuples and notifies
//! the orchestrator when it changes, so SSDP can be restarted on the new
//! address without a misleading `ssdp:byebye` cycle.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;

use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(5);

type InterfaceSnapshot = BTreeSet<(String, IpAddr)>;

fn snapshot(blocked: &[String], additional: &[String]) -> InterfaceSnapshot {
    let interfaces = match NetworkInterface::show() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            warn!(error=?e, "error listing interfaces for IP-change monitor");
            return InterfaceSnapshot::new();
        }
    };

    interfaces
        .into_iter()
        .filter(|nic| !blocked.contains(&nic.name) || additional.contains(&nic.name))
        .flat_map(|nic| {
            let name = nic.name.clone();
            nic.addr.into_iter().map(move |a| (name.clone(), a.ip()))
        })
        .filter(|(_, ip)| match ip {
            IpAddr::V4(v4) => !v4.is_loopback(),
            IpAddr::V6(v6) => !v6.is_loopback(),
        })
        .collect()
}

/// Runs until `cancel` fires, sending on `changed` every time the interface
/// snapshot differs from the previous poll.
pub async fn run(
    blocked_interfaces: Vec<String>,
    additional_interfaces: Vec<String>,
    changed: mpsc::UnboundedSender<()>,
    cancel: CancellationToken,
) {
    let mut last = snapshot(&blocked_interfaces, &additional_interfaces);
    let mut interval = tokio::time::interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                let current = snapshot(&blocked_interfaces, &additional_interfaces);
                if current != last {
                    debug!("local interface set changed");
                    last = current;
                    if changed.send(()).is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_excludes_loopback() {
        let snap = snapshot(&[], &[]);
        assert!(snap.iter().all(|(_, ip)| !ip.is_loopback()));
    }
}

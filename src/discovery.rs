//! Instrument discovery: VXI-11 portmapper broadcast and mDNS browsing.

use std::time::Duration;

use crate::protocol::{rpc, vxi11};
use crate::rname::ResourceName;

/// Finds VXI-11 instruments by broadcasting a portmapper `GETPORT` request
/// for the Device Core program and collecting responders.
///
/// The broadcast goes to the limited broadcast address, which reaches the
/// default interface's subnet; enumerating every interface's broadcast
/// address is left to the caller's network setup.
pub fn list_vxi11_resources(wait: Duration) -> Vec<ResourceName> {
    let mut pmap = match rpc::BroadcastPortmap::new() {
        Ok(pmap) => pmap,
        Err(e) => {
            log::debug!("VXI-11 broadcast socket unavailable: {}", e);
            return Vec::new();
        }
    };
    let replies = match pmap.getport(
        "255.255.255.255",
        vxi11::DEVICE_CORE_PROG,
        vxi11::DEVICE_CORE_VERS,
        rpc::IPPROTO_TCP,
        wait,
    ) {
        Ok(replies) => replies,
        Err(e) => {
            log::debug!("VXI-11 broadcast failed: {}", e);
            return Vec::new();
        }
    };
    let mut hosts: Vec<std::net::IpAddr> = replies.iter().map(|(_, from)| from.ip()).collect();
    hosts.sort();
    hosts.dedup();
    hosts
        .into_iter()
        .map(|ip| ResourceName::TcpipInstr {
            board: 0,
            host: ip.to_string(),
            lan_device_name: crate::rname::DEFAULT_LAN_DEVICE_NAME.to_string(),
        })
        .collect()
}

#[cfg(feature = "mdns")]
mod mdns {
    use std::collections::HashMap;
    use std::time::{Duration, Instant};

    use mdns_sd::{ServiceDaemon, ServiceEvent};

    /// One resolved service: address, port and TXT properties.
    pub(super) struct Resolved {
        pub host: String,
        pub port: u16,
        pub properties: HashMap<String, String>,
    }

    /// Browses `service_type` for `wait`, returning everything that
    /// resolved in that window.
    pub(super) fn browse(service_type: &str, wait: Duration) -> Vec<Resolved> {
        let daemon = match ServiceDaemon::new() {
            Ok(daemon) => daemon,
            Err(e) => {
                log::debug!("mDNS daemon unavailable: {}", e);
                return Vec::new();
            }
        };
        let receiver = match daemon.browse(service_type) {
            Ok(receiver) => receiver,
            Err(e) => {
                log::debug!("mDNS browse of {} failed: {}", service_type, e);
                return Vec::new();
            }
        };

        let deadline = Instant::now() + wait;
        let mut resolved = Vec::new();
        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            match receiver.recv_timeout(remaining) {
                Ok(ServiceEvent::ServiceResolved(info)) => {
                    let properties: HashMap<String, String> = info
                        .get_properties()
                        .iter()
                        .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
                        .collect();
                    for addr in info.get_addresses() {
                        resolved.push(Resolved {
                            host: addr.to_string(),
                            port: info.get_port(),
                            properties: properties.clone(),
                        });
                    }
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        let _ = daemon.shutdown();
        resolved
    }
}

/// Finds HiSLIP instruments announced over mDNS.
#[cfg(feature = "mdns")]
pub fn list_hislip_resources(wait: Duration) -> Vec<ResourceName> {
    let mut found: Vec<ResourceName> = mdns::browse("_hislip._tcp.local.", wait)
        .into_iter()
        .map(|service| ResourceName::TcpipInstr {
            board: 0,
            host: service.host,
            lan_device_name: format!("hislip0,{}", service.port),
        })
        .collect();
    found.sort_by_key(|r| r.to_string());
    found.dedup();
    found
}

/// Finds VICP instruments: LXI announcements whose manufacturer TXT record
/// identifies a LeCroy device.
#[cfg(feature = "mdns")]
pub fn list_vicp_resources(wait: Duration) -> Vec<ResourceName> {
    let mut found: Vec<ResourceName> = mdns::browse("_lxi._tcp.local.", wait)
        .into_iter()
        .filter(|service| {
            service
                .properties
                .get("Manufacturer")
                .map(|manufacturer| manufacturer.to_ascii_lowercase().starts_with("lecroy"))
                .unwrap_or(false)
        })
        .map(|service| ResourceName::VicpInstr {
            board: 0,
            host: service.host,
        })
        .collect();
    found.sort_by_key(|r| r.to_string());
    found.dedup();
    found
}

//! Host ports claimed on a node, keyed by the pod that claims them

use std::collections::HashMap;

use thiserror::Error;

use crate::cluster::{HostPort, NamespacedName, Protocol};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("host port {port}/{protocol:?} on '{ip}' already in use by pod {owner}")]
pub struct HostPortConflict {
    pub ip: String,
    pub port: u16,
    pub protocol: Protocol,
    pub owner: NamespacedName,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostPortUsage {
    reserved: HashMap<NamespacedName, Vec<HostPort>>,
}

impl HostPortUsage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the ports of `pod`, replacing anything it held before
    pub fn add(&mut self, pod: &NamespacedName, ports: Vec<HostPort>) {
        if ports.is_empty() {
            self.reserved.remove(pod);
        } else {
            self.reserved.insert(pod.clone(), ports);
        }
    }

    pub fn delete_pod(&mut self, pod: &NamespacedName) {
        self.reserved.remove(pod);
    }

    /// Check whether `ports` can be claimed by `pod` alongside everything already reserved
    pub fn conflicts(&self, pod: &NamespacedName, ports: &[HostPort]) -> Result<(), HostPortConflict> {
        for (owner, reserved) in &self.reserved {
            if owner == pod {
                continue;
            }
            for wanted in ports {
                if let Some(used) = reserved.iter().find(|r| r.conflicts_with(wanted)) {
                    return Err(HostPortConflict {
                        ip: used.ip.clone(),
                        port: used.port,
                        protocol: used.protocol,
                        owner: owner.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.reserved.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.reserved.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(ip: &str, port: u16) -> HostPort {
        HostPort {
            ip: ip.to_string(),
            port,
            protocol: Protocol::Tcp,
        }
    }

    #[test]
    fn test_conflicts_with_other_pod() {
        let a = NamespacedName::new("default", "a");
        let b = NamespacedName::new("default", "b");
        let mut usage = HostPortUsage::new();
        usage.add(&a, vec![port("", 8080)]);

        let err = usage.conflicts(&b, &[port("10.0.0.1", 8080)]).unwrap_err();
        assert_eq!(err.owner, a);
        assert!(usage.conflicts(&b, &[port("", 9090)]).is_ok());
        // a pod never conflicts with itself
        assert!(usage.conflicts(&a, &[port("", 8080)]).is_ok());
    }

    #[test]
    fn test_specific_ips_do_not_conflict() {
        let mut usage = HostPortUsage::new();
        usage.add(&NamespacedName::new("default", "a"), vec![port("10.0.0.1", 80)]);
        assert!(usage
            .conflicts(&NamespacedName::new("default", "b"), &[port("10.0.0.2", 80)])
            .is_ok());
    }

    #[test]
    fn test_add_is_idempotent_and_delete_releases() {
        let a = NamespacedName::new("default", "a");
        let mut usage = HostPortUsage::new();
        usage.add(&a, vec![port("", 80)]);
        usage.add(&a, vec![port("", 80)]);
        assert_eq!(usage.len(), 1);

        usage.delete_pod(&a);
        assert!(usage.is_empty());
    }
}

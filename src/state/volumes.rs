//! Attached-volume accounting against per-driver attach limits

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

use crate::cluster::{NamespacedName, PodVolume};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("would exceed volume limit for driver '{driver}': {count} > {limit}")]
pub struct VolumeLimitExceeded {
    pub driver: String,
    pub count: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VolumeUsage {
    volumes: HashMap<NamespacedName, Vec<PodVolume>>,
    limits: HashMap<String, usize>,
}

impl VolumeUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_limit(&mut self, driver: impl Into<String>, limit: usize) {
        self.limits.insert(driver.into(), limit);
    }

    pub fn limit(&self, driver: &str) -> Option<usize> {
        self.limits.get(driver).copied()
    }

    /// Record the volumes of `pod`, replacing anything it held before
    pub fn add(&mut self, pod: &NamespacedName, volumes: Vec<PodVolume>) {
        if volumes.is_empty() {
            self.volumes.remove(pod);
        } else {
            self.volumes.insert(pod.clone(), volumes);
        }
    }

    pub fn delete_pod(&mut self, pod: &NamespacedName) {
        self.volumes.remove(pod);
    }

    /// Distinct volume ids attached per driver
    fn attached(&self) -> HashMap<&str, BTreeSet<&str>> {
        let mut attached: HashMap<&str, BTreeSet<&str>> = HashMap::new();
        for volume in self.volumes.values().flatten() {
            attached
                .entry(volume.driver.as_str())
                .or_default()
                .insert(volume.id.as_str());
        }
        attached
    }

    pub fn attached_count(&self, driver: &str) -> usize {
        self.attached().get(driver).map(BTreeSet::len).unwrap_or(0)
    }

    /// Check whether adding `volumes` would push any driver past its limit
    ///
    /// Drivers without a reported limit are unbounded. Volumes already
    /// attached (shared claims) do not count twice.
    pub fn exceeds_limits(&self, volumes: &[PodVolume]) -> Result<(), VolumeLimitExceeded> {
        let mut attached = self.attached();
        for volume in volumes {
            attached
                .entry(volume.driver.as_str())
                .or_default()
                .insert(volume.id.as_str());
        }
        let mut drivers: Vec<_> = attached.into_iter().collect();
        drivers.sort_by(|a, b| a.0.cmp(b.0));
        for (driver, ids) in drivers {
            if let Some(limit) = self.limits.get(driver) {
                if ids.len() > *limit {
                    return Err(VolumeLimitExceeded {
                        driver: driver.to_string(),
                        count: ids.len(),
                        limit: *limit,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vol(driver: &str, id: &str) -> PodVolume {
        PodVolume {
            driver: driver.to_string(),
            id: id.to_string(),
        }
    }

    #[test]
    fn test_exceeds_limit() {
        let mut usage = VolumeUsage::new();
        usage.add_limit("ebs", 2);
        usage.add(&NamespacedName::new("default", "a"), vec![vol("ebs", "default/claim-a")]);
        usage.add(&NamespacedName::new("default", "b"), vec![vol("ebs", "default/claim-b")]);

        let err = usage.exceeds_limits(&[vol("ebs", "default/claim-c")]).unwrap_err();
        assert_eq!(err.count, 3);
        assert_eq!(err.limit, 2);

        // shared claim counts once
        assert!(usage.exceeds_limits(&[vol("ebs", "default/claim-a")]).is_ok());
    }

    #[test]
    fn test_unbounded_driver() {
        let mut usage = VolumeUsage::new();
        usage.add(&NamespacedName::new("default", "a"), vec![vol("nfs", "x")]);
        assert!(usage.exceeds_limits(&[vol("nfs", "y"), vol("nfs", "z")]).is_ok());
    }

    #[test]
    fn test_delete_pod_releases() {
        let pod = NamespacedName::new("default", "a");
        let mut usage = VolumeUsage::new();
        usage.add_limit("ebs", 1);
        usage.add(&pod, vec![vol("ebs", "default/claim-a")]);
        assert!(usage.exceeds_limits(&[vol("ebs", "default/claim-b")]).is_err());

        usage.delete_pod(&pod);
        assert_eq!(usage.attached_count("ebs"), 0);
        assert!(usage.exceeds_limits(&[vol("ebs", "default/claim-b")]).is_ok());
    }
}

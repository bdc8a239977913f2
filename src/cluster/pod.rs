//! Pod resource - the workload unit whose footprint is tracked per node

use serde::{Deserialize, Serialize};

use super::meta::{ObjectMeta, OwnerReference};
use super::resources::{max_resources, merge_into, LabelSelector, NamespacedName, ResourceList};
use super::DO_NOT_DISRUPT_ANNOTATION_KEY;

/// A pod
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: PodSpec,

    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    /// Node the pod is bound to, empty while pending
    #[serde(default)]
    pub node_name: String,

    #[serde(default)]
    pub containers: Vec<Container>,

    #[serde(default)]
    pub init_containers: Vec<Container>,

    #[serde(default)]
    pub volumes: Vec<Volume>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,

    #[serde(default)]
    pub resources: ResourceRequirements,

    #[serde(default)]
    pub ports: Vec<ContainerPort>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: ResourceList,

    #[serde(default)]
    pub limits: ResourceList,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    pub container_port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,

    #[serde(default, rename = "hostIP")]
    pub host_ip: String,

    #[serde(default)]
    pub protocol: Protocol,
}

/// A pod volume; only volumes backed by a CSI driver count toward attach limits
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,

    /// Claim name for claim-backed volumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_name: Option<String>,

    /// CSI driver serving the volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Affinity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_anti_affinity: Option<PodAntiAffinity>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodAntiAffinity {
    #[serde(default)]
    pub required_during_scheduling_ignored_during_execution: Vec<PodAffinityTerm>,

    #[serde(default)]
    pub preferred_during_scheduling_ignored_during_execution: Vec<WeightedPodAffinityTerm>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodAffinityTerm {
    #[serde(default)]
    pub label_selector: LabelSelector,

    pub topology_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedPodAffinityTerm {
    pub weight: i32,
    pub pod_affinity_term: PodAffinityTerm,
}

/// Lifecycle phase of a pod
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,
}

/// A host port claimed by a pod
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub ip: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl HostPort {
    /// Two claims conflict when port and protocol match and either binds all addresses
    pub fn conflicts_with(&self, other: &HostPort) -> bool {
        self.port == other.port
            && self.protocol == other.protocol
            && (self.ip == other.ip || is_wildcard(&self.ip) || is_wildcard(&other.ip))
    }
}

fn is_wildcard(ip: &str) -> bool {
    ip.is_empty() || ip == "0.0.0.0" || ip == "::"
}

/// A volume as seen by attach-limit accounting
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodVolume {
    pub driver: String,
    pub id: String,
}

impl Pod {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, name),
            ..Default::default()
        }
    }

    pub fn key(&self) -> NamespacedName {
        self.metadata.key()
    }

    /// Add a container with the given requests (used as limits too)
    pub fn with_container(mut self, name: impl Into<String>, requests: ResourceList) -> Self {
        self.spec.containers.push(Container {
            name: name.into(),
            resources: ResourceRequirements {
                limits: requests.clone(),
                requests,
            },
            ports: vec![],
        });
        self
    }

    pub fn with_host_port(mut self, port: u16, protocol: Protocol) -> Self {
        let port = ContainerPort {
            container_port: port,
            host_port: Some(port),
            host_ip: String::new(),
            protocol,
        };
        match self.spec.containers.first_mut() {
            Some(container) => container.ports.push(port),
            None => self.spec.containers.push(Container {
                name: "main".to_string(),
                resources: ResourceRequirements::default(),
                ports: vec![port],
            }),
        }
        self
    }

    pub fn with_volume(mut self, name: &str, claim_name: Option<&str>, driver: &str) -> Self {
        self.spec.volumes.push(Volume {
            name: name.to_string(),
            claim_name: claim_name.map(str::to_string),
            driver: Some(driver.to_string()),
        });
        self
    }

    pub fn bound_to(mut self, node_name: impl Into<String>) -> Self {
        self.spec.node_name = node_name.into();
        self
    }

    pub fn with_phase(mut self, phase: PodPhase) -> Self {
        self.status.phase = phase;
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.annotations.insert(key.into(), value.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    pub fn owned_by(mut self, kind: &str, name: &str, uid: &str) -> Self {
        self.metadata.owner_references.push(OwnerReference {
            kind: kind.to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
            controller: true,
        });
        self
    }

    pub fn with_required_anti_affinity(mut self, selector: LabelSelector, topology_key: &str) -> Self {
        let affinity = self.spec.affinity.get_or_insert_with(Affinity::default);
        affinity
            .pod_anti_affinity
            .get_or_insert_with(PodAntiAffinity::default)
            .required_during_scheduling_ignored_during_execution
            .push(PodAffinityTerm {
                label_selector: selector,
                topology_key: topology_key.to_string(),
            });
        self
    }

    pub fn with_preferred_anti_affinity(mut self, selector: LabelSelector, topology_key: &str) -> Self {
        let affinity = self.spec.affinity.get_or_insert_with(Affinity::default);
        affinity
            .pod_anti_affinity
            .get_or_insert_with(PodAntiAffinity::default)
            .preferred_during_scheduling_ignored_during_execution
            .push(WeightedPodAffinityTerm {
                weight: 1,
                pod_affinity_term: PodAffinityTerm {
                    label_selector: selector,
                    topology_key: topology_key.to_string(),
                },
            });
        self
    }
}

/// Succeeded or failed pods no longer hold resources
pub fn is_terminal(pod: &Pod) -> bool {
    matches!(pod.status.phase, PodPhase::Succeeded | PodPhase::Failed)
}

/// Not terminal and not being deleted
pub fn is_active(pod: &Pod) -> bool {
    !is_terminal(pod) && !pod.metadata.is_deleting()
}

pub fn is_owned_by_daemonset(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .iter()
        .any(|r| r.kind == "DaemonSet")
}

pub fn has_required_anti_affinity(pod: &Pod) -> bool {
    pod.spec
        .affinity
        .as_ref()
        .and_then(|a| a.pod_anti_affinity.as_ref())
        .map(|a| !a.required_during_scheduling_ignored_during_execution.is_empty())
        .unwrap_or(false)
}

/// An active pod carrying the do-not-disrupt annotation blocks disruption of its node
pub fn has_do_not_disrupt(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .get(DO_NOT_DISRUPT_ANNOTATION_KEY)
        .map(|v| v == "true")
        .unwrap_or(false)
}

pub fn is_disruptable(pod: &Pod) -> bool {
    !(is_active(pod) && has_do_not_disrupt(pod))
}

/// Effective requests: sum of containers, raised to the largest init container
pub fn requests_for_pod(pod: &Pod) -> ResourceList {
    effective_resources(pod, |c| &c.resources.requests)
}

/// Effective limits, computed like requests
pub fn limits_for_pod(pod: &Pod) -> ResourceList {
    effective_resources(pod, |c| &c.resources.limits)
}

fn effective_resources(pod: &Pod, select: impl Fn(&Container) -> &ResourceList) -> ResourceList {
    let mut total = ResourceList::new();
    for container in &pod.spec.containers {
        merge_into(&mut total, select(container));
    }
    for container in &pod.spec.init_containers {
        total = max_resources(&total, select(container));
    }
    total
}

/// Host ports claimed by any container in the pod
pub fn host_ports(pod: &Pod) -> Vec<HostPort> {
    pod.spec
        .containers
        .iter()
        .chain(pod.spec.init_containers.iter())
        .flat_map(|c| c.ports.iter())
        .filter_map(|p| {
            p.host_port.filter(|port| *port != 0).map(|port| HostPort {
                ip: p.host_ip.clone(),
                port,
                protocol: p.protocol,
            })
        })
        .collect()
}

/// CSI-backed volumes; claim-backed volumes are identified by claim so
/// two pods sharing a claim count once
pub fn volumes(pod: &Pod) -> Vec<PodVolume> {
    pod.spec
        .volumes
        .iter()
        .filter_map(|v| {
            let driver = v.driver.clone()?;
            let id = match &v.claim_name {
                Some(claim) => format!("{}/{}", pod.metadata.namespace, claim),
                None => format!("{}/{}/{}", pod.metadata.namespace, pod.metadata.name, v.name),
            };
            Some(PodVolume { driver, id })
        })
        .collect()
}

//! Deployment manifest assembly and rendering.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::addons::{Addon, iptables_manager};
use crate::error::{NetworkError, NetworkResult};
use crate::network::NetworkPlan;

/// `{prefix}-{index:04}-{instance_id}`, e.g. `service-fabrik-0394-<guid>`.
pub fn deployment_name(prefix: &str, index: u32, instance_id: &str) -> String {
    format!("{prefix}-{index:04}-{instance_id}")
}

/// Split a deployment name back into `(index, instance_id)`.
pub fn parse_deployment_name(prefix: &str, name: &str) -> Option<(u32, String)> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('-')?;
    let (index, instance_id) = rest.split_once('-')?;
    if index.len() < 4 || instance_id.is_empty() {
        return None;
    }
    Some((index.parse().ok()?, instance_id.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRef {
    pub name: String,
    #[serde(default = "latest")]
    pub version: String,
}

fn latest() -> String {
    "latest".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    pub name: String,
    pub release: String,
}

/// Static part of the instance group, supplied by configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceGroupTemplate {
    pub name: String,
    #[serde(default)]
    pub jobs: Vec<JobRef>,
    #[serde(default = "default_vm_type")]
    pub vm_type: String,
    #[serde(default = "default_stemcell")]
    pub stemcell: String,
    /// Used when the primary network is dynamic.
    #[serde(default = "default_instances")]
    pub instances: u32,
}

fn default_vm_type() -> String {
    "default".to_string()
}

fn default_stemcell() -> String {
    "default".to_string()
}

fn default_instances() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManifestSubnet {
    pub az: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<Ipv4Addr>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reserved: Vec<String>,
    #[serde(rename = "static", skip_serializing_if = "Vec::is_empty")]
    pub static_ips: Vec<Ipv4Addr>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub cloud_properties: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManifestNetwork {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub subnets: Vec<ManifestSubnet>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceNetwork {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub static_ips: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceGroup {
    pub name: String,
    pub instances: u32,
    pub azs: Vec<String>,
    pub networks: Vec<InstanceNetwork>,
    pub jobs: Vec<JobRef>,
    pub vm_type: String,
    pub stemcell: String,
}

/// A rendered-ready deployment manifest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentManifest {
    pub name: String,
    pub releases: Vec<ReleaseRef>,
    pub networks: Vec<ManifestNetwork>,
    pub instance_groups: Vec<InstanceGroup>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub addons: Vec<Addon>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub properties: Value,
}

impl DeploymentManifest {
    /// Assemble a manifest from planned networks. The first network is the
    /// instance group's primary network and carries its static IPs.
    pub fn build(
        name: impl Into<String>,
        release: ReleaseRef,
        template: &InstanceGroupTemplate,
        plans: &[NetworkPlan],
        properties: Value,
    ) -> Self {
        let networks = plans.iter().map(manifest_network).collect();
        let primary = plans.first();

        let instance_networks = plans
            .iter()
            .enumerate()
            .map(|(i, plan)| InstanceNetwork {
                name: plan.name().to_string(),
                static_ips: if i == 0 {
                    plan.manual_subnets()
                        .iter()
                        .flat_map(|s| s.static_ips.iter().copied())
                        .collect()
                } else {
                    Vec::new()
                },
            })
            .collect::<Vec<_>>();

        let instances = match instance_networks.first() {
            Some(net) if !net.static_ips.is_empty() => net.static_ips.len() as u32,
            _ => template.instances,
        };

        let addon = iptables_manager(plans, &release.name);
        Self {
            name: name.into(),
            instance_groups: vec![InstanceGroup {
                name: template.name.clone(),
                instances,
                azs: primary.map(NetworkPlan::azs).unwrap_or_default(),
                networks: instance_networks,
                jobs: template.jobs.clone(),
                vm_type: template.vm_type.clone(),
                stemcell: template.stemcell.clone(),
            }],
            releases: vec![release],
            networks,
            addons: vec![addon],
            properties,
        }
    }

    pub fn to_yaml(&self) -> NetworkResult<String> {
        serde_yaml::to_string(self).map_err(|e| NetworkError::Render(e.to_string()))
    }
}

fn manifest_network(plan: &NetworkPlan) -> ManifestNetwork {
    match plan {
        NetworkPlan::Manual { name, subnets } => ManifestNetwork {
            name: name.clone(),
            kind: "manual".to_string(),
            subnets: subnets
                .iter()
                .map(|s| ManifestSubnet {
                    az: s.az.clone(),
                    range: Some(s.range.to_string()),
                    gateway: Some(s.gateway),
                    dns: s.dns.clone(),
                    reserved: s.reserved_strings(),
                    static_ips: s.static_ips.clone(),
                    cloud_properties: s.cloud_properties.clone(),
                })
                .collect(),
        },
        NetworkPlan::Dynamic { name, subnets } => ManifestNetwork {
            name: name.clone(),
            kind: "dynamic".to_string(),
            subnets: subnets
                .iter()
                .map(|s| ManifestSubnet {
                    az: s.az.clone(),
                    range: None,
                    gateway: None,
                    dns: s.dns.clone(),
                    reserved: Vec::new(),
                    static_ips: Vec::new(),
                    cloud_properties: s.cloud_properties.clone(),
                })
                .collect(),
        },
    }
}

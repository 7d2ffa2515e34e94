//! Network specs and the planner entry point.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{NetworkError, NetworkResult};
use crate::subnet::{Segmentation, SubnetPlan, SubnetSpec, plan_subnet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    Manual,
    Dynamic,
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkType::Manual => f.write_str("manual"),
            NetworkType::Dynamic => f.write_str("dynamic"),
        }
    }
}

impl FromStr for NetworkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(NetworkType::Manual),
            "dynamic" => Ok(NetworkType::Dynamic),
            other => Err(other.to_string()),
        }
    }
}

/// A configured network. `type` stays a free string here so that an
/// unsupported value is reported as a planning error naming the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub subnets: Vec<SubnetSpec>,
}

impl NetworkSpec {
    pub fn manual(name: impl Into<String>, subnets: Vec<SubnetSpec>) -> Self {
        Self {
            name: name.into(),
            kind: NetworkType::Manual.to_string(),
            subnets,
        }
    }

    pub fn dynamic(name: impl Into<String>, subnets: Vec<SubnetSpec>) -> Self {
        Self {
            name: name.into(),
            kind: NetworkType::Dynamic.to_string(),
            subnets,
        }
    }

    pub fn network_type(&self) -> NetworkResult<NetworkType> {
        self.kind
            .parse()
            .map_err(|kind| NetworkError::UnsupportedNetworkType {
                network: self.name.clone(),
                kind,
            })
    }

    /// Check type and ranges without planning a segment.
    pub fn validate(&self) -> NetworkResult<()> {
        if self.network_type()? == NetworkType::Manual {
            for subnet in &self.subnets {
                crate::cidr::Ipv4Cidr::parse(&subnet.range)?;
            }
        }
        Ok(())
    }
}

/// Dynamic subnets carry no address bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DynamicSubnet {
    pub az: String,
    pub dns: Vec<std::net::Ipv4Addr>,
    pub cloud_properties: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetworkPlan {
    Manual {
        name: String,
        subnets: Vec<SubnetPlan>,
    },
    Dynamic {
        name: String,
        subnets: Vec<DynamicSubnet>,
    },
}

impl NetworkPlan {
    pub fn name(&self) -> &str {
        match self {
            NetworkPlan::Manual { name, .. } | NetworkPlan::Dynamic { name, .. } => name,
        }
    }

    pub fn azs(&self) -> Vec<String> {
        match self {
            NetworkPlan::Manual { subnets, .. } => subnets.iter().map(|s| s.az.clone()).collect(),
            NetworkPlan::Dynamic { subnets, .. } => subnets.iter().map(|s| s.az.clone()).collect(),
        }
    }

    /// Manual subnets in AZ order; empty for dynamic networks.
    pub fn manual_subnets(&self) -> &[SubnetPlan] {
        match self {
            NetworkPlan::Manual { subnets, .. } => subnets,
            NetworkPlan::Dynamic { .. } => &[],
        }
    }
}

/// Plan every network in order for segment `index`.
pub fn plan_networks(
    specs: &[NetworkSpec],
    index: u32,
    segmentation: &Segmentation,
) -> NetworkResult<Vec<NetworkPlan>> {
    specs
        .iter()
        .map(|spec| match spec.network_type()? {
            NetworkType::Manual => Ok(NetworkPlan::Manual {
                name: spec.name.clone(),
                subnets: spec
                    .subnets
                    .iter()
                    .map(|subnet| plan_subnet(subnet, index, segmentation))
                    .collect::<NetworkResult<_>>()?,
            }),
            NetworkType::Dynamic => Ok(NetworkPlan::Dynamic {
                name: spec.name.clone(),
                subnets: spec
                    .subnets
                    .iter()
                    .map(|subnet| DynamicSubnet {
                        az: subnet.az.clone(),
                        dns: subnet.dns.clone(),
                        cloud_properties: subnet.cloud_properties.clone(),
                    })
                    .collect(),
            }),
        })
        .collect()
}

/// Find one network by name.
pub fn find_network<'a>(specs: &'a [NetworkSpec], name: &str) -> NetworkResult<&'a NetworkSpec> {
    specs
        .iter()
        .find(|spec| spec.name == name)
        .ok_or_else(|| NetworkError::UnknownNetwork(name.to_string()))
}

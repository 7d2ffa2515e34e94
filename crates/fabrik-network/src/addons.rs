//! Add-on jobs synthesized from network plans.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::network::NetworkPlan;

/// Name of the firewall add-on and of its single job.
pub const IPTABLES_MANAGER: &str = "iptables-manager";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddonJob {
    pub name: String,
    pub release: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

/// A manifest `addons` entry: jobs colocated on every instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Addon {
    pub name: String,
    pub jobs: Vec<AddonJob>,
}

/// Firewall add-on for the manual subnets of `plans`.
///
/// `allow_ips_list` holds each subnet's service address and
/// `block_ips_list` each subnet's CIDR block, both comma-joined in network
/// then AZ order.
pub fn iptables_manager(plans: &[NetworkPlan], release: &str) -> Addon {
    let subnets = plans.iter().flat_map(NetworkPlan::manual_subnets);
    let mut allow = Vec::new();
    let mut block = Vec::new();
    for subnet in subnets {
        if let Some(ip) = subnet.service_ip() {
            allow.push(ip.to_string());
        }
        block.push(subnet.range.to_string());
    }

    let properties = BTreeMap::from([
        ("allow_ips_list".to_string(), Value::String(allow.join(","))),
        ("block_ips_list".to_string(), Value::String(block.join(","))),
    ]);
    Addon {
        name: IPTABLES_MANAGER.to_string(),
        jobs: vec![AddonJob {
            name: IPTABLES_MANAGER.to_string(),
            release: release.to_string(),
            properties,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{NetworkSpec, plan_networks};
    use crate::subnet::{Segmentation, SubnetSpec};

    #[test]
    fn allow_and_block_lists_follow_az_order() {
        let specs = vec![NetworkSpec::manual(
            "sf_network",
            vec![
                SubnetSpec::new("10.11.0.0/18", "z1"),
                SubnetSpec::new("10.11.64.0/18", "z2"),
                SubnetSpec::new("10.11.128.0/18", "z3"),
            ],
        )];
        let seg = Segmentation {
            reserved: 3406,
            size: 1,
            capacity: 100,
        };
        let plans = plan_networks(&specs, 0, &seg).unwrap();
        let addon = iptables_manager(&plans, "service-fabrik");

        assert_eq!(addon.name, "iptables-manager");
        let job = &addon.jobs[0];
        assert_eq!(job.release, "service-fabrik");
        // Pool starts at .0.2; 3406 reserved → first static at 13.80.
        assert_eq!(
            job.properties["allow_ips_list"],
            "10.11.13.80,10.11.77.80,10.11.141.80"
        );
        assert_eq!(
            job.properties["block_ips_list"],
            "10.11.0.0/18,10.11.64.0/18,10.11.128.0/18"
        );
    }

    #[test]
    fn dynamic_networks_contribute_nothing() {
        let specs = vec![NetworkSpec::dynamic(
            "public",
            vec![SubnetSpec::new("10.0.0.0/24", "z1")],
        )];
        let plans = plan_networks(&specs, 0, &Segmentation::default()).unwrap();
        let addon = iptables_manager(&plans, "service-fabrik");
        assert_eq!(addon.jobs[0].properties["allow_ips_list"], "");
        assert_eq!(addon.jobs[0].properties["block_ips_list"], "");
    }
}

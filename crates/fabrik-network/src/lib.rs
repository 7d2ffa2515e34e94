//! fabrik-network — pure network and manifest planning for deployments.
//!
//! Given the configured network specs, a deployment's segment index and the
//! segmentation policy, the planner computes for every availability zone:
//!
//! ```text
//!   range 10.11.0.0/24            (network .0, broadcast .255)
//!   ├── gateway                   .1
//!   ├── outside offset/size window   ─┐
//!   ├── reserved prefix              ─┴─ rendered as `reserved`
//!   ├── segment 0 │ segment 1 │ ...  ◀── `static` for index i
//!   └── remainder                    ─── left allocatable
//! ```
//!
//! Planning is deterministic: the same inputs always produce byte-identical
//! reserved and static lists. The results feed the add-on jobs (firewall
//! allow/block lists) and the rendered deployment manifest.
//!
//! Nothing here performs I/O; the crate is synchronous and side-effect free.

pub mod addons;
pub mod cidr;
pub mod error;
pub mod manifest;
pub mod network;
pub mod subnet;

pub use addons::{Addon, AddonJob, IPTABLES_MANAGER, iptables_manager};
pub use cidr::{IpRange, Ipv4Cidr};
pub use error::{NetworkError, NetworkResult};
pub use manifest::{
    DeploymentManifest, InstanceGroupTemplate, JobRef, ReleaseRef, deployment_name,
    parse_deployment_name,
};
pub use network::{DynamicSubnet, NetworkPlan, NetworkSpec, NetworkType, find_network, plan_networks};
pub use subnet::{Segmentation, SubnetPlan, SubnetSpec, plan_subnet};

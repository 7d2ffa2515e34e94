//! Per-AZ subnet planning for manual networks.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::cidr::{self, IpRange, Ipv4Cidr, Ranges};
use crate::error::{NetworkError, NetworkResult};

/// One subnet of a manual network, as configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetSpec {
    /// CIDR block, e.g. `10.11.0.0/18`.
    pub range: String,
    pub az: String,
    /// Start of the usable window, counted from the network address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
    /// Fraction of the block's host count the window spans, in `(0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<f64>,
    /// Defaults to the first host address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns: Vec<Ipv4Addr>,
    #[serde(default)]
    pub cloud_properties: Value,
}

impl SubnetSpec {
    pub fn new(range: impl Into<String>, az: impl Into<String>) -> Self {
        Self {
            range: range.into(),
            az: az.into(),
            offset: None,
            size: None,
            gateway: None,
            dns: Vec::new(),
            cloud_properties: Value::Null,
        }
    }

    pub fn with_window(mut self, offset: u32, size: f64) -> Self {
        self.offset = Some(offset);
        self.size = Some(size);
        self
    }

    pub fn with_gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway = Some(gateway);
        self
    }
}

/// How the allocatable pool of every subnet is carved up between deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Segmentation {
    /// Addresses at the start of the pool kept for management and infra.
    pub reserved: u32,
    /// Static addresses handed to each deployment (per-job IP multiplicity).
    pub size: u32,
    /// Number of segment indices available.
    pub capacity: u32,
}

impl Default for Segmentation {
    fn default() -> Self {
        Self {
            reserved: 0,
            size: 1,
            capacity: 1,
        }
    }
}

/// The computed plan for one subnet and one segment index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubnetPlan {
    pub az: String,
    pub range: Ipv4Cidr,
    pub gateway: Ipv4Addr,
    pub dns: Vec<Ipv4Addr>,
    pub network_address: Ipv4Addr,
    pub broadcast_address: Ipv4Addr,
    /// Every address in the block, network and broadcast included.
    pub total_addresses: u64,
    /// Host addresses this deployment must not use.
    pub reserved: Vec<IpRange>,
    /// Addresses assigned to this deployment's segment.
    pub static_ips: Vec<Ipv4Addr>,
    /// Pool addresses neither reserved nor static.
    pub allocatable: u64,
    pub cloud_properties: Value,
}

impl SubnetPlan {
    /// The single "service" address of this AZ.
    pub fn service_ip(&self) -> Option<Ipv4Addr> {
        self.static_ips.first().copied()
    }

    pub fn reserved_count(&self) -> u64 {
        self.reserved.iter().map(IpRange::address_count).sum()
    }

    /// `a - b` strings as they appear in a manifest.
    pub fn reserved_strings(&self) -> Vec<String> {
        self.reserved.iter().map(ToString::to_string).collect()
    }
}

/// Plan `spec` for segment `index`.
pub fn plan_subnet(
    spec: &SubnetSpec,
    index: u32,
    segmentation: &Segmentation,
) -> NetworkResult<SubnetPlan> {
    let range = Ipv4Cidr::parse(&spec.range)?;
    let (first_host, last_host) = range.host_bounds().ok_or_else(|| {
        NetworkError::InvalidWindow(format!("{range} has no host addresses"))
    })?;

    let gateway = match spec.gateway {
        Some(gw) if range.is_host(gw) => gw,
        Some(gw) => {
            return Err(NetworkError::InvalidGateway {
                range: range.to_string(),
                gateway: gw.to_string(),
            });
        }
        None => Ipv4Addr::from(first_host),
    };
    let gateway_raw = u32::from(gateway);

    let window = usable_window(&range, spec.offset, spec.size)?;
    let outside = cidr::remove_point(
        &cidr::subtract((first_host, last_host), Some(window)),
        gateway_raw,
    );
    let pool = cidr::remove_point(&[window], gateway_raw);

    let segment_start = u64::from(segmentation.reserved)
        + u64::from(index) * u64::from(segmentation.size);
    let (prefix, _) = cidr::split_at(&pool, u64::from(segmentation.reserved));
    let statics = segment(&range, &pool, index, segment_start, segmentation)?;

    let reserved: Ranges = cidr::merge(outside.into_iter().chain(prefix).collect());
    let static_ips = cidr::addresses(&statics);
    let allocatable = cidr::count(&pool)
        - u64::from(segmentation.reserved).min(cidr::count(&pool))
        - static_ips.len() as u64;

    debug!(
        range = %range,
        az = %spec.az,
        index,
        statics = static_ips.len(),
        allocatable,
        "subnet planned"
    );

    Ok(SubnetPlan {
        az: spec.az.clone(),
        range,
        gateway,
        dns: spec.dns.clone(),
        network_address: range.network(),
        broadcast_address: range.broadcast(),
        total_addresses: range.size(),
        reserved: reserved.into_iter().map(IpRange::from_raw).collect(),
        static_ips,
        allocatable,
        cloud_properties: spec.cloud_properties.clone(),
    })
}

/// Host range selected by `offset` and `size`, clipped to the block's hosts.
///
/// The span is `floor(size × host_count)` addresses.
fn usable_window(
    range: &Ipv4Cidr,
    offset: Option<u32>,
    size: Option<f64>,
) -> NetworkResult<(u32, u32)> {
    let (first_host, last_host) = range
        .host_bounds()
        .ok_or_else(|| NetworkError::InvalidWindow(format!("{range} has no host addresses")))?;
    if offset.is_none() && size.is_none() {
        return Ok((first_host, last_host));
    }

    let offset = u64::from(offset.unwrap_or(0));
    if offset >= range.size() - 1 {
        return Err(NetworkError::InvalidWindow(format!(
            "offset {offset} beyond last host of {range}"
        )));
    }
    let start = (u64::from(u32::from(range.network())) + offset).max(u64::from(first_host));

    let span = match size {
        Some(fraction) if fraction > 0.0 && fraction <= 1.0 => {
            (fraction * range.host_count() as f64).floor() as u64
        }
        Some(fraction) => {
            return Err(NetworkError::InvalidWindow(format!(
                "size {fraction} must lie in (0, 1]"
            )));
        }
        None => u64::from(last_host) - start + 1,
    };
    if span == 0 {
        return Err(NetworkError::InvalidWindow(format!(
            "size leaves no addresses in {range}"
        )));
    }
    let end = (start + span - 1).min(u64::from(last_host));
    Ok((start as u32, end as u32))
}

fn segment(
    range: &Ipv4Cidr,
    pool: &[(u32, u32)],
    index: u32,
    start: u64,
    segmentation: &Segmentation,
) -> NetworkResult<Ranges> {
    let exhausted = |reason: String| NetworkError::SegmentExhausted {
        index,
        range: range.to_string(),
        reason,
    };
    if segmentation.size == 0 {
        return Err(exhausted("segment size is zero".to_string()));
    }
    if index >= segmentation.capacity {
        return Err(exhausted(format!(
            "index exceeds capacity {}",
            segmentation.capacity
        )));
    }
    let needed = start + u64::from(segmentation.size);
    let available = cidr::count(pool);
    if needed > available {
        return Err(exhausted(format!(
            "needs {needed} pool addresses, {available} available"
        )));
    }
    let (_, rest) = cidr::split_at(pool, start);
    let (statics, _) = cidr::split_at(&rest, u64::from(segmentation.size));
    Ok(statics)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(reserved: u32, size: u32, capacity: u32) -> Segmentation {
        Segmentation {
            reserved,
            size,
            capacity,
        }
    }

    #[test]
    fn block_addresses_for_slash_25() {
        let plan = plan_subnet(&SubnetSpec::new("127.0.0.1/25", "z1"), 0, &seg(0, 1, 1)).unwrap();
        assert_eq!(plan.network_address, Ipv4Addr::new(127, 0, 0, 0));
        assert_eq!(plan.broadcast_address, Ipv4Addr::new(127, 0, 0, 127));
        assert_eq!(plan.gateway, Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(plan.total_addresses, 128);
        // Gateway is never handed out.
        assert_eq!(plan.static_ips, vec![Ipv4Addr::new(127, 0, 0, 2)]);
    }

    #[test]
    fn reserved_prefix_then_segments() {
        let spec = SubnetSpec::new("10.0.0.0/24", "z1");
        let plan = plan_subnet(&spec, 2, &seg(10, 4, 8)).unwrap();
        // Pool starts at .2 (after gateway .1); 10 reserved → .2-.11.
        assert_eq!(plan.reserved_strings(), vec!["10.0.0.2 - 10.0.0.11"]);
        // Index 2 → pool positions 18..22 → .20-.23.
        assert_eq!(
            plan.static_ips,
            (20..24).map(|h| Ipv4Addr::new(10, 0, 0, h)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn window_applies_offset_and_rounds_size_down() {
        // /24 has 254 hosts; 0.5 → 127 addresses starting at .64.
        let spec = SubnetSpec::new("10.0.0.0/24", "z1").with_window(64, 0.5);
        let plan = plan_subnet(&spec, 0, &seg(0, 2, 4)).unwrap();
        assert_eq!(
            plan.static_ips,
            vec![Ipv4Addr::new(10, 0, 0, 64), Ipv4Addr::new(10, 0, 0, 65)]
        );
        // Outside the window (minus gateway): .2-.63 and .191-.254.
        assert_eq!(
            plan.reserved_strings(),
            vec!["10.0.0.2 - 10.0.0.63", "10.0.0.191 - 10.0.0.254"]
        );
    }

    #[test]
    fn planning_is_deterministic() {
        let spec = SubnetSpec::new("10.11.0.0/18", "z2").with_window(16, 0.25);
        let a = plan_subnet(&spec, 5, &seg(32, 3, 100)).unwrap();
        let b = plan_subnet(&spec, 5, &seg(32, 3, 100)).unwrap();
        assert_eq!(serde_json::to_vec(&a).unwrap(), serde_json::to_vec(&b).unwrap());
    }

    #[test]
    fn address_accounting_never_exceeds_block() {
        for (range, window, index) in [
            ("10.0.0.0/24", None, 0),
            ("10.0.0.0/24", Some((40, 0.3)), 3),
            ("172.16.0.0/20", Some((0, 1.0)), 7),
            ("192.168.1.0/28", None, 1),
        ] {
            let mut spec = SubnetSpec::new(range, "z1");
            if let Some((offset, size)) = window {
                spec = spec.with_window(offset, size);
            }
            let plan = plan_subnet(&spec, index, &seg(2, 2, 8)).unwrap();
            let used = plan.reserved_count() + plan.static_ips.len() as u64 + plan.allocatable;
            assert!(used <= plan.total_addresses, "{range}");
            // Every host except the gateway is accounted for exactly once.
            assert_eq!(used, plan.total_addresses - 3, "{range}");
            for ip in &plan.static_ips {
                assert_ne!(*ip, plan.network_address);
                assert_ne!(*ip, plan.broadcast_address);
                assert_ne!(*ip, plan.gateway);
            }
        }
    }

    #[test]
    fn explicit_gateway_inside_pool_is_skipped() {
        let spec = SubnetSpec::new("10.0.0.0/29", "z1").with_gateway(Ipv4Addr::new(10, 0, 0, 3));
        let plan = plan_subnet(&spec, 0, &seg(1, 2, 1)).unwrap();
        assert_eq!(plan.reserved_strings(), vec!["10.0.0.1"]);
        assert_eq!(
            plan.static_ips,
            vec![Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 4)]
        );
    }

    #[test]
    fn gateway_outside_block_rejected() {
        let spec = SubnetSpec::new("10.0.0.0/29", "z1").with_gateway(Ipv4Addr::new(10, 0, 1, 1));
        let err = plan_subnet(&spec, 0, &seg(0, 1, 1)).unwrap_err();
        assert!(matches!(err, NetworkError::InvalidGateway { .. }));
    }

    #[test]
    fn segment_bounds() {
        let spec = SubnetSpec::new("10.0.0.0/29", "z1");
        // 5 pool addresses (.2-.6).
        assert!(plan_subnet(&spec, 1, &seg(1, 2, 4)).is_ok());
        let err = plan_subnet(&spec, 2, &seg(1, 2, 4)).unwrap_err();
        assert!(matches!(err, NetworkError::SegmentExhausted { .. }));
        let err = plan_subnet(&spec, 4, &seg(0, 1, 4)).unwrap_err();
        assert!(matches!(err, NetworkError::SegmentExhausted { .. }));
    }

    #[test]
    fn invalid_windows() {
        for (offset, size) in [(0, 0.0), (0, 1.5), (300, 0.5), (0, 0.001)] {
            let spec = SubnetSpec::new("10.0.0.0/24", "z1").with_window(offset, size);
            let err = plan_subnet(&spec, 0, &seg(0, 1, 1)).unwrap_err();
            assert!(matches!(err, NetworkError::InvalidWindow(_)), "{offset} {size}");
        }
    }
}

//! `fabrik.toml` configuration.
//!
//! Every section has defaults, so an empty file is a valid configuration.
//! Durations are human strings (`"500ms"`, `"30s"`, `"5m"`, `"2h"`) and are
//! checked by [`FabrikConfig::validate`] at startup.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use fabrik_network::{
    InstanceGroupTemplate, JobRef, NetworkSpec, ReleaseRef, Segmentation,
};

use crate::error::{OperatorError, OperatorResult};
use crate::kind::OperatorKind;
use crate::task::TaskType;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FabrikConfig {
    pub operator: OperatorConfig,
    pub poller: PollerConfig,
    pub deployment: DeploymentConfig,
    pub network: NetworkConfig,
    pub tasks: TasksConfig,
    /// Serial service flows by name.
    pub serviceflows: BTreeMap<String, ServiceFlowDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Identity stamped on claims and locks; generated when absent.
    pub identity: Option<String>,
    /// Worker tasks per operator.
    pub workers: usize,
    /// Pending resources per operator before the watch loop waits.
    pub queue_capacity: usize,
    pub watch_timeout: String,
    pub watch_error_delay: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            identity: None,
            workers: 10,
            queue_capacity: 256,
            watch_timeout: "5m".to_string(),
            watch_error_delay: "5s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub interval: String,
    /// Extra slack before another replica's poller lock is considered stale.
    pub relaxation: String,
    /// `in_progress` deadline for kinds without an entry in `timeouts`.
    pub default_timeout: String,
    /// Per-kind deadlines keyed by operator kind name (`backup`, `task`, ...).
    pub timeouts: BTreeMap<String, String>,
    /// How long an `aborting` resource may wait for its backend job.
    pub abort_timeout: String,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: "10s".to_string(),
            relaxation: "5s".to_string(),
            default_timeout: "30m".to_string(),
            timeouts: BTreeMap::new(),
            abort_timeout: "10m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    pub name_prefix: String,
    pub release: ReleaseRef,
    pub instance_group: InstanceGroupTemplate,
    /// Deployment locks older than this may be taken over.
    pub lock_ttl: String,
    /// TTL of the network segment allocation lock. Held only while the
    /// lowest free index is picked, so a crashed holder frees it quickly.
    pub allocation_lock_ttl: String,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            name_prefix: "service-fabrik".to_string(),
            release: ReleaseRef {
                name: "service-fabrik".to_string(),
                version: "latest".to_string(),
            },
            instance_group: InstanceGroupTemplate {
                name: "service".to_string(),
                jobs: vec![JobRef {
                    name: "broker-agent".to_string(),
                    release: "service-fabrik".to_string(),
                }],
                vm_type: "default".to_string(),
                stemcell: "default".to_string(),
                instances: 1,
            },
            lock_ttl: "24h".to_string(),
            allocation_lock_ttl: "30s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub networks: Vec<NetworkSpec>,
    pub segmentation: Segmentation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    /// Task types this deployment expects to run; each must be registered.
    pub enabled: Vec<String>,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            enabled: TaskType::ALL.iter().map(|t| t.name().to_string()).collect(),
        }
    }
}

/// An ordered list of tasks run one after another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceFlowDefinition {
    #[serde(default)]
    pub description: String,
    pub tasks: Vec<FlowTaskDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowTaskDefinition {
    pub task_type: String,
    #[serde(default)]
    pub task_description: String,
    /// Overrides the flow's parameters for this task when set.
    #[serde(default)]
    pub operation_params: Value,
}

impl FabrikConfig {
    pub fn from_file(path: &Path) -> OperatorResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OperatorError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> OperatorResult<Self> {
        toml::from_str(content).map_err(|e| OperatorError::Config(e.to_string()))
    }

    /// Check everything that can be checked without a store.
    pub fn validate(&self) -> OperatorResult<()> {
        if self.operator.workers == 0 {
            return Err(OperatorError::Config("operator.workers must be > 0".into()));
        }
        if self.operator.queue_capacity == 0 {
            return Err(OperatorError::Config(
                "operator.queue_capacity must be > 0".into(),
            ));
        }
        self.watch_timeout()?;
        self.watch_error_delay()?;
        self.poll_interval()?;
        self.poll_relaxation()?;
        self.abort_timeout()?;
        self.lock_ttl()?;
        if self.allocation_lock_ttl()? < Duration::from_secs(1) {
            return Err(OperatorError::Config(
                "deployment.allocation_lock_ttl must be at least 1s".into(),
            ));
        }
        for kind in OperatorKind::ALL {
            self.timeout_for(kind)?;
        }
        for name in self.poller.timeouts.keys() {
            if OperatorKind::from_name(name).is_none() {
                return Err(OperatorError::Config(format!(
                    "poller.timeouts: unknown kind '{name}'"
                )));
            }
        }
        for network in &self.network.networks {
            network.validate()?;
        }
        if self.network.segmentation.size == 0 {
            return Err(OperatorError::Config(
                "network.segmentation.size must be > 0".into(),
            ));
        }
        for (name, flow) in &self.serviceflows {
            if flow.tasks.is_empty() {
                return Err(OperatorError::Config(format!(
                    "service flow '{name}' has no tasks"
                )));
            }
        }
        Ok(())
    }

    pub fn watch_timeout(&self) -> OperatorResult<Duration> {
        parse_setting("operator.watch_timeout", &self.operator.watch_timeout)
    }

    pub fn watch_error_delay(&self) -> OperatorResult<Duration> {
        parse_setting("operator.watch_error_delay", &self.operator.watch_error_delay)
    }

    pub fn poll_interval(&self) -> OperatorResult<Duration> {
        parse_setting("poller.interval", &self.poller.interval)
    }

    pub fn poll_relaxation(&self) -> OperatorResult<Duration> {
        parse_setting("poller.relaxation", &self.poller.relaxation)
    }

    pub fn abort_timeout(&self) -> OperatorResult<Duration> {
        parse_setting("poller.abort_timeout", &self.poller.abort_timeout)
    }

    pub fn lock_ttl(&self) -> OperatorResult<Duration> {
        parse_setting("deployment.lock_ttl", &self.deployment.lock_ttl)
    }

    pub fn allocation_lock_ttl(&self) -> OperatorResult<Duration> {
        parse_setting(
            "deployment.allocation_lock_ttl",
            &self.deployment.allocation_lock_ttl,
        )
    }

    /// `in_progress` deadline for one operator kind.
    pub fn timeout_for(&self, kind: OperatorKind) -> OperatorResult<Duration> {
        match self.poller.timeouts.get(kind.name()) {
            Some(value) => parse_setting(&format!("poller.timeouts.{}", kind.name()), value),
            None => parse_setting("poller.default_timeout", &self.poller.default_timeout),
        }
    }

    pub fn serviceflow(&self, name: &str) -> OperatorResult<&ServiceFlowDefinition> {
        self.serviceflows
            .get(name)
            .ok_or_else(|| OperatorError::Config(format!("service flow '{name}' is not defined")))
    }
}

fn parse_setting(name: &str, value: &str) -> OperatorResult<Duration> {
    parse_duration(value)
        .ok_or_else(|| OperatorError::Config(format!("{name}: invalid duration '{value}'")))
}

/// Parse `"500ms"`, `"30s"`, `"5m"`, `"2h"` or a bare number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_valid() {
        let config = FabrikConfig::from_toml("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.operator.workers, 10);
        assert_eq!(config.poll_interval().unwrap(), Duration::from_secs(10));
        assert_eq!(config.tasks.enabled.len(), TaskType::ALL.len());
    }

    #[test]
    fn full_config_parses() {
        let config = FabrikConfig::from_toml(
            r#"
            [operator]
            identity = "fabrik-0"
            workers = 4

            [poller]
            interval = "500ms"
            default_timeout = "20m"
            [poller.timeouts]
            backup = "2h"

            [deployment]
            name_prefix = "sf"
            lock_ttl = "30m"
            allocation_lock_ttl = "10s"
            [deployment.instance_group]
            name = "postgresql"
            jobs = [{ name = "postgresql", release = "postgres" }]

            [network.segmentation]
            reserved = 16
            size = 2
            capacity = 64

            [[network.networks]]
            name = "sf_network"
            type = "manual"
            [[network.networks.subnets]]
            range = "10.11.0.0/18"
            az = "z1"

            [tasks]
            enabled = ["ServiceInstanceBackupTask"]

            [serviceflows.upgrade_to_multi_az]
            description = "Backup then update"
            [[serviceflows.upgrade_to_multi_az.tasks]]
            task_type = "ServiceInstanceBackupTask"
            task_description = "Backup before update"
            [[serviceflows.upgrade_to_multi_az.tasks]]
            task_type = "ServiceInstanceUpdateTask"
            task_description = "Multi-AZ update"
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.operator.identity.as_deref(), Some("fabrik-0"));
        assert_eq!(config.poll_interval().unwrap(), Duration::from_millis(500));
        assert_eq!(
            config.timeout_for(OperatorKind::Backup).unwrap(),
            Duration::from_secs(7200)
        );
        assert_eq!(
            config.timeout_for(OperatorKind::Deployment).unwrap(),
            Duration::from_secs(1200)
        );
        assert_eq!(config.network.segmentation.capacity, 64);
        assert_eq!(config.network.networks[0].subnets[0].az, "z1");
        assert_eq!(config.deployment.instance_group.vm_type, "default");
        assert_eq!(config.lock_ttl().unwrap(), Duration::from_secs(1800));
        assert_eq!(
            config.allocation_lock_ttl().unwrap(),
            Duration::from_secs(10)
        );
        let flow = config.serviceflow("upgrade_to_multi_az").unwrap();
        assert_eq!(flow.tasks.len(), 2);
    }

    #[test]
    fn invalid_settings_rejected() {
        let mut config = FabrikConfig::default();
        config.poller.interval = "soon".to_string();
        assert!(matches!(config.validate(), Err(OperatorError::Config(_))));

        let mut config = FabrikConfig::default();
        config.poller.timeouts.insert("snapshot".into(), "1m".into());
        assert!(config.validate().is_err());

        let mut config = FabrikConfig::default();
        config.deployment.allocation_lock_ttl = "500ms".to_string();
        assert!(matches!(config.validate(), Err(OperatorError::Config(_))));

        let mut config = FabrikConfig::default();
        config.network.networks.push(NetworkSpec::manual(
            "bad",
            vec![fabrik_network::SubnetSpec::new("10.0.0.0/99", "z1")],
        ));
        assert!(matches!(config.validate(), Err(OperatorError::Network(_))));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fabrik.toml");
        std::fs::write(&path, "[operator]\nworkers = 3\n").unwrap();
        let config = FabrikConfig::from_file(&path).unwrap();
        assert_eq!(config.operator.workers, 3);
        assert_eq!(config.operator.queue_capacity, 256);
        assert_eq!(
            config.allocation_lock_ttl().unwrap(),
            Duration::from_secs(30)
        );

        assert!(FabrikConfig::from_file(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn unknown_flow_is_config_error() {
        let config = FabrikConfig::default();
        assert!(matches!(
            config.serviceflow("nope"),
            Err(OperatorError::Config(_))
        ));
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("ten"), None);
    }
}

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Runtime configuration, built once in `main` and handed to every component.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub kubeconfig: Option<String>,

    /// Image for connect/exchange/mesh shadow pods (must run sshd on port 22)
    #[serde(default = "default_image")]
    pub image: String,

    #[serde(default = "default_router_image")]
    pub router_image: String,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Heartbeat age, in minutes, after which a shadow resource is orphaned
    #[serde(default = "default_clean_threshold_minutes")]
    pub clean_threshold_minutes: i64,

    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: i64,

    #[serde(default = "default_pod_creation_wait_secs")]
    pub pod_creation_wait_secs: u64,

    #[serde(default = "default_port_forward_wait_secs")]
    pub port_forward_wait_secs: u64,

    /// Prefix length used when pod CIDRs are synthesized from sampled pod IPs
    #[serde(default = "default_sample_prefix")]
    pub pod_sample_prefix: u8,

    #[serde(default = "default_sample_prefix")]
    pub service_sample_prefix: u8,

    #[serde(default = "default_vpn_binary")]
    pub vpn_binary: String,

    #[serde(default = "default_vpn_install_command")]
    pub vpn_install_command: String,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub log_json: bool,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_image() -> String {
    "registry.cn-hangzhou.aliyuncs.com/rdc-incubator/kt-connect-shadow:stable".to_string()
}

fn default_router_image() -> String {
    "registry.cn-hangzhou.aliyuncs.com/rdc-incubator/kt-connect-router:stable".to_string()
}

fn default_heartbeat_interval_secs() -> u64 {
    60
}

fn default_clean_threshold_minutes() -> i64 {
    10
}

fn default_lock_timeout_secs() -> i64 {
    120
}

fn default_pod_creation_wait_secs() -> u64 {
    60
}

fn default_port_forward_wait_secs() -> u64 {
    10
}

fn default_sample_prefix() -> u8 {
    16
}

fn default_vpn_binary() -> String {
    "sshuttle".to_string()
}

fn default_vpn_install_command() -> String {
    "pip3 install sshuttle".to_string()
}

fn default_state_dir() -> PathBuf {
    directories::UserDirs::new()
        .map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf())
        .join(".kubebridge")
}

impl Config {
    pub fn load() -> AppResult<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("KUBEBRIDGE").try_parsing(true))
            .build()?;

        let settings: Config = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the session loops and the CIDR reducer cannot work with
    pub fn validate(&self) -> AppResult<()> {
        if self.heartbeat_interval_secs == 0 {
            return Err(AppError::Config(
                "heartbeat_interval_secs must be greater than 0".to_string(),
            ));
        }
        for (name, prefix) in [
            ("pod_sample_prefix", self.pod_sample_prefix),
            ("service_sample_prefix", self.service_sample_prefix),
        ] {
            if !(1..=32).contains(&prefix) {
                return Err(AppError::Config(format!(
                    "{} must be between 1 and 32, got {}",
                    name, prefix
                )));
            }
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn pod_creation_wait(&self) -> Duration {
        Duration::from_secs(self.pod_creation_wait_secs)
    }

    pub fn port_forward_wait(&self) -> Duration {
        Duration::from_secs(self.port_forward_wait_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            kubeconfig: None,
            image: default_image(),
            router_image: default_router_image(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            clean_threshold_minutes: default_clean_threshold_minutes(),
            lock_timeout_secs: default_lock_timeout_secs(),
            pod_creation_wait_secs: default_pod_creation_wait_secs(),
            port_forward_wait_secs: default_port_forward_wait_secs(),
            pod_sample_prefix: default_sample_prefix(),
            service_sample_prefix: default_sample_prefix(),
            vpn_binary: default_vpn_binary(),
            vpn_install_command: default_vpn_install_command(),
            state_dir: default_state_dir(),
            log_json: false,
        }
    }
}

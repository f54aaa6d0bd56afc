use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capacity {
    pub min: u32,
    pub max: u32,
    pub desired: u32,
}

impl Default for Capacity {
    fn default() -> Self {
        Self {
            min: 1,
            max: 2,
            desired: 1,
        }
    }
}

impl Capacity {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max == 0 || self.min > self.desired || self.desired > self.max {
            return Err(ConfigError::Invalid(format!(
                "capacity must satisfy min <= desired <= max and max >= 1 (min={}, desired={}, max={})",
                self.min, self.desired, self.max
            )));
        }
        Ok(())
    }
}

/// Metric the target-tracking policy follows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ScalingMetric {
    Cpu,
    AlbRequestCount,
}

impl ScalingMetric {
    pub fn predefined_type(self) -> &'static str {
        match self {
            Self::Cpu => "ASGAverageCPUUtilization",
            Self::AlbRequestCount => "ALBRequestCountPerTarget",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScalingPolicy {
    pub metric: ScalingMetric,
    pub target: f64,
    /// Covers model download and load before a new instance counts.
    pub warmup_secs: u32,
    pub disable_scale_in: bool,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            metric: ScalingMetric::Cpu,
            target: 70.0,
            warmup_secs: 900,
            disable_scale_in: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RootVolume {
    pub device_name: String,
    pub size_gib: u32,
    pub volume_type: String,
    pub delete_on_termination: bool,
}

impl Default for RootVolume {
    fn default() -> Self {
        Self {
            device_name: "/dev/sda1".to_string(),
            size_gib: 70,
            volume_type: "gp3".to_string(),
            delete_on_termination: true,
        }
    }
}

/// The GPU autoscaling group running vLLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InferenceConfig {
    pub instance_type: String,
    /// Region -> AMI id. Needs a GPU driver image.
    pub ami: BTreeMap<String, String>,
    pub root_volume: RootVolume,
    pub model: String,
    pub vllm_version: Option<String>,
    pub gpu_memory_utilization: f32,
    pub max_model_len: Option<u32>,
    pub tensor_parallel_size: Option<u32>,
    pub capacity: Capacity,
    pub scaling: ScalingPolicy,
    pub health_check_grace_secs: u32,
    pub service_user: String,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        let mut ami = BTreeMap::new();
        // Deep Learning OSS Nvidia Driver AMI GPU PyTorch 2.6 (Ubuntu 22.04)
        ami.insert("us-east-1".to_string(), "ami-0fcdcdcc9cf0407ae".to_string());
        Self {
            instance_type: "g5.xlarge".to_string(),
            ami,
            root_volume: RootVolume::default(),
            model: "google/medgemma-4b-it".to_string(),
            vllm_version: None,
            gpu_memory_utilization: 0.9,
            max_model_len: None,
            tensor_parallel_size: None,
            capacity: Capacity::default(),
            scaling: ScalingPolicy::default(),
            health_check_grace_secs: 900,
            service_user: "ubuntu".to_string(),
        }
    }
}

impl InferenceConfig {
    pub fn ami_for(&self, region: &str) -> Result<&str, ConfigError> {
        self.ami
            .get(region)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::MissingAmi(region.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.capacity.validate()?;
        if !(0.0..=1.0).contains(&self.gpu_memory_utilization) || self.gpu_memory_utilization == 0.0 {
            return Err(ConfigError::Invalid(format!(
                "gpu_memory_utilization must be in (0, 1], got {}",
                self.gpu_memory_utilization
            )));
        }
        if self.scaling.target.is_nan() || self.scaling.target <= 0.0 {
            return Err(ConfigError::Invalid("scaling.target must be positive".into()));
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid("inference.model is empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Arm64,
    X86_64,
}

impl Architecture {
    pub fn cpu_architecture(self) -> &'static str {
        match self {
            Self::Arm64 => "ARM64",
            Self::X86_64 => "X86_64",
        }
    }
}

/// The OpenWebUI container service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WebUiConfig {
    pub image: String,
    pub cpu: u32,
    pub memory_mib: u32,
    pub architecture: Architecture,
    pub desired_count: u32,
    pub min_healthy_percent: u32,
    pub max_healthy_percent: u32,
    /// Extra variables merged over the generated ones.
    pub environment: BTreeMap<String, String>,
    pub data_path: String,
    pub access_point_path: String,
    pub log_stream_prefix: String,
    pub log_retention_days: u32,
    pub container_insights: bool,
}

impl Default for WebUiConfig {
    fn default() -> Self {
        Self {
            image: "ghcr.io/open-webui/open-webui:main".to_string(),
            cpu: 2048,
            memory_mib: 4096,
            architecture: Architecture::Arm64,
            desired_count: 1,
            min_healthy_percent: 100,
            max_healthy_percent: 200,
            environment: BTreeMap::new(),
            data_path: "/app/backend/data".to_string(),
            access_point_path: "/openwebui-data".to_string(),
            log_stream_prefix: "webui".to_string(),
            log_retention_days: 30,
            container_insights: true,
        }
    }
}

impl WebUiConfig {
    const FARGATE_CPU: [u32; 7] = [256, 512, 1024, 2048, 4096, 8192, 16384];

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !Self::FARGATE_CPU.contains(&self.cpu) {
            return Err(ConfigError::Invalid(format!(
                "webui.cpu {} is not a Fargate CPU size",
                self.cpu
            )));
        }
        // Fargate allows between 2x and 8x the vCPU count in GiB.
        let vcpu_mib = self.cpu / 1024 * 1024;
        if vcpu_mib > 0 && (self.memory_mib < vcpu_mib * 2 || self.memory_mib > vcpu_mib * 8) {
            return Err(ConfigError::Invalid(format!(
                "webui.memory_mib {} does not fit cpu {}",
                self.memory_mib, self.cpu
            )));
        }
        if self.min_healthy_percent > self.max_healthy_percent {
            return Err(ConfigError::Invalid(
                "webui.min_healthy_percent exceeds max_healthy_percent".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ServiceConfig {
    pub inference: InferenceConfig,
    pub webui: WebUiConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_bounds() {
        assert!(Capacity::default().validate().is_ok());
        assert!(Capacity { min: 2, max: 3, desired: 1 }.validate().is_err());
        assert!(Capacity { min: 0, max: 0, desired: 0 }.validate().is_err());
        assert!(Capacity { min: 1, max: 3, desired: 4 }.validate().is_err());
    }

    #[test]
    fn test_ami_lookup() {
        let cfg = InferenceConfig::default();
        assert_eq!(cfg.ami_for("us-east-1").unwrap(), "ami-0fcdcdcc9cf0407ae");
        assert!(matches!(cfg.ami_for("eu-west-1"), Err(ConfigError::MissingAmi(_))));
    }

    #[test]
    fn test_webui_sizes() {
        assert!(WebUiConfig::default().validate().is_ok());
        let bad = WebUiConfig {
            cpu: 3000,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let too_little = WebUiConfig {
            memory_mib: 2048,
            ..Default::default()
        };
        assert!(too_little.validate().is_err());
    }
}

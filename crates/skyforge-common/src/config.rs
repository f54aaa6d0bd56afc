use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::load_balancer::LoadBalancerConfig;
use crate::network::NetworkConfig;
use crate::secret::SecretRef;
use crate::service::ServiceConfig;
use crate::util::is_shell_safe;

/// Target account and region.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Environment {
    /// Only used to key recorded state; templates use `AWS::AccountId`.
    pub account: Option<String>,
    pub region: String,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            account: None,
            region: "us-east-1".to_string(),
        }
    }
}

impl Environment {
    pub fn account_or_default(&self) -> &str {
        self.account.as_deref().unwrap_or("default")
    }
}

/// Free-form context block, as in a CDK context file.
/// Only `context.vllm.model` is interpreted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Context {
    pub vllm: Option<VllmContext>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct VllmContext {
    pub model: Option<String>,
}

/// Everything the three stacks are synthesized from (`skyforge.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Prefix of the stack names: `{prefix}Network`, `{prefix}LoadBalancer`, `{prefix}Service`.
    pub stack_prefix: String,
    pub env: Environment,
    pub network: NetworkConfig,
    pub load_balancer: LoadBalancerConfig,
    pub service: ServiceConfig,
    /// Model repository credential, resolved on the instance at boot.
    pub model_token: SecretRef,
    /// Tags applied to every taggable resource.
    pub tags: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "is_empty_context")]
    pub context: Context,
}

fn is_empty_context(c: &Context) -> bool {
    c.vllm.is_none() && c.extra.is_empty()
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut tags = BTreeMap::new();
        tags.insert("app".to_string(), "skyforge".to_string());
        Self {
            stack_prefix: "Skyforge".to_string(),
            env: Environment::default(),
            network: NetworkConfig::default(),
            load_balancer: LoadBalancerConfig::default(),
            service: ServiceConfig::default(),
            model_token: SecretRef::default(),
            tags,
            context: Context::default(),
        }
    }
}

impl AppConfig {
    /// Loads the config file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let mut cfg: AppConfig = serde_json::from_str(raw)?;
        cfg.apply_context();
        Ok(cfg)
    }

    fn apply_context(&mut self) {
        if let Some(model) = self.context.vllm.as_ref().and_then(|v| v.model.clone()) {
            self.service.inference.model = model;
        }
    }

    pub fn network_stack(&self) -> String {
        format!("{}Network", self.stack_prefix)
    }

    pub fn load_balancer_stack(&self) -> String {
        format!("{}LoadBalancer", self.stack_prefix)
    }

    pub fn service_stack(&self) -> String {
        format!("{}Service", self.stack_prefix)
    }

    pub fn toolkit_stack(&self) -> String {
        format!("{}Toolkit", self.stack_prefix)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_prefix.is_empty()
            || !self.stack_prefix.chars().all(|c| c.is_ascii_alphanumeric())
            || !self.stack_prefix.starts_with(|c: char| c.is_ascii_alphabetic())
        {
            return Err(ConfigError::Invalid(format!(
                "stack_prefix '{}' must be alphanumeric and start with a letter",
                self.stack_prefix
            )));
        }
        if self.env.region.is_empty() {
            return Err(ConfigError::Invalid("env.region is empty".into()));
        }
        if self.model_token.name.trim().is_empty() {
            return Err(ConfigError::Invalid("model_token.name is empty".into()));
        }
        self.validate_boot_inputs()?;
        self.network.validate()?;
        self.load_balancer.validate()?;
        self.service.inference.validate()?;
        self.service.inference.ami_for(&self.env.region)?;
        self.service.webui.validate()?;
        Ok(())
    }

    /// Values the inference boot script and systemd unit embed unquoted.
    pub fn validate_boot_inputs(&self) -> Result<(), ConfigError> {
        let inf = &self.service.inference;
        let fields = [
            ("inference.model", Some(inf.model.as_str())),
            ("inference.vllm_version", inf.vllm_version.as_deref()),
            ("inference.service_user", Some(inf.service_user.as_str())),
            ("model_token", Some(self.model_token.secret_id())),
            ("env.region", Some(self.env.region.as_str())),
        ];
        for (field, value) in fields {
            if let Some(v) = value.filter(|v| !is_shell_safe(v)) {
                return Err(ConfigError::Invalid(format!("{field} '{v}' contains unsupported characters")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_file() {
        let cfg = AppConfig::from_json(
            r#"{
                "env": { "region": "us-east-1", "account": "123456789012" },
                "service": { "inference": { "capacity": { "min": 1, "max": 3, "desired": 1 } } }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.service.inference.capacity.max, 3);
        assert_eq!(cfg.service.inference.instance_type, "g5.xlarge");
        assert_eq!(cfg.env.account_or_default(), "123456789012");
        assert_eq!(cfg.network.ports.inference, 8000);
    }

    #[test]
    fn test_context_model_override() {
        let cfg = AppConfig::from_json(r#"{ "context": { "vllm": { "model": "Qwen/Qwen2.5-7B-Instruct" } } }"#)
            .unwrap();
        assert_eq!(cfg.service.inference.model, "Qwen/Qwen2.5-7B-Instruct");
    }

    #[test]
    fn test_region_without_ami() {
        let mut cfg = AppConfig::default();
        cfg.env.region = "ap-south-1".to_string();
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingAmi(_))));
    }

    #[test]
    fn test_boot_inputs_must_be_shell_safe() {
        let mut cfg = AppConfig::default();
        cfg.service.inference.service_user = "ubuntu user".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = AppConfig::default();
        cfg.model_token.name = "HuggingFaceToken$(id)".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = AppConfig::default();
        cfg.env.region = "us-east-1;reboot".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_prefix() {
        let cfg = AppConfig {
            stack_prefix: "1-bad".to_string(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_stack_names() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.network_stack(), "SkyforgeNetwork");
        assert_eq!(cfg.load_balancer_stack(), "SkyforgeLoadBalancer");
        assert_eq!(cfg.service_stack(), "SkyforgeService");
    }
}

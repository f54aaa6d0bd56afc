use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Target group health check knobs.
///
/// A target is deregistered after `unhealthy_threshold` consecutive
/// failures and registered again after `healthy_threshold` successes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheck {
    pub path: String,
    pub interval_secs: u32,
    pub timeout_secs: u32,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
    pub matcher: String,
}

impl HealthCheck {
    /// vLLM answers `/health` once the model is loaded.
    pub fn inference() -> Self {
        Self {
            path: "/health".to_string(),
            interval_secs: 60,
            timeout_secs: 15,
            healthy_threshold: 2,
            unhealthy_threshold: 3,
            matcher: "200".to_string(),
        }
    }

    pub fn webui() -> Self {
        Self {
            path: "/health".to_string(),
            interval_secs: 30,
            timeout_secs: 5,
            healthy_threshold: 2,
            unhealthy_threshold: 3,
            matcher: "200".to_string(),
        }
    }

    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        for (knob, v) in [
            ("healthy_threshold", self.healthy_threshold),
            ("unhealthy_threshold", self.unhealthy_threshold),
        ] {
            if !(2..=10).contains(&v) {
                return Err(ConfigError::Invalid(format!(
                    "{name}.{knob} must be within 2..=10, got {v}"
                )));
            }
        }
        if self.timeout_secs >= self.interval_secs {
            return Err(ConfigError::Invalid(format!(
                "{name}.timeout_secs must be shorter than interval_secs"
            )));
        }
        if !self.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!("{name}.path must start with '/'")));
        }
        Ok(())
    }
}

/// Cookie-based session affinity on the inference target group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Stickiness {
    pub enabled: bool,
    pub duration_secs: u32,
}

impl Default for Stickiness {
    fn default() -> Self {
        Self {
            enabled: true,
            duration_secs: 86_400,
        }
    }
}

impl Stickiness {
    pub const MAX_DURATION_SECS: u32 = 604_800;

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && !(1..=Self::MAX_DURATION_SECS).contains(&self.duration_secs) {
            return Err(ConfigError::Invalid(format!(
                "stickiness.duration_secs must be within 1..={}, got {}",
                Self::MAX_DURATION_SECS,
                self.duration_secs
            )));
        }
        Ok(())
    }
}

/// Shared-secret header the edge network adds and the public listener checks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HeaderGuard {
    pub header_name: String,
    /// Name of the generated Secrets Manager secret holding the value.
    /// Defaults to `{stack_prefix}OriginVerify`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
    pub secret_length: u32,
}

impl Default for HeaderGuard {
    fn default() -> Self {
        Self {
            header_name: "X-Origin-Verify".to_string(),
            secret_name: None,
            secret_length: 32,
        }
    }
}

impl HeaderGuard {
    pub fn resolved_secret_name(&self, stack_prefix: &str) -> String {
        self.secret_name
            .clone()
            .unwrap_or_else(|| format!("{stack_prefix}OriginVerify"))
    }

    /// Dynamic reference resolved by CloudFormation at deploy time, so the
    /// template only ever carries the pointer.
    pub fn dynamic_reference(&self, stack_prefix: &str) -> String {
        format!(
            "{{{{resolve:secretsmanager:{}:SecretString}}}}",
            self.resolved_secret_name(stack_prefix)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub inference_health: HealthCheck,
    pub webui_health: HealthCheck,
    pub stickiness: Stickiness,
    pub header_guard: HeaderGuard,
    pub deregistration_delay_secs: u32,
    /// Long enough for streamed chat completions.
    pub idle_timeout_secs: u32,
    pub edge_price_class: String,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            inference_health: HealthCheck::inference(),
            webui_health: HealthCheck::webui(),
            stickiness: Stickiness::default(),
            header_guard: HeaderGuard::default(),
            deregistration_delay_secs: 30,
            idle_timeout_secs: 300,
            edge_price_class: "PriceClass_100".to_string(),
        }
    }
}

impl LoadBalancerConfig {
    /// Public listener model: forward only when the guard header carries
    /// `secret_value`, otherwise 403.
    pub fn public_listener(&self, port: u16, target_group: &str, secret_value: &str) -> Listener {
        Listener {
            port,
            rules: vec![ListenerRule {
                priority: 1,
                conditions: vec![HeaderCondition {
                    header: self.header_guard.header_name.clone(),
                    values: vec![secret_value.to_string()],
                }],
                action: ListenerAction::Forward(target_group.to_string()),
            }],
            default_action: ListenerAction::FixedResponse {
                status: 403,
                content_type: "text/plain".to_string(),
                body: "Forbidden".to_string(),
            },
        }
    }

    pub fn internal_listener(&self, port: u16, target_group: &str) -> Listener {
        Listener {
            port,
            rules: Vec::new(),
            default_action: ListenerAction::Forward(target_group.to_string()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.inference_health.validate("load_balancer.inference_health")?;
        self.webui_health.validate("load_balancer.webui_health")?;
        self.stickiness.validate()?;
        if self.header_guard.header_name.trim().is_empty() {
            return Err(ConfigError::Invalid("header_guard.header_name is empty".into()));
        }
        if self.header_guard.secret_length < 16 {
            return Err(ConfigError::Invalid(
                "header_guard.secret_length must be at least 16".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ListenerAction {
    Forward(String),
    FixedResponse {
        status: u16,
        content_type: String,
        body: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeaderCondition {
    pub header: String,
    pub values: Vec<String>,
}

impl HeaderCondition {
    /// Header names and values compare case-insensitively, as on an ALB.
    fn matches(&self, headers: &[(&str, &str)]) -> bool {
        headers.iter().any(|(name, value)| {
            name.eq_ignore_ascii_case(&self.header)
                && self.values.iter().any(|v| v.eq_ignore_ascii_case(value))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListenerRule {
    pub priority: u32,
    pub conditions: Vec<HeaderCondition>,
    pub action: ListenerAction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Listener {
    pub port: u16,
    pub rules: Vec<ListenerRule>,
    pub default_action: ListenerAction,
}

impl Listener {
    /// Action taken for a request carrying `headers`: rules in priority
    /// order, every condition of a rule must match, else the default.
    pub fn evaluate(&self, headers: &[(&str, &str)]) -> &ListenerAction {
        let mut rules: Vec<&ListenerRule> = self.rules.iter().collect();
        rules.sort_by_key(|r| r.priority);
        rules
            .into_iter()
            .find(|r| r.conditions.iter().all(|c| c.matches(headers)))
            .map(|r| &r.action)
            .unwrap_or(&self.default_action)
    }
}

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use skyforge_common::{BootstrapRecord, Capacity, ScalingMetric, ScalingPolicy, StackTemplate};

use super::{CloudProvider, StackOutcome};
use crate::error::{ProviderError, ResourceFailure};
use crate::scaling::ScalingSimulator;

/// In-memory provider for dry runs and tests.
///
/// Stacks apply atomically: a stack containing a resource marked with
/// [`SimulatedProvider::fail_resource`] is rolled back and nothing changes.
#[derive(Default)]
pub struct SimulatedProvider {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    stacks: BTreeMap<String, SimStack>,
    failures: BTreeMap<String, String>,
    /// Stack names in the order applies were attempted.
    attempts: Vec<String>,
}

struct SimStack {
    template: StackTemplate,
    outcome: StackOutcome,
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every apply of a stack containing `logical_id` fail.
    pub async fn fail_resource(&self, logical_id: &str, reason: &str) {
        let mut inner = self.inner.lock().await;
        inner.failures.insert(logical_id.to_string(), reason.to_string());
    }

    pub async fn clear_failures(&self) {
        self.inner.lock().await.failures.clear();
    }

    pub async fn stack_names(&self) -> Vec<String> {
        self.inner.lock().await.stacks.keys().cloned().collect()
    }

    pub async fn attempts(&self) -> Vec<String> {
        self.inner.lock().await.attempts.clone()
    }

    pub async fn template(&self, stack: &str) -> Option<StackTemplate> {
        let inner = self.inner.lock().await;
        inner.stacks.get(stack).map(|s| s.template.clone())
    }

    /// Runs the target-tracking policy of an autoscaling group in a deployed
    /// stack against per-instance metric samples.
    pub async fn simulate_scaling(
        &self,
        stack: &str,
        asg: &str,
        samples: &[f64],
    ) -> Result<Vec<u32>, ProviderError> {
        let template = self
            .template(stack)
            .await
            .ok_or_else(|| ProviderError::Parse(format!("stack {stack} is not deployed")))?;
        let (policy, bounds) = scaling_model(&template, asg)?;
        let mut sim = ScalingSimulator::new(policy, bounds)
            .map_err(|e| ProviderError::Parse(format!("{asg}: {e}")))?;
        Ok(sim.run(samples))
    }
}

fn physical_id(stack: &str, logical_id: &str) -> String {
    format!("sim-{}-{}", stack.to_ascii_lowercase(), logical_id.to_ascii_lowercase())
}

fn capacity_field(props: &Value, key: &str) -> Result<u32, ProviderError> {
    let v = &props[key];
    v.as_str()
        .and_then(|s| s.parse().ok())
        .or_else(|| v.as_u64().and_then(|n| u32::try_from(n).ok()))
        .ok_or_else(|| ProviderError::Parse(format!("autoscaling group has no usable {key}")))
}

fn scaling_model(template: &StackTemplate, asg: &str) -> Result<(ScalingPolicy, Capacity), ProviderError> {
    let group = template
        .resources
        .get(asg)
        .ok_or_else(|| ProviderError::Parse(format!("{asg} not found in {}", template.name)))?;
    let bounds = Capacity {
        min: capacity_field(&group.properties, "MinSize")?,
        max: capacity_field(&group.properties, "MaxSize")?,
        desired: capacity_field(&group.properties, "DesiredCapacity")?,
    };

    let tracking = template
        .resources_of_kind("AWS::AutoScaling::ScalingPolicy")
        .map(|(_, r)| &r.properties)
        .find(|p| p["AutoScalingGroupName"]["Ref"] == asg)
        .map(|p| &p["TargetTrackingConfiguration"])
        .ok_or_else(|| ProviderError::Parse(format!("{asg} has no target tracking policy")))?;
    let metric = match tracking["PredefinedMetricSpecification"]["PredefinedMetricType"].as_str() {
        Some("ALBRequestCountPerTarget") => ScalingMetric::AlbRequestCount,
        _ => ScalingMetric::Cpu,
    };
    let policy = ScalingPolicy {
        metric,
        target: tracking["TargetValue"]
            .as_f64()
            .ok_or_else(|| ProviderError::Parse("target tracking policy has no TargetValue".into()))?,
        disable_scale_in: tracking["DisableScaleIn"].as_bool().unwrap_or(false),
        ..Default::default()
    };
    Ok((policy, bounds))
}

#[async_trait]
impl CloudProvider for SimulatedProvider {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn deploy_stack(
        &self,
        template: &StackTemplate,
        _bootstrap: Option<&BootstrapRecord>,
    ) -> Result<StackOutcome, ProviderError> {
        let mut inner = self.inner.lock().await;
        inner.attempts.push(template.name.clone());

        let failed: Vec<ResourceFailure> = template
            .resources
            .iter()
            .filter_map(|(id, r)| {
                inner.failures.get(id).map(|reason| ResourceFailure {
                    logical_id: id.clone(),
                    kind: r.kind.clone(),
                    reason: reason.clone(),
                })
            })
            .collect();
        if !failed.is_empty() {
            let status = if inner.stacks.contains_key(&template.name) {
                "UPDATE_ROLLBACK_COMPLETE"
            } else {
                "ROLLBACK_COMPLETE"
            };
            tracing::warn!(stack = %template.name, failed = failed.len(), "simulated apply failed");
            return Err(ProviderError::StackFailed {
                stack: template.name.clone(),
                reason: status.to_string(),
                resources: failed,
            });
        }

        let status = if inner.stacks.contains_key(&template.name) {
            "UPDATE_COMPLETE"
        } else {
            "CREATE_COMPLETE"
        };
        let outcome = StackOutcome {
            status: status.to_string(),
            outputs: template
                .outputs
                .iter()
                .map(|(key, o)| {
                    let value = match &o.value {
                        Value::String(s) => s.clone(),
                        _ => format!("sim://{}/{}", template.name, key),
                    };
                    (key.clone(), value)
                })
                .collect(),
            physical_ids: template
                .resources
                .keys()
                .map(|id| (id.clone(), physical_id(&template.name, id)))
                .collect(),
        };
        inner.stacks.insert(
            template.name.clone(),
            SimStack {
                template: template.clone(),
                outcome: outcome.clone(),
            },
        );
        tracing::debug!(stack = %template.name, status, "simulated apply");
        Ok(outcome)
    }

    async fn delete_stack(&self, name: &str) -> Result<bool, ProviderError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.stacks.remove(name).is_some())
    }

    async fn describe_stack(&self, name: &str) -> Result<Option<StackOutcome>, ProviderError> {
        let inner = self.inner.lock().await;
        Ok(inner.stacks.get(name).map(|s| s.outcome.clone()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use skyforge_common::{AppConfig, Resource};
    use skyforge_stacks::service::{synth_service, INFERENCE_ASG};

    use super::*;

    fn stack(name: &str) -> StackTemplate {
        let mut t = StackTemplate::new(name, "");
        t.add("Bucket", Resource::new("AWS::S3::Bucket", json!({}))).unwrap();
        t.output("Name", json!({ "Ref": "Bucket" }), None);
        t
    }

    #[tokio::test]
    async fn test_apply_and_delete() {
        let p = SimulatedProvider::new();
        let outcome = p.deploy_stack(&stack("A"), None).await.unwrap();
        assert_eq!(outcome.status, "CREATE_COMPLETE");
        assert_eq!(outcome.physical_ids["Bucket"], "sim-a-bucket");
        assert_eq!(outcome.outputs["Name"], "sim://A/Name");
        assert_eq!(p.deploy_stack(&stack("A"), None).await.unwrap().status, "UPDATE_COMPLETE");

        assert!(p.delete_stack("A").await.unwrap());
        assert!(!p.delete_stack("A").await.unwrap());
        assert!(p.describe_stack("A").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_failure_rolls_back() {
        let p = SimulatedProvider::new();
        p.fail_resource("Bucket", "bucket name taken").await;
        let err = p.deploy_stack(&stack("A"), None).await.unwrap_err();
        assert_eq!(err.resources().len(), 1);
        assert_eq!(err.resources()[0].reason, "bucket name taken");
        assert!(p.stack_names().await.is_empty());
        assert_eq!(p.attempts().await, vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn test_scaling_scenario_from_template() {
        let mut cfg = AppConfig::default();
        cfg.service.inference.capacity = Capacity { min: 1, max: 3, desired: 1 };
        let template = synth_service(&cfg).unwrap();
        let p = SimulatedProvider::new();
        p.deploy_stack(&template, None).await.unwrap();

        let capacities = p
            .simulate_scaling(&template.name, INFERENCE_ASG, &[95.0; 5])
            .await
            .unwrap();
        assert_eq!(capacities.last(), Some(&3));
        assert!(capacities.windows(2).all(|w| w[0] <= w[1]));
        assert!(capacities.iter().all(|c| *c <= 3));
    }
}

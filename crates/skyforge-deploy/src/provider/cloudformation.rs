use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use skyforge_common::{BootstrapRecord, StackTemplate};

use super::{CloudProvider, StackOutcome};
use crate::error::{ProviderError, ResourceFailure};

/// Largest template body CloudFormation accepts inline.
const MAX_INLINE_TEMPLATE: usize = 51_200;

/// Applies stacks with CloudFormation through the `aws` CLI.
///
/// Credentials come from the usual AWS chain (environment, profile,
/// instance role); only the region and optional profile are passed.
pub struct CloudFormationProvider {
    region: String,
    profile: Option<String>,
    aws_bin: String,
    work_dir: PathBuf,
}

impl CloudFormationProvider {
    pub fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
            profile: std::env::var("AWS_PROFILE").ok().filter(|p| !p.is_empty()),
            aws_bin: "aws".to_string(),
            work_dir: std::env::temp_dir(),
        }
    }

    pub fn with_aws_bin(mut self, bin: &str) -> Self {
        self.aws_bin = bin.to_string();
        self
    }

    async fn aws(&self, args: &[&str]) -> Result<String, ProviderError> {
        let mut cmd = Command::new(&self.aws_bin);
        cmd.args(args).args(["--region", self.region.as_str(), "--output", "json"]);
        if let Some(profile) = &self.profile {
            cmd.args(["--profile", profile.as_str()]);
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        tracing::debug!(command = %args.join(" "), "running aws");
        let output = cmd.output().await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        Err(ProviderError::Command {
            command: format!("aws {}", args.join(" ")),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Failed resource events of the most recent operation on `stack`.
    async fn failure_events(&self, stack: &str) -> Vec<ResourceFailure> {
        match self
            .aws(&["cloudformation", "describe-stack-events", "--stack-name", stack])
            .await
        {
            Ok(out) => parse_failure_events(stack, &out).unwrap_or_else(|e| {
                tracing::warn!(%stack, error = %e, "failed to parse stack events");
                Vec::new()
            }),
            Err(e) => {
                tracing::warn!(%stack, error = %e, "failed to fetch stack events");
                Vec::new()
            }
        }
    }

    async fn physical_ids(&self, stack: &str) -> Result<BTreeMap<String, String>, ProviderError> {
        let out = self
            .aws(&["cloudformation", "describe-stack-resources", "--stack-name", stack])
            .await?;
        parse_stack_resources(&out)
    }

    /// Deletes an existing stack and waits until it is gone.
    async fn remove_stack(&self, name: &str) -> Result<(), ProviderError> {
        self.aws(&["cloudformation", "delete-stack", "--stack-name", name])
            .await?;
        if let Err(e) = self
            .aws(&["cloudformation", "wait", "stack-delete-complete", "--stack-name", name])
            .await
        {
            return Err(self.stack_failed(name, e).await);
        }
        Ok(())
    }

    async fn stack_failed(&self, stack: &str, err: ProviderError) -> ProviderError {
        match err {
            ProviderError::Command { stderr, .. } => ProviderError::StackFailed {
                stack: stack.to_string(),
                reason: stderr,
                resources: self.failure_events(stack).await,
            },
            other => other,
        }
    }
}

#[async_trait]
impl CloudProvider for CloudFormationProvider {
    fn name(&self) -> &str {
        "cloudformation"
    }

    async fn deploy_stack(
        &self,
        template: &StackTemplate,
        bootstrap: Option<&BootstrapRecord>,
    ) -> Result<StackOutcome, ProviderError> {
        let name = template.name.as_str();
        let body = template.to_pretty_json();
        if body.len() > MAX_INLINE_TEMPLATE && bootstrap.is_none() {
            return Err(ProviderError::NotBootstrapped {
                stack: name.to_string(),
                bytes: body.len(),
                limit: MAX_INLINE_TEMPLATE,
            });
        }

        // A failed first create leaves a stack that can only be deleted.
        if let Some(existing) = self.describe_stack(name).await? {
            if existing.status == "ROLLBACK_COMPLETE" {
                tracing::warn!(stack = %name, "stack is in ROLLBACK_COMPLETE, deleting before retry");
                self.remove_stack(name).await?;
            }
        }

        let hash = template.content_hash();
        let path = self.work_dir.join(format!("skyforge-{name}-{}.json", &hash[..12]));
        tokio::fs::write(&path, body).await?;
        let path_str = path.to_string_lossy().into_owned();

        let mut args = vec![
            "cloudformation",
            "deploy",
            "--stack-name",
            name,
            "--template-file",
            path_str.as_str(),
            "--no-fail-on-empty-changeset",
            "--capabilities",
            "CAPABILITY_IAM",
            "CAPABILITY_NAMED_IAM",
        ];
        if let Some(b) = bootstrap {
            args.extend(["--s3-bucket", b.bucket.as_str(), "--s3-prefix", name]);
        }

        tracing::info!(stack = %name, "applying stack");
        let result = self.aws(&args).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::debug!(path = %path.display(), error = %e, "failed to remove template file");
        }
        if let Err(e) = result {
            return Err(self.stack_failed(name, e).await);
        }

        let mut outcome = self
            .describe_stack(name)
            .await?
            .ok_or_else(|| ProviderError::Parse(format!("stack {name} not found after deploy")))?;
        outcome.physical_ids = self.physical_ids(name).await?;
        Ok(outcome)
    }

    async fn delete_stack(&self, name: &str) -> Result<bool, ProviderError> {
        if self.describe_stack(name).await?.is_none() {
            tracing::info!(stack = %name, "stack does not exist, nothing to delete");
            return Ok(false);
        }
        tracing::info!(stack = %name, "deleting stack");
        self.remove_stack(name).await?;
        Ok(true)
    }

    async fn describe_stack(&self, name: &str) -> Result<Option<StackOutcome>, ProviderError> {
        match self
            .aws(&["cloudformation", "describe-stacks", "--stack-name", name])
            .await
        {
            Ok(out) => parse_describe_stacks(&out),
            Err(ProviderError::Command { stderr, .. }) if stderr.contains("does not exist") => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn parse_json(out: &str) -> Result<Value, ProviderError> {
    serde_json::from_str(out).map_err(|e| ProviderError::Parse(e.to_string()))
}

fn parse_describe_stacks(out: &str) -> Result<Option<StackOutcome>, ProviderError> {
    let v = parse_json(out)?;
    let Some(stack) = v["Stacks"].get(0) else {
        return Ok(None);
    };
    let status = stack["StackStatus"].as_str().unwrap_or_default().to_string();
    if status == "DELETE_COMPLETE" {
        return Ok(None);
    }
    let outputs = stack["Outputs"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|o| {
            Some((
                o["OutputKey"].as_str()?.to_string(),
                o["OutputValue"].as_str()?.to_string(),
            ))
        })
        .collect();
    Ok(Some(StackOutcome {
        status,
        outputs,
        physical_ids: BTreeMap::new(),
    }))
}

fn parse_stack_resources(out: &str) -> Result<BTreeMap<String, String>, ProviderError> {
    let v = parse_json(out)?;
    Ok(v["StackResources"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|r| {
            Some((
                r["LogicalResourceId"].as_str()?.to_string(),
                r["PhysicalResourceId"].as_str()?.to_string(),
            ))
        })
        .collect())
}

/// Events come newest first; the scan stops at the stack's own
/// "User Initiated" event that started the operation.
fn parse_failure_events(stack: &str, out: &str) -> Result<Vec<ResourceFailure>, ProviderError> {
    let v = parse_json(out)?;
    let mut failures = Vec::new();
    for event in v["StackEvents"].as_array().into_iter().flatten() {
        let logical_id = event["LogicalResourceId"].as_str().unwrap_or_default();
        let status = event["ResourceStatus"].as_str().unwrap_or_default();
        let reason = event["ResourceStatusReason"].as_str().unwrap_or_default();
        if logical_id == stack && reason == "User Initiated" {
            break;
        }
        if logical_id != stack && status.ends_with("_FAILED") && reason != "Resource creation cancelled" {
            failures.push(ResourceFailure {
                logical_id: logical_id.to_string(),
                kind: event["ResourceType"].as_str().unwrap_or_default().to_string(),
                reason: reason.to_string(),
            });
        }
    }
    failures.reverse();
    Ok(failures)
}

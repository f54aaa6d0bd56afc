use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::Instrument;

use skyforge_common::util::now_ms;
use skyforge_common::{AppConfig, BootstrapRecord, RecordStatus, StackRecord, StackTemplate};
use skyforge_stacks::toolkit::BUCKET_NAME;
use skyforge_stacks::{synth_toolkit, App};
use skyforge_state::{load_json, store_json, StateStore};

use crate::diff::{diff, StackDiff};
use crate::error::DeployError;
use crate::provider::CloudProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StackState {
    NotDeployed,
    UpToDate,
    Changed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct StackStatus {
    pub name: String,
    pub depends_on: Vec<String>,
    pub state: StackState,
    pub record: Option<StackRecord>,
}

#[derive(Debug, Clone)]
pub struct AppliedStack {
    pub name: String,
    pub diff: StackDiff,
    pub outputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct DeployReport {
    pub run_id: String,
    pub applied: Vec<AppliedStack>,
    pub unchanged: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DestroyReport {
    pub run_id: String,
    pub deleted: Vec<String>,
    /// Selected stacks that did not exist.
    pub absent: Vec<String>,
}

/// Applies the synthesized app through a provider and keeps one record
/// per stack in the state store.
pub struct Deployer {
    app: App,
    toolkit: StackTemplate,
    store: Arc<dyn StateStore>,
    provider: Arc<dyn CloudProvider>,
    account: String,
    region: String,
}

impl Deployer {
    pub fn new(
        cfg: &AppConfig,
        store: Arc<dyn StateStore>,
        provider: Arc<dyn CloudProvider>,
    ) -> Result<Self, DeployError> {
        Ok(Self {
            app: App::synth(cfg)?,
            toolkit: synth_toolkit(cfg)?,
            store,
            provider,
            account: cfg.env.account_or_default().to_string(),
            region: cfg.env.region.clone(),
        })
    }

    pub fn app(&self) -> &App {
        &self.app
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    fn record_key(&self, stack: &str) -> String {
        StackRecord::key(&self.account, &self.region, stack)
    }

    pub async fn record(&self, stack: &str) -> Result<Option<(StackRecord, u64)>, DeployError> {
        Ok(load_json(self.store.as_ref(), &self.record_key(stack)).await?)
    }

    pub async fn bootstrap_record(&self) -> Result<Option<BootstrapRecord>, DeployError> {
        let key = BootstrapRecord::key(&self.account, &self.region);
        Ok(load_json(self.store.as_ref(), &key).await?.map(|(b, _)| b))
    }

    /// Outputs recorded for a deployed stack.
    pub async fn outputs(&self, stack: &str) -> Result<BTreeMap<String, String>, DeployError> {
        Ok(self
            .record(stack)
            .await?
            .filter(|(r, _)| r.is_deployed())
            .map(|(r, _)| r.outputs)
            .unwrap_or_default())
    }

    pub async fn list(&self) -> Result<Vec<StackStatus>, DeployError> {
        let mut out = Vec::new();
        for stack in self.app.stacks() {
            let record = self.record(&stack.name).await?.map(|(r, _)| r);
            let state = match &record {
                None => StackState::NotDeployed,
                Some(r) if r.status == RecordStatus::Failed => StackState::Failed,
                Some(r) if r.template_hash == stack.content_hash() => StackState::UpToDate,
                Some(_) => StackState::Changed,
            };
            out.push(StackStatus {
                name: stack.name.clone(),
                depends_on: stack.depends_on.clone(),
                state,
                record,
            });
        }
        Ok(out)
    }

    pub async fn diff(&self, names: &[String], all: bool) -> Result<Vec<StackDiff>, DeployError> {
        self.app.validate()?;
        let mut out = Vec::new();
        for stack in self.app.select(names, all)? {
            let record = self.record(&stack.name).await?;
            let previous = record.as_ref().and_then(|(r, _)| r.template.as_ref());
            out.push(diff(previous, stack));
        }
        Ok(out)
    }

    /// Applies the selected stacks in dependency order and stops at the
    /// first failure.
    pub async fn deploy(&self, names: &[String], all: bool) -> Result<DeployReport, DeployError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("deploy", %run_id, provider = self.provider.name());
        self.deploy_inner(names, all, run_id.clone()).instrument(span).await
    }

    async fn deploy_inner(
        &self,
        names: &[String],
        all: bool,
        run_id: String,
    ) -> Result<DeployReport, DeployError> {
        let selected = self.app.select(names, all)?;
        if selected.is_empty() {
            return Err(DeployError::EmptySelection);
        }
        self.app.validate()?;

        let selected_names: BTreeSet<&str> = selected.iter().map(|s| s.name.as_str()).collect();
        for stack in &selected {
            for dep in stack.depends_on.iter().filter(|d| !selected_names.contains(d.as_str())) {
                let deployed = self.record(dep).await?.is_some_and(|(r, _)| r.is_deployed());
                if !deployed {
                    return Err(DeployError::MissingDependency {
                        stack: stack.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let bootstrap = self.bootstrap_record().await?;
        if bootstrap.is_none() {
            tracing::debug!("no toolkit stack recorded, templates are sent inline");
        }

        let mut report = DeployReport {
            run_id: run_id.clone(),
            applied: Vec::new(),
            unchanged: Vec::new(),
        };
        for (i, stack) in selected.iter().enumerate() {
            let existing = self.record(&stack.name).await?;
            let previous = existing.as_ref().and_then(|(r, _)| r.template.as_ref());
            let changes = diff(previous, stack);
            let deployed = existing.as_ref().is_some_and(|(r, _)| r.is_deployed());
            if changes.is_empty() && deployed {
                tracing::info!(stack = %stack.name, "no changes");
                report.unchanged.push(stack.name.clone());
                continue;
            }

            let (added, modified, removed) = changes.counts();
            tracing::info!(
                stack = %stack.name,
                added,
                modified,
                removed,
                replacements = changes.replacements().count(),
                "deploying stack"
            );

            let (mut record, rev) = match existing {
                Some((r, rev)) => (r, rev),
                None => (StackRecord::new(&stack.name), 0),
            };
            record.version += 1;
            record.updated_at_ms = now_ms();
            record.run_id = run_id.clone();

            match self.provider.deploy_stack(stack, bootstrap.as_ref()).await {
                Ok(outcome) => {
                    record.template = Some((*stack).clone());
                    record.template_hash = stack.content_hash();
                    record.status = RecordStatus::Deployed;
                    record.outputs = outcome.outputs.clone();
                    record.physical_ids = outcome.physical_ids;
                    record.failures.clear();
                    store_json(self.store.as_ref(), &self.record_key(&stack.name), rev, &record).await?;
                    tracing::info!(stack = %stack.name, status = %outcome.status, "stack deployed");
                    report.applied.push(AppliedStack {
                        name: stack.name.clone(),
                        diff: changes,
                        outputs: outcome.outputs,
                    });
                }
                Err(source) => {
                    // Template and hash stay at the last good apply.
                    record.status = RecordStatus::Failed;
                    record.failures = source.resources().iter().map(ToString::to_string).collect();
                    if record.failures.is_empty() {
                        record.failures.push(source.to_string());
                    }
                    if let Err(e) =
                        store_json(self.store.as_ref(), &self.record_key(&stack.name), rev, &record).await
                    {
                        tracing::error!(stack = %stack.name, error = %e, "failed to record failed deploy");
                    }
                    let skipped: Vec<String> = selected[i + 1..].iter().map(|s| s.name.clone()).collect();
                    tracing::error!(stack = %stack.name, error = %source, ?skipped, "deploy failed");
                    return Err(DeployError::DeployFailed {
                        stack: stack.name.clone(),
                        skipped,
                        source,
                    });
                }
            }
        }
        Ok(report)
    }

    /// Deletes the selected stacks in reverse dependency order. Stacks that
    /// do not exist are skipped.
    pub async fn destroy(&self, names: &[String], all: bool) -> Result<DestroyReport, DeployError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("destroy", %run_id, provider = self.provider.name());
        self.destroy_inner(names, all, run_id).instrument(span).await
    }

    async fn destroy_inner(
        &self,
        names: &[String],
        all: bool,
        run_id: String,
    ) -> Result<DestroyReport, DeployError> {
        let selected = self.app.select(names, all)?;
        if selected.is_empty() {
            return Err(DeployError::EmptySelection);
        }

        let selected_names: BTreeSet<&str> = selected.iter().map(|s| s.name.as_str()).collect();
        for stack in &selected {
            for dependent in self.app.dependents_of(&stack.name) {
                if !selected_names.contains(dependent) && self.record(dependent).await?.is_some() {
                    return Err(DeployError::StillRequired {
                        stack: stack.name.clone(),
                        dependent: dependent.to_string(),
                    });
                }
            }
        }

        let mut report = DestroyReport {
            run_id,
            deleted: Vec::new(),
            absent: Vec::new(),
        };
        for stack in selected.iter().rev() {
            let existed = self
                .provider
                .delete_stack(&stack.name)
                .await
                .map_err(|source| DeployError::DestroyFailed {
                    stack: stack.name.clone(),
                    source,
                })?;
            if self.record(&stack.name).await?.is_some() {
                self.store.delete(&self.record_key(&stack.name)).await?;
            }
            if existed {
                tracing::info!(stack = %stack.name, "stack deleted");
                report.deleted.push(stack.name.clone());
            } else {
                report.absent.push(stack.name.clone());
            }
        }
        Ok(report)
    }

    /// Creates or updates the toolkit stack and records its bucket.
    pub async fn bootstrap(&self) -> Result<BootstrapRecord, DeployError> {
        let name = self.toolkit.name.clone();
        let outcome = self
            .provider
            .bootstrap(&self.toolkit)
            .await
            .map_err(|source| DeployError::DeployFailed {
                stack: name.clone(),
                skipped: Vec::new(),
                source,
            })?;
        let bucket = outcome
            .outputs
            .get(BUCKET_NAME)
            .cloned()
            .ok_or_else(|| DeployError::Bootstrap(BUCKET_NAME.to_string()))?;

        let key = BootstrapRecord::key(&self.account, &self.region);
        let existing: Option<(BootstrapRecord, u64)> = load_json(self.store.as_ref(), &key).await?;
        let (version, rev) = existing.map_or((0, 0), |(r, rev)| (r.version, rev));
        let record = BootstrapRecord {
            stack_name: name,
            bucket,
            version: version + 1,
            updated_at_ms: now_ms(),
        };
        store_json(self.store.as_ref(), &key, rev, &record).await?;
        tracing::info!(bucket = %record.bucket, "bootstrapped");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use skyforge_state::MemoryStateStore;

    use super::*;
    use crate::provider::SimulatedProvider;

    struct Fixture {
        store: Arc<MemoryStateStore>,
        provider: Arc<SimulatedProvider>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStateStore::new()),
                provider: Arc::new(SimulatedProvider::new()),
            }
        }

        fn deployer(&self, cfg: &AppConfig) -> Deployer {
            Deployer::new(cfg, self.store.clone(), self.provider.clone()).unwrap()
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_deploy_then_diff_is_empty() {
        let fx = Fixture::new();
        let d = fx.deployer(&AppConfig::default());

        let report = d.deploy(&[], true).await.unwrap();
        assert_eq!(report.applied.len(), 3);
        assert_eq!(report.applied[0].name, "SkyforgeNetwork");

        for diff in d.diff(&[], true).await.unwrap() {
            assert!(diff.is_empty(), "{} has pending changes", diff.stack);
        }
        assert!(d.list().await.unwrap().iter().all(|s| s.state == StackState::UpToDate));

        let again = d.deploy(&[], true).await.unwrap();
        assert!(again.applied.is_empty());
        assert_eq!(again.unchanged.len(), 3);
        assert_eq!(fx.provider.attempts().await.len(), 3);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let fx = Fixture::new();
        let d = fx.deployer(&AppConfig::default());
        d.deploy(&[], true).await.unwrap();

        let report = d.destroy(&[], true).await.unwrap();
        assert_eq!(
            report.deleted,
            names(&["SkyforgeService", "SkyforgeLoadBalancer", "SkyforgeNetwork"])
        );
        assert!(fx.provider.stack_names().await.is_empty());
        assert!(fx.store.list_prefix("/stacks/").await.unwrap().is_empty());

        let again = d.destroy(&[], true).await.unwrap();
        assert!(again.deleted.is_empty());
        assert_eq!(again.absent.len(), 3);
    }

    #[tokio::test]
    async fn test_failure_stops_later_stacks() {
        let fx = Fixture::new();
        fx.provider.fail_resource("EdgeAlb", "subnet quota exceeded").await;
        let d = fx.deployer(&AppConfig::default());

        let err = d.deploy(&[], true).await.unwrap_err();
        match &err {
            DeployError::DeployFailed { stack, skipped, .. } => {
                assert_eq!(stack, "SkyforgeLoadBalancer");
                assert_eq!(skipped, &names(&["SkyforgeService"]));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.resource_failures()[0].logical_id, "EdgeAlb");
        assert_eq!(
            fx.provider.attempts().await,
            names(&["SkyforgeNetwork", "SkyforgeLoadBalancer"])
        );
        assert_eq!(fx.provider.stack_names().await, names(&["SkyforgeNetwork"]));

        let (lb, _) = d.record("SkyforgeLoadBalancer").await.unwrap().unwrap();
        assert_eq!(lb.status, RecordStatus::Failed);
        assert!(lb.template.is_none());
        assert!(lb.failures[0].contains("subnet quota exceeded"));
        let states: Vec<StackState> = d.list().await.unwrap().iter().map(|s| s.state).collect();
        assert_eq!(
            states,
            vec![StackState::UpToDate, StackState::Failed, StackState::NotDeployed]
        );

        fx.provider.clear_failures().await;
        let report = d.deploy(&[], true).await.unwrap();
        assert_eq!(report.unchanged, names(&["SkyforgeNetwork"]));
        assert_eq!(report.applied.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_update_keeps_last_good_template() {
        let fx = Fixture::new();
        let cfg = AppConfig::default();
        fx.deployer(&cfg).deploy(&[], true).await.unwrap();

        let mut changed = cfg.clone();
        changed.load_balancer.stickiness.duration_secs = 3600;
        fx.provider.fail_resource("InferenceTargetGroup", "update failed").await;
        let d = fx.deployer(&changed);
        assert!(d.deploy(&[], true).await.is_err());

        let (record, _) = d.record("SkyforgeLoadBalancer").await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(record.template_hash, fx.deployer(&cfg).app().stacks()[1].content_hash());
        let diffs = d.diff(&names(&["SkyforgeLoadBalancer"]), false).await.unwrap();
        assert_eq!(diffs[0].resources[0].logical_id, "InferenceTargetGroup");
    }

    #[tokio::test]
    async fn test_dependencies_must_be_deployed() {
        let fx = Fixture::new();
        let d = fx.deployer(&AppConfig::default());
        assert!(matches!(
            d.deploy(&names(&["SkyforgeService"]), false).await,
            Err(DeployError::MissingDependency { dependency, .. }) if dependency == "SkyforgeLoadBalancer"
        ));
        assert!(matches!(d.deploy(&[], false).await, Err(DeployError::EmptySelection)));
        assert!(fx.provider.attempts().await.is_empty());

        d.deploy(&names(&["SkyforgeNetwork", "SkyforgeLoadBalancer"]), false)
            .await
            .unwrap();
        d.deploy(&names(&["SkyforgeService"]), false).await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_refuses_needed_stack() {
        let fx = Fixture::new();
        let d = fx.deployer(&AppConfig::default());
        d.deploy(&[], true).await.unwrap();
        assert!(matches!(
            d.destroy(&names(&["SkyforgeNetwork"]), false).await,
            Err(DeployError::StillRequired { .. })
        ));
        d.destroy(&names(&["SkyforgeService"]), false).await.unwrap();
        assert_eq!(d.list().await.unwrap()[2].state, StackState::NotDeployed);
    }

    #[tokio::test]
    async fn test_bootstrap_records_bucket() {
        let fx = Fixture::new();
        let d = fx.deployer(&AppConfig::default());
        assert!(d.bootstrap_record().await.unwrap().is_none());
        let first = d.bootstrap().await.unwrap();
        assert_eq!(first.stack_name, "SkyforgeToolkit");
        assert_eq!(first.version, 1);
        assert_eq!(d.bootstrap().await.unwrap().version, 2);
        assert_eq!(d.bootstrap_record().await.unwrap().unwrap().bucket, first.bucket);
    }

    #[tokio::test]
    async fn test_scaling_scenario_after_deploy() {
        let fx = Fixture::new();
        let mut cfg = AppConfig::default();
        cfg.service.inference.capacity.max = 3;
        fx.deployer(&cfg).deploy(&[], true).await.unwrap();

        let capacities = fx
            .provider
            .simulate_scaling("SkyforgeService", skyforge_stacks::service::INFERENCE_ASG, &[95.0; 8])
            .await
            .unwrap();
        assert_eq!(capacities, vec![2, 3, 3, 3, 3, 3, 3, 3]);
    }

    #[tokio::test]
    async fn test_records_are_scoped_by_account_and_region() {
        let fx = Fixture::new();
        let mut cfg = AppConfig::default();
        cfg.env.account = Some("123456789012".into());
        fx.deployer(&cfg).deploy(&[], true).await.unwrap();
        let keys: Vec<String> = fx
            .store
            .list_prefix("/stacks/")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _, _)| k)
            .collect();
        assert_eq!(keys[0], "/stacks/123456789012/us-east-1/SkyforgeLoadBalancer");
        assert_eq!(keys.len(), 3);
    }
}

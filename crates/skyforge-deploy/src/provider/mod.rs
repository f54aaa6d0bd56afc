pub mod cloudformation;
pub mod simulated;

use std::collections::BTreeMap;

use async_trait::async_trait;

use skyforge_common::{BootstrapRecord, StackTemplate};

use crate::error::ProviderError;

pub use cloudformation::CloudFormationProvider;
pub use simulated::SimulatedProvider;

/// What the provider reports for a stack that exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackOutcome {
    pub status: String,
    pub outputs: BTreeMap<String, String>,
    /// Logical id -> physical id.
    pub physical_ids: BTreeMap<String, String>,
}

/// Applies stack templates to a cloud account.
///
/// Applies are all-or-nothing per stack: on failure the provider rolls the
/// stack back to its previous state and reports the failed resources.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Provider identifier, e.g. "cloudformation", "simulated".
    fn name(&self) -> &str;

    /// Creates or updates the toolkit stack. Never staged through a bucket.
    async fn bootstrap(&self, toolkit: &StackTemplate) -> Result<StackOutcome, ProviderError> {
        self.deploy_stack(toolkit, None).await
    }

    /// Creates or updates a stack, staging the template through the toolkit
    /// bucket when one is given.
    async fn deploy_stack(
        &self,
        template: &StackTemplate,
        bootstrap: Option<&BootstrapRecord>,
    ) -> Result<StackOutcome, ProviderError>;

    /// Deletes a stack and waits for completion. Returns false if it did not exist.
    async fn delete_stack(&self, name: &str) -> Result<bool, ProviderError>;

    async fn describe_stack(&self, name: &str) -> Result<Option<StackOutcome>, ProviderError>;
}

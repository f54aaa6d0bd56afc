use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::template::StackTemplate;

/// Outcome of the last apply of a stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Deployed,
    Failed,
}

/// What skyforge last applied for one stack.
///
/// Stored under `/stacks/{account}/{region}/{stack}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackRecord {
    pub stack_name: String,

    /// Last template that deployed successfully. A failed apply keeps the
    /// previous one so the next diff still shows the pending delta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<StackTemplate>,

    #[serde(default)]
    pub template_hash: String,

    pub status: RecordStatus,

    /// Stack outputs as reported by the provider.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,

    /// Logical id -> physical id.
    #[serde(default)]
    pub physical_ids: BTreeMap<String, String>,

    /// Per-resource failure detail of the last failed apply.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,

    /// Monotonically increasing; bumped on every write.
    #[serde(default)]
    pub version: u64,

    #[serde(default)]
    pub updated_at_ms: u64,

    #[serde(default)]
    pub run_id: String,
}

impl StackRecord {
    /// A record for a stack that has never been applied.
    pub fn new(stack_name: &str) -> Self {
        Self {
            stack_name: stack_name.to_string(),
            template: None,
            template_hash: String::new(),
            status: RecordStatus::Failed,
            outputs: BTreeMap::new(),
            physical_ids: BTreeMap::new(),
            failures: Vec::new(),
            version: 0,
            updated_at_ms: 0,
            run_id: String::new(),
        }
    }

    pub fn key(account: &str, region: &str, stack: &str) -> String {
        format!("/stacks/{account}/{region}/{stack}")
    }

    pub fn prefix(account: &str, region: &str) -> String {
        format!("/stacks/{account}/{region}/")
    }

    pub fn is_deployed(&self) -> bool {
        self.status == RecordStatus::Deployed && self.template.is_some()
    }
}

/// The toolkit stack created by `bootstrap`.
///
/// Stored under `/bootstrap/{account}/{region}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootstrapRecord {
    pub stack_name: String,
    pub bucket: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub updated_at_ms: u64,
}

impl BootstrapRecord {
    pub fn key(account: &str, region: &str) -> String {
        format!("/bootstrap/{account}/{region}")
    }
}

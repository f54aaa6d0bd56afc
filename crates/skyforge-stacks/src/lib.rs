pub mod app;
pub mod load_balancer;
pub mod network;
pub mod service;
pub mod toolkit;
pub mod user_data;
pub mod validate;

pub use app::App;
pub use toolkit::synth_toolkit;
pub use user_data::{BootPhase, BootScript};
pub use validate::{validate_stacks, ValidationError, Violation};

use serde_json::{json, Value};
use skyforge_common::AppConfig;

/// Tag list for a resource: the configured tags plus `Name`.
pub(crate) fn tags(cfg: &AppConfig, name: &str) -> Value {
    let mut out: Vec<Value> = cfg
        .tags
        .iter()
        .filter(|(k, _)| k.as_str() != "Name")
        .map(|(k, v)| json!({ "Key": k, "Value": v }))
        .collect();
    out.push(json!({ "Key": "Name", "Value": format!("{}/{}", cfg.stack_prefix, name) }));
    Value::Array(out)
}

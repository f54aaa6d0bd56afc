use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use skyforge_common::{Output, Resource, StackTemplate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Add,
    Remove,
    Modify,
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "+",
            Self::Remove => "-",
            Self::Modify => "~",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceChange {
    pub logical_id: String,
    pub kind: String,
    pub action: ChangeAction,
    /// Dotted property paths that differ. Empty for adds and removes.
    pub changed: Vec<String>,
    pub replacement: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputChange {
    pub key: String,
    pub action: ChangeAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackDiff {
    pub stack: String,
    pub resources: Vec<ResourceChange>,
    pub outputs: Vec<OutputChange>,
}

impl StackDiff {
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.outputs.is_empty()
    }

    pub fn replacements(&self) -> impl Iterator<Item = &ResourceChange> {
        self.resources.iter().filter(|c| c.replacement)
    }

    /// (added, modified, removed) resource counts.
    pub fn counts(&self) -> (usize, usize, usize) {
        let count = |a| self.resources.iter().filter(|c| c.action == a).count();
        (count(ChangeAction::Add), count(ChangeAction::Modify), count(ChangeAction::Remove))
    }
}

/// Properties whose change forces CloudFormation to replace the resource.
fn immutable_properties(kind: &str) -> &'static [&'static str] {
    match kind {
        "AWS::EC2::VPC" => &["CidrBlock"],
        "AWS::EC2::Subnet" => &["CidrBlock", "AvailabilityZone", "VpcId"],
        "AWS::EC2::SecurityGroup" => &["GroupDescription", "VpcId"],
        "AWS::EC2::SecurityGroupIngress" => {
            &["GroupId", "IpProtocol", "FromPort", "ToPort", "CidrIp", "CidrIpv6", "SourcePrefixListId", "SourceSecurityGroupId"]
        }
        "AWS::EC2::RouteTable" => &["VpcId"],
        "AWS::EC2::NatGateway" => &["SubnetId", "AllocationId"],
        "AWS::ElasticLoadBalancingV2::LoadBalancer" => &["Scheme", "Type", "Name"],
        "AWS::ElasticLoadBalancingV2::TargetGroup" => &["Port", "Protocol", "TargetType", "VpcId", "Name"],
        "AWS::EFS::FileSystem" => &["Encrypted", "PerformanceMode", "KmsKeyId"],
        "AWS::EFS::MountTarget" => &["FileSystemId", "SubnetId"],
        "AWS::EFS::AccessPoint" => &["FileSystemId", "PosixUser", "RootDirectory"],
        "AWS::SecretsManager::Secret" => &["Name"],
        "AWS::ECS::Service" => &["LaunchType", "Cluster", "LoadBalancers"],
        // Task definitions are immutable; any change registers a new revision.
        "AWS::ECS::TaskDefinition" => &["*"],
        _ => &[],
    }
}

/// Compares the last applied template (if any) against a new one.
pub fn diff(previous: Option<&StackTemplate>, next: &StackTemplate) -> StackDiff {
    let mut resources = Vec::new();
    let empty = StackTemplate::new(&next.name, "");
    let prev = previous.unwrap_or(&empty);

    let ids: BTreeSet<&String> = prev.resources.keys().chain(next.resources.keys()).collect();
    for id in ids {
        match (prev.resources.get(id), next.resources.get(id)) {
            (None, Some(r)) => resources.push(ResourceChange {
                logical_id: id.clone(),
                kind: r.kind.clone(),
                action: ChangeAction::Add,
                changed: Vec::new(),
                replacement: false,
            }),
            (Some(r), None) => resources.push(ResourceChange {
                logical_id: id.clone(),
                kind: r.kind.clone(),
                action: ChangeAction::Remove,
                changed: Vec::new(),
                replacement: false,
            }),
            (Some(old), Some(new)) if old != new => resources.push(modify(id, old, new)),
            _ => {}
        }
    }

    let keys: BTreeSet<&String> = prev.outputs.keys().chain(next.outputs.keys()).collect();
    let outputs = keys
        .into_iter()
        .filter_map(|key| {
            let action = match (prev.outputs.get(key), next.outputs.get(key)) {
                (None, Some(_)) => ChangeAction::Add,
                (Some(_), None) => ChangeAction::Remove,
                (Some(a), Some(b)) if !same_output(a, b) => ChangeAction::Modify,
                _ => return None,
            };
            Some(OutputChange { key: key.clone(), action })
        })
        .collect();

    StackDiff {
        stack: next.name.clone(),
        resources,
        outputs,
    }
}

fn same_output(a: &Output, b: &Output) -> bool {
    a.value == b.value && a.export == b.export
}

fn modify(id: &str, old: &Resource, new: &Resource) -> ResourceChange {
    let mut changed = Vec::new();
    if old.kind != new.kind {
        changed.push("Type".to_string());
    }
    changed_paths(&old.properties, &new.properties, "", &mut changed);
    if old.depends_on != new.depends_on {
        changed.push("DependsOn".to_string());
    }
    if old.deletion_policy != new.deletion_policy {
        changed.push("DeletionPolicy".to_string());
    }

    let immutable = immutable_properties(&new.kind);
    let replacement = old.kind != new.kind
        || changed.iter().any(|path| {
            let top = path.split(['.', '[']).next().unwrap_or(path);
            (immutable.contains(&"*") && top != "DependsOn" && top != "DeletionPolicy")
                || immutable.contains(&top)
        });

    ResourceChange {
        logical_id: id.to_string(),
        kind: new.kind.clone(),
        action: ChangeAction::Modify,
        changed,
        replacement,
    }
}

/// Collects the paths where `a` and `b` differ. Objects are walked key by
/// key; arrays and scalars are compared as a whole.
fn changed_paths(a: &Value, b: &Value, prefix: &str, out: &mut Vec<String>) {
    if a == b {
        return;
    }
    match (a, b) {
        (Value::Object(x), Value::Object(y)) => {
            let keys: BTreeSet<&String> = x.keys().chain(y.keys()).collect();
            for key in keys {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                changed_paths(
                    x.get(key).unwrap_or(&Value::Null),
                    y.get(key).unwrap_or(&Value::Null),
                    &path,
                    out,
                );
            }
        }
        _ => out.push(if prefix.is_empty() { "Properties".to_string() } else { prefix.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn template(cidr: &str, port: u16) -> StackTemplate {
        let mut t = StackTemplate::new("Net", "");
        t.add("Vpc", Resource::new("AWS::EC2::VPC", json!({ "CidrBlock": cidr }))).unwrap();
        t.add(
            "Tg",
            Resource::new(
                "AWS::ElasticLoadBalancingV2::TargetGroup",
                json!({ "Port": port, "HealthCheckPath": "/health", "Matcher": { "HttpCode": "200" } }),
            ),
        )
        .unwrap();
        t.export("VpcId", json!({ "Ref": "Vpc" }), None);
        t
    }

    #[test]
    fn test_no_record_adds_everything() {
        let t = template("10.0.0.0/16", 8000);
        let d = diff(None, &t);
        assert_eq!(d.counts(), (2, 0, 0));
        assert_eq!(d.outputs, vec![OutputChange { key: "VpcId".into(), action: ChangeAction::Add }]);
    }

    #[test]
    fn test_identical_templates() {
        let t = template("10.0.0.0/16", 8000);
        assert!(diff(Some(&t), &t.clone()).is_empty());
    }

    #[test]
    fn test_in_place_modify() {
        let old = template("10.0.0.0/16", 8000);
        let mut new = old.clone();
        new.resources.get_mut("Tg").unwrap().properties["Matcher"]["HttpCode"] = json!("200-299");
        let d = diff(Some(&old), &new);
        assert_eq!(d.resources.len(), 1);
        assert_eq!(d.resources[0].changed, vec!["Matcher.HttpCode".to_string()]);
        assert!(!d.resources[0].replacement);
    }

    #[test]
    fn test_immutable_change_replaces() {
        let old = template("10.0.0.0/16", 8000);
        let new = template("10.1.0.0/16", 8001);
        let d = diff(Some(&old), &new);
        assert_eq!(d.replacements().count(), 2);
        assert_eq!(d.counts(), (0, 2, 0));
    }

    #[test]
    fn test_removed_resource() {
        let old = template("10.0.0.0/16", 8000);
        let mut new = old.clone();
        new.resources.remove("Tg");
        let d = diff(Some(&old), &new);
        assert_eq!(d.counts(), (0, 0, 1));
        assert_eq!(d.resources[0].kind, "AWS::ElasticLoadBalancingV2::TargetGroup");
    }

    #[test]
    fn test_task_definition_any_change_replaces() {
        let mut old = StackTemplate::new("Svc", "");
        old.add("Task", Resource::new("AWS::ECS::TaskDefinition", json!({ "Cpu": "1024" }))).unwrap();
        let mut new = old.clone();
        new.resources.get_mut("Task").unwrap().properties["Cpu"] = json!("2048");
        assert!(diff(Some(&old), &new).resources[0].replacement);
    }
}

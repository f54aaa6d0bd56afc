use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::SynthError;

/// One declared cloud resource, in CloudFormation shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    #[serde(rename = "Type")]
    pub kind: String,

    #[serde(rename = "Properties", default, skip_serializing_if = "Value::is_null")]
    pub properties: Value,

    #[serde(rename = "DependsOn", default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    #[serde(rename = "DeletionPolicy", default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<String>,
}

impl Resource {
    pub fn new(kind: &str, properties: Value) -> Self {
        Self {
            kind: kind.to_string(),
            properties,
            depends_on: Vec::new(),
            deletion_policy: None,
        }
    }

    pub fn depends_on(mut self, logical_id: &str) -> Self {
        self.depends_on.push(logical_id.to_string());
        self
    }

    pub fn deletion_policy(mut self, policy: &str) -> Self {
        self.deletion_policy = Some(policy.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Export {
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Output {
    #[serde(rename = "Description", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "Value")]
    pub value: Value,

    #[serde(rename = "Export", default, skip_serializing_if = "Option::is_none")]
    pub export: Option<Export>,
}

/// A named, independently deployable unit of declared resources.
///
/// Logical ids live in ordered maps so that the same inputs always produce
/// byte-identical templates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackTemplate {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub resources: BTreeMap<String, Resource>,
    #[serde(default)]
    pub outputs: BTreeMap<String, Output>,
}

impl StackTemplate {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            depends_on: Vec::new(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, logical_id: &str, resource: Resource) -> Result<(), SynthError> {
        if self.resources.contains_key(logical_id) {
            return Err(SynthError::DuplicateLogicalId {
                stack: self.name.clone(),
                logical_id: logical_id.to_string(),
            });
        }
        self.resources.insert(logical_id.to_string(), resource);
        Ok(())
    }

    /// Adds an output exported as `{stack}:{key}` for consumers in later stacks.
    pub fn export(&mut self, key: &str, value: Value, description: Option<&str>) {
        self.outputs.insert(
            key.to_string(),
            Output {
                description: description.map(str::to_string),
                value,
                export: Some(Export {
                    name: export_name(&self.name, key),
                }),
            },
        );
    }

    pub fn output(&mut self, key: &str, value: Value, description: Option<&str>) {
        self.outputs.insert(
            key.to_string(),
            Output {
                description: description.map(str::to_string),
                value,
                export: None,
            },
        );
    }

    pub fn to_cloudformation(&self) -> Value {
        let mut doc = json!({
            "AWSTemplateFormatVersion": "2010-09-09",
            "Description": self.description,
            "Resources": self.resources,
        });
        if !self.outputs.is_empty() {
            doc["Outputs"] = json!(self.outputs);
        }
        doc
    }

    pub fn to_pretty_json(&self) -> String {
        serde_json::to_string_pretty(&self.to_cloudformation()).unwrap_or_default()
    }

    /// SHA-256 over the compact CloudFormation body.
    pub fn content_hash(&self) -> String {
        let body = serde_json::to_vec(&self.to_cloudformation()).unwrap_or_default();
        format!("{:x}", Sha256::digest(&body))
    }

    pub fn resources_of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = (&'a String, &'a Resource)> + 'a {
        self.resources.iter().filter(move |(_, r)| r.kind == kind)
    }
}

pub fn export_name(stack: &str, key: &str) -> String {
    format!("{stack}:{key}")
}

/// CloudFormation intrinsic functions.
pub mod fns {
    use serde_json::{json, Value};

    pub fn ref_(logical_id: &str) -> Value {
        json!({ "Ref": logical_id })
    }

    pub fn get_att(logical_id: &str, attribute: &str) -> Value {
        json!({ "Fn::GetAtt": [logical_id, attribute] })
    }

    pub fn import_value(stack: &str, key: &str) -> Value {
        json!({ "Fn::ImportValue": super::export_name(stack, key) })
    }

    pub fn sub(template: &str) -> Value {
        json!({ "Fn::Sub": template })
    }

    pub fn sub_with(template: &str, vars: Value) -> Value {
        json!({ "Fn::Sub": [template, vars] })
    }

    pub fn base64(v: Value) -> Value {
        json!({ "Fn::Base64": v })
    }

    pub fn select(index: usize, list: Value) -> Value {
        json!({ "Fn::Select": [index.to_string(), list] })
    }

    pub fn get_azs() -> Value {
        json!({ "Fn::GetAZs": "" })
    }

    pub fn join(sep: &str, parts: Vec<Value>) -> Value {
        json!({ "Fn::Join": [sep, parts] })
    }

    pub fn split(sep: &str, v: Value) -> Value {
        json!({ "Fn::Split": [sep, v] })
    }

    pub fn tag(key: &str, value: &str) -> Value {
        json!({ "Key": key, "Value": value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_logical_id() {
        let mut t = StackTemplate::new("S", "test");
        t.add("A", Resource::new("AWS::SNS::Topic", json!({}))).unwrap();
        let err = t.add("A", Resource::new("AWS::SNS::Topic", json!({}))).unwrap_err();
        assert!(matches!(err, SynthError::DuplicateLogicalId { .. }));
    }

    #[test]
    fn test_cloudformation_shape() {
        let mut t = StackTemplate::new("S", "test");
        t.add("Topic", Resource::new("AWS::SNS::Topic", json!({ "TopicName": "t" })).depends_on("Other"))
            .unwrap();
        t.export("TopicArn", fns::ref_("Topic"), None);
        let doc = t.to_cloudformation();
        assert_eq!(doc["Resources"]["Topic"]["Type"], "AWS::SNS::Topic");
        assert_eq!(doc["Resources"]["Topic"]["DependsOn"][0], "Other");
        assert_eq!(doc["Outputs"]["TopicArn"]["Export"]["Name"], "S:TopicArn");
        assert!(doc["Resources"]["Topic"].get("DeletionPolicy").is_none());
    }

    #[test]
    fn test_hash_is_stable() {
        let mut a = StackTemplate::new("S", "test");
        a.add("B", Resource::new("AWS::SNS::Topic", json!({}))).unwrap();
        a.add("A", Resource::new("AWS::SNS::Topic", json!({}))).unwrap();
        let mut b = StackTemplate::new("S", "test");
        b.add("A", Resource::new("AWS::SNS::Topic", json!({}))).unwrap();
        b.add("B", Resource::new("AWS::SNS::Topic", json!({}))).unwrap();
        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash().len(), 64);
    }
}

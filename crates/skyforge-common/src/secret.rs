use serde::{Deserialize, Serialize};

use crate::template::fns;

/// Pointer to a credential provisioned outside of skyforge.
///
/// Only the name (or ARN) ends up in a template; the value is resolved by
/// whoever holds the read grant, at the time it is needed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arn: Option<String>,
}

impl SecretRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arn: None,
        }
    }

    /// Identifier to pass to `get-secret-value`.
    pub fn secret_id(&self) -> &str {
        self.arn.as_deref().unwrap_or(&self.name)
    }

    /// IAM resource covering the secret. Secrets Manager appends a random
    /// suffix to ARNs, hence the trailing wildcard for name references.
    pub fn iam_resource(&self) -> serde_json::Value {
        match &self.arn {
            Some(arn) => serde_json::Value::String(arn.clone()),
            None => fns::sub(&format!(
                "arn:${{AWS::Partition}}:secretsmanager:${{AWS::Region}}:${{AWS::AccountId}}:secret:{}*",
                self.name
            )),
        }
    }
}

impl Default for SecretRef {
    fn default() -> Self {
        Self::named("HuggingFaceToken")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iam_resource_by_name() {
        let v = SecretRef::default().iam_resource();
        assert_eq!(
            v["Fn::Sub"],
            "arn:${AWS::Partition}:secretsmanager:${AWS::Region}:${AWS::AccountId}:secret:HuggingFaceToken*"
        );
    }

    #[test]
    fn test_iam_resource_by_arn() {
        let s = SecretRef {
            name: "tok".into(),
            arn: Some("arn:aws:secretsmanager:us-east-1:123:secret:tok-AbCd".into()),
        };
        assert_eq!(s.secret_id(), "arn:aws:secretsmanager:us-east-1:123:secret:tok-AbCd");
        assert!(s.iam_resource().is_string());
    }
}

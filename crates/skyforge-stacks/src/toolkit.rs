//! Bootstrap stack holding the bucket templates are uploaded through.

use serde_json::json;

use skyforge_common::template::fns;
use skyforge_common::{AppConfig, Resource, StackTemplate, SynthError};

use crate::tags;

pub const BUCKET_NAME: &str = "BucketName";

pub fn synth_toolkit(cfg: &AppConfig) -> Result<StackTemplate, SynthError> {
    let mut t = StackTemplate::new(
        &cfg.toolkit_stack(),
        "Deployment toolkit for skyforge: template staging bucket",
    );
    t.add(
        "StagingBucket",
        Resource::new(
            "AWS::S3::Bucket",
            json!({
                "VersioningConfiguration": { "Status": "Enabled" },
                "BucketEncryption": {
                    "ServerSideEncryptionConfiguration": [{
                        "ServerSideEncryptionByDefault": { "SSEAlgorithm": "AES256" },
                    }],
                },
                "PublicAccessBlockConfiguration": {
                    "BlockPublicAcls": true,
                    "BlockPublicPolicy": true,
                    "IgnorePublicAcls": true,
                    "RestrictPublicBuckets": true,
                },
                "LifecycleConfiguration": {
                    "Rules": [{
                        "Id": "ExpireOldTemplates",
                        "Status": "Enabled",
                        "NoncurrentVersionExpiration": { "NoncurrentDays": 30 },
                    }],
                },
                "Tags": tags(cfg, "StagingBucket"),
            }),
        )
        .deletion_policy("Retain"),
    )?;
    t.add(
        "StagingBucketPolicy",
        Resource::new(
            "AWS::S3::BucketPolicy",
            json!({
                "Bucket": fns::ref_("StagingBucket"),
                "PolicyDocument": {
                    "Version": "2012-10-17",
                    "Statement": [{
                        "Sid": "DenyInsecureTransport",
                        "Effect": "Deny",
                        "Principal": "*",
                        "Action": "s3:*",
                        "Resource": [
                            fns::get_att("StagingBucket", "Arn"),
                            fns::sub("${StagingBucket.Arn}/*"),
                        ],
                        "Condition": { "Bool": { "aws:SecureTransport": "false" } },
                    }],
                },
            }),
        ),
    )?;
    t.output(BUCKET_NAME, fns::ref_("StagingBucket"), Some("Template staging bucket"));
    Ok(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_versioned_bucket() {
        let t = synth_toolkit(&AppConfig::default()).unwrap();
        assert_eq!(t.name, "SkyforgeToolkit");
        let bucket = &t.resources["StagingBucket"];
        assert_eq!(bucket.properties["VersioningConfiguration"]["Status"], "Enabled");
        assert_eq!(bucket.properties["PublicAccessBlockConfiguration"]["BlockPublicPolicy"], true);
        assert_eq!(bucket.deletion_policy.as_deref(), Some("Retain"));
        assert!(t.outputs.contains_key(BUCKET_NAME));
    }
}

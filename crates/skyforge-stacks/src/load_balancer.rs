//! Load-balancer stack: internal ALB for vLLM, public ALB for OpenWebUI
//! behind CloudFront, and the shared header secret tying the two together.

use serde_json::{json, Value};

use skyforge_common::template::fns;
use skyforge_common::{
    AppConfig, HealthCheck, Listener, ListenerAction, Resource, SecurityGroupRole, StackTemplate,
    SynthError,
};

use crate::network::{security_group_export, PRIVATE_SUBNET_IDS, PUBLIC_SUBNET_IDS, VPC_ID};
use crate::tags;

pub const INFERENCE_ALB_DNS: &str = "InferenceAlbDnsName";
pub const INFERENCE_ALB_FULL_NAME: &str = "InferenceAlbFullName";
pub const INFERENCE_TARGET_GROUP_ARN: &str = "InferenceTargetGroupArn";
pub const INFERENCE_TARGET_GROUP_FULL_NAME: &str = "InferenceTargetGroupFullName";
pub const WEBUI_TARGET_GROUP_ARN: &str = "WebUiTargetGroupArn";
pub const EDGE_ALB_DNS: &str = "EdgeAlbDnsName";
pub const EDGE_URL: &str = "EdgeUrl";

pub const INFERENCE_TARGET_GROUP: &str = "InferenceTargetGroup";
pub const WEBUI_TARGET_GROUP: &str = "WebUiTargetGroup";
pub const EDGE_LISTENER: &str = "EdgeListener";
pub const ORIGIN_VERIFY_SECRET: &str = "OriginVerifySecret";

// AWS managed CloudFront policies.
const CACHING_DISABLED_POLICY: &str = "4135ea2d-6df8-44a3-9df3-4b5a84be39ad";
const ALL_VIEWER_ORIGIN_REQUEST_POLICY: &str = "216adef6-5c7f-47e4-b989-5492eafa07d3";

pub fn synth_load_balancer(cfg: &AppConfig) -> Result<StackTemplate, SynthError> {
    let lb = &cfg.load_balancer;
    let ports = &cfg.network.ports;
    let network = cfg.network_stack();
    let mut t = StackTemplate::new(
        &cfg.load_balancer_stack(),
        "Load-balancer layout for vLLM + OpenWebUI: internal ALB, public ALB and edge distribution",
    );
    t.depends_on.push(network.clone());

    let subnets = |key: &str| fns::split(",", fns::import_value(&network, key));
    let sg = |role: SecurityGroupRole| fns::import_value(&network, &security_group_export(role));

    t.add(
        "InferenceAlb",
        Resource::new(
            "AWS::ElasticLoadBalancingV2::LoadBalancer",
            json!({
                "Type": "application",
                "Scheme": "internal",
                "Subnets": subnets(PRIVATE_SUBNET_IDS),
                "SecurityGroups": [sg(SecurityGroupRole::InferenceAlb)],
                "LoadBalancerAttributes": [
                    { "Key": "idle_timeout.timeout_seconds", "Value": lb.idle_timeout_secs.to_string() },
                ],
                "Tags": tags(cfg, "InferenceAlb"),
            }),
        ),
    )?;
    t.add(
        "EdgeAlb",
        Resource::new(
            "AWS::ElasticLoadBalancingV2::LoadBalancer",
            json!({
                "Type": "application",
                "Scheme": "internet-facing",
                "Subnets": subnets(PUBLIC_SUBNET_IDS),
                "SecurityGroups": [sg(SecurityGroupRole::EdgeAlb)],
                "LoadBalancerAttributes": [
                    { "Key": "idle_timeout.timeout_seconds", "Value": lb.idle_timeout_secs.to_string() },
                    { "Key": "routing.http.drop_invalid_header_fields.enabled", "Value": "true" },
                ],
                "Tags": tags(cfg, "EdgeAlb"),
            }),
        ),
    )?;

    let mut inference_attrs = vec![json!({
        "Key": "deregistration_delay.timeout_seconds",
        "Value": lb.deregistration_delay_secs.to_string(),
    })];
    if lb.stickiness.enabled {
        inference_attrs.extend([
            json!({ "Key": "stickiness.enabled", "Value": "true" }),
            json!({ "Key": "stickiness.type", "Value": "lb_cookie" }),
            json!({
                "Key": "stickiness.lb_cookie.duration_seconds",
                "Value": lb.stickiness.duration_secs.to_string(),
            }),
        ]);
    }
    t.add(
        INFERENCE_TARGET_GROUP,
        target_group(
            cfg,
            INFERENCE_TARGET_GROUP,
            ports.inference,
            "instance",
            &lb.inference_health,
            inference_attrs,
        ),
    )?;
    t.add(
        WEBUI_TARGET_GROUP,
        target_group(
            cfg,
            WEBUI_TARGET_GROUP,
            ports.app,
            "ip",
            &lb.webui_health,
            vec![json!({
                "Key": "deregistration_delay.timeout_seconds",
                "Value": lb.deregistration_delay_secs.to_string(),
            })],
        ),
    )?;

    add_listener(
        &mut t,
        "InferenceListener",
        "InferenceAlb",
        &lb.internal_listener(ports.listener, INFERENCE_TARGET_GROUP),
    )?;

    t.add(
        ORIGIN_VERIFY_SECRET,
        Resource::new(
            "AWS::SecretsManager::Secret",
            json!({
                "Name": lb.header_guard.resolved_secret_name(&cfg.stack_prefix),
                "Description": "Shared header value between the edge distribution and the public ALB",
                "GenerateSecretString": {
                    "PasswordLength": lb.header_guard.secret_length,
                    "ExcludePunctuation": true,
                },
                "Tags": tags(cfg, ORIGIN_VERIFY_SECRET),
            }),
        ),
    )?;
    let secret_value = lb.header_guard.dynamic_reference(&cfg.stack_prefix);
    let edge_listener = lb.public_listener(ports.listener, WEBUI_TARGET_GROUP, &secret_value);
    add_listener(&mut t, EDGE_LISTENER, "EdgeAlb", &edge_listener)?;

    t.add(
        "EdgeDistribution",
        Resource::new(
            "AWS::CloudFront::Distribution",
            json!({
                "DistributionConfig": {
                    "Enabled": true,
                    "Comment": format!("{} OpenWebUI", cfg.stack_prefix),
                    "PriceClass": lb.edge_price_class,
                    "HttpVersion": "http2and3",
                    "Origins": [{
                        "Id": "EdgeAlbOrigin",
                        "DomainName": fns::get_att("EdgeAlb", "DNSName"),
                        "CustomOriginConfig": {
                            "OriginProtocolPolicy": "http-only",
                            "HTTPPort": ports.listener,
                            "OriginReadTimeout": 60,
                        },
                        "OriginCustomHeaders": [{
                            "HeaderName": lb.header_guard.header_name,
                            "HeaderValue": secret_value,
                        }],
                    }],
                    "DefaultCacheBehavior": {
                        "TargetOriginId": "EdgeAlbOrigin",
                        "ViewerProtocolPolicy": "redirect-to-https",
                        "AllowedMethods": ["GET", "HEAD", "OPTIONS", "PUT", "PATCH", "POST", "DELETE"],
                        "CachedMethods": ["GET", "HEAD"],
                        "CachePolicyId": CACHING_DISABLED_POLICY,
                        "OriginRequestPolicyId": ALL_VIEWER_ORIGIN_REQUEST_POLICY,
                        "Compress": true,
                    },
                },
                "Tags": tags(cfg, "EdgeDistribution"),
            }),
        )
        .depends_on(ORIGIN_VERIFY_SECRET),
    )?;

    t.export(INFERENCE_ALB_DNS, fns::get_att("InferenceAlb", "DNSName"), Some("Internal vLLM endpoint"));
    t.export(INFERENCE_ALB_FULL_NAME, fns::get_att("InferenceAlb", "LoadBalancerFullName"), None);
    t.export(INFERENCE_TARGET_GROUP_ARN, fns::ref_(INFERENCE_TARGET_GROUP), None);
    t.export(
        INFERENCE_TARGET_GROUP_FULL_NAME,
        fns::get_att(INFERENCE_TARGET_GROUP, "TargetGroupFullName"),
        None,
    );
    t.export(WEBUI_TARGET_GROUP_ARN, fns::ref_(WEBUI_TARGET_GROUP), None);
    t.export(EDGE_ALB_DNS, fns::get_att("EdgeAlb", "DNSName"), None);
    t.export(
        EDGE_URL,
        fns::sub("https://${EdgeDistribution.DomainName}"),
        Some("OpenWebUI endpoint"),
    );
    t.output("WebUiEndpoint", fns::sub("https://${EdgeDistribution.DomainName}"), Some("WebUI endpoint"));

    tracing::debug!(stack = %t.name, resources = t.resources.len(), "synthesized load-balancer stack");
    Ok(t)
}

fn target_group(
    cfg: &AppConfig,
    name: &str,
    port: u16,
    target_type: &str,
    hc: &HealthCheck,
    attributes: Vec<Value>,
) -> Resource {
    Resource::new(
        "AWS::ElasticLoadBalancingV2::TargetGroup",
        json!({
            "VpcId": fns::import_value(&cfg.network_stack(), VPC_ID),
            "Port": port,
            "Protocol": "HTTP",
            "TargetType": target_type,
            "HealthCheckEnabled": true,
            "HealthCheckPath": hc.path,
            "HealthCheckIntervalSeconds": hc.interval_secs,
            "HealthCheckTimeoutSeconds": hc.timeout_secs,
            "HealthyThresholdCount": hc.healthy_threshold,
            "UnhealthyThresholdCount": hc.unhealthy_threshold,
            "Matcher": { "HttpCode": hc.matcher },
            "TargetGroupAttributes": attributes,
            "Tags": tags(cfg, name),
        }),
    )
}

pub(crate) fn action_json(action: &ListenerAction) -> Value {
    match action {
        ListenerAction::Forward(tg) => json!({
            "Type": "forward",
            "TargetGroupArn": fns::ref_(tg),
        }),
        ListenerAction::FixedResponse {
            status,
            content_type,
            body,
        } => json!({
            "Type": "fixed-response",
            "FixedResponseConfig": {
                "StatusCode": status.to_string(),
                "ContentType": content_type,
                "MessageBody": body,
            },
        }),
    }
}

/// Emits a listener and one `ListenerRule` per rule of the model.
fn add_listener(
    t: &mut StackTemplate,
    id: &str,
    alb: &str,
    listener: &Listener,
) -> Result<(), SynthError> {
    t.add(
        id,
        Resource::new(
            "AWS::ElasticLoadBalancingV2::Listener",
            json!({
                "LoadBalancerArn": fns::ref_(alb),
                "Port": listener.port,
                "Protocol": "HTTP",
                "DefaultActions": [action_json(&listener.default_action)],
            }),
        ),
    )?;
    for rule in &listener.rules {
        let conditions: Vec<Value> = rule
            .conditions
            .iter()
            .map(|c| {
                json!({
                    "Field": "http-header",
                    "HttpHeaderConfig": {
                        "HttpHeaderName": c.header,
                        "Values": c.values,
                    },
                })
            })
            .collect();
        let mut resource = Resource::new(
            "AWS::ElasticLoadBalancingV2::ListenerRule",
            json!({
                "ListenerArn": fns::ref_(id),
                "Priority": rule.priority,
                "Conditions": conditions,
                "Actions": [action_json(&rule.action)],
            }),
        );
        // Dynamic references resolve at create time, the secret has to exist first.
        let resolves_secret = rule
            .conditions
            .iter()
            .flat_map(|c| c.values.iter())
            .any(|v| v.starts_with("{{resolve:secretsmanager:"));
        if resolves_secret {
            resource = resource.depends_on(ORIGIN_VERIFY_SECRET);
        }
        t.add(&format!("{id}Rule{}", rule.priority), resource)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> StackTemplate {
        synth_load_balancer(&AppConfig::default()).unwrap()
    }

    fn attribute<'a>(r: &'a Resource, key: &str) -> Option<&'a str> {
        r.properties["TargetGroupAttributes"]
            .as_array()?
            .iter()
            .find(|a| a["Key"] == key)
            .and_then(|a| a["Value"].as_str())
    }

    #[test]
    fn test_sticky_inference_target_group() {
        let t = template();
        let tg = &t.resources[INFERENCE_TARGET_GROUP];
        assert_eq!(attribute(tg, "stickiness.enabled"), Some("true"));
        assert_eq!(attribute(tg, "stickiness.type"), Some("lb_cookie"));
        assert_eq!(attribute(tg, "stickiness.lb_cookie.duration_seconds"), Some("86400"));
        assert_eq!(tg.properties["Port"], 8000);
        assert_eq!(tg.properties["HealthCheckPath"], "/health");
        assert_eq!(tg.properties["UnhealthyThresholdCount"], 3);
    }

    #[test]
    fn test_stickiness_duration_configurable() {
        let mut cfg = AppConfig::default();
        cfg.load_balancer.stickiness.duration_secs = 3600;
        let t = synth_load_balancer(&cfg).unwrap();
        assert_eq!(
            attribute(&t.resources[INFERENCE_TARGET_GROUP], "stickiness.lb_cookie.duration_seconds"),
            Some("3600")
        );
    }

    #[test]
    fn test_edge_listener_denies_by_default() {
        let t = template();
        let listener = &t.resources[EDGE_LISTENER];
        let default = &listener.properties["DefaultActions"][0];
        assert_eq!(default["Type"], "fixed-response");
        assert_eq!(default["FixedResponseConfig"]["StatusCode"], "403");

        let rule = &t.resources["EdgeListenerRule1"];
        let cond = &rule.properties["Conditions"][0]["HttpHeaderConfig"];
        assert_eq!(cond["HttpHeaderName"], "X-Origin-Verify");
        assert!(cond["Values"][0].as_str().unwrap().starts_with("{{resolve:secretsmanager:"));
        assert_eq!(rule.properties["Actions"][0]["TargetGroupArn"]["Ref"], WEBUI_TARGET_GROUP);
    }

    #[test]
    fn test_edge_distribution_injects_header() {
        let t = template();
        let origin = &t.resources["EdgeDistribution"].properties["DistributionConfig"]["Origins"][0];
        assert_eq!(origin["OriginCustomHeaders"][0]["HeaderName"], "X-Origin-Verify");
        assert_eq!(
            origin["OriginCustomHeaders"][0]["HeaderValue"],
            "{{resolve:secretsmanager:SkyforgeOriginVerify:SecretString}}"
        );
        assert_eq!(origin["DomainName"]["Fn::GetAtt"][0], "EdgeAlb");
    }

    #[test]
    fn test_secret_name_follows_stack_prefix() {
        let mut cfg = AppConfig::default();
        cfg.stack_prefix = "Staging".into();
        let t = synth_load_balancer(&cfg).unwrap();
        assert_eq!(t.resources[ORIGIN_VERIFY_SECRET].properties["Name"], "StagingOriginVerify");
        let origin = &t.resources["EdgeDistribution"].properties["DistributionConfig"]["Origins"][0];
        assert_eq!(
            origin["OriginCustomHeaders"][0]["HeaderValue"],
            "{{resolve:secretsmanager:StagingOriginVerify:SecretString}}"
        );
    }

    #[test]
    fn test_schemes_and_subnets() {
        let t = template();
        assert_eq!(t.resources["InferenceAlb"].properties["Scheme"], "internal");
        assert_eq!(
            t.resources["InferenceAlb"].properties["Subnets"]["Fn::Split"][1]["Fn::ImportValue"],
            "SkyforgeNetwork:PrivateSubnetIds"
        );
        assert_eq!(t.resources["EdgeAlb"].properties["Scheme"], "internet-facing");
        assert_eq!(t.depends_on, vec!["SkyforgeNetwork".to_string()]);
    }

    #[test]
    fn test_secret_is_generated() {
        let t = template();
        let s = &t.resources[ORIGIN_VERIFY_SECRET].properties;
        assert!(s.get("SecretString").is_none());
        assert_eq!(s["GenerateSecretString"]["PasswordLength"], 32);
    }
}

//! Service stack: the GPU autoscaling group serving vLLM and the Fargate
//! service running OpenWebUI on EFS-backed storage.

use serde_json::{json, Value};

use skyforge_common::template::fns;
use skyforge_common::{
    AppConfig, Resource, ScalingMetric, SecurityGroupRole, StackTemplate, SynthError,
};

use crate::load_balancer::{
    INFERENCE_ALB_DNS, INFERENCE_ALB_FULL_NAME, INFERENCE_TARGET_GROUP_ARN,
    INFERENCE_TARGET_GROUP_FULL_NAME, WEBUI_TARGET_GROUP_ARN,
};
use crate::network::{security_group_export, PRIVATE_SUBNET_IDS};
use crate::tags;
use crate::user_data::BootScript;

pub const INFERENCE_ASG: &str = "InferenceAsg";
pub const WEBUI_SERVICE: &str = "WebUiService";
pub const WEBUI_CONTAINER: &str = "webui";
const WEBUI_VOLUME: &str = "webui-data";

pub fn synth_service(cfg: &AppConfig) -> Result<StackTemplate, SynthError> {
    let inf = &cfg.service.inference;
    let ui = &cfg.service.webui;
    let network = cfg.network_stack();
    let lb = cfg.load_balancer_stack();

    cfg.validate_boot_inputs()?;
    let ami = inf.ami_for(&cfg.env.region)?;

    let mut t = StackTemplate::new(
        &cfg.service_stack(),
        "Compute for vLLM + OpenWebUI: GPU autoscaling group and Fargate service",
    );
    t.depends_on.push(lb.clone());

    let private_subnets = || fns::split(",", fns::import_value(&network, PRIVATE_SUBNET_IDS));
    let sg = |role: SecurityGroupRole| fns::import_value(&network, &security_group_export(role));

    // vLLM instances

    t.add(
        "InferenceInstanceRole",
        Resource::new(
            "AWS::IAM::Role",
            json!({
                "AssumeRolePolicyDocument": assume_role("ec2.amazonaws.com"),
                "ManagedPolicyArns": [
                    fns::sub("arn:${AWS::Partition}:iam::aws:policy/AmazonSSMManagedInstanceCore"),
                ],
                "Policies": [{
                    "PolicyName": "ReadModelToken",
                    "PolicyDocument": {
                        "Version": "2012-10-17",
                        "Statement": [{
                            "Effect": "Allow",
                            "Action": ["secretsmanager:GetSecretValue", "secretsmanager:DescribeSecret"],
                            "Resource": cfg.model_token.iam_resource(),
                        }],
                    },
                }],
                "Tags": tags(cfg, "InferenceInstanceRole"),
            }),
        ),
    )?;
    t.add(
        "InferenceInstanceProfile",
        Resource::new(
            "AWS::IAM::InstanceProfile",
            json!({ "Roles": [fns::ref_("InferenceInstanceRole")] }),
        ),
    )?;

    let script = BootScript::from_config(cfg).render();
    t.add(
        "InferenceLaunchTemplate",
        Resource::new(
            "AWS::EC2::LaunchTemplate",
            json!({
                "LaunchTemplateData": {
                    "ImageId": ami,
                    "InstanceType": inf.instance_type,
                    "IamInstanceProfile": { "Arn": fns::get_att("InferenceInstanceProfile", "Arn") },
                    "SecurityGroupIds": [sg(SecurityGroupRole::Inference)],
                    "BlockDeviceMappings": [{
                        "DeviceName": inf.root_volume.device_name,
                        "Ebs": {
                            "VolumeSize": inf.root_volume.size_gib,
                            "VolumeType": inf.root_volume.volume_type,
                            "DeleteOnTermination": inf.root_volume.delete_on_termination,
                            "Encrypted": true,
                        },
                    }],
                    "MetadataOptions": { "HttpTokens": "required", "HttpEndpoint": "enabled" },
                    "UserData": fns::base64(json!(script)),
                    "TagSpecifications": [{
                        "ResourceType": "instance",
                        "Tags": tags(cfg, "Inference"),
                    }],
                },
            }),
        ),
    )?;
    t.add(
        INFERENCE_ASG,
        Resource::new(
            "AWS::AutoScaling::AutoScalingGroup",
            json!({
                "MinSize": inf.capacity.min.to_string(),
                "MaxSize": inf.capacity.max.to_string(),
                "DesiredCapacity": inf.capacity.desired.to_string(),
                "LaunchTemplate": {
                    "LaunchTemplateId": fns::ref_("InferenceLaunchTemplate"),
                    "Version": fns::get_att("InferenceLaunchTemplate", "LatestVersionNumber"),
                },
                "VPCZoneIdentifier": private_subnets(),
                "TargetGroupARNs": [fns::import_value(&lb, INFERENCE_TARGET_GROUP_ARN)],
                "HealthCheckType": "ELB",
                "HealthCheckGracePeriod": inf.health_check_grace_secs,
                "DefaultInstanceWarmup": inf.scaling.warmup_secs,
            }),
        ),
    )?;

    let mut metric = json!({ "PredefinedMetricType": inf.scaling.metric.predefined_type() });
    if inf.scaling.metric == ScalingMetric::AlbRequestCount {
        metric["ResourceLabel"] = fns::join(
            "/",
            vec![
                fns::import_value(&lb, INFERENCE_ALB_FULL_NAME),
                fns::import_value(&lb, INFERENCE_TARGET_GROUP_FULL_NAME),
            ],
        );
    }
    t.add(
        "InferenceScalingPolicy",
        Resource::new(
            "AWS::AutoScaling::ScalingPolicy",
            json!({
                "AutoScalingGroupName": fns::ref_(INFERENCE_ASG),
                "PolicyType": "TargetTrackingScaling",
                "EstimatedInstanceWarmup": inf.scaling.warmup_secs,
                "TargetTrackingConfiguration": {
                    "PredefinedMetricSpecification": metric,
                    "TargetValue": inf.scaling.target,
                    "DisableScaleIn": inf.scaling.disable_scale_in,
                },
            }),
        ),
    )?;

    // OpenWebUI

    let insights = if ui.container_insights { "enabled" } else { "disabled" };
    t.add(
        "WebUiCluster",
        Resource::new(
            "AWS::ECS::Cluster",
            json!({
                "ClusterSettings": [{
                    "Name": "containerInsights",
                    "Value": insights,
                }],
                "Tags": tags(cfg, "WebUiCluster"),
            }),
        ),
    )?;
    t.add(
        "WebUiLogGroup",
        Resource::new(
            "AWS::Logs::LogGroup",
            json!({ "RetentionInDays": ui.log_retention_days }),
        )
        .deletion_policy("Delete"),
    )?;
    t.add(
        "WebUiFileSystem",
        Resource::new(
            "AWS::EFS::FileSystem",
            json!({
                "Encrypted": true,
                "PerformanceMode": "generalPurpose",
                "ThroughputMode": "bursting",
                "FileSystemTags": tags(cfg, "WebUiFileSystem"),
            }),
        )
        .deletion_policy("Delete"),
    )?;

    let mut mount_targets = Vec::new();
    for i in 0..cfg.network.zone_count() {
        let id = format!("WebUiMountTarget{}", i + 1);
        t.add(
            &id,
            Resource::new(
                "AWS::EFS::MountTarget",
                json!({
                    "FileSystemId": fns::ref_("WebUiFileSystem"),
                    "SubnetId": fns::select(i, private_subnets()),
                    "SecurityGroups": [sg(SecurityGroupRole::Efs)],
                }),
            ),
        )?;
        mount_targets.push(id);
    }
    t.add(
        "WebUiAccessPoint",
        Resource::new(
            "AWS::EFS::AccessPoint",
            json!({
                "FileSystemId": fns::ref_("WebUiFileSystem"),
                "PosixUser": { "Uid": "0", "Gid": "0" },
                "RootDirectory": {
                    "Path": ui.access_point_path,
                    "CreationInfo": { "OwnerUid": "0", "OwnerGid": "0", "Permissions": "755" },
                },
            }),
        ),
    )?;

    t.add(
        "WebUiTaskExecutionRole",
        Resource::new(
            "AWS::IAM::Role",
            json!({
                "AssumeRolePolicyDocument": assume_role("ecs-tasks.amazonaws.com"),
                "ManagedPolicyArns": [fns::sub(
                    "arn:${AWS::Partition}:iam::aws:policy/service-role/AmazonECSTaskExecutionRolePolicy",
                )],
            }),
        ),
    )?;
    t.add(
        "WebUiTaskRole",
        Resource::new(
            "AWS::IAM::Role",
            json!({
                "AssumeRolePolicyDocument": assume_role("ecs-tasks.amazonaws.com"),
                "Policies": [{
                    "PolicyName": "WebUiDataAccess",
                    "PolicyDocument": {
                        "Version": "2012-10-17",
                        "Statement": [{
                            "Effect": "Allow",
                            "Action": [
                                "elasticfilesystem:ClientMount",
                                "elasticfilesystem:ClientWrite",
                                "elasticfilesystem:ClientRootAccess",
                                "elasticfilesystem:DescribeMountTargets",
                            ],
                            "Resource": fns::get_att("WebUiFileSystem", "Arn"),
                            "Condition": {
                                "Bool": { "elasticfilesystem:AccessedViaMountTarget": "true" },
                            },
                        }],
                    },
                }],
            }),
        ),
    )?;

    t.add(
        "WebUiTaskDefinition",
        Resource::new(
            "AWS::ECS::TaskDefinition",
            json!({
                "RequiresCompatibilities": ["FARGATE"],
                "NetworkMode": "awsvpc",
                "Cpu": ui.cpu.to_string(),
                "Memory": ui.memory_mib.to_string(),
                "RuntimePlatform": {
                    "CpuArchitecture": ui.architecture.cpu_architecture(),
                    "OperatingSystemFamily": "LINUX",
                },
                "ExecutionRoleArn": fns::get_att("WebUiTaskExecutionRole", "Arn"),
                "TaskRoleArn": fns::get_att("WebUiTaskRole", "Arn"),
                "Volumes": [{
                    "Name": WEBUI_VOLUME,
                    "EFSVolumeConfiguration": {
                        "FilesystemId": fns::ref_("WebUiFileSystem"),
                        "TransitEncryption": "ENABLED",
                        "AuthorizationConfig": {
                            "AccessPointId": fns::ref_("WebUiAccessPoint"),
                            "IAM": "ENABLED",
                        },
                    },
                }],
                "ContainerDefinitions": [{
                    "Name": WEBUI_CONTAINER,
                    "Image": ui.image,
                    "Essential": true,
                    "PortMappings": [{ "ContainerPort": cfg.network.ports.app, "Protocol": "tcp" }],
                    "Environment": webui_environment(cfg),
                    "MountPoints": [{
                        "SourceVolume": WEBUI_VOLUME,
                        "ContainerPath": ui.data_path,
                        "ReadOnly": false,
                    }],
                    "LogConfiguration": {
                        "LogDriver": "awslogs",
                        "Options": {
                            "awslogs-group": fns::ref_("WebUiLogGroup"),
                            "awslogs-region": fns::ref_("AWS::Region"),
                            "awslogs-stream-prefix": ui.log_stream_prefix,
                        },
                    },
                }],
            }),
        ),
    )?;

    let mut service = Resource::new(
        "AWS::ECS::Service",
        json!({
            "Cluster": fns::ref_("WebUiCluster"),
            "TaskDefinition": fns::ref_("WebUiTaskDefinition"),
            "LaunchType": "FARGATE",
            "PlatformVersion": "1.4.0",
            "DesiredCount": ui.desired_count,
            "DeploymentConfiguration": {
                "MinimumHealthyPercent": ui.min_healthy_percent,
                "MaximumPercent": ui.max_healthy_percent,
            },
            "NetworkConfiguration": {
                "AwsvpcConfiguration": {
                    "AssignPublicIp": "DISABLED",
                    "Subnets": private_subnets(),
                    "SecurityGroups": [sg(SecurityGroupRole::WebUi)],
                },
            },
            "LoadBalancers": [{
                "ContainerName": WEBUI_CONTAINER,
                "ContainerPort": cfg.network.ports.app,
                "TargetGroupArn": fns::import_value(&lb, WEBUI_TARGET_GROUP_ARN),
            }],
            "HealthCheckGracePeriodSeconds": 60,
        }),
    );
    // Tasks fail to start until the file system is reachable.
    for id in &mount_targets {
        service = service.depends_on(id);
    }
    t.add(WEBUI_SERVICE, service)?;

    t.output("InferenceAutoScalingGroup", fns::ref_(INFERENCE_ASG), Some("vLLM autoscaling group"));
    t.output("WebUiClusterName", fns::ref_("WebUiCluster"), None);
    t.output("WebUiServiceName", fns::get_att(WEBUI_SERVICE, "Name"), None);
    t.output("WebUiFileSystemId", fns::ref_("WebUiFileSystem"), None);

    tracing::debug!(stack = %t.name, resources = t.resources.len(), "synthesized service stack");
    Ok(t)
}

fn assume_role(principal: &str) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": principal },
            "Action": "sts:AssumeRole",
        }],
    })
}

/// Container environment. Configured extras are merged last.
fn webui_environment(cfg: &AppConfig) -> Vec<Value> {
    let ui = &cfg.service.webui;
    let mut env: Vec<(String, Value)> = vec![
        ("ENABLE_OLLAMA_API".into(), json!("false")),
        (
            "OPENAI_API_BASE_URL".into(),
            fns::sub_with(
                "http://${Dns}/v1",
                json!({ "Dns": fns::import_value(&cfg.load_balancer_stack(), INFERENCE_ALB_DNS) }),
            ),
        ),
        ("DATA_DIR".into(), json!(ui.data_path)),
        (
            "DATABASE_URL".into(),
            json!(format!("sqlite:///{}/database.db", ui.data_path)),
        ),
    ];
    for (k, v) in &ui.environment {
        match env.iter_mut().find(|(name, _)| name == k) {
            Some(slot) => slot.1 = json!(v),
            None => env.push((k.clone(), json!(v))),
        }
    }
    env.into_iter()
        .map(|(name, value)| json!({ "Name": name, "Value": value }))
        .collect()
}

#[cfg(test)]
mod tests {
    use skyforge_common::ConfigError;

    use super::*;

    fn template() -> StackTemplate {
        synth_service(&AppConfig::default()).unwrap()
    }

    fn env_value<'a>(t: &'a StackTemplate, name: &str) -> Option<&'a Value> {
        t.resources["WebUiTaskDefinition"].properties["ContainerDefinitions"][0]["Environment"]
            .as_array()?
            .iter()
            .find(|e| e["Name"] == name)
            .map(|e| &e["Value"])
    }

    #[test]
    fn test_asg_capacity_and_health() {
        let mut cfg = AppConfig::default();
        cfg.service.inference.capacity.max = 3;
        let t = synth_service(&cfg).unwrap();
        let asg = &t.resources[INFERENCE_ASG].properties;
        assert_eq!(asg["MinSize"], "1");
        assert_eq!(asg["MaxSize"], "3");
        assert_eq!(asg["HealthCheckType"], "ELB");
        assert_eq!(
            asg["TargetGroupARNs"][0]["Fn::ImportValue"],
            "SkyforgeLoadBalancer:InferenceTargetGroupArn"
        );
    }

    #[test]
    fn test_cpu_target_tracking() {
        let t = template();
        let policy = &t.resources["InferenceScalingPolicy"].properties["TargetTrackingConfiguration"];
        assert_eq!(policy["PredefinedMetricSpecification"]["PredefinedMetricType"], "ASGAverageCPUUtilization");
        assert_eq!(policy["TargetValue"], 70.0);
        assert_eq!(policy["DisableScaleIn"], false);
        assert!(policy["PredefinedMetricSpecification"].get("ResourceLabel").is_none());
    }

    #[test]
    fn test_request_count_needs_resource_label() {
        let mut cfg = AppConfig::default();
        cfg.service.inference.scaling.metric = ScalingMetric::AlbRequestCount;
        let t = synth_service(&cfg).unwrap();
        let spec = &t.resources["InferenceScalingPolicy"].properties["TargetTrackingConfiguration"]
            ["PredefinedMetricSpecification"];
        assert_eq!(spec["PredefinedMetricType"], "ALBRequestCountPerTarget");
        assert_eq!(spec["ResourceLabel"]["Fn::Join"][0], "/");
    }

    #[test]
    fn test_instance_can_read_token_by_name_only() {
        let t = template();
        let role = &t.resources["InferenceInstanceRole"].properties;
        let stmt = &role["Policies"][0]["PolicyDocument"]["Statement"][0];
        assert!(stmt["Resource"]["Fn::Sub"].as_str().unwrap().ends_with(":secret:HuggingFaceToken*"));

        let lt = &t.resources["InferenceLaunchTemplate"].properties["LaunchTemplateData"];
        let script = lt["UserData"]["Fn::Base64"].as_str().unwrap();
        assert!(script.contains("--secret-id HuggingFaceToken"));
        assert_eq!(lt["MetadataOptions"]["HttpTokens"], "required");
        assert_eq!(lt["ImageId"], "ami-0fcdcdcc9cf0407ae");
    }

    #[test]
    fn test_webui_points_at_internal_alb() {
        let t = template();
        let base = env_value(&t, "OPENAI_API_BASE_URL").unwrap();
        assert_eq!(base["Fn::Sub"][0], "http://${Dns}/v1");
        assert_eq!(
            base["Fn::Sub"][1]["Dns"]["Fn::ImportValue"],
            "SkyforgeLoadBalancer:InferenceAlbDnsName"
        );
        assert_eq!(env_value(&t, "ENABLE_OLLAMA_API").unwrap(), "false");
        assert_eq!(
            env_value(&t, "DATABASE_URL").unwrap(),
            "sqlite:////app/backend/data/database.db"
        );
    }

    #[test]
    fn test_extra_environment_overrides() {
        let mut cfg = AppConfig::default();
        cfg.service.webui.environment.insert("ENABLE_OLLAMA_API".into(), "true".into());
        cfg.service.webui.environment.insert("WEBUI_NAME".into(), "Clinic".into());
        let t = synth_service(&cfg).unwrap();
        assert_eq!(env_value(&t, "ENABLE_OLLAMA_API").unwrap(), "true");
        assert_eq!(env_value(&t, "WEBUI_NAME").unwrap(), "Clinic");
    }

    #[test]
    fn test_fargate_service_is_private() {
        let t = template();
        let svc = &t.resources[WEBUI_SERVICE];
        let vpc = &svc.properties["NetworkConfiguration"]["AwsvpcConfiguration"];
        assert_eq!(vpc["AssignPublicIp"], "DISABLED");
        assert_eq!(vpc["SecurityGroups"][0]["Fn::ImportValue"], "SkyforgeNetwork:WebUiSecurityGroupId");
        assert_eq!(svc.depends_on, vec!["WebUiMountTarget1".to_string(), "WebUiMountTarget2".to_string()]);
        let task = &t.resources["WebUiTaskDefinition"].properties;
        assert_eq!(task["RuntimePlatform"]["CpuArchitecture"], "ARM64");
        assert_eq!(task["ContainerDefinitions"][0]["PortMappings"][0]["ContainerPort"], 8080);
    }

    #[test]
    fn test_unsafe_model_rejected() {
        let mut cfg = AppConfig::default();
        cfg.service.inference.model = "org/model; curl evil".into();
        assert!(matches!(
            synth_service(&cfg),
            Err(SynthError::Config(ConfigError::Invalid(_)))
        ));
    }

    #[test]
    fn test_unsafe_unit_user_rejected() {
        let mut cfg = AppConfig::default();
        cfg.service.inference.service_user = "ubuntu;id".into();
        assert!(matches!(
            synth_service(&cfg),
            Err(SynthError::Config(ConfigError::Invalid(_)))
        ));
    }
}

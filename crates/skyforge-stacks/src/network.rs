//! Network stack: VPC, public/private subnet tiers, NAT path and the
//! security group allow-list.

use serde_json::{json, Value};

use skyforge_common::network::NetworkConfig;
use skyforge_common::template::fns;
use skyforge_common::{AppConfig, Peer, Resource, SecurityGroupRole, StackTemplate, SubnetTier, SynthError};

use crate::tags;

pub const VPC_ID: &str = "VpcId";
pub const VPC_CIDR: &str = "VpcCidr";
pub const PUBLIC_SUBNET_IDS: &str = "PublicSubnetIds";
pub const PRIVATE_SUBNET_IDS: &str = "PrivateSubnetIds";

/// Export key of a security group id.
pub fn security_group_export(role: SecurityGroupRole) -> String {
    format!("{}Id", role.logical_id())
}

pub fn subnet_id(tier: SubnetTier, index: usize) -> String {
    format!("{}Subnet{}", tier.label(), index + 1)
}

fn availability_zone(net: &NetworkConfig, index: usize) -> Value {
    match net.availability_zones.get(index) {
        Some(zone) => json!(zone),
        None => fns::select(index, fns::get_azs()),
    }
}

pub fn synth_network(cfg: &AppConfig) -> Result<StackTemplate, SynthError> {
    let net = &cfg.network;
    let mut t = StackTemplate::new(
        &cfg.network_stack(),
        "Network layout for vLLM + OpenWebUI: VPC, subnet tiers, NAT and security groups",
    );

    t.add(
        "Vpc",
        Resource::new(
            "AWS::EC2::VPC",
            json!({
                "CidrBlock": net.cidr,
                "EnableDnsHostnames": true,
                "EnableDnsSupport": true,
                "Tags": tags(cfg, "Vpc"),
            }),
        ),
    )?;
    t.add(
        "InternetGateway",
        Resource::new("AWS::EC2::InternetGateway", json!({ "Tags": tags(cfg, "InternetGateway") })),
    )?;
    t.add(
        "VpcGatewayAttachment",
        Resource::new(
            "AWS::EC2::VPCGatewayAttachment",
            json!({
                "VpcId": fns::ref_("Vpc"),
                "InternetGatewayId": fns::ref_("InternetGateway"),
            }),
        ),
    )?;

    let zones = net.zone_count();
    let nat_count = net.nat_count();
    let public_cidrs = net.subnet_cidrs(SubnetTier::Public)?;
    let private_cidrs = net.subnet_cidrs(SubnetTier::Private)?;

    for (i, cidr) in public_cidrs.iter().enumerate() {
        let subnet = subnet_id(SubnetTier::Public, i);
        add_subnet(&mut t, cfg, &subnet, &cidr.to_string(), availability_zone(net, i), true)?;
        t.add(
            &format!("{subnet}DefaultRoute"),
            Resource::new(
                "AWS::EC2::Route",
                json!({
                    "RouteTableId": fns::ref_(&format!("{subnet}RouteTable")),
                    "DestinationCidrBlock": "0.0.0.0/0",
                    "GatewayId": fns::ref_("InternetGateway"),
                }),
            )
            .depends_on("VpcGatewayAttachment"),
        )?;

        if i < nat_count {
            t.add(
                &format!("{subnet}NatEip"),
                Resource::new("AWS::EC2::EIP", json!({ "Domain": "vpc", "Tags": tags(cfg, &format!("{subnet}NatEip")) }))
                    .depends_on("VpcGatewayAttachment"),
            )?;
            t.add(
                &format!("{subnet}NatGateway"),
                Resource::new(
                    "AWS::EC2::NatGateway",
                    json!({
                        "SubnetId": fns::ref_(&subnet),
                        "AllocationId": fns::get_att(&format!("{subnet}NatEip"), "AllocationId"),
                        "Tags": tags(cfg, &format!("{subnet}NatGateway")),
                    }),
                ),
            )?;
        }
    }

    // Private subnets leave the VPC only through a NAT gateway.
    for (i, cidr) in private_cidrs.iter().enumerate() {
        let subnet = subnet_id(SubnetTier::Private, i);
        add_subnet(&mut t, cfg, &subnet, &cidr.to_string(), availability_zone(net, i), false)?;
        let nat = format!("{}NatGateway", subnet_id(SubnetTier::Public, i % nat_count));
        t.add(
            &format!("{subnet}DefaultRoute"),
            Resource::new(
                "AWS::EC2::Route",
                json!({
                    "RouteTableId": fns::ref_(&format!("{subnet}RouteTable")),
                    "DestinationCidrBlock": "0.0.0.0/0",
                    "NatGatewayId": fns::ref_(&nat),
                }),
            ),
        )?;
    }

    for role in SecurityGroupRole::ALL {
        t.add(
            role.logical_id(),
            Resource::new(
                "AWS::EC2::SecurityGroup",
                json!({
                    "GroupDescription": role.description(),
                    "VpcId": fns::ref_("Vpc"),
                    "SecurityGroupEgress": [
                        { "IpProtocol": "-1", "CidrIp": "0.0.0.0/0", "Description": "Allow all outbound traffic" }
                    ],
                    "Tags": tags(cfg, role.logical_id()),
                }),
            ),
        )?;
    }

    for rule in net.ingress_rules() {
        let mut props = json!({
            "GroupId": fns::get_att(rule.target.logical_id(), "GroupId"),
            "IpProtocol": "tcp",
            "FromPort": rule.port,
            "ToPort": rule.port,
            "Description": rule.description,
        });
        let source = match &rule.peer {
            Peer::AnyIpv4 => {
                props["CidrIp"] = json!("0.0.0.0/0");
                "AnyIpv4".to_string()
            }
            Peer::AnyIpv6 => {
                props["CidrIpv6"] = json!("::/0");
                "AnyIpv6".to_string()
            }
            Peer::Cidr(c) if c == &net.cidr => {
                props["CidrIp"] = json!(c);
                "VpcCidr".to_string()
            }
            Peer::Cidr(c) => {
                props["CidrIp"] = json!(c);
                format!("Cidr{}", c.replace(['.', '/'], ""))
            }
            Peer::PrefixList(id) => {
                props["SourcePrefixListId"] = json!(id);
                "EdgePrefixList".to_string()
            }
            Peer::Group(g) => {
                props["SourceSecurityGroupId"] = fns::get_att(g.logical_id(), "GroupId");
                g.logical_id().trim_end_matches("SecurityGroup").to_string()
            }
        };
        let id = format!("{}From{}Port{}", rule.target.logical_id(), source, rule.port);
        t.add(&id, Resource::new("AWS::EC2::SecurityGroupIngress", props))?;
    }

    t.export(VPC_ID, fns::ref_("Vpc"), Some("VPC id"));
    t.export(VPC_CIDR, fns::get_att("Vpc", "CidrBlock"), None);
    for (tier, key) in [
        (SubnetTier::Public, PUBLIC_SUBNET_IDS),
        (SubnetTier::Private, PRIVATE_SUBNET_IDS),
    ] {
        let ids = (0..zones).map(|i| fns::ref_(&subnet_id(tier, i))).collect();
        t.export(key, fns::join(",", ids), None);
    }
    for role in SecurityGroupRole::ALL {
        t.export(
            &security_group_export(role),
            fns::get_att(role.logical_id(), "GroupId"),
            None,
        );
    }

    tracing::debug!(stack = %t.name, resources = t.resources.len(), "synthesized network stack");
    Ok(t)
}

fn add_subnet(
    t: &mut StackTemplate,
    cfg: &AppConfig,
    subnet: &str,
    cidr: &str,
    zone: Value,
    public: bool,
) -> Result<(), SynthError> {
    t.add(
        subnet,
        Resource::new(
            "AWS::EC2::Subnet",
            json!({
                "VpcId": fns::ref_("Vpc"),
                "CidrBlock": cidr,
                "AvailabilityZone": zone,
                "MapPublicIpOnLaunch": public,
                "Tags": tags(cfg, subnet),
            }),
        ),
    )?;
    t.add(
        &format!("{subnet}RouteTable"),
        Resource::new(
            "AWS::EC2::RouteTable",
            json!({ "VpcId": fns::ref_("Vpc"), "Tags": tags(cfg, subnet) }),
        ),
    )?;
    t.add(
        &format!("{subnet}RouteTableAssociation"),
        Resource::new(
            "AWS::EC2::SubnetRouteTableAssociation",
            json!({
                "RouteTableId": fns::ref_(&format!("{subnet}RouteTable")),
                "SubnetId": fns::ref_(subnet),
            }),
        ),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> StackTemplate {
        synth_network(&AppConfig::default()).unwrap()
    }

    #[test]
    fn test_subnets_per_zone() {
        let t = template();
        assert_eq!(t.resources_of_kind("AWS::EC2::Subnet").count(), 4);
        assert_eq!(t.resources["PublicSubnet1"].properties["CidrBlock"], "10.0.0.0/24");
        assert_eq!(t.resources["PrivateSubnet2"].properties["CidrBlock"], "10.0.3.0/24");
        assert_eq!(t.resources["PrivateSubnet1"].properties["MapPublicIpOnLaunch"], false);
    }

    #[test]
    fn test_single_nat_serves_all_private_subnets() {
        let t = template();
        assert_eq!(t.resources_of_kind("AWS::EC2::NatGateway").count(), 1);
        for i in 1..=2 {
            let route = &t.resources[&format!("PrivateSubnet{i}DefaultRoute")];
            assert_eq!(route.properties["NatGatewayId"]["Ref"], "PublicSubnet1NatGateway");
            assert!(route.properties.get("GatewayId").is_none());
        }
    }

    #[test]
    fn test_nat_per_zone() {
        let mut cfg = AppConfig::default();
        cfg.network.nat_gateways = 5;
        let t = synth_network(&cfg).unwrap();
        assert_eq!(t.resources_of_kind("AWS::EC2::NatGateway").count(), 2);
        assert_eq!(
            t.resources["PrivateSubnet2DefaultRoute"].properties["NatGatewayId"]["Ref"],
            "PublicSubnet2NatGateway"
        );
    }

    #[test]
    fn test_allow_list_rules() {
        let t = template();
        let rule = &t.resources["InferenceSecurityGroupFromInferenceAlbPort8000"];
        assert_eq!(rule.properties["SourceSecurityGroupId"]["Fn::GetAtt"][0], "InferenceAlbSecurityGroup");
        assert_eq!(rule.properties["FromPort"], 8000);
        let edge = &t.resources["EdgeAlbSecurityGroupFromAnyIpv4Port80"];
        assert_eq!(edge.properties["CidrIp"], "0.0.0.0/0");
        assert!(t.resources.contains_key("EfsSecurityGroupFromVpcCidrPort2049"));
        assert_eq!(t.resources_of_kind("AWS::EC2::SecurityGroupIngress").count(), 6);
    }

    #[test]
    fn test_explicit_zones() {
        let mut cfg = AppConfig::default();
        cfg.network.availability_zones = vec!["us-east-1a".into(), "us-east-1b".into()];
        let t = synth_network(&cfg).unwrap();
        assert_eq!(t.resources["PublicSubnet2"].properties["AvailabilityZone"], "us-east-1b");
    }

    #[test]
    fn test_exports() {
        let t = template();
        assert_eq!(t.outputs[PRIVATE_SUBNET_IDS].export.as_ref().unwrap().name, "SkyforgeNetwork:PrivateSubnetIds");
        assert!(t.outputs.contains_key("WebUiSecurityGroupId"));
    }
}

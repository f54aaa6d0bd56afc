use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Placement tier of a subnet and of everything attached to it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SubnetTier {
    Public,
    Private,
}

impl SubnetTier {
    pub fn label(self) -> &'static str {
        match self {
            Self::Public => "Public",
            Self::Private => "Private",
        }
    }
}

/// The fixed set of security groups the network stack declares.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityGroupRole {
    /// Public ALB in front of the UI, reached through the edge network.
    EdgeAlb,
    /// Internal ALB in front of vLLM.
    InferenceAlb,
    /// GPU instances running vLLM.
    Inference,
    /// OpenWebUI tasks.
    WebUi,
    /// EFS mount targets backing the UI data directory.
    Efs,
}

impl SecurityGroupRole {
    pub const ALL: [SecurityGroupRole; 5] = [
        Self::EdgeAlb,
        Self::InferenceAlb,
        Self::Inference,
        Self::WebUi,
        Self::Efs,
    ];

    pub fn logical_id(self) -> &'static str {
        match self {
            Self::EdgeAlb => "EdgeAlbSecurityGroup",
            Self::InferenceAlb => "InferenceAlbSecurityGroup",
            Self::Inference => "InferenceSecurityGroup",
            Self::WebUi => "WebUiSecurityGroup",
            Self::Efs => "EfsSecurityGroup",
        }
    }

    pub fn tier(self) -> SubnetTier {
        match self {
            Self::EdgeAlb => SubnetTier::Public,
            _ => SubnetTier::Private,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::EdgeAlb => "Public ALB for OpenWebUI, reachable from the edge network",
            Self::InferenceAlb => "Internal ALB for vLLM",
            Self::Inference => "vLLM GPU instances",
            Self::WebUi => "OpenWebUI tasks",
            Self::Efs => "EFS for OpenWebUI data",
        }
    }
}

/// Source of traffic in an ingress rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum Peer {
    AnyIpv4,
    AnyIpv6,
    Cidr(String),
    PrefixList(String),
    Group(SecurityGroupRole),
}

impl Peer {
    /// True if the peer admits addresses on the public internet.
    ///
    /// Prefix lists are treated as public: the ones used here are the
    /// edge network's origin-facing ranges.
    pub fn is_public_internet(&self) -> bool {
        match self {
            Self::AnyIpv4 | Self::AnyIpv6 | Self::PrefixList(_) => true,
            Self::Group(_) => false,
            Self::Cidr(cidr) => match cidr.parse::<Ipv4Cidr>() {
                Ok(c) => !c.is_private(),
                // IPv6 ranges: only unique-local (fc00::/7) counts as private.
                Err(_) => {
                    let lower = cidr.to_ascii_lowercase();
                    !(lower.starts_with("fc") || lower.starts_with("fd"))
                }
            },
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AnyIpv4 => write!(f, "0.0.0.0/0"),
            Self::AnyIpv6 => write!(f, "::/0"),
            Self::Cidr(c) => write!(f, "{c}"),
            Self::PrefixList(p) => write!(f, "{p}"),
            Self::Group(g) => write!(f, "sg:{}", g.logical_id()),
        }
    }
}

/// Which peer may reach the public ALB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EdgeIngress {
    AnyIpv4,
    PrefixList(String),
}

impl Default for EdgeIngress {
    fn default() -> Self {
        Self::AnyIpv4
    }
}

impl EdgeIngress {
    pub fn peer(&self) -> Peer {
        match self {
            Self::AnyIpv4 => Peer::AnyIpv4,
            Self::PrefixList(id) => Peer::PrefixList(id.clone()),
        }
    }
}

impl TryFrom<String> for EdgeIngress {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == "any-ipv4" {
            Ok(Self::AnyIpv4)
        } else if value.starts_with("pl-") && value.len() > 3 {
            Ok(Self::PrefixList(value))
        } else {
            Err(ConfigError::EdgeIngress(value))
        }
    }
}

impl From<EdgeIngress> for String {
    fn from(value: EdgeIngress) -> Self {
        match value {
            EdgeIngress::AnyIpv4 => "any-ipv4".to_string(),
            EdgeIngress::PrefixList(id) => id,
        }
    }
}

/// A single allow rule: `peer` may reach `target` on TCP `port`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngressRule {
    pub target: SecurityGroupRole,
    pub peer: Peer,
    pub port: u16,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Ports {
    /// Listener port on both load balancers.
    pub listener: u16,
    /// OpenWebUI container port.
    pub app: u16,
    /// vLLM API port on the GPU instances.
    pub inference: u16,
    pub nfs: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            listener: 80,
            app: 8080,
            inference: 8000,
            nfs: 2049,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub cidr: String,
    pub max_azs: u8,
    pub nat_gateways: u8,
    pub subnet_mask: u8,
    /// Explicit zone names; when empty zones are picked with `Fn::GetAZs`.
    pub availability_zones: Vec<String>,
    pub ports: Ports,
    pub edge_ingress: EdgeIngress,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            cidr: "10.0.0.0/16".to_string(),
            max_azs: 2,
            nat_gateways: 1,
            subnet_mask: 24,
            availability_zones: Vec::new(),
            ports: Ports::default(),
            edge_ingress: EdgeIngress::default(),
        }
    }
}

impl NetworkConfig {
    pub fn zone_count(&self) -> usize {
        if self.availability_zones.is_empty() {
            self.max_azs as usize
        } else {
            self.availability_zones.len().min(self.max_azs as usize)
        }
    }

    pub fn nat_count(&self) -> usize {
        (self.nat_gateways as usize).clamp(1, self.zone_count().max(1))
    }

    /// Subnet CIDRs for a tier. Public subnets take the first `zone_count`
    /// blocks of the VPC range, private subnets the next ones.
    pub fn subnet_cidrs(&self, tier: SubnetTier) -> Result<Vec<Ipv4Cidr>, ConfigError> {
        let vpc: Ipv4Cidr = self.cidr.parse()?;
        let zones = self.zone_count();
        let offset = match tier {
            SubnetTier::Public => 0,
            SubnetTier::Private => zones,
        };
        (0..zones)
            .map(|i| vpc.subnet(self.subnet_mask, (offset + i) as u32))
            .collect()
    }

    /// The allow-list between the tiers. Nothing outside this list is opened.
    pub fn ingress_rules(&self) -> Vec<IngressRule> {
        let p = &self.ports;
        vec![
            IngressRule {
                target: SecurityGroupRole::EdgeAlb,
                peer: self.edge_ingress.peer(),
                port: p.listener,
                description: "Edge network to public ALB".to_string(),
            },
            IngressRule {
                target: SecurityGroupRole::WebUi,
                peer: Peer::Group(SecurityGroupRole::EdgeAlb),
                port: p.app,
                description: "Public ALB to OpenWebUI".to_string(),
            },
            IngressRule {
                target: SecurityGroupRole::InferenceAlb,
                peer: Peer::Group(SecurityGroupRole::WebUi),
                port: p.listener,
                description: "OpenWebUI to internal vLLM ALB".to_string(),
            },
            IngressRule {
                target: SecurityGroupRole::Inference,
                peer: Peer::Group(SecurityGroupRole::InferenceAlb),
                port: p.inference,
                description: "Internal ALB to vLLM".to_string(),
            },
            IngressRule {
                target: SecurityGroupRole::Efs,
                peer: Peer::Group(SecurityGroupRole::WebUi),
                port: p.nfs,
                description: "NFS from OpenWebUI".to_string(),
            },
            IngressRule {
                target: SecurityGroupRole::Efs,
                peer: Peer::Cidr(self.cidr.clone()),
                port: p.nfs,
                description: "NFS from inside the VPC".to_string(),
            },
        ]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_azs == 0 {
            return Err(ConfigError::Invalid("network.max_azs must be at least 1".into()));
        }
        // CIDR and mask problems surface here instead of halfway through synth.
        self.subnet_cidrs(SubnetTier::Private)?;
        Ok(())
    }
}

/// An IPv4 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4Cidr {
    fn mask(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix as u32)
        }
    }

    pub fn contains(&self, other: &Ipv4Cidr) -> bool {
        let mask = Self::mask(self.prefix);
        other.prefix >= self.prefix && (u32::from(other.addr) & mask) == u32::from(self.addr)
    }

    /// RFC 1918 and carrier-grade NAT space.
    pub fn is_private(&self) -> bool {
        ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16", "100.64.0.0/10"]
            .iter()
            .filter_map(|c| c.parse::<Ipv4Cidr>().ok())
            .any(|range| range.contains(self))
    }

    /// The `index`-th block of size `/new_prefix` inside this network.
    pub fn subnet(&self, new_prefix: u8, index: u32) -> Result<Ipv4Cidr, ConfigError> {
        if new_prefix < self.prefix || new_prefix > 28 {
            return Err(ConfigError::Invalid(format!(
                "subnet mask /{new_prefix} does not fit in {self}"
            )));
        }
        let bits = (new_prefix - self.prefix) as u32;
        if bits < 32 && index >= (1u32 << bits) {
            return Err(ConfigError::Invalid(format!(
                "{self} has no room for subnet #{index} of size /{new_prefix}"
            )));
        }
        let size = 1u32 << (32 - new_prefix as u32);
        let base = u32::from(self.addr) + index * size;
        Ok(Ipv4Cidr {
            addr: Ipv4Addr::from(base),
            prefix: new_prefix,
        })
    }
}

impl FromStr for Ipv4Cidr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s.split_once('/').ok_or_else(|| ConfigError::Cidr(s.to_string()))?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| ConfigError::Cidr(s.to_string()))?;
        let prefix: u8 = prefix.parse().map_err(|_| ConfigError::Cidr(s.to_string()))?;
        if prefix > 32 || u32::from(addr) & !Self::mask(prefix) != 0 {
            return Err(ConfigError::Cidr(s.to_string()));
        }
        Ok(Self { addr, prefix })
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subnet_carving() {
        let cfg = NetworkConfig::default();
        let public: Vec<String> = cfg
            .subnet_cidrs(SubnetTier::Public)
            .unwrap()
            .iter()
            .map(|c| c.to_string())
            .collect();
        let private: Vec<String> = cfg
            .subnet_cidrs(SubnetTier::Private)
            .unwrap()
            .iter()
            .map(|c| c.to_string())
            .collect();
        assert_eq!(public, vec!["10.0.0.0/24", "10.0.1.0/24"]);
        assert_eq!(private, vec!["10.0.2.0/24", "10.0.3.0/24"]);
    }

    #[test]
    fn test_subnet_overflow() {
        let cfg = NetworkConfig {
            cidr: "10.0.0.0/24".to_string(),
            subnet_mask: 26,
            max_azs: 3,
            ..Default::default()
        };
        assert!(cfg.subnet_cidrs(SubnetTier::Private).is_err());
    }

    #[test]
    fn test_cidr_parse() {
        assert!("10.0.0.0/16".parse::<Ipv4Cidr>().is_ok());
        assert!("10.0.0.1/16".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Ipv4Cidr>().is_err());
        assert!("banana".parse::<Ipv4Cidr>().is_err());
    }

    #[test]
    fn test_public_internet_peers() {
        assert!(Peer::AnyIpv4.is_public_internet());
        assert!(Peer::AnyIpv6.is_public_internet());
        assert!(Peer::Cidr("8.8.8.0/24".into()).is_public_internet());
        assert!(Peer::PrefixList("pl-3b927c52".into()).is_public_internet());
        assert!(!Peer::Cidr("10.0.0.0/16".into()).is_public_internet());
        assert!(!Peer::Cidr("172.20.0.0/16".into()).is_public_internet());
        assert!(!Peer::Cidr("fd00::/8".into()).is_public_internet());
        assert!(!Peer::Group(SecurityGroupRole::WebUi).is_public_internet());
    }

    #[test]
    fn test_only_edge_alb_faces_internet() {
        let cfg = NetworkConfig::default();
        for rule in cfg.ingress_rules() {
            if rule.peer.is_public_internet() {
                assert_eq!(rule.target, SecurityGroupRole::EdgeAlb);
            }
        }
    }

    #[test]
    fn test_edge_ingress_parse() {
        let v: EdgeIngress = serde_json::from_str("\"pl-82a045eb\"").unwrap();
        assert_eq!(v, EdgeIngress::PrefixList("pl-82a045eb".into()));
        assert!(serde_json::from_str::<EdgeIngress>("\"anywhere\"").is_err());
    }
}

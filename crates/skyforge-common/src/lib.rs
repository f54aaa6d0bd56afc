pub mod config;
pub mod error;
pub mod load_balancer;
pub mod network;
pub mod record;
pub mod secret;
pub mod service;
pub mod template;
pub mod util;

pub use config::{AppConfig, Environment};
pub use error::{ConfigError, SynthError};
pub use load_balancer::{
    HeaderCondition, HeaderGuard, HealthCheck, Listener, ListenerAction, ListenerRule,
    LoadBalancerConfig, Stickiness,
};
pub use network::{EdgeIngress, IngressRule, Ipv4Cidr, NetworkConfig, Peer, Ports, SecurityGroupRole, SubnetTier};
pub use record::{BootstrapRecord, RecordStatus, StackRecord};
pub use secret::SecretRef;
pub use service::{
    Architecture, Capacity, InferenceConfig, RootVolume, ScalingMetric, ScalingPolicy,
    ServiceConfig, WebUiConfig,
};
pub use template::{Output, Resource, StackTemplate};

pub mod telemetry;

pub mod deployer;
pub mod diff;
pub mod error;
pub mod provider;
pub mod scaling;

pub use deployer::{AppliedStack, DeployReport, Deployer, DestroyReport, StackState, StackStatus};
pub use diff::{diff, ChangeAction, OutputChange, ResourceChange, StackDiff};
pub use error::{DeployError, ProviderError, ResourceFailure};
pub use provider::{CloudFormationProvider, CloudProvider, SimulatedProvider, StackOutcome};
pub use scaling::{next_capacity, ScalingSimulator};

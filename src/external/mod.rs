//! External tool abstractions
//!
//! Trait-based wrappers around `terraform` and `kubectl`, with simulated
//! implementations for demo mode. Pure decisions (what to run, how to read
//! the output) stay separate from the effect of running a process.

pub mod command;
pub mod kubectl;
pub mod simulated;
pub mod terraform;

pub use command::{CommandError, CommandExecutor, CommandOutput, Invocation, ProcessCommandExecutor};
pub use kubectl::{ClusterHealth, ClusterInspector, KubectlCli, NodeStatus, PodStatus};
pub use simulated::{SimulatedInspector, SimulatedProvisioner};
pub use terraform::{InfraProvisioner, InfraSpec, ProvisionOutcome, TerraformCli};

#[cfg(any(test, feature = "testing"))]
pub use kubectl::MockClusterInspector;
#[cfg(any(test, feature = "testing"))]
pub use terraform::MockInfraProvisioner;

//! Outbound clients: the job-controller adapter and the node-agent client.
//!
//! Both are trait objects so the control loops can be driven against
//! in-memory fakes in tests. Every RPC is bounded by the client timeout.

pub mod controller;
pub mod node_agent;

pub use controller::{ControllerAdapter, ControllerError, ControllerNodeState, JenkinsController};
pub use node_agent::{AgentError, HttpNodeAgent, NodeAgentApi, VmInfo, VmLaunchSpec};

//! Cut execution backends.
//!
//! A cutter claims actions by prefix and executes them against one backend:
//! the container runtime (`docker_*`), the hypervisor CLI (`vbox_*`), or a
//! remote shell (`ssh_*`). The registry holds an ordered list of cutters and
//! resolution is first-claimant-wins.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod docker;
mod network;
mod vbox;

pub use docker::DockerCutter;
pub use network::NetworkCutter;
pub use vbox::VBoxCutter;

/// Flat string parameters handed to a cutter: the strategy's action, command
/// and snapshot name plus the node's transport fields.
pub type CutParams = HashMap<String, String>;

/// Everything that can go wrong between admitting an alert and finishing a
/// cut. The variant is the error kind; the rendered message is what lands in
/// the journal record.
#[derive(Debug, Clone, Error)]
pub enum CutError {
    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("outside allowed time windows")]
    OutsideTimeWindows,

    #[error("rate limit exceeded: {max_cuts} cuts per {window_minutes} minutes")]
    RateLimited { max_cuts: u32, window_minutes: u32 },

    #[error("no cutter for action: {0}")]
    NoCutter(String),

    /// The caller asked for something the backend cannot do with the given
    /// parameters (missing host, missing snapshot name, unsupported action).
    #[error("{0}")]
    Usage(String),

    /// The backend itself failed.
    #[error("{0}")]
    Backend(String),

    #[error("cut timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

/// Outcome of one cut attempt. Transient: the engine turns this into a
/// persistent [`crate::history::CutRecord`].
#[derive(Debug, Clone)]
pub struct CutResult {
    pub target: String,
    pub action: String,
    pub success: bool,
    pub error: Option<CutError>,
    pub latency_ms: i64,
}

impl CutResult {
    pub fn success(target: &str, action: &str, latency_ms: i64) -> Self {
        Self {
            target: target.to_string(),
            action: action.to_string(),
            success: true,
            error: None,
            latency_ms,
        }
    }

    pub fn failure(target: &str, action: &str, error: CutError, latency_ms: i64) -> Self {
        Self {
            target: target.to_string(),
            action: action.to_string(),
            success: false,
            error: Some(error),
            latency_ms,
        }
    }

    /// Journal-ready error text; empty on success.
    pub fn error_text(&self) -> String {
        self.error.as_ref().map(ToString::to_string).unwrap_or_default()
    }
}

/// A single execution backend.
#[async_trait]
pub trait Cutter: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this cutter claims the given action identifier.
    fn can_handle(&self, action: &str) -> bool;

    /// Execute the action against `target`. The engine bounds this call with
    /// its execution deadline; implementations must tolerate being dropped
    /// mid-flight.
    async fn execute(&self, target: &str, params: &CutParams) -> Result<(), CutError>;
}

/// Ordered collection of cutters; the first one claiming an action wins.
pub struct Registry {
    cutters: Vec<Box<dyn Cutter>>,
}

impl Registry {
    /// Registry with the three built-in backends.
    pub fn new() -> Self {
        Self {
            cutters: vec![
                Box::new(DockerCutter::new()),
                Box::new(NetworkCutter::new()),
                Box::new(VBoxCutter::new()),
            ],
        }
    }

    /// Registry with no backends, for callers that register their own.
    pub fn empty() -> Self {
        Self {
            cutters: Vec::new(),
        }
    }

    pub fn register(&mut self, cutter: Box<dyn Cutter>) {
        self.cutters.push(cutter);
    }

    pub fn find(&self, action: &str) -> Option<&dyn Cutter> {
        self.cutters
            .iter()
            .find(|c| c.can_handle(action))
            .map(|c| c.as_ref())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PrefixCutter {
        name: &'static str,
        prefix: &'static str,
    }

    #[async_trait]
    impl Cutter for PrefixCutter {
        fn name(&self) -> &str {
            self.name
        }

        fn can_handle(&self, action: &str) -> bool {
            action.starts_with(self.prefix)
        }

        async fn execute(&self, _target: &str, _params: &CutParams) -> Result<(), CutError> {
            Ok(())
        }
    }

    #[test]
    fn built_in_registry_claims_all_prefixes() {
        let registry = Registry::new();
        assert_eq!(registry.find("docker_stop_all").unwrap().name(), "docker");
        assert_eq!(registry.find("ssh_isolate_network").unwrap().name(), "network");
        assert_eq!(registry.find("vbox_poweroff").unwrap().name(), "vbox");
        assert!(registry.find("fpga_reflash").is_none());
    }

    #[test]
    fn first_claimant_wins() {
        let mut registry = Registry::empty();
        registry.register(Box::new(PrefixCutter {
            name: "first",
            prefix: "x_",
        }));
        registry.register(Box::new(PrefixCutter {
            name: "second",
            prefix: "x_",
        }));
        assert_eq!(registry.find("x_anything").unwrap().name(), "first");
    }

    #[test]
    fn error_text_matches_display() {
        let result = CutResult::failure(
            "athena",
            "docker_stop_all",
            CutError::RateLimited {
                max_cuts: 2,
                window_minutes: 60,
            },
            0,
        );
        assert_eq!(result.error_text(), "rate limit exceeded: 2 cuts per 60 minutes");
        assert_eq!(CutResult::success("athena", "none", 0).error_text(), "");
    }
}

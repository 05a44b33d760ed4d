//! # atropos-core
//!
//! Remediation core for Atropos -- an automated entropy-remediation daemon.
//!
//! This crate holds everything below the HTTP surface: the per-node policy
//! model and its strategy selectors, the cutter registry with the three
//! execution backends (container runtime, hypervisor, remote shell), the
//! compressed cut journal, the serialised execution engine, the trend
//! analyser, the audit correlator, and the notification manager.

pub mod correlation;
pub mod cutter;
pub mod engine;
pub mod history;
pub mod notifications;
pub mod policy;
pub mod trends;

pub use cutter::{CutError, CutResult};
pub use engine::Executor;
pub use history::{CutRecord, HistoryManager};
pub use policy::RemediationPolicy;

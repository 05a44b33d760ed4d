//! Serialised cut execution.
//!
//! The executor is the choke point between inbound alerts and the backends:
//! one global async mutex serialises every cut from admission through
//! journalling, so journal order reflects admission order and a node never
//! sees two concurrent cuts. Admission gates (node lookup, time windows, rate
//! limit) run inside the same critical section.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, Timelike, Utc};
use tokio::sync::{oneshot, Mutex};
use tracing::{error, info, warn};

use crate::cutter::{CutError, CutParams, CutResult, Registry};
use crate::history::{CutRecord, HistoryManager, StrategyInfo};
use crate::notifications::{CutEvent, NotificationManager};
use crate::policy::{NodePolicy, RemediationPolicy, Strategy};

mod rate_limit;

pub use rate_limit::RateLimiter;

/// Deadline applied to every backend call.
const EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Executor {
    policy: Arc<RemediationPolicy>,
    registry: Registry,
    history: Arc<HistoryManager>,
    notifications: Option<Arc<NotificationManager>>,
    limiter: RateLimiter,
    /// Serialises all cuts; held from admission through journalling.
    gate: Mutex<()>,
}

impl Executor {
    /// Executor with the built-in backend registry.
    pub fn new(policy: Arc<RemediationPolicy>, history: Arc<HistoryManager>) -> Self {
        Self::with_registry(policy, history, Registry::new())
    }

    /// Executor with a caller-supplied registry.
    pub fn with_registry(
        policy: Arc<RemediationPolicy>,
        history: Arc<HistoryManager>,
        registry: Registry,
    ) -> Self {
        Self {
            policy,
            registry,
            history,
            notifications: None,
            limiter: RateLimiter::new(),
            gate: Mutex::new(()),
        }
    }

    /// Attach a notification manager; one event is dispatched per journal
    /// write, best-effort.
    pub fn with_notifications(mut self, manager: Arc<NotificationManager>) -> Self {
        self.notifications = Some(manager);
        self
    }

    pub fn policy(&self) -> &Arc<RemediationPolicy> {
        &self.policy
    }

    pub fn history(&self) -> &Arc<HistoryManager> {
        &self.history
    }

    /// Admit and execute one cut. Runs serially across all nodes; every
    /// admitted alert produces exactly one journal record.
    pub async fn execute_cut(&self, node: &str, entropy: f64) -> CutResult {
        let _admission = self.gate.lock().await;

        let Some(node_policy) = self.policy.get_node(node) else {
            let result =
                CutResult::failure(node, "", CutError::UnknownNode(node.to_string()), 0);
            self.log_cut(&result, entropy, None);
            return result;
        };

        if !node_policy.within_time_windows(local_minute_of_day()) {
            let result =
                CutResult::failure(node, "", CutError::OutsideTimeWindows, 0);
            self.log_cut(&result, entropy, None);
            return result;
        }

        let Some(strategy) = node_policy.select_strategy(entropy) else {
            // Entropy below every threshold: record the non-action and move on.
            let result = CutResult::success(node, "none", 0);
            self.log_cut(&result, entropy, None);
            return result;
        };

        if let Some(limit) = &node_policy.rate_limit {
            if !self.limiter.admit(node, limit, Utc::now()) {
                let result = CutResult::failure(
                    node,
                    &strategy.action,
                    CutError::RateLimited {
                        max_cuts: limit.max_cuts,
                        window_minutes: limit.window_minutes,
                    },
                    0,
                );
                self.log_cut(&result, entropy, Some(strategy));
                return result;
            }
        }

        info!(
            node = %node,
            action = %strategy.action,
            entropy = entropy,
            "cut initiated"
        );

        let mut result = self.execute_strategy(node, node_policy, strategy).await;
        let mut executed = strategy;
        let mut fallback_applied = false;

        // Fallback is exclusive: when it runs, its result is final and
        // escalation is skipped even for critical strategies.
        if !result.success && !strategy.on_failure.is_empty() {
            if let Some(fallback) = node_policy.select_by_action(&strategy.on_failure) {
                warn!(
                    node = %node,
                    from_action = %strategy.action,
                    to_action = %fallback.action,
                    reason = %result.error_text(),
                    "fallback"
                );
                result = self.execute_strategy(node, node_policy, fallback).await;
                executed = fallback;
                fallback_applied = true;
            } else {
                warn!(
                    node = %node,
                    action = %strategy.action,
                    on_failure = %strategy.on_failure,
                    "on_failure names no strategy of this node"
                );
            }
        }

        if !result.success && !fallback_applied && strategy.critical {
            if let Some(escalated) = node_policy.escalation_strategy(strategy.threshold) {
                warn!(
                    node = %node,
                    from_action = %strategy.action,
                    to_action = %escalated.action,
                    reason = %result.error_text(),
                    "escalation"
                );
                result = self.execute_strategy(node, node_policy, escalated).await;
                executed = escalated;
            }
        }

        self.log_cut(&result, entropy, Some(executed));
        result
    }

    /// Run one strategy against its backend under the execution deadline.
    async fn execute_strategy(
        &self,
        node: &str,
        node_policy: &NodePolicy,
        strategy: &Strategy,
    ) -> CutResult {
        let start = Instant::now();

        let Some(cutter) = self.registry.find(&strategy.action) else {
            let err = CutError::NoCutter(strategy.action.clone());
            error!(node = %node, action = %strategy.action, error = %err, "cut failed");
            return CutResult::failure(node, &strategy.action, err, 0);
        };

        let mut params = CutParams::new();
        params.insert("action".to_string(), strategy.action.clone());
        params.insert("command".to_string(), strategy.command.clone());
        params.insert("snapshot_name".to_string(), strategy.snapshot_name.clone());
        params.insert("host".to_string(), node_policy.host.clone());
        params.insert("user".to_string(), node_policy.user.clone());
        if node_policy.port > 0 {
            params.insert("port".to_string(), node_policy.port.to_string());
        }
        if !node_policy.known_hosts.is_empty() {
            params.insert("known_hosts".to_string(), node_policy.known_hosts.clone());
        }

        let outcome = match tokio::time::timeout(
            EXECUTION_TIMEOUT,
            cutter.execute(node, &params),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(CutError::Timeout(EXECUTION_TIMEOUT)),
        };
        let latency_ms = start.elapsed().as_millis() as i64;

        match outcome {
            Ok(()) => {
                info!(
                    node = %node,
                    action = %strategy.action,
                    latency_ms = latency_ms,
                    status = "success",
                    "cut executed"
                );
                CutResult::success(node, &strategy.action, latency_ms)
            }
            Err(err) => {
                error!(
                    node = %node,
                    action = %strategy.action,
                    status = "failure",
                    error = %err,
                    "cut failed"
                );
                CutResult::failure(node, &strategy.action, err, latency_ms)
            }
        }
    }

    /// Journal the outcome and dispatch one notification event. A journal
    /// write failure is logged but never fails the cut back to the caller.
    fn log_cut(&self, result: &CutResult, entropy: f64, strategy: Option<&Strategy>) {
        let mut record = CutRecord {
            id: String::new(),
            node: result.target.clone(),
            entropy,
            action: result.action.clone(),
            success: result.success,
            error: result.error_text(),
            latency_ms: result.latency_ms,
            timestamp: Utc::now(),
            policy_version: self.policy.meta.version.clone(),
            strategy: strategy.map(StrategyInfo::from).unwrap_or_default(),
        };

        if let Err(e) = self.history.save_cut(&mut record) {
            error!(node = %record.node, error = %e, "journal write failed");
        }

        if let Some(manager) = &self.notifications {
            let manager = Arc::clone(manager);
            let event = CutEvent::from_record(&record);
            tokio::spawn(async move {
                if let Err(e) = manager.notify_cut(event).await {
                    warn!(error = %e, "cut notification failed");
                }
            });
        }
    }

    /// Run a cut in the background and deliver the single result on a
    /// channel of capacity one, so callers can race it against their own
    /// ceiling. The cut keeps running if the receiver gives up.
    pub fn execute_cut_async(
        self: &Arc<Self>,
        node: String,
        entropy: f64,
    ) -> oneshot::Receiver<CutResult> {
        let (tx, rx) = oneshot::channel();
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let result = engine.execute_cut(&node, entropy).await;
            let _ = tx.send(result);
        });
        rx
    }
}

/// Minutes since local midnight, for the time-window gate.
fn local_minute_of_day() -> u32 {
    let now = Local::now();
    now.hour() * 60 + now.minute()
}

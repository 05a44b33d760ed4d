//! Per-node remediation policy: parsing, validation, and strategy selection.
//!
//! A policy file is a YAML document mapping node names to an ordered list of
//! cut strategies. After loading, each node's strategies are kept sorted by
//! descending threshold so [`NodePolicy::select_strategy`] always returns the
//! most aggressive rule that applies to a given entropy reading.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable that overrides the policy file's HMAC secret.
pub const HMAC_SECRET_ENV: &str = "ATROPOS_HMAC_SECRET";

/// Listen address used when the policy file leaves `server.listen_addr` empty.
const DEFAULT_LISTEN_ADDR: &str = ":8443";

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("read policy {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("parse policy: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("policy must define at least one node")]
    NoNodes,

    #[error("node {node:?}: needs at least one strategy")]
    NoStrategies { node: String },

    #[error("node {node:?} strategy {index}: {reason}")]
    InvalidStrategy {
        node: String,
        index: usize,
        reason: String,
    },

    #[error("node {node:?} time window {index}: {reason}")]
    InvalidWindow {
        node: String,
        index: usize,
        reason: String,
    },
}

/// A single remediation rule: fire `action` once entropy reaches `threshold`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub threshold: f64,
    pub action: String,
    /// Remote command, for shell-backed actions.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    /// A critical strategy escalates to the next higher threshold on failure.
    #[serde(default)]
    pub critical: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub snapshot_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub escalate_to: String,
    /// Action of a sibling strategy to run when this one fails.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub on_failure: String,
}

/// An inclusive local-time window during which cuts are permitted.
///
/// Windows may wrap past midnight: `22:00`-`04:00` matches 23:00 and 03:00.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: String,
    pub end: String,
}

impl TimeWindow {
    /// Whether `minute_of_day` (0..1440) falls inside this window, inclusive
    /// at both ends. Returns `false` for unparseable bounds; load-time
    /// validation rejects those before they reach here.
    pub fn contains(&self, minute_of_day: u32) -> bool {
        let (Some(start), Some(end)) = (parse_hhmm(&self.start), parse_hhmm(&self.end)) else {
            return false;
        };
        if start <= end {
            start <= minute_of_day && minute_of_day <= end
        } else {
            // Wraps midnight.
            minute_of_day >= start || minute_of_day <= end
        }
    }
}

/// Parse a `"HH:MM"` string into minutes since midnight.
pub(crate) fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

/// Rolling admission limit: at most `max_cuts` cuts per `window_minutes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_cuts: u32,
    pub window_minutes: u32,
}

/// Policy for a single managed node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePolicy {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub strategies: Vec<Strategy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub time_windows: Vec<TimeWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
    /// Known-hosts file for shell-backed actions; defaults to
    /// `~/.ssh/known_hosts` when empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub known_hosts: String,
    /// Back-reference to the map key, filled in by the index build.
    #[serde(skip)]
    pub name: String,
}

impl NodePolicy {
    /// First strategy whose threshold is at or below `entropy`.
    ///
    /// Strategies are sorted by descending threshold, so the first match is
    /// the most aggressive applicable one. `None` means entropy is below
    /// every threshold and no action is warranted.
    pub fn select_strategy(&self, entropy: f64) -> Option<&Strategy> {
        self.strategies.iter().find(|s| entropy >= s.threshold)
    }

    /// First strategy with the given action, used to resolve `on_failure`
    /// references within this node.
    pub fn select_by_action(&self, action: &str) -> Option<&Strategy> {
        self.strategies.iter().find(|s| s.action == action)
    }

    /// First strategy strictly more aggressive than `current_threshold`.
    pub fn escalation_strategy(&self, current_threshold: f64) -> Option<&Strategy> {
        self.strategies
            .iter()
            .find(|s| s.threshold > current_threshold)
    }

    /// Whether `minute_of_day` falls inside any declared window. A node with
    /// no windows is always admissible.
    pub fn within_time_windows(&self, minute_of_day: u32) -> bool {
        self.time_windows.is_empty()
            || self.time_windows.iter().any(|w| w.contains(minute_of_day))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub last_reviewed: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub listen_addr: String,
    #[serde(default)]
    pub hmac_secret: String,
}

/// The full remediation policy: metadata, server config, and one
/// [`NodePolicy`] per managed node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationPolicy {
    #[serde(default)]
    pub meta: Meta,
    #[serde(default)]
    pub server: ServerConfig,
    pub nodes: BTreeMap<String, NodePolicy>,
}

impl RemediationPolicy {
    /// Load a policy from a YAML file, validate it, and build the node index.
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let data = fs::read_to_string(path).map_err(|source| PolicyError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&data)
    }

    /// Parse and validate a policy from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self, PolicyError> {
        let mut policy: RemediationPolicy = serde_yaml::from_str(data)?;
        policy.validate()?;
        policy.build_index();
        Ok(policy)
    }

    fn validate(&self) -> Result<(), PolicyError> {
        if self.nodes.is_empty() {
            return Err(PolicyError::NoNodes);
        }

        for (name, node) in &self.nodes {
            if node.strategies.is_empty() {
                return Err(PolicyError::NoStrategies { node: name.clone() });
            }
            for (j, strat) in node.strategies.iter().enumerate() {
                if !(0.0..=1.0).contains(&strat.threshold) {
                    return Err(PolicyError::InvalidStrategy {
                        node: name.clone(),
                        index: j,
                        reason: "threshold must be 0-1".to_string(),
                    });
                }
                if strat.action.is_empty() {
                    return Err(PolicyError::InvalidStrategy {
                        node: name.clone(),
                        index: j,
                        reason: "action required".to_string(),
                    });
                }
            }
            for (j, window) in node.time_windows.iter().enumerate() {
                for bound in [&window.start, &window.end] {
                    if parse_hhmm(bound).is_none() {
                        return Err(PolicyError::InvalidWindow {
                            node: name.clone(),
                            index: j,
                            reason: format!("{bound:?} is not a valid HH:MM time"),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Record each node's name into itself and sort strategies by descending
    /// threshold. The sort is stable, so equal thresholds keep declaration
    /// order.
    fn build_index(&mut self) {
        for (name, node) in &mut self.nodes {
            node.name = name.clone();
            node.strategies.sort_by(|a, b| {
                b.threshold
                    .partial_cmp(&a.threshold)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
    }

    pub fn get_node(&self, name: &str) -> Option<&NodePolicy> {
        self.nodes.get(name)
    }

    /// Configured listen address, defaulting to `:8443`.
    pub fn listen_addr(&self) -> String {
        if self.server.listen_addr.is_empty() {
            DEFAULT_LISTEN_ADDR.to_string()
        } else {
            self.server.listen_addr.clone()
        }
    }

    /// HMAC secret: the `ATROPOS_HMAC_SECRET` environment variable when set,
    /// otherwise the policy file value. Empty disables verification.
    pub fn hmac_secret(&self) -> String {
        match std::env::var(HMAC_SECRET_ENV) {
            Ok(secret) if !secret.is_empty() => secret,
            _ => self.server.hmac_secret.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn policy_yaml() -> &'static str {
        r#"
meta:
  version: "1.2.0"
  last_reviewed: "2026-07-01"
server:
  listen_addr: "127.0.0.1:9443"
  hmac_secret: "file-secret"
nodes:
  athena:
    host: 10.0.0.21
    port: 2222
    user: ops
    strategies:
      - threshold: 0.70
        action: docker_pause_all
      - threshold: 0.85
        action: docker_stop_all
      - threshold: 0.95
        action: vbox_poweroff
        critical: true
    rate_limit:
      max_cuts: 2
      window_minutes: 60
  hermes:
    strategies:
      - threshold: 0.80
        action: ssh_isolate_network
        command: "systemctl stop wireguard@wg0"
    time_windows:
      - start: "09:00"
        end: "17:00"
"#
    }

    fn write_temp_policy(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn load_valid_policy() {
        let f = write_temp_policy(policy_yaml());
        let policy = RemediationPolicy::load(f.path()).unwrap();
        assert_eq!(policy.meta.version, "1.2.0");
        assert_eq!(policy.nodes.len(), 2);

        let athena = policy.get_node("athena").unwrap();
        assert_eq!(athena.name, "athena");
        assert_eq!(athena.port, 2222);
        assert_eq!(athena.rate_limit.as_ref().unwrap().max_cuts, 2);
    }

    #[test]
    fn strategies_sorted_descending() {
        let f = write_temp_policy(policy_yaml());
        let policy = RemediationPolicy::load(f.path()).unwrap();
        let athena = policy.get_node("athena").unwrap();

        let thresholds: Vec<f64> = athena.strategies.iter().map(|s| s.threshold).collect();
        assert_eq!(thresholds, vec![0.95, 0.85, 0.70]);
    }

    #[test]
    fn equal_thresholds_keep_declaration_order() {
        let policy = RemediationPolicy::from_yaml(
            r#"
nodes:
  tied:
    strategies:
      - threshold: 0.8
        action: first
      - threshold: 0.8
        action: second
"#,
        )
        .unwrap();
        let node = policy.get_node("tied").unwrap();
        assert_eq!(node.strategies[0].action, "first");
        assert_eq!(node.strategies[1].action, "second");
    }

    #[test]
    fn select_strategy_picks_most_aggressive() {
        let f = write_temp_policy(policy_yaml());
        let policy = RemediationPolicy::load(f.path()).unwrap();
        let athena = policy.get_node("athena").unwrap();

        assert_eq!(
            athena.select_strategy(0.9).unwrap().action,
            "docker_stop_all"
        );
        assert_eq!(athena.select_strategy(0.99).unwrap().action, "vbox_poweroff");
        assert_eq!(
            athena.select_strategy(0.70).unwrap().action,
            "docker_pause_all"
        );
    }

    #[test]
    fn select_strategy_below_all_thresholds() {
        let f = write_temp_policy(policy_yaml());
        let policy = RemediationPolicy::load(f.path()).unwrap();
        let athena = policy.get_node("athena").unwrap();
        assert!(athena.select_strategy(0.5).is_none());
    }

    #[test]
    fn select_by_action_finds_sibling() {
        let f = write_temp_policy(policy_yaml());
        let policy = RemediationPolicy::load(f.path()).unwrap();
        let athena = policy.get_node("athena").unwrap();

        let s = athena.select_by_action("docker_stop_all").unwrap();
        assert_eq!(s.threshold, 0.85);
        assert!(athena.select_by_action("missing").is_none());
    }

    #[test]
    fn escalation_picks_next_higher_threshold() {
        let f = write_temp_policy(policy_yaml());
        let policy = RemediationPolicy::load(f.path()).unwrap();
        let athena = policy.get_node("athena").unwrap();

        // Descending order means the first strictly greater threshold is the
        // largest one; 0.70 escalates to 0.95, the most aggressive rule.
        let esc = athena.escalation_strategy(0.70).unwrap();
        assert_eq!(esc.action, "vbox_poweroff");
        assert!(athena.escalation_strategy(0.95).is_none());
    }

    #[test]
    fn validation_rejects_empty_nodes() {
        let err = RemediationPolicy::from_yaml("nodes: {}").unwrap_err();
        assert!(matches!(err, PolicyError::NoNodes));
    }

    #[test]
    fn validation_rejects_missing_strategies() {
        let err = RemediationPolicy::from_yaml(
            r#"
nodes:
  bare:
    strategies: []
"#,
        )
        .unwrap_err();
        assert!(matches!(err, PolicyError::NoStrategies { ref node } if node == "bare"));
    }

    #[test]
    fn validation_rejects_out_of_range_threshold() {
        let err = RemediationPolicy::from_yaml(
            r#"
nodes:
  bad:
    strategies:
      - threshold: 1.5
        action: docker_stop_all
"#,
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("bad"), "error should name the node: {msg}");
        assert!(msg.contains("strategy 0"), "error should name the index: {msg}");
    }

    #[test]
    fn validation_rejects_empty_action() {
        let err = RemediationPolicy::from_yaml(
            r#"
nodes:
  bad:
    strategies:
      - threshold: 0.5
        action: ""
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("action required"));
    }

    #[test]
    fn validation_rejects_malformed_time_window() {
        let err = RemediationPolicy::from_yaml(
            r#"
nodes:
  bad:
    strategies:
      - threshold: 0.5
        action: docker_stop_all
    time_windows:
      - start: "25:00"
        end: "17:00"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, PolicyError::InvalidWindow { index: 0, .. }));
    }

    #[test]
    fn time_window_inclusive_bounds() {
        let w = TimeWindow {
            start: "09:00".to_string(),
            end: "17:00".to_string(),
        };
        assert!(w.contains(9 * 60));
        assert!(w.contains(17 * 60));
        assert!(w.contains(12 * 60 + 30));
        assert!(!w.contains(8 * 60 + 59));
        assert!(!w.contains(17 * 60 + 1));
    }

    #[test]
    fn time_window_wraps_midnight() {
        let w = TimeWindow {
            start: "22:00".to_string(),
            end: "04:00".to_string(),
        };
        assert!(w.contains(23 * 60));
        assert!(w.contains(3 * 60));
        assert!(w.contains(22 * 60));
        assert!(w.contains(4 * 60));
        assert!(!w.contains(12 * 60));
    }

    #[test]
    fn node_without_windows_always_admissible() {
        let f = write_temp_policy(policy_yaml());
        let policy = RemediationPolicy::load(f.path()).unwrap();
        let athena = policy.get_node("athena").unwrap();
        assert!(athena.within_time_windows(0));
        assert!(athena.within_time_windows(1439));
    }

    #[test]
    fn listen_addr_defaults() {
        let policy = RemediationPolicy::from_yaml(
            r#"
nodes:
  n:
    strategies:
      - threshold: 0.5
        action: docker_stop_all
"#,
        )
        .unwrap();
        assert_eq!(policy.listen_addr(), ":8443");

        let f = write_temp_policy(policy_yaml());
        let configured = RemediationPolicy::load(f.path()).unwrap();
        assert_eq!(configured.listen_addr(), "127.0.0.1:9443");
    }

    #[test]
    fn hmac_secret_env_overrides_file() {
        let f = write_temp_policy(policy_yaml());
        let policy = RemediationPolicy::load(f.path()).unwrap();

        std::env::remove_var(HMAC_SECRET_ENV);
        assert_eq!(policy.hmac_secret(), "file-secret");

        std::env::set_var(HMAC_SECRET_ENV, "env-secret");
        assert_eq!(policy.hmac_secret(), "env-secret");
        std::env::remove_var(HMAC_SECRET_ENV);
    }

    #[test]
    fn parse_hhmm_bounds() {
        assert_eq!(parse_hhmm("00:00"), Some(0));
        assert_eq!(parse_hhmm("23:59"), Some(1439));
        assert_eq!(parse_hhmm("24:00"), None);
        assert_eq!(parse_hhmm("12:60"), None);
        assert_eq!(parse_hhmm("noon"), None);
    }
}

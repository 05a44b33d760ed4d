//! Hypervisor cutter.
//!
//! Claims `vbox_*` actions and shells out to `VBoxManage`. The VM name
//! defaults to the target node; errors carry the child's combined output.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use super::{CutError, CutParams, Cutter};

pub struct VBoxCutter;

impl VBoxCutter {
    pub fn new() -> Self {
        Self
    }

    /// Run `VBoxManage` with the given arguments, failing on non-zero exit.
    async fn run(&self, args: &[&str]) -> Result<(), CutError> {
        let output = Command::new("VBoxManage")
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CutError::Backend(format!("VBoxManage {}: {e}", args.join(" "))))?;

        if !output.status.success() {
            return Err(CutError::Backend(format!(
                "VBoxManage {}: exit {}, output: {}",
                args.join(" "),
                output.status.code().unwrap_or(-1),
                combined_output(&output),
            )));
        }
        Ok(())
    }

    async fn revert_snapshot(&self, vm: &str, snapshot: &str) -> Result<(), CutError> {
        // Best-effort power off; a VM that is already down restores fine.
        let _ = self.power_off(vm).await;

        self.run(&["snapshot", vm, "restore", snapshot])
            .await
            .map_err(|e| CutError::Backend(format!("restore snapshot {snapshot:?}: {e}")))?;

        self.run(&["startvm", vm, "--type", "headless"])
            .await
            .map_err(|e| CutError::Backend(format!("start VM: {e}")))
    }

    async fn power_off(&self, vm: &str) -> Result<(), CutError> {
        let output = Command::new("VBoxManage")
            .args(["controlvm", vm, "poweroff"])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CutError::Backend(format!("poweroff: {e}")))?;

        let combined = combined_output(&output);
        // Powering off a VM that is already down is not a failure.
        if !output.status.success() && !combined.contains("not currently running") {
            return Err(CutError::Backend(format!("poweroff: {combined}")));
        }
        Ok(())
    }
}

fn combined_output(output: &std::process::Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text.trim().to_string()
}

impl Default for VBoxCutter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cutter for VBoxCutter {
    fn name(&self) -> &str {
        "vbox"
    }

    fn can_handle(&self, action: &str) -> bool {
        action.starts_with("vbox_")
    }

    async fn execute(&self, target: &str, params: &CutParams) -> Result<(), CutError> {
        let action = params.get("action").map(String::as_str).unwrap_or_default();
        let vm = params
            .get("vm_name")
            .filter(|v| !v.is_empty())
            .map(String::as_str)
            .unwrap_or(target);

        info!(target = %target, vm = %vm, action = %action, op = "vbox_cut", "hypervisor cut");

        match action {
            "vbox_revert_snapshot" => {
                let snapshot = params
                    .get("snapshot_name")
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        CutError::Usage("vbox_revert_snapshot requires snapshot_name".to_string())
                    })?;
                self.revert_snapshot(vm, snapshot).await
            }
            "vbox_poweroff" => self.power_off(vm).await,
            "vbox_reset" => self.run(&["controlvm", vm, "reset"]).await,
            other => Err(CutError::Usage(format!("unsupported action: {other}"))),
        }
    }
}

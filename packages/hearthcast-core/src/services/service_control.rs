//! Control of external long-running services.
//!
//! The control plane supervises daemons it does not implement (audio
//! engines, the multiroom bus). [`ServiceController`] is the seam between
//! that supervision logic and the host's init system; the default
//! implementation shells out to `systemctl` with bounded timeouts.

use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{HearthError, HearthResult};

/// Start/stop/probe interface for named host services.
///
/// All operations are bounded: a hung init system surfaces as an error, not
/// an unbounded lock hold in a caller.
#[async_trait]
pub trait ServiceController: Send + Sync {
    /// Whether the unit is currently active.
    ///
    /// Inactive, failed, and unknown units all report `false`; only a
    /// failure to query at all is an error.
    async fn is_active(&self, unit: &str) -> HearthResult<bool>;

    /// Starts the unit.
    async fn start(&self, unit: &str) -> HearthResult<()>;

    /// Stops the unit.
    async fn stop(&self, unit: &str) -> HearthResult<()>;
}

/// [`ServiceController`] backed by `systemctl`.
pub struct SystemdServiceController {
    timeout: Duration,
}

impl SystemdServiceController {
    /// Creates a controller with the given per-command timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run(&self, args: &[&str]) -> HearthResult<Output> {
        let command_line = format!("systemctl {}", args.join(" "));
        let output = tokio::time::timeout(
            self.timeout,
            Command::new("systemctl").args(args).output(),
        )
        .await
        .map_err(|_| HearthError::ServiceControl(format!("{command_line} timed out")))?
        .map_err(|e| HearthError::ServiceControl(format!("{command_line}: {e}")))?;
        Ok(output)
    }
}

impl Default for SystemdServiceController {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl ServiceController for SystemdServiceController {
    async fn is_active(&self, unit: &str) -> HearthResult<bool> {
        let output = self.run(&["is-active", unit]).await?;
        // `systemctl is-active` exits non-zero for anything but "active";
        // that is an answer, not a query failure.
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.trim() == "active")
    }

    async fn start(&self, unit: &str) -> HearthResult<()> {
        let output = self.run(&["start", unit]).await?;
        if output.status.success() {
            log::info!("[Services] Started {}", unit);
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(HearthError::ServiceControl(format!(
                "start {unit}: {}",
                stderr.trim()
            )))
        }
    }

    async fn stop(&self, unit: &str) -> HearthResult<()> {
        let output = self.run(&["stop", unit]).await?;
        if output.status.success() {
            log::info!("[Services] Stopped {}", unit);
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(HearthError::ServiceControl(format!(
                "stop {unit}: {}",
                stderr.trim()
            )))
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable in-memory service controller shared by routing, plugin,
    //! and bootstrap tests.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};

    /// Fake controller tracking unit activity and recording every call.
    #[derive(Default)]
    pub(crate) struct FakeServiceController {
        pub active: Mutex<HashMap<String, bool>>,
        pub fail_start: Mutex<HashSet<String>>,
        pub fail_stop: Mutex<HashSet<String>>,
        /// Call log as `"<op>:<unit>"`, in order.
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeServiceController {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn set_active(&self, unit: &str, active: bool) {
            self.active.lock().insert(unit.to_string(), active);
        }

        pub(crate) fn fail_start_of(&self, unit: &str) {
            self.fail_start.lock().insert(unit.to_string());
        }

        pub(crate) fn start_stop_calls(&self) -> Vec<String> {
            self.calls
                .lock()
                .iter()
                .filter(|c| !c.starts_with("is_active"))
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl ServiceController for FakeServiceController {
        async fn is_active(&self, unit: &str) -> HearthResult<bool> {
            self.calls.lock().push(format!("is_active:{unit}"));
            Ok(*self.active.lock().get(unit).unwrap_or(&false))
        }

        async fn start(&self, unit: &str) -> HearthResult<()> {
            self.calls.lock().push(format!("start:{unit}"));
            if self.fail_start.lock().contains(unit) {
                return Err(HearthError::ServiceControl(format!(
                    "start {unit}: scripted failure"
                )));
            }
            self.active.lock().insert(unit.to_string(), true);
            Ok(())
        }

        async fn stop(&self, unit: &str) -> HearthResult<()> {
            self.calls.lock().push(format!("stop:{unit}"));
            if self.fail_stop.lock().contains(unit) {
                return Err(HearthError::ServiceControl(format!(
                    "stop {unit}: scripted failure"
                )));
            }
            self.active.lock().insert(unit.to_string(), false);
            Ok(())
        }
    }
}

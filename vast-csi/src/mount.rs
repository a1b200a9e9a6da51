//! Mount Shim — a thin wrapper over the host's `mount`/`umount` binaries.
//!
//! Generalizes the upstream driver's nullfs bind-mount helper to NFS mount
//! specs of the form `<ip>:<export_path>`. Every decision re-reads
//! `/proc/mounts` rather than caching — `MountRecord` is never persisted.

use std::path::Path;
use std::process::Command;

use tracing::{info, warn};

use crate::error::{DriverError, DriverResult};

/// Observed state of a mountpoint, re-read from the OS before each decision.
#[derive(Debug, Clone, PartialEq)]
pub struct MountRecord {
    pub device: String,
    pub target: String,
    pub opts: Vec<String>,
}

fn read_proc_mounts() -> Vec<MountRecord> {
    let contents = std::fs::read_to_string("/proc/mounts").unwrap_or_default();
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?.to_string();
            let target = fields.next()?.to_string();
            let _fstype = fields.next();
            let opts = fields.next()?.split(',').map(str::to_string).collect();
            Some(MountRecord { device, target, opts })
        })
        .collect()
}

/// Return the mount entry for `target`, if any.
pub fn current_mount(target: &Path) -> Option<MountRecord> {
    let target = target.to_string_lossy().to_string();
    read_proc_mounts().into_iter().find(|m| m.target == target)
}

pub fn is_mounted(target: &Path) -> bool {
    current_mount(target).is_some()
}

/// `mount -v [-o <csv-flags>] <spec> <target>`
pub fn mount(spec: &str, target: &Path, flags: &[String]) -> DriverResult<()> {
    let mut cmd = Command::new("mount");
    cmd.arg("-v");
    if !flags.is_empty() {
        cmd.arg("-o").arg(flags.join(","));
    }
    cmd.arg(spec).arg(target);

    info!(spec, target = %target.display(), "mounting");
    let output = cmd.output().map_err(|e| DriverError::MountFailed(e.to_string()))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        return Err(DriverError::MountFailed(stderr));
    }
    Ok(())
}

/// `umount -v <target>`. Returns `Ok(())` if the kernel reports the target
/// is already unmounted, since that's the caller's desired end state.
pub fn unmount(target: &Path) -> DriverResult<()> {
    let output = Command::new("umount")
        .arg("-v")
        .arg(target)
        .output()
        .map_err(|e| DriverError::MountFailed(e.to_string()))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if stderr.contains("not mounted") {
        return Ok(());
    }
    warn!(target = %target.display(), stderr, "umount failed");
    Err(DriverError::MountFailed(stderr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_record_equality() {
        let a = MountRecord {
            device: "10.0.0.5:/k8s/pvc-abc".to_string(),
            target: "/mnt/x".to_string(),
            opts: vec!["ro".to_string()],
        };
        let b = a.clone();
        assert_eq!(a, b);
    }
}

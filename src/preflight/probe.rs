use std::path::{Path, PathBuf};

use sysinfo::{Disks, System};

/// A process visible to the current user.
#[derive(Debug, Clone)]
pub struct RunningApp {
    pub name: String,
    pub exe: Option<PathBuf>,
}

impl RunningApp {
    /// Match by process name, `.app` bundle name, or the last component of a
    /// bundle identifier such as `com.apple.Safari`. Case-insensitive.
    pub fn matches(&self, target: &str) -> bool {
        let target = target.trim().trim_end_matches(".app");
        if target.is_empty() {
            return false;
        }
        let mut candidates = vec![target];
        let parts: Vec<&str> = target.split('.').collect();
        if parts.len() >= 3 && !target.contains(['/', ' ']) {
            if let Some(last) = parts.last() {
                candidates.push(last);
            }
        }

        candidates.iter().any(|candidate| {
            if self.name.eq_ignore_ascii_case(candidate) {
                return true;
            }
            let bundle = format!("/{}.app/", candidate.to_lowercase());
            self.exe
                .as_ref()
                .is_some_and(|exe| exe.to_string_lossy().to_lowercase().contains(&bundle))
        })
    }
}

/// Read-only view of the machine used by preflight checks.
pub trait SystemProbe: Send + Sync {
    fn running_applications(&self) -> Vec<RunningApp>;

    /// Free bytes on the volume containing `path`, if it can be determined.
    fn available_space(&self, path: &Path) -> Option<u64>;
}

/// Probe backed by `sysinfo`. Snapshots are taken per call.
pub struct SysinfoProbe;

impl SystemProbe for SysinfoProbe {
    fn running_applications(&self) -> Vec<RunningApp> {
        let sys = System::new_all();
        sys.processes()
            .values()
            .map(|p| RunningApp {
                name: p.name().to_string_lossy().to_string(),
                exe: p.exe().map(Path::to_path_buf),
            })
            .collect()
    }

    fn available_space(&self, path: &Path) -> Option<u64> {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space())
    }
}

use std::{
    collections::HashMap,
    fs,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use log::{debug, info};

pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";
pub const UNKNOWN_CGROUP: &str = "unknown";

/// Id of the cgroup a process sits in when `/proc/<pid>/cgroup` names no path.
pub const ROOT_CGROUP: u32 = 1;

/// Cgroup id to path names.
///
/// On cgroup v2 the id the kernel reports is the inode of the cgroup
/// directory; the hooks keep its low 32 bits.
pub struct CgroupNames {
    root: PathBuf,
    names: HashMap<u32, String>,
}

impl CgroupNames {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            names: HashMap::new(),
        }
    }

    /// Walk the hierarchy and remember every directory.
    pub fn scan(&mut self) {
        let root = self.root.clone();
        self.walk(&root);
        debug!("[cgroup] {} cgroups known", self.names.len());
    }

    fn walk(&mut self, dir: &Path) {
        match fs::metadata(dir) {
            Ok(meta) => {
                self.names.insert(meta.ino() as u32, self.display_name(dir));
            }
            Err(e) => {
                debug!("[cgroup] stat {}: {e}", dir.display());
                return;
            }
        }
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            // file_type does not follow symlinks
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                self.walk(&entry.path());
            }
        }
    }

    // path below the root, without the v1 hybrid `unified/` prefix
    fn display_name(&self, dir: &Path) -> String {
        let rel = dir.strip_prefix(&self.root).unwrap_or(dir);
        let rel = rel.strip_prefix("unified").unwrap_or(rel);
        format!("/{}", rel.display())
    }

    /// Name of `id`, rescanning once when it is not known yet.
    pub fn name(&mut self, id: u32) -> &str {
        if !self.names.contains_key(&id) {
            info!("[cgroup] {id}: re-scanning");
            self.scan();
        }
        self.names
            .get(&id)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_CGROUP)
    }

    /// Id of the cgroup at `rel` (as found in `/proc/<pid>/cgroup`).
    pub fn id_of(root: &Path, rel: &str) -> Option<u32> {
        let rel = rel.trim_start_matches('/');
        if rel.is_empty() {
            return Some(ROOT_CGROUP);
        }
        fs::metadata(root.join(rel))
            .or_else(|_| fs::metadata(root.join("unified").join(rel)))
            .ok()
            .map(|meta| meta.ino() as u32)
    }
}

//! Per-plugin virtual filesystem.
//!
//! Each plugin sees `/` mounted to
//! `<config_root>/plugin-config-data/<plugin_id>/vfs/`, pre-populated with
//! `data/`, `config/`, `tmp/`. The `<plugin_id>.json` config file lives
//! outside this tree (see `manifest::PluginConfigFile`).

use std::path::Path;
use std::path::PathBuf;

/// Resolves and prepares the on-disk layout for a single plugin's sandbox.
#[derive(Debug, Clone)]
pub struct PluginVfs {
    plugin_id: String,
    root: PathBuf,
}

impl PluginVfs {
    pub fn new(config_root: &Path, plugin_id: &str) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            root: config_root.join("plugin-config-data").join(plugin_id).join("vfs"),
        }
    }

    /// Absolute path the guest sees mounted at `/`.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Charts/tile-container storage, a guest-writable subdirectory of
    /// `data/` the charts hybrid interceptor reads and writes directly,
    /// bypassing the guest for tile bytes too large for its safe buffer
    /// size (§4.G).
    pub fn charts_dir(&self) -> PathBuf {
        self.data_dir().join("charts")
    }

    /// Path to the host-side sidecar config file, which lives as a
    /// sibling of the plugin's VFS directory, not inside it.
    pub fn config_file_path(&self) -> PathBuf {
        self.root
            .parent() // plugin-config-data/<id>
            .and_then(Path::parent) // plugin-config-data
            .map(|p| p.join(format!("{}.json", self.plugin_id)))
            .unwrap_or_else(|| self.root.with_extension("json"))
    }

    /// Ensure `data/`, `config/`, `tmp/` exist. Idempotent.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.data_dir())?;
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.tmp_dir())?;
        Ok(())
    }

    /// Migrate legacy files from the pre-VFS layout
    /// (`plugin-config-data/<id>/*`) into `vfs/data/`, run once on first
    /// load of a plugin that predates the VFS sandbox.
    pub fn migrate_legacy_files(&self) -> std::io::Result<usize> {
        let legacy_dir = match self.root.parent() {
            Some(p) => p.to_path_buf(),
            None => return Ok(0),
        };
        if !legacy_dir.is_dir() {
            return Ok(0);
        }
        self.ensure_directories()?;
        let data_dir = self.data_dir();
        let mut migrated = 0usize;
        for entry in std::fs::read_dir(&legacy_dir)? {
            let entry = entry?;
            let path = entry.path();
            // Skip the vfs/ directory itself and the sidecar config file.
            if path == self.root || path.extension().and_then(|e| e.to_str()) == Some("json") {
                continue;
            }
            if path.is_file() {
                let dest = data_dir.join(entry.file_name());
                if !dest.exists() {
                    std::fs::rename(&path, &dest)?;
                    migrated += 1;
                }
            }
        }
        Ok(migrated)
    }

    /// Remove everything under `tmp/`, called on plugin stop.
    pub fn cleanup_tmp(&self) -> std::io::Result<()> {
        let tmp = self.tmp_dir();
        if tmp.is_dir() {
            for entry in std::fs::read_dir(&tmp)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    std::fs::remove_dir_all(&path)?;
                } else {
                    std::fs::remove_file(&path)?;
                }
            }
        }
        Ok(())
    }

    /// Total bytes used under the VFS root, walked recursively.
    pub fn disk_usage_bytes(&self) -> std::io::Result<u64> {
        fn walk(dir: &Path) -> std::io::Result<u64> {
            let mut total = 0u64;
            if !dir.is_dir() {
                return Ok(0);
            }
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                let metadata = entry.metadata()?;
                if metadata.is_dir() {
                    total += walk(&entry.path())?;
                } else {
                    total += metadata.len();
                }
            }
            Ok(total)
        }
        walk(&self.root)
    }

    /// Resolve a guest-relative path (as seen under `/`) to an absolute
    /// host path, rejecting any attempt to escape the VFS root via `..`.
    pub fn resolve(&self, guest_relative: &str) -> Option<PathBuf> {
        let relative = guest_relative.trim_start_matches('/');
        let mut resolved = self.root.clone();
        for component in relative.split('/') {
            match component {
                "" | "." => continue,
                ".." => return None,
                other => resolved.push(other),
            }
        }
        Some(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vfs_in(tmp: &Path) -> PluginVfs {
        PluginVfs::new(tmp, "anchor-alarm")
    }

    #[test]
    fn root_is_under_plugin_config_data() {
        let vfs = vfs_in(Path::new("/etc/marine"));
        assert_eq!(vfs.root(), Path::new("/etc/marine/plugin-config-data/anchor-alarm/vfs"));
    }

    #[test]
    fn config_file_lives_outside_vfs() {
        let vfs = vfs_in(Path::new("/etc/marine"));
        let config_path = vfs.config_file_path();
        assert_eq!(config_path, Path::new("/etc/marine/plugin-config-data/anchor-alarm.json"));
        assert!(!config_path.starts_with(vfs.root()));
    }

    #[test]
    fn resolve_rejects_parent_escape() {
        let vfs = vfs_in(Path::new("/etc/marine"));
        assert!(vfs.resolve("../../etc/passwd").is_none());
        assert!(vfs.resolve("data/foo.txt").is_some());
    }

    #[test]
    fn resolve_within_root_stays_under_root() {
        let vfs = vfs_in(Path::new("/etc/marine"));
        let resolved = vfs.resolve("/config/settings.json").unwrap();
        assert!(resolved.starts_with(vfs.root()));
        assert_eq!(resolved, vfs.root().join("config/settings.json"));
    }

    #[test]
    fn ensure_and_migrate_on_tempdir() {
        let dir = tempdir();
        let vfs = PluginVfs::new(dir.path(), "legacy-plugin");
        vfs.ensure_directories().unwrap();
        assert!(vfs.data_dir().is_dir());
        assert!(vfs.config_dir().is_dir());
        assert!(vfs.tmp_dir().is_dir());

        // Write a legacy file directly in plugin-config-data/<id>/.
        let legacy_dir = dir.path().join("plugin-config-data").join("legacy-plugin");
        std::fs::write(legacy_dir.join("old.txt"), b"hello").unwrap();

        let migrated = vfs.migrate_legacy_files().unwrap();
        assert_eq!(migrated, 1);
        assert!(vfs.data_dir().join("old.txt").is_file());
        assert!(!legacy_dir.join("old.txt").exists());
    }

    #[test]
    fn cleanup_tmp_removes_contents_but_not_dir() {
        let dir = tempdir();
        let vfs = PluginVfs::new(dir.path(), "p");
        vfs.ensure_directories().unwrap();
        std::fs::write(vfs.tmp_dir().join("scratch.tmp"), b"x").unwrap();
        vfs.cleanup_tmp().unwrap();
        assert!(vfs.tmp_dir().is_dir());
        assert_eq!(std::fs::read_dir(vfs.tmp_dir()).unwrap().count(), 0);
    }

    // Minimal temp-dir helper so these tests don't pull in a dev-dependency
    // solely for this one module.
    struct TempDir(PathBuf);
    impl TempDir {
        fn path(&self) -> &Path {
            &self.0
        }
    }
    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }
    fn tempdir() -> TempDir {
        let mut path = std::env::temp_dir();
        let unique = format!("skwasm-host-vfs-test-{}-{:?}", std::process::id(), std::thread::current().id());
        path.push(unique);
        std::fs::create_dir_all(&path).unwrap();
        TempDir(path)
    }
}

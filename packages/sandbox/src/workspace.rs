// ABOUTME: Path-safe file store rooted at the sandbox workspace directory
// ABOUTME: Every relative path is checked against the root before any filesystem mutation

use crate::error::{Result, SandboxError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Ephemeral scripts written by the command executor
pub const TMP_SCRIPTS_DIR: &str = "tmp_scripts";
/// Background task scripts, pid markers and captured output
pub const TASKS_DIR: &str = "tasks";
/// Diagnostics bundles captured after container failures
pub const DIAGNOSTICS_DIR: &str = "container";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub append: bool,
    pub executable: bool,
}

impl WriteOptions {
    pub fn append() -> Self {
        Self {
            append: true,
            ..Self::default()
        }
    }

    pub fn executable() -> Self {
        Self {
            executable: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    root: PathBuf,
}

impl WorkspaceStore {
    /// Open (creating if needed) a workspace rooted at `root`
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        debug!("Workspace root: {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a workspace-relative path to an absolute host path inside the root.
    ///
    /// Empty paths are `InvalidPath`. Absolute paths, `..` segments that climb
    /// above the root and existing symlinks whose target leaves the root are
    /// all `PathTraversal`. Nothing on disk is touched.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        if relative.trim().is_empty() {
            return Err(invalid(relative, "path is empty"));
        }
        if relative.contains('\0') {
            return Err(invalid(relative, "path contains a NUL byte"));
        }

        let mut normalized = PathBuf::new();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(SandboxError::PathTraversal(relative.to_string()));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(SandboxError::PathTraversal(relative.to_string()));
                }
            }
        }

        let resolved = self.root.join(&normalized);
        self.check_symlinks(relative, &resolved)?;
        Ok(resolved)
    }

    // Canonicalize the deepest existing ancestor; a symlink anywhere on the
    // existing prefix shows up as a canonical path outside the root.
    fn check_symlinks(&self, relative: &str, resolved: &Path) -> Result<()> {
        let mut probe = resolved;
        loop {
            if fs::symlink_metadata(probe).is_ok() {
                let canonical = probe
                    .canonicalize()
                    .map_err(|_| SandboxError::PathTraversal(relative.to_string()))?;
                if !canonical.starts_with(&self.root) {
                    return Err(SandboxError::PathTraversal(relative.to_string()));
                }
                return Ok(());
            }
            match probe.parent() {
                Some(parent) if parent.starts_with(&self.root) => probe = parent,
                _ => return Ok(()),
            }
        }
    }

    pub fn write_text(&self, relative: &str, content: &str, options: WriteOptions) -> Result<PathBuf> {
        self.write_bytes(relative, content.as_bytes(), options)
    }

    pub fn write_bytes(
        &self,
        relative: &str,
        content: &[u8],
        options: WriteOptions,
    ) -> Result<PathBuf> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(options.append)
            .truncate(!options.append)
            .open(&path)?;
        file.write_all(content)?;

        if options.executable {
            make_executable(&path)?;
        }

        debug!(
            "Wrote {} bytes to {} (append: {})",
            content.len(),
            path.display(),
            options.append
        );
        Ok(path)
    }

    pub fn read_text(&self, relative: &str) -> Result<String> {
        let path = self.resolve(relative)?;
        Ok(fs::read_to_string(path)?)
    }

    pub fn read_bytes(&self, relative: &str) -> Result<Vec<u8>> {
        let path = self.resolve(relative)?;
        Ok(fs::read(path)?)
    }

    pub fn mkdir(&self, relative: &str) -> Result<PathBuf> {
        let path = self.resolve(relative)?;
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Remove a file. Returns false if it did not exist.
    pub fn remove_file(&self, relative: &str) -> Result<bool> {
        let path = self.resolve(relative)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, relative: &str) -> Result<bool> {
        Ok(self.resolve(relative)?.exists())
    }

    /// File names directly under `relative`, sorted. A missing directory is empty.
    pub fn list_dir(&self, relative: &str) -> Result<Vec<String>> {
        let path = self.resolve(relative)?;
        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn write_json<T: Serialize>(&self, relative: &str, value: &T) -> Result<PathBuf> {
        let json = serde_json::to_string_pretty(value).map_err(|source| SandboxError::Json {
            path: PathBuf::from(relative),
            source,
        })?;
        self.write_text(relative, &json, WriteOptions::default())
    }

    pub fn read_json<T: DeserializeOwned>(&self, relative: &str) -> Result<T> {
        let text = self.read_text(relative)?;
        serde_json::from_str(&text).map_err(|source| SandboxError::Json {
            path: PathBuf::from(relative),
            source,
        })
    }

    pub fn write_yaml<T: Serialize>(&self, relative: &str, value: &T) -> Result<PathBuf> {
        let yaml = serde_yaml::to_string(value).map_err(|source| SandboxError::Yaml {
            path: PathBuf::from(relative),
            source,
        })?;
        self.write_text(relative, &yaml, WriteOptions::default())
    }

    pub fn read_yaml<T: DeserializeOwned>(&self, relative: &str) -> Result<T> {
        let text = self.read_text(relative)?;
        serde_yaml::from_str(&text).map_err(|source| SandboxError::Yaml {
            path: PathBuf::from(relative),
            source,
        })
    }

    /// Create the fixed subtrees used by the supervisor
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [TMP_SCRIPTS_DIR, TASKS_DIR, DIAGNOSTICS_DIR] {
            self.mkdir(dir)?;
        }
        Ok(())
    }

    /// Remove executor scripts left behind by an interrupted process
    pub fn sweep_scripts(&self) -> usize {
        let names = match self.list_dir(TMP_SCRIPTS_DIR) {
            Ok(names) => names,
            Err(e) => {
                warn!("Failed to list leftover scripts: {}", e);
                return 0;
            }
        };

        let mut removed = 0;
        for name in names
            .iter()
            .filter(|n| n.starts_with("task_") && n.ends_with(".sh"))
        {
            let relative = format!("{}/{}", TMP_SCRIPTS_DIR, name);
            match self.remove_file(&relative) {
                Ok(true) => {
                    debug!("Cleaned up remaining script: {}", relative);
                    removed += 1;
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to clean up script {}: {}", relative, e),
            }
        }
        removed
    }
}

fn invalid(path: &str, reason: &str) -> SandboxError {
    SandboxError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_mode(permissions.mode() | 0o111);
    fs::set_permissions(path, permissions)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use tempfile::TempDir;

    fn store() -> (TempDir, WorkspaceStore) {
        let dir = TempDir::new().unwrap();
        let store = WorkspaceStore::open(dir.path().join("ws")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_append_text_then_binary() {
        let (_dir, store) = store();
        store
            .write_text("notes/log.txt", "a\n", WriteOptions::default())
            .unwrap();
        store
            .write_text("notes/log.txt", "b\n", WriteOptions::append())
            .unwrap();
        store
            .write_bytes("notes/log.txt", b"c\n", WriteOptions::append())
            .unwrap();

        assert_eq!(store.read_text("notes/log.txt").unwrap(), "a\nb\nc\n");
        assert_eq!(store.read_bytes("notes/log.txt").unwrap(), b"a\nb\nc\n".to_vec());
    }

    #[test]
    fn test_write_truncates_without_append() {
        let (_dir, store) = store();
        store.write_text("f.txt", "long content", WriteOptions::default()).unwrap();
        store.write_text("f.txt", "short", WriteOptions::default()).unwrap();
        assert_eq!(store.read_text("f.txt").unwrap(), "short");
    }

    #[rstest]
    #[case("../escape.txt")]
    #[case("sub/../../escape.txt")]
    #[case("a/b/../../../escape.txt")]
    fn test_traversal_rejected_without_mutation(#[case] path: &str) {
        let (dir, store) = store();

        let err = store
            .write_text(path, "nope", WriteOptions::default())
            .unwrap_err();
        assert!(matches!(err, SandboxError::PathTraversal(_)));
        assert!(matches!(
            store.read_text(path).unwrap_err(),
            SandboxError::PathTraversal(_)
        ));

        assert!(!dir.path().join("escape.txt").exists());
        assert!(!store.root().join("sub").exists());
        assert!(!store.root().join("a").exists());
    }

    #[test]
    fn test_parent_segments_inside_root_are_allowed() {
        let (_dir, store) = store();
        let path = store
            .write_text("a/b/../c.txt", "ok", WriteOptions::default())
            .unwrap();
        assert_eq!(path, store.root().join("a/c.txt"));
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    fn test_empty_paths_rejected(#[case] path: &str) {
        let (_dir, store) = store();
        let err = store.resolve(path).unwrap_err();
        assert!(matches!(err, SandboxError::InvalidPath { .. }));
    }

    #[rstest]
    #[case("/etc/passwd")]
    #[case("/tmp/escape.txt")]
    fn test_absolute_paths_are_traversal(#[case] path: &str) {
        let (_dir, store) = store();
        let err = store
            .write_text(path, "nope", WriteOptions::default())
            .unwrap_err();
        assert!(matches!(err, SandboxError::PathTraversal(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let (dir, store) = store();
        let outside = dir.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, store.root().join("link")).unwrap();

        let err = store
            .write_text("link/secret.txt", "x", WriteOptions::default())
            .unwrap_err();
        assert!(matches!(err, SandboxError::PathTraversal(_)));
        assert!(!outside.join("secret.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_executable_sets_all_execute_bits() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, store) = store();
        let path = store
            .write_text("run.sh", "#!/bin/bash\n", WriteOptions::executable())
            .unwrap();
        let mode = fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[test]
    fn test_json_round_trip_and_listing() {
        let (_dir, store) = store();
        store
            .write_json("state/ready.json", &serde_json::json!({"running": true}))
            .unwrap();
        let value: serde_json::Value = store.read_json("state/ready.json").unwrap();
        assert_eq!(value["running"], true);

        assert_eq!(store.list_dir("state").unwrap(), vec!["ready.json"]);
        assert!(store.list_dir("missing").unwrap().is_empty());
    }

    #[derive(Debug, PartialEq, Serialize, serde::Deserialize)]
    struct Manifest {
        name: String,
        steps: Vec<String>,
    }

    #[test]
    fn test_yaml_keeps_field_order_and_rejects_garbage() {
        let (_dir, store) = store();
        let manifest = Manifest {
            name: "build".to_string(),
            steps: vec!["fetch".to_string(), "compile".to_string()],
        };
        store.write_yaml("conf/manifest.yaml", &manifest).unwrap();

        let text = store.read_text("conf/manifest.yaml").unwrap();
        assert!(text.find("name:").unwrap() < text.find("steps:").unwrap());
        let loaded: Manifest = store.read_yaml("conf/manifest.yaml").unwrap();
        assert_eq!(loaded, manifest);

        store
            .write_text("conf/broken.yaml", "name: [unclosed", WriteOptions::default())
            .unwrap();
        let err = store.read_yaml::<Manifest>("conf/broken.yaml").unwrap_err();
        assert!(matches!(err, SandboxError::Yaml { .. }));
        assert!(err.to_string().contains("conf/broken.yaml"));
    }

    #[test]
    fn test_sweep_scripts_only_removes_task_scripts() {
        let (_dir, store) = store();
        store.ensure_layout().unwrap();
        store
            .write_text("tmp_scripts/task_1.sh", "x", WriteOptions::default())
            .unwrap();
        store
            .write_text("tmp_scripts/task_2.sh", "x", WriteOptions::default())
            .unwrap();
        store
            .write_text("tmp_scripts/keep.txt", "x", WriteOptions::default())
            .unwrap();

        assert_eq!(store.sweep_scripts(), 2);
        assert_eq!(store.list_dir(TMP_SCRIPTS_DIR).unwrap(), vec!["keep.txt"]);
    }

    #[test]
    fn test_remove_missing_file_is_not_an_error() {
        let (_dir, store) = store();
        assert!(!store.remove_file("nothing.txt").unwrap());
    }
}

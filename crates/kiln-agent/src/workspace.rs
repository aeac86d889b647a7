//! Path confinement and protected-file checks.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::config::STATE_DIR;
use crate::errors::{AgentError, SafetyError};

#[derive(Clone, Debug)]
enum ProtectedEntry {
    Path(PathBuf),
    Pattern(glob::Pattern),
}

/// The single gate every filesystem-touching tool goes through.
///
/// `resolve` confines a path to the working-directory root, including
/// through symlinks; `check_protected` rejects modification of protected
/// paths. The guard only reads metadata and directory listings and never
/// changes the filesystem.
#[derive(Clone, Debug)]
pub struct WorkspaceGuard {
    root: PathBuf,
    protected: Vec<ProtectedEntry>,
}

impl WorkspaceGuard {
    /// Builds a guard rooted at `root`. The agent state directory is always
    /// protected in addition to `protected`.
    pub fn new<P: AsRef<Path>>(root: P, protected: &[String]) -> Result<Self, AgentError> {
        let root = root.as_ref().canonicalize().map_err(|err| {
            AgentError::InvalidConfiguration(format!(
                "working directory '{}' is not accessible: {err}",
                root.as_ref().display()
            ))
        })?;

        let mut entries = vec![ProtectedEntry::Path(root.join(STATE_DIR))];
        for raw in protected {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            if raw.contains(['*', '?', '[']) {
                let pattern = glob::Pattern::new(raw).map_err(|err| {
                    AgentError::InvalidConfiguration(format!("invalid protected pattern '{raw}': {err}"))
                })?;
                entries.push(ProtectedEntry::Pattern(pattern));
            } else {
                entries.push(ProtectedEntry::Path(normalize(&root.join(raw))));
            }
        }

        Ok(Self {
            root,
            protected: entries,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves `path` against the root and rejects anything that lands
    /// outside of it.
    pub fn resolve<P: AsRef<Path>>(&self, path: P) -> Result<PathBuf, SafetyError> {
        let path = path.as_ref();
        let raw = path.to_string_lossy();
        if raw.trim().is_empty() || raw.contains('\0') {
            return Err(SafetyError::InvalidPath(raw.into_owned()));
        }

        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let normalized = normalize(&joined);
        if !normalized.starts_with(&self.root) {
            return Err(SafetyError::PathTraversal(raw.into_owned()));
        }

        let resolved = canonicalize_existing_prefix(&normalized)
            .map_err(|_| SafetyError::PathTraversal(raw.to_string()))?;
        if !resolved.starts_with(&self.root) {
            return Err(SafetyError::PathTraversal(raw.into_owned()));
        }
        Ok(resolved)
    }

    /// Fails when `path` (already resolved) is protected, lies inside a
    /// protected directory, or contains a protected path. For patterns, an
    /// existing directory counts as containing a protected path when any
    /// entry beneath it matches.
    pub fn check_protected(&self, path: &Path) -> Result<(), SafetyError> {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let hit = self.protected.iter().any(|entry| match entry {
            ProtectedEntry::Path(protected) => {
                path.starts_with(protected) || protected.starts_with(path)
            }
            ProtectedEntry::Pattern(pattern) => {
                pattern.matches_path(relative)
                    || (path.is_dir() && self.matches_beneath(pattern, path, relative))
            }
        });
        if hit {
            return Err(SafetyError::ProtectedFile(self.display(path)));
        }
        Ok(())
    }

    fn matches_beneath(&self, pattern: &glob::Pattern, dir: &Path, relative: &Path) -> bool {
        let prefix = literal_prefix(pattern);
        if !(relative.starts_with(&prefix) || prefix.starts_with(relative)) {
            return false;
        }
        WalkDir::new(dir)
            .min_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .any(|entry| {
                entry
                    .path()
                    .strip_prefix(&self.root)
                    .is_ok_and(|inner| pattern.matches_path(inner))
            })
    }

    /// Root-relative rendering of `path` for tool output.
    pub fn display(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(relative) if relative.as_os_str().is_empty() => ".".to_string(),
            Ok(relative) => relative.to_string_lossy().into_owned(),
            Err(_) => path.to_string_lossy().into_owned(),
        }
    }
}

// Leading components of a pattern that contain no wildcard.
fn literal_prefix(pattern: &glob::Pattern) -> PathBuf {
    Path::new(pattern.as_str())
        .components()
        .take_while(|component| {
            !component
                .as_os_str()
                .to_string_lossy()
                .contains(['*', '?', '['])
        })
        .collect()
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// Canonicalizes the longest existing ancestor and re-appends the missing tail.
fn canonicalize_existing_prefix(path: &Path) -> std::io::Result<PathBuf> {
    let mut cursor = path.to_path_buf();
    let mut missing = Vec::<OsString>::new();
    loop {
        if cursor.exists() {
            let mut resolved = cursor.canonicalize()?;
            for part in missing.iter().rev() {
                resolved.push(part);
            }
            return Ok(resolved);
        }
        // A dangling symlink cannot be proven to stay inside the root.
        if cursor.symlink_metadata().is_ok() {
            return Err(std::io::Error::other("dangling symlink"));
        }
        let Some(name) = cursor.file_name() else {
            return Err(std::io::Error::other("no existing ancestor"));
        };
        missing.push(name.to_os_string());
        if !cursor.pop() {
            return Err(std::io::Error::other("no existing ancestor"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CONFIG_FILE, INSTRUCTION_FILE};

    fn guard(extra: &[&str]) -> (tempfile::TempDir, WorkspaceGuard) {
        let tmp = tempfile::tempdir().expect("tempdir should be created");
        std::fs::create_dir_all(tmp.path().join(STATE_DIR)).expect("state dir");
        std::fs::write(tmp.path().join(CONFIG_FILE), "{}").expect("config");
        let extra: Vec<String> = extra.iter().map(|s| s.to_string()).collect();
        let guard = WorkspaceGuard::new(tmp.path(), &extra).expect("guard should build");
        (tmp, guard)
    }

    #[test]
    fn resolve_keeps_paths_inside_root() {
        let (_tmp, guard) = guard(&[]);
        let resolved = guard.resolve("src/app.js").expect("inside root");
        assert!(resolved.starts_with(guard.root()));
        assert_eq!(guard.display(&resolved), "src/app.js");
        assert_eq!(guard.display(&guard.resolve(".").expect("root")), ".");
    }

    #[test]
    fn resolve_rejects_parent_traversal() {
        let (_tmp, guard) = guard(&[]);
        for path in ["../outside.txt", "src/../../outside.txt", "a/b/../../../x"] {
            assert!(
                matches!(guard.resolve(path), Err(SafetyError::PathTraversal(_))),
                "{path} should be rejected"
            );
        }
    }

    #[test]
    fn resolve_rejects_absolute_paths_outside_root() {
        let (_tmp, guard) = guard(&[]);
        assert!(matches!(
            guard.resolve("/etc/passwd"),
            Err(SafetyError::PathTraversal(_))
        ));
        let inside = guard.root().join("ok.txt");
        assert!(guard.resolve(&inside).is_ok());
    }

    #[test]
    fn resolve_rejects_empty_path() {
        let (_tmp, guard) = guard(&[]);
        assert!(matches!(guard.resolve(""), Err(SafetyError::InvalidPath(_))));
    }

    #[cfg(unix)]
    #[test]
    fn resolve_rejects_symlink_escape() {
        let (tmp, guard) = guard(&[]);
        let outside = tempfile::tempdir().expect("outside dir");
        std::os::unix::fs::symlink(outside.path(), tmp.path().join("link")).expect("symlink");
        std::os::unix::fs::symlink(outside.path().join("gone"), tmp.path().join("dangling"))
            .expect("dangling symlink");

        assert!(matches!(
            guard.resolve("link/secret.txt"),
            Err(SafetyError::PathTraversal(_))
        ));
        assert!(matches!(
            guard.resolve("dangling"),
            Err(SafetyError::PathTraversal(_))
        ));
    }

    #[test]
    fn config_and_instruction_files_are_always_protected() {
        let (_tmp, guard) = guard(&[]);
        for path in [CONFIG_FILE, INSTRUCTION_FILE] {
            let resolved = guard.resolve(path).expect("resolves");
            assert!(matches!(
                guard.check_protected(&resolved),
                Err(SafetyError::ProtectedFile(_))
            ));
        }
        let state_dir = guard.resolve(STATE_DIR).expect("resolves");
        assert!(guard.check_protected(&state_dir).is_err());
        let ordinary = guard.resolve("index.js").expect("resolves");
        assert!(guard.check_protected(&ordinary).is_ok());
    }

    #[test]
    fn configured_paths_and_patterns_are_protected() {
        let (_tmp, guard) = guard(&["package-lock.json", "secrets/*.pem"]);
        let lock = guard.resolve("./package-lock.json").expect("resolves");
        assert!(guard.check_protected(&lock).is_err());
        let pem = guard.resolve("secrets/server.pem").expect("resolves");
        assert!(guard.check_protected(&pem).is_err());
        let other = guard.resolve("secrets/readme.md").expect("resolves");
        assert!(guard.check_protected(&other).is_ok());
    }

    #[test]
    fn directories_holding_pattern_protected_files_cannot_be_modified() {
        let (tmp, guard) = guard(&["secrets/*.pem"]);
        std::fs::create_dir_all(tmp.path().join("secrets/nested")).expect("secrets dir");
        std::fs::write(tmp.path().join("secrets/nested/server.pem"), "key").expect("pem");
        std::fs::create_dir_all(tmp.path().join("public")).expect("public dir");
        std::fs::write(tmp.path().join("public/index.html"), "<html>").expect("html");

        for dir in ["secrets", "secrets/nested", "."] {
            let resolved = guard.resolve(dir).expect("resolves");
            assert!(
                matches!(guard.check_protected(&resolved), Err(SafetyError::ProtectedFile(_))),
                "{dir} should be protected"
            );
        }
        let public = guard.resolve("public").expect("resolves");
        assert!(guard.check_protected(&public).is_ok());
    }

    #[test]
    fn ancestors_of_protected_paths_cannot_be_modified() {
        let (_tmp, guard) = guard(&["config/app.json"]);
        let parent = guard.resolve("config").expect("resolves");
        assert!(guard.check_protected(&parent).is_err());
    }
}

use glob::{MatchOptions, Pattern};
use std::io;
use std::path::{Component, Path, PathBuf};
use tftp_upload_core::ErrorCode;
use tracing::debug;

use crate::config::WriteConfig;
use crate::error::{Result, TftpError};
use crate::sink::staging_path;

/// Reason an upload name was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// `..` components or prefixes
    Traversal,
    /// Target is a symbolic link
    Symlink,
    /// Resolves outside the root directory
    OutsideRoot,
    /// No `allowed_patterns` entry matches
    NotAllowed,
    /// Target exists and overwrites are disabled
    Exists,
    /// Target or its parent cannot be inspected
    Unavailable,
}

impl Violation {
    pub fn as_str(self) -> &'static str {
        match self {
            Violation::Traversal => "directory_traversal",
            Violation::Symlink => "symlink",
            Violation::OutsideRoot => "outside_root",
            Violation::NotAllowed => "pattern_not_allowed",
            Violation::Exists => "file_exists",
            Violation::Unavailable => "unavailable",
        }
    }

    pub fn error_code(self) -> ErrorCode {
        match self {
            Violation::Exists => ErrorCode::FileExists,
            _ => ErrorCode::AccessViolation,
        }
    }

    /// Attempts to leave the root directory, as opposed to policy refusals.
    pub fn is_escape(self) -> bool {
        matches!(
            self,
            Violation::Traversal | Violation::Symlink | Violation::OutsideRoot
        )
    }
}

/// Final and staging locations of an accepted upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPath {
    /// Name relative to the root, with separators normalised.
    pub relative: String,
    pub target: PathBuf,
    pub staging: PathBuf,
}

/// Jails upload names under a root directory and applies the write policy.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    root_dir: PathBuf,
    canonical_root: PathBuf,
    allow_overwrite: bool,
    patterns: Vec<Pattern>,
}

impl AccessPolicy {
    pub fn new(root_dir: &Path, write_config: &WriteConfig) -> Result<Self> {
        let canonical_root = root_dir.canonicalize().map_err(|e| {
            TftpError::Config(format!(
                "root_dir {} is not accessible: {}",
                root_dir.display(),
                e
            ))
        })?;

        let patterns = write_config
            .allowed_patterns
            .iter()
            .map(|p| {
                Pattern::new(p)
                    .map_err(|e| TftpError::Config(format!("Invalid write pattern '{}': {}", p, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            root_dir: root_dir.to_path_buf(),
            canonical_root,
            allow_overwrite: write_config.allow_overwrite,
            patterns,
        })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Resolve a requested filename to the paths the upload will use.
    pub fn resolve(&self, filename: &str) -> std::result::Result<UploadPath, Violation> {
        let normalized = filename.replace('\\', "/");
        let relative = normalized.trim_start_matches('/');

        if relative.is_empty() {
            return Err(Violation::NotAllowed);
        }

        if Path::new(relative)
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(Violation::Traversal);
        }

        let target = self.root_dir.join(relative);

        match std::fs::symlink_metadata(&target) {
            Ok(metadata) if metadata.file_type().is_symlink() => return Err(Violation::Symlink),
            Ok(metadata) if metadata.is_dir() => return Err(Violation::NotAllowed),
            Ok(_) if !self.allow_overwrite => return Err(Violation::Exists),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                debug!("Cannot inspect {}: {}", target.display(), e);
                return Err(Violation::Unavailable);
            }
        }

        // The parent must already exist inside the root; uploads never create directories.
        let parent = target.parent().ok_or(Violation::OutsideRoot)?;
        let canonical_parent = parent.canonicalize().map_err(|e| {
            debug!("Cannot resolve {}: {}", parent.display(), e);
            Violation::Unavailable
        })?;
        if !canonical_parent.starts_with(&self.canonical_root) {
            return Err(Violation::OutsideRoot);
        }

        if !self.patterns.is_empty() && !self.matches_pattern(relative) {
            return Err(Violation::NotAllowed);
        }

        let staging = staging_path(&target);
        if let Ok(metadata) = std::fs::symlink_metadata(&staging)
            && metadata.file_type().is_symlink()
        {
            return Err(Violation::Symlink);
        }

        Ok(UploadPath {
            relative: relative.to_string(),
            target,
            staging,
        })
    }

    fn matches_pattern(&self, relative: &str) -> bool {
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        self.patterns
            .iter()
            .any(|pattern| pattern.matches_with(relative, options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(dir: &Path, allow_overwrite: bool, patterns: &[&str]) -> Result<AccessPolicy> {
        AccessPolicy::new(
            dir,
            &WriteConfig {
                allow_overwrite,
                allowed_patterns: patterns.iter().map(|p| p.to_string()).collect(),
            },
        )
    }

    #[test]
    fn resolves_plain_and_nested_names() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir(dir.path().join("configs"))?;
        let policy = policy(dir.path(), true, &[])?;

        let upload = policy.resolve("a.bin").map_err(|v| v.as_str())?;
        assert_eq!(upload.target, dir.path().join("a.bin"));
        assert_eq!(upload.staging, dir.path().join("a.bin.upload"));

        let upload = policy.resolve("/configs\\r1.cfg").map_err(|v| v.as_str())?;
        assert_eq!(upload.relative, "configs/r1.cfg");
        assert_eq!(upload.target, dir.path().join("configs/r1.cfg"));
        Ok(())
    }

    #[test]
    fn rejects_traversal() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let policy = policy(dir.path(), true, &[])?;
        for name in ["../etc/passwd", "a/../../b", "..\\x", "a/.."] {
            assert_eq!(policy.resolve(name), Err(Violation::Traversal), "{name}");
        }
        Ok(())
    }

    #[test]
    fn rejects_missing_parent_directory() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let policy = policy(dir.path(), true, &[])?;
        assert_eq!(policy.resolve("nope/a.bin"), Err(Violation::Unavailable));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlinks() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let outside = tempfile::tempdir()?;
        std::os::unix::fs::symlink(outside.path().join("x"), dir.path().join("link.bin"))?;
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape"))?;

        let policy = policy(dir.path(), true, &[])?;
        assert_eq!(policy.resolve("link.bin"), Err(Violation::Symlink));
        assert_eq!(policy.resolve("escape/a.bin"), Err(Violation::OutsideRoot));
        Ok(())
    }

    #[test]
    fn applies_allowed_patterns() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir(dir.path().join("configs"))?;
        let policy = policy(dir.path(), true, &["*.bin", "configs/*.cfg"])?;

        assert!(policy.resolve("fw.bin").is_ok());
        assert!(policy.resolve("configs/r1.cfg").is_ok());
        assert_eq!(policy.resolve("fw.txt"), Err(Violation::NotAllowed));
        assert_eq!(policy.resolve("configs/fw.bin"), Err(Violation::NotAllowed));
        Ok(())
    }

    #[test]
    fn overwrite_policy() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("a.bin"), b"old")?;

        assert!(policy(dir.path(), true, &[])?.resolve("a.bin").is_ok());
        let strict = policy(dir.path(), false, &[])?;
        assert_eq!(strict.resolve("a.bin"), Err(Violation::Exists));
        assert_eq!(Violation::Exists.error_code(), ErrorCode::FileExists);
        Ok(())
    }

    #[test]
    fn rejects_directories_as_targets() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir(dir.path().join("sub"))?;
        let policy = policy(dir.path(), true, &[])?;
        assert_eq!(policy.resolve("sub"), Err(Violation::NotAllowed));
        assert_eq!(policy.resolve("/"), Err(Violation::NotAllowed));
        Ok(())
    }

    #[test]
    fn missing_root_is_a_config_error() {
        let result = policy(Path::new("/nonexistent/tftp-upload-root"), true, &[]);
        assert!(matches!(result, Err(TftpError::Config(_))));
    }
}

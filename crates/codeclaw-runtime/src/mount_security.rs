//! §4.7.1 Additional-mount validation. The allow-list lives outside the
//! project root so a compromised agent cannot edit it into permissiveness.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::MountError;

type Result<T> = std::result::Result<T, MountError>;

const DEFAULT_BLOCKED_SEGMENTS: &[&str] = &[
    ".ssh",
    ".gnupg",
    ".aws",
    ".kube",
    ".docker",
    ".env",
    ".netrc",
    "id_rsa",
    "id_ed25519",
    "private_key",
    ".secret",
];

#[derive(Debug, Clone, Deserialize)]
struct AllowlistFile {
    #[serde(default)]
    allowed_roots: Vec<PathBuf>,
    #[serde(default)]
    blocked_segments: Vec<String>,
    #[serde(default)]
    non_main_read_only: bool,
    #[serde(default)]
    allow_read_write: bool,
}

pub struct MountSecurity {
    allowlist_path: PathBuf,
}

/// An additional mount after policy has been applied; `read_write` may
/// have been silently downgraded from the caller's request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovedMount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_write: bool,
}

impl MountSecurity {
    pub fn new(allowlist_path: impl Into<PathBuf>) -> Self {
        Self {
            allowlist_path: allowlist_path.into(),
        }
    }

    fn load_allowlist(&self) -> Result<AllowlistFile> {
        let raw = fs::read_to_string(&self.allowlist_path).map_err(|_| MountError::AllowlistUnavailable)?;
        serde_json::from_str(&raw).map_err(|_| MountError::AllowlistUnavailable)
    }

    /// Validates one requested mount, returning the approved (possibly
    /// downgraded-to-readonly) mount or the first denial reason.
    ///
    /// `is_main` controls the rw policy: `non_main_read_only` only
    /// restricts mounts requested by non-main groups.
    pub fn validate(
        &self,
        host_path: &str,
        container_path: &str,
        requested_rw: bool,
        is_main: bool,
    ) -> Result<ApprovedMount> {
        let allowlist = self.load_allowlist()?;

        if container_path.is_empty() || !container_path.starts_with('/') || container_path.contains("..") {
            return Err(MountError::InvalidContainerPath);
        }

        let real_host_path = fs::canonicalize(host_path)
            .map_err(|_| MountError::HostPathMissing(host_path.to_string()))?;

        let blocked: Vec<&str> = if allowlist.blocked_segments.is_empty() {
            DEFAULT_BLOCKED_SEGMENTS.to_vec()
        } else {
            allowlist.blocked_segments.iter().map(String::as_str).collect()
        };
        for component in real_host_path.components() {
            let segment = component.as_os_str().to_string_lossy();
            if blocked.iter().any(|b| segment.as_ref() == *b) {
                return Err(MountError::BlockedSegment(host_path.to_string(), segment.to_string()));
            }
        }

        let under_allowed_root = allowlist
            .allowed_roots
            .iter()
            .filter_map(|root| fs::canonicalize(root).ok())
            .any(|root| real_host_path.starts_with(&root));
        if !under_allowed_root {
            return Err(MountError::OutsideAllowedRoots(host_path.to_string()));
        }

        let read_write = requested_rw
            && allowlist.allow_read_write
            && !(allowlist.non_main_read_only && !is_main);

        Ok(ApprovedMount {
            host_path: real_host_path,
            container_path: container_path.to_string(),
            read_write,
        })
    }
}

fn write_allowlist(path: &Path, file: &AllowlistFile) {
    #[derive(serde::Serialize)]
    struct Writable<'a> {
        allowed_roots: &'a [PathBuf],
        blocked_segments: &'a [String],
        non_main_read_only: bool,
        allow_read_write: bool,
    }
    let writable = Writable {
        allowed_roots: &file.allowed_roots,
        blocked_segments: &file.blocked_segments,
        non_main_read_only: file.non_main_read_only,
        allow_read_write: file.allow_read_write,
    };
    fs::write(path, serde_json::to_string(&writable).unwrap()).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn allowlist(dir: &Path, roots: Vec<PathBuf>, rw: bool, non_main_ro: bool) -> PathBuf {
        let path = dir.join("mount-allowlist.json");
        write_allowlist(
            &path,
            &AllowlistFile {
                allowed_roots: roots,
                blocked_segments: Vec::new(),
                non_main_read_only: non_main_ro,
                allow_read_write: rw,
            },
        );
        path
    }

    #[test]
    fn missing_allowlist_is_default_deny() {
        let dir = tempdir().unwrap();
        let security = MountSecurity::new(dir.path().join("missing.json"));
        let target = tempdir().unwrap();
        let err = security.validate(target.path().to_str().unwrap(), "/workspace/x", false, true).unwrap_err();
        assert!(matches!(err, MountError::AllowlistUnavailable));
    }

    #[test]
    fn container_path_must_be_absolute_without_dotdot() {
        let dir = tempdir().unwrap();
        let allowed = tempdir().unwrap();
        let path = allowlist(dir.path(), vec![allowed.path().to_path_buf()], true, false);
        let security = MountSecurity::new(path);
        let err = security
            .validate(allowed.path().to_str().unwrap(), "relative/path", false, true)
            .unwrap_err();
        assert!(matches!(err, MountError::InvalidContainerPath));
    }

    #[test]
    fn host_path_must_exist() {
        let dir = tempdir().unwrap();
        let allowed = tempdir().unwrap();
        let path = allowlist(dir.path(), vec![allowed.path().to_path_buf()], true, false);
        let security = MountSecurity::new(path);
        let missing = allowed.path().join("nope");
        let err = security
            .validate(missing.to_str().unwrap(), "/workspace/x", false, true)
            .unwrap_err();
        assert!(matches!(err, MountError::HostPathMissing(_)));
    }

    #[test]
    fn blocked_segment_is_rejected() {
        let dir = tempdir().unwrap();
        let allowed = tempdir().unwrap();
        let ssh_dir = allowed.path().join(".ssh");
        fs::create_dir_all(&ssh_dir).unwrap();
        let path = allowlist(dir.path(), vec![allowed.path().to_path_buf()], true, false);
        let security = MountSecurity::new(path);
        let err = security
            .validate(ssh_dir.to_str().unwrap(), "/workspace/x", false, true)
            .unwrap_err();
        assert!(matches!(err, MountError::BlockedSegment(_, _)));
    }

    #[test]
    fn outside_allowed_roots_is_rejected() {
        let dir = tempdir().unwrap();
        let allowed = tempdir().unwrap();
        let elsewhere = tempdir().unwrap();
        let path = allowlist(dir.path(), vec![allowed.path().to_path_buf()], true, false);
        let security = MountSecurity::new(path);
        let err = security
            .validate(elsewhere.path().to_str().unwrap(), "/workspace/x", false, true)
            .unwrap_err();
        assert!(matches!(err, MountError::OutsideAllowedRoots(_)));
    }

    #[test]
    fn rw_downgrades_to_readonly_for_non_main_when_policy_requires() {
        let dir = tempdir().unwrap();
        let allowed = tempdir().unwrap();
        let path = allowlist(dir.path(), vec![allowed.path().to_path_buf()], true, true);
        let security = MountSecurity::new(path);
        let approved = security
            .validate(allowed.path().to_str().unwrap(), "/workspace/x", true, false)
            .unwrap();
        assert!(!approved.read_write);
    }

    #[test]
    fn rw_preserved_for_main_even_when_non_main_restricted() {
        let dir = tempdir().unwrap();
        let allowed = tempdir().unwrap();
        let path = allowlist(dir.path(), vec![allowed.path().to_path_buf()], true, true);
        let security = MountSecurity::new(path);
        let approved = security
            .validate(allowed.path().to_str().unwrap(), "/workspace/x", true, true)
            .unwrap();
        assert!(approved.read_write);
    }

    #[test]
    fn rw_denied_when_allow_read_write_policy_is_false() {
        let dir = tempdir().unwrap();
        let allowed = tempdir().unwrap();
        let path = allowlist(dir.path(), vec![allowed.path().to_path_buf()], false, false);
        let security = MountSecurity::new(path);
        let approved = security
            .validate(allowed.path().to_str().unwrap(), "/workspace/x", true, true)
            .unwrap();
        assert!(!approved.read_write);
    }
}

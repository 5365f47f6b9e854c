//! Job directory lifecycle and source tree materialization.
//!
//! With an empty command prefix everything goes through the local filesystem.
//! With a prefix, the same operations are issued as `mkdir`, `sh` and `rm`
//! commands behind it so the files land wherever the isolation binary lives.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::{debug, warn};
use uuid::Uuid;

use super::CmdPrefix;
use crate::error::SandboxError;
use crate::model::Directory;

/// `$0` is the target path, `$1` the base64 payload.
const WRITE_SCRIPT: &str = r#"printf '%s' "$1" | base64 -d > "$0""#;

/// Working directory of a single job, plus its rendered config file.
///
/// Call [`JobDir::remove`] on every path out of the job. If the guard is
/// dropped instead (the job future was cancelled), cleanup happens in `Drop`.
#[derive(Debug)]
pub struct JobDir {
    path: PathBuf,
    config_path: PathBuf,
    prefix: CmdPrefix,
    armed: bool,
}

impl JobDir {
    /// Create `<jobs_dir>/<job_id>`.
    pub async fn create(
        prefix: &CmdPrefix,
        jobs_dir: &Path,
        job_id: Uuid,
    ) -> Result<Self, SandboxError> {
        let path = jobs_dir.join(job_id.to_string());
        let config_path = jobs_dir.join(format!("config-{job_id}.cfg"));

        create_dir(prefix, &path).await?;
        debug!(path = %path.display(), "Created job directory");

        Ok(Self {
            path,
            config_path,
            prefix: prefix.clone(),
            armed: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the rendered isolation config goes. Kept outside the job
    /// directory so the program cannot read it from its mount.
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Delete the job directory and config file. Failures are logged only.
    pub async fn remove(mut self) {
        self.armed = false;
        for path in [&self.path, &self.config_path] {
            if let Err(e) = remove_path(&self.prefix, path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove job path");
            }
        }
    }
}

impl Drop for JobDir {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        warn!(path = %self.path.display(), "Job abandoned before cleanup, removing");
        let paths = [self.path.clone(), self.config_path.clone()];
        let prefix = self.prefix.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) if prefix.is_empty() => {
                handle.spawn_blocking(move || remove_blocking(&prefix, &paths));
            }
            Ok(handle) => {
                handle.spawn(async move {
                    for path in &paths {
                        if let Err(e) = remove_path(&prefix, path).await {
                            warn!(path = %path.display(), error = %e, "Failed to remove job path");
                        }
                    }
                });
            }
            Err(_) => remove_blocking(&prefix, &paths),
        }
    }
}

/// Cleanup for when no async context is available.
fn remove_blocking(prefix: &CmdPrefix, paths: &[PathBuf]) {
    for path in paths {
        let result = if prefix.is_empty() {
            remove_local_blocking(path)
        } else {
            prefix
                .std_command("rm", [OsStr::new("-rf"), path.as_os_str()])
                .status()
                .map(drop)
        };
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Failed to remove job path");
        }
    }
}

/// Write `tree` under `root`. The root directory's own name is ignored.
pub async fn materialize(
    prefix: &CmdPrefix,
    root: &Path,
    tree: &Directory,
) -> Result<(), SandboxError> {
    let mut pending = vec![(root.to_path_buf(), tree)];

    while let Some((dir, node)) = pending.pop() {
        for file in &node.files {
            let name = file.file_name();
            let path = dir.join(checked_name(&name)?);
            write_file(prefix, &path, file.content.as_bytes()).await?;
        }

        for child in &node.directories {
            let path = dir.join(checked_name(&child.name)?);
            create_dir(prefix, &path).await?;
            pending.push((path, child));
        }
    }

    Ok(())
}

/// Entry points must name a file inside the job directory, spelled only with
/// `[A-Za-z0-9._/-]`. The value is pasted into the isolation config, so
/// nothing that could end a quoted string or a line gets through.
pub fn checked_entry_point(entry_point: &str) -> Result<&str, SandboxError> {
    let path = Path::new(entry_point);
    let plain = entry_point
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-' | b'/'));
    let inside = path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    let names_file = !entry_point.ends_with('/')
        && matches!(path.components().next_back(), Some(Component::Normal(_)));

    if plain && inside && names_file {
        Ok(entry_point)
    } else {
        Err(SandboxError::InvalidPath(entry_point.to_string()))
    }
}

fn checked_name(name: &str) -> Result<&str, SandboxError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);

    if valid {
        Ok(name)
    } else {
        Err(SandboxError::InvalidPath(name.to_string()))
    }
}

pub(crate) async fn create_dir(prefix: &CmdPrefix, path: &Path) -> Result<(), SandboxError> {
    if prefix.is_empty() {
        return tokio::fs::create_dir_all(path)
            .await
            .map_err(|source| SandboxError::Setup {
                context: format!("create directory {}", path.display()),
                source,
            });
    }

    run_helper(prefix.command("mkdir", [OsStr::new("-p"), path.as_os_str()]), "mkdir").await
}

pub(crate) async fn write_file(
    prefix: &CmdPrefix,
    path: &Path,
    content: &[u8],
) -> Result<(), SandboxError> {
    if prefix.is_empty() {
        return tokio::fs::write(path, content)
            .await
            .map_err(|source| SandboxError::Setup {
                context: format!("write file {}", path.display()),
                source,
            });
    }

    let encoded = STANDARD.encode(content);
    let cmd = prefix.command(
        "sh",
        [
            OsStr::new("-c"),
            OsStr::new(WRITE_SCRIPT),
            path.as_os_str(),
            OsStr::new(&encoded),
        ],
    );
    run_helper(cmd, "write").await
}

async fn remove_path(prefix: &CmdPrefix, path: &Path) -> Result<(), SandboxError> {
    if prefix.is_empty() {
        let path = path.to_path_buf();
        return tokio::task::spawn_blocking(move || remove_local_blocking(&path))
            .await
            .map_err(|e| SandboxError::Setup {
                context: "join cleanup task".into(),
                source: std::io::Error::other(e),
            })?
            .map_err(|source| SandboxError::Setup {
                context: "remove job path".into(),
                source,
            });
    }

    run_helper(prefix.command("rm", [OsStr::new("-rf"), path.as_os_str()]), "rm").await
}

fn remove_local_blocking(path: &Path) -> std::io::Result<()> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) => Err(e),
    };

    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

async fn run_helper(
    mut cmd: tokio::process::Command,
    name: &str,
) -> Result<(), SandboxError> {
    let output = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| SandboxError::Setup {
            context: format!("spawn {name}"),
            source,
        })?;

    if output.status.success() {
        return Ok(());
    }

    Err(SandboxError::Command {
        command: name.to_string(),
        status: format!(
            "{}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::File;

    fn file(name: &str, content: &str) -> File {
        File {
            name: name.into(),
            ext: String::new(),
            content: content.into(),
        }
    }

    #[tokio::test]
    async fn materialize_nested_tree() {
        let root = tempfile::tempdir().unwrap();
        let tree = Directory {
            name: "ignored".into(),
            files: vec![
                File {
                    name: "main".into(),
                    ext: "py".into(),
                    content: "import pkg.util\n".into(),
                },
                file("empty.txt", ""),
            ],
            directories: vec![Directory {
                name: "pkg".into(),
                files: vec![file("util.py", "X = 1\n")],
                directories: vec![Directory {
                    name: "deep".into(),
                    ..Directory::default()
                }],
            }],
        };

        materialize(&CmdPrefix::default(), root.path(), &tree)
            .await
            .unwrap();

        let read = |p: &str| std::fs::read_to_string(root.path().join(p)).unwrap();
        assert_eq!(read("main.py"), "import pkg.util\n");
        assert_eq!(read("empty.txt"), "");
        assert_eq!(read("pkg/util.py"), "X = 1\n");
        assert!(root.path().join("pkg/deep").is_dir());
        assert!(!root.path().join("ignored").exists());
    }

    #[tokio::test]
    async fn materialize_rejects_escaping_names() {
        let root = tempfile::tempdir().unwrap();
        for bad in ["..", "a/b", "", "."] {
            let tree = Directory {
                files: vec![file(bad, "x")],
                ..Directory::default()
            };
            let err = materialize(&CmdPrefix::default(), root.path(), &tree)
                .await
                .unwrap_err();
            assert!(matches!(err, SandboxError::InvalidPath(_)), "{bad:?}");
        }
    }

    #[test]
    fn entry_point_must_stay_inside() {
        for ok in ["main.py", "src/app.js", "./main.py", "./pkg/test_utils-2.py"] {
            assert_eq!(checked_entry_point(ok).unwrap(), ok);
        }
        for bad in ["../main.py", "src/../../x.py", "/etc/passwd", "", ".", "./", "src/"] {
            assert!(checked_entry_point(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn entry_point_cannot_inject_config() {
        let hostile = "t.py\"\n}\nkeep_caps: true\ndisable_no_new_privs: true\nmount {\n src: \".\"\n dst: \"host\" is_bind: true rw: true\n fstype: \"x";
        for bad in [hostile, "main.py\"", "main\npy", "ma in.py", "main.py\\", "t.py#x", "\u{e9}.py"] {
            assert!(
                matches!(checked_entry_point(bad), Err(SandboxError::InvalidPath(_))),
                "{bad:?}"
            );
        }
    }

    #[tokio::test]
    async fn job_dir_remove_deletes_everything() {
        let jobs = tempfile::tempdir().unwrap();
        let job = JobDir::create(&CmdPrefix::default(), jobs.path(), Uuid::new_v4())
            .await
            .unwrap();
        let dir = job.path().to_path_buf();
        let cfg = job.config_path().to_path_buf();
        std::fs::write(dir.join("main.py"), "x").unwrap();
        std::fs::write(&cfg, "cfg").unwrap();

        job.remove().await;

        assert!(!dir.exists());
        assert!(!cfg.exists());
    }

    #[tokio::test]
    async fn job_dir_drop_cleans_up() {
        let jobs = tempfile::tempdir().unwrap();
        let job = JobDir::create(&CmdPrefix::default(), jobs.path(), Uuid::new_v4())
            .await
            .unwrap();
        let dir = job.path().to_path_buf();
        std::fs::write(dir.join("main.py"), "x").unwrap();

        drop(job);

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while dir.exists() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job directory removed in the background");
    }

    #[test]
    fn job_dir_drop_without_runtime_cleans_up() {
        let jobs = tempfile::tempdir().unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let job = rt
            .block_on(JobDir::create(&CmdPrefix::default(), jobs.path(), Uuid::new_v4()))
            .unwrap();
        drop(rt);
        let dir = job.path().to_path_buf();

        drop(job);

        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn create_fails_when_parent_is_a_file() {
        let jobs = tempfile::tempdir().unwrap();
        let blocker = jobs.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();

        let err = JobDir::create(&CmdPrefix::default(), &blocker, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Setup { .. }));
    }
}

//! Remote file browser
//!
//! Every path handed to the browser is relative to a profile's home directory.
//! Paths are normalized before any command runs and anything that would climb
//! out of the home directory is rejected.
//!
//! Operations:
//! - `list`, `stat`, `exists`: read only
//! - `mkdir`, `delete`, `rename`: mutate the remote tree

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::connection::CommandOutput;
use crate::error::FileError;
use crate::shell::{Shell, quote};

/// `stat` format shared by `stat` and `list`: type, size, mtime, mode, path
const STAT_FORMAT: &str = "%F|%s|%Y|%a|%n";

/// A single entry in a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    /// Path relative to the home directory
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub permissions: String,
}

/// Resolves a user supplied path against `home_dir`
///
/// Leading slashes are ignored, so `/` and the empty string both name the
/// home directory itself.
///
/// # Errors
/// Returns `FileError::PathTraversal` if the normalized path would leave
/// `home_dir`.
pub fn resolve_path(home_dir: &str, path: &str) -> Result<String, FileError> {
    let mut parts: Vec<&str> = Vec::new();

    for component in path.trim_start_matches('/').split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(FileError::PathTraversal(path.to_string()));
                }
            }
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return Ok(home_dir.to_string());
    }

    Ok(format!(
        "{}/{}",
        home_dir.trim_end_matches('/'),
        parts.join("/")
    ))
}

/// Renders the lower nine mode bits as `rwxrwxrwx`
pub fn format_permissions(mode: u32) -> String {
    const FLAGS: [char; 3] = ['r', 'w', 'x'];

    (0..9)
        .map(|bit| {
            if mode & (0o400 >> bit) != 0 {
                FLAGS[bit % 3]
            } else {
                '-'
            }
        })
        .collect()
}

/// Maps a failed command's stderr to the matching error kind
fn classify(output: &CommandOutput, path: &str) -> FileError {
    let stderr = output.stderr.trim();

    if stderr.contains("No such file or directory") {
        FileError::NotFound(path.to_string())
    } else if stderr.contains("Permission denied") {
        FileError::PermissionDenied(path.to_string())
    } else if stderr.contains("File exists") {
        FileError::AlreadyExists(path.to_string())
    } else if stderr.contains("Not a directory") {
        FileError::InvalidPath(path.to_string())
    } else {
        FileError::Command(stderr.to_string())
    }
}

/// Browses files under one profile's home directory
#[derive(Clone)]
pub struct FileBrowser {
    shell: Arc<dyn Shell>,
    home_dir: String,
}

impl FileBrowser {
    pub fn new(shell: Arc<dyn Shell>, home_dir: impl Into<String>) -> Self {
        Self {
            shell,
            home_dir: home_dir.into(),
        }
    }

    /// Lists a directory, directories first and then by name
    pub async fn list(&self, path: &str) -> Result<Vec<FileEntry>, FileError> {
        let dir = self.stat(path).await?;
        if !dir.is_dir {
            return Err(FileError::InvalidPath(format!("{} is not a directory", path)));
        }

        let resolved = resolve_path(&self.home_dir, path)?;
        let command = format!(
            "find {} -mindepth 1 -maxdepth 1 -exec stat -c {} {{}} +",
            quote(&resolved),
            quote(STAT_FORMAT)
        );
        let output = self.shell.run(&command).await?;
        if !output.success() {
            return Err(classify(&output, path));
        }

        let mut entries = output
            .stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| self.parse_stat_line(line))
            .collect::<Result<Vec<_>, _>>()?;

        entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));

        debug!("Listed {} entries in {}", entries.len(), resolved);
        Ok(entries)
    }

    /// Describes a single file or directory
    pub async fn stat(&self, path: &str) -> Result<FileEntry, FileError> {
        let resolved = resolve_path(&self.home_dir, path)?;
        let command = format!("stat -c {} -- {}", quote(STAT_FORMAT), quote(&resolved));

        let output = self.shell.run(&command).await?;
        if !output.success() {
            return Err(classify(&output, path));
        }

        let line = output
            .stdout
            .lines()
            .next()
            .ok_or_else(|| FileError::Parse(format!("empty stat output for {}", path)))?;
        self.parse_stat_line(line)
    }

    pub async fn exists(&self, path: &str) -> Result<bool, FileError> {
        let resolved = resolve_path(&self.home_dir, path)?;
        let output = self
            .shell
            .run(&format!("test -e {}", quote(&resolved)))
            .await?;

        match output.status {
            0 => Ok(true),
            1 => Ok(false),
            _ => Err(classify(&output, path)),
        }
    }

    /// Creates a directory, optionally with missing parents
    pub async fn mkdir(&self, path: &str, parents: bool) -> Result<(), FileError> {
        let resolved = resolve_path(&self.home_dir, path)?;
        if resolved == self.home_dir {
            return Err(FileError::AlreadyExists(path.to_string()));
        }

        let flag = if parents { "-p " } else { "" };
        let output = self
            .shell
            .run(&format!("mkdir {}-- {}", flag, quote(&resolved)))
            .await?;

        if !output.success() {
            return Err(classify(&output, path));
        }
        Ok(())
    }

    /// Removes a file, or a directory when `recursive` is set
    ///
    /// Without `recursive` only empty directories can be removed.
    pub async fn delete(&self, path: &str, recursive: bool) -> Result<(), FileError> {
        let resolved = resolve_path(&self.home_dir, path)?;
        if resolved == self.home_dir {
            return Err(FileError::InvalidPath(
                "refusing to delete the home directory".to_string(),
            ));
        }

        let entry = self.stat(path).await?;
        let command = match (entry.is_dir, recursive) {
            (true, true) => format!("rm -rf -- {}", quote(&resolved)),
            (true, false) => format!("rmdir -- {}", quote(&resolved)),
            (false, _) => format!("rm -f -- {}", quote(&resolved)),
        };

        let output = self.shell.run(&command).await?;
        if !output.success() {
            return Err(classify(&output, path));
        }
        Ok(())
    }

    /// Moves `from` to `to`; the destination must not exist
    pub async fn rename(&self, from: &str, to: &str) -> Result<(), FileError> {
        let source = resolve_path(&self.home_dir, from)?;
        let target = resolve_path(&self.home_dir, to)?;
        if source == self.home_dir || target == self.home_dir {
            return Err(FileError::InvalidPath(
                "cannot rename the home directory".to_string(),
            ));
        }

        if !self.exists(from).await? {
            return Err(FileError::NotFound(from.to_string()));
        }
        if self.exists(to).await? {
            return Err(FileError::AlreadyExists(to.to_string()));
        }

        let output = self
            .shell
            .run(&format!("mv -- {} {}", quote(&source), quote(&target)))
            .await?;
        if !output.success() {
            return Err(classify(&output, from));
        }
        Ok(())
    }

    fn parse_stat_line(&self, line: &str) -> Result<FileEntry, FileError> {
        let mut fields = line.splitn(5, '|');
        let (Some(kind), Some(size), Some(mtime), Some(mode), Some(full_path)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return Err(FileError::Parse(line.to_string()));
        };

        let size = size
            .parse::<u64>()
            .map_err(|_| FileError::Parse(line.to_string()))?;
        let mode = u32::from_str_radix(mode, 8).map_err(|_| FileError::Parse(line.to_string()))?;
        let modified = mtime
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0));

        let name = full_path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(full_path)
            .to_string();

        Ok(FileEntry {
            name,
            path: self.relative(full_path),
            is_dir: kind == "directory",
            size,
            modified,
            permissions: format_permissions(mode),
        })
    }

    fn relative(&self, full_path: &str) -> String {
        let home = self.home_dir.trim_end_matches('/');
        match full_path.strip_prefix(home) {
            Some(rest) if rest.is_empty() => "/".to_string(),
            Some(rest) if rest.starts_with('/') => rest.to_string(),
            _ => full_path.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ShellError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replies to commands by prefix and records what was run
    #[derive(Default)]
    struct FakeShell {
        replies: Vec<(&'static str, CommandOutput)>,
        commands: Mutex<Vec<String>>,
    }

    impl FakeShell {
        fn reply(mut self, prefix: &'static str, status: i32, stdout: &str, stderr: &str) -> Self {
            self.replies.push((
                prefix,
                CommandOutput {
                    status,
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                },
            ));
            self
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Shell for FakeShell {
        async fn run(&self, command: &str) -> Result<CommandOutput, ShellError> {
            self.commands.lock().unwrap().push(command.to_string());
            Ok(self
                .replies
                .iter()
                .find(|(prefix, _)| command.starts_with(prefix))
                .map(|(_, output)| output.clone())
                .unwrap_or_default())
        }

        async fn write_file(&self, _path: &str, _contents: &str) -> Result<(), ShellError> {
            Ok(())
        }

        fn is_remote(&self) -> bool {
            true
        }
    }

    fn browser(shell: FakeShell) -> (FileBrowser, Arc<FakeShell>) {
        let shell = Arc::new(shell);
        (FileBrowser::new(shell.clone(), "/home/alice"), shell)
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        assert!(matches!(
            resolve_path("/home/alice", "../../etc/passwd"),
            Err(FileError::PathTraversal(_))
        ));
        assert!(matches!(
            resolve_path("/home/alice", "a/../../b"),
            Err(FileError::PathTraversal(_))
        ));
        assert!(matches!(
            resolve_path("/home/alice", "/.."),
            Err(FileError::PathTraversal(_))
        ));
    }

    #[test]
    fn test_resolve_home_dir() {
        assert_eq!(resolve_path("/home/alice", "").unwrap(), "/home/alice");
        assert_eq!(resolve_path("/home/alice", "/").unwrap(), "/home/alice");
        assert_eq!(resolve_path("/home/alice", "a/..").unwrap(), "/home/alice");
    }

    #[test]
    fn test_resolve_normalizes() {
        assert_eq!(
            resolve_path("/home/alice", "/models/./llama//weights").unwrap(),
            "/home/alice/models/llama/weights"
        );
        assert_eq!(
            resolve_path("/home/alice/", "a/b/../c").unwrap(),
            "/home/alice/a/c"
        );
    }

    #[test]
    fn test_format_permissions() {
        assert_eq!(format_permissions(0o755), "rwxr-xr-x");
        assert_eq!(format_permissions(0o644), "rw-r--r--");
        assert_eq!(format_permissions(0), "---------");
        assert_eq!(format_permissions(0o777), "rwxrwxrwx");
        assert_eq!(format_permissions(0o40750), "rwxr-x---");
    }

    #[tokio::test]
    async fn test_stat_parses_entry() {
        let (browser, _) = browser(FakeShell::default().reply(
            "stat",
            0,
            "regular file|1024|1700000000|644|/home/alice/models/config.json\n",
            "",
        ));

        let entry = browser.stat("models/config.json").await.unwrap();
        assert_eq!(entry.name, "config.json");
        assert_eq!(entry.path, "/models/config.json");
        assert!(!entry.is_dir);
        assert_eq!(entry.size, 1024);
        assert_eq!(entry.permissions, "rw-r--r--");
        assert_eq!(entry.modified.unwrap().timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn test_stat_maps_errors() {
        let (missing, _) = browser(FakeShell::default().reply(
            "stat",
            1,
            "",
            "stat: cannot stat '/home/alice/nope': No such file or directory",
        ));
        assert!(matches!(
            missing.stat("nope").await,
            Err(FileError::NotFound(_))
        ));

        let (denied, _) = browser(FakeShell::default().reply(
            "stat",
            1,
            "",
            "stat: cannot stat '/home/alice/secret/x': Permission denied",
        ));
        assert!(matches!(
            denied.stat("secret/x").await,
            Err(FileError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_list_sorts_directories_first() {
        let (browser, shell) = browser(
            FakeShell::default()
                .reply("stat", 0, "directory|4096|1700000000|755|/home/alice\n", "")
                .reply(
                    "find",
                    0,
                    "regular file|10|1700000000|600|/home/alice/b.txt\n\
                     directory|4096|1700000000|755|/home/alice/zeta\n\
                     regular file|20|1700000000|644|/home/alice/a.txt\n",
                    "",
                ),
        );

        let entries = browser.list("").await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "a.txt", "b.txt"]);
        assert_eq!(entries[2].permissions, "rw-------");
        assert!(shell.commands()[1].starts_with("find /home/alice "));
    }

    #[tokio::test]
    async fn test_traversal_runs_nothing() {
        let (browser, shell) = browser(FakeShell::default());

        assert!(matches!(
            browser.list("../bob").await,
            Err(FileError::PathTraversal(_))
        ));
        assert!(matches!(
            browser.delete("../../etc", true).await,
            Err(FileError::PathTraversal(_))
        ));
        assert!(shell.commands().is_empty());
    }

    #[tokio::test]
    async fn test_delete_refuses_home() {
        let (browser, shell) = browser(FakeShell::default());
        assert!(matches!(
            browser.delete("/", true).await,
            Err(FileError::InvalidPath(_))
        ));
        assert!(shell.commands().is_empty());
    }

    #[tokio::test]
    async fn test_delete_directory_recursive() {
        let (browser, shell) = browser(FakeShell::default().reply(
            "stat",
            0,
            "directory|4096|1700000000|755|/home/alice/old\n",
            "",
        ));

        browser.delete("old", true).await.unwrap();
        assert_eq!(shell.commands()[1], "rm -rf -- /home/alice/old");
    }

    #[tokio::test]
    async fn test_exists_status_codes() {
        let (present, _) = browser(FakeShell::default().reply("test -e", 0, "", ""));
        assert!(present.exists("a").await.unwrap());

        let (absent, _) = browser(FakeShell::default().reply("test -e", 1, "", ""));
        assert!(!absent.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_rename_refuses_existing_target() {
        let (browser, shell) = browser(FakeShell::default().reply("test -e", 0, "", ""));

        assert!(matches!(
            browser.rename("a", "b").await,
            Err(FileError::AlreadyExists(_))
        ));
        assert!(!shell.commands().iter().any(|c| c.starts_with("mv")));
    }

    #[tokio::test]
    async fn test_mkdir_with_parents() {
        let (browser, shell) = browser(FakeShell::default());
        browser.mkdir("runs/2024/01", true).await.unwrap();
        assert_eq!(shell.commands(), vec!["mkdir -p -- /home/alice/runs/2024/01"]);
    }
}

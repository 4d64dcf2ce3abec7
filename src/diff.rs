use std::collections::BTreeMap;
use std::path::Path;

use tokio::process::Command;

use crate::error::CommitError;

/// Largest staged diff sent verbatim; beyond this only `--stat` is sent.
pub const MAX_DIFF_BYTES: usize = 512 * 1024;

/// Per-directory ceiling used when the diff is split into chunks.
pub const MAX_CHUNK_BYTES: usize = 100 * 1024;

/// Cap on the `--stat` summary that replaces an oversized diff.
pub const MAX_SUMMARY_BYTES: usize = 64 * 1024;

pub const TRUNCATION_NOTICE: &str = "[diff too large; showing --stat summary only]\n";

/// Staged changes under one directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffChunk {
    /// Immediate parent directory of the files, `.` for the repository root.
    pub dir: String,
    pub diff: String,
}

async fn git(repo: &Path, args: &[&str]) -> Result<String, CommitError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .await
        .map_err(|e| CommitError::Git {
            command: args.join(" "),
            message: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(CommitError::Git {
            command: args.join(" "),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn ensure_repository(repo: &Path) -> Result<(), CommitError> {
    let inside = Command::new("git")
        .args(["rev-parse", "--git-dir"])
        .current_dir(repo)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .is_ok_and(|s| s.success());
    if inside {
        Ok(())
    } else {
        Err(CommitError::NotARepository)
    }
}

/// Full staged diff of `repo`, or its `--stat` summary when larger than
/// [`MAX_DIFF_BYTES`].
pub async fn fetch_diff(repo: &Path) -> Result<String, CommitError> {
    ensure_repository(repo).await?;
    let diff = git(repo, &["diff", "--staged"]).await?;
    if diff.len() <= MAX_DIFF_BYTES {
        return Ok(diff);
    }
    tracing::info!(bytes = diff.len(), "staged diff too large, sending --stat summary");
    let stat = git(repo, &["diff", "--staged", "--stat"]).await?;
    Ok(summarize(&stat))
}

/// Staged diff split by immediate parent directory, ordered by directory.
/// Directories whose diff exceeds [`MAX_CHUNK_BYTES`] contribute their
/// `--stat` summary instead.
pub async fn fetch_diff_chunks(repo: &Path) -> Result<Vec<DiffChunk>, CommitError> {
    ensure_repository(repo).await?;
    // -z keeps non-ASCII paths unquoted. Without renames both sides of a
    // move land in their own directory's chunk.
    let names = git(repo, &["diff", "--staged", "--no-renames", "--name-only", "-z"]).await?;

    let mut chunks = Vec::new();
    for (dir, paths) in group_by_dir(names.split('\0')) {
        // --name-only prints paths relative to the top level, whatever the cwd.
        let pathspecs: Vec<String> = paths
            .iter()
            .map(|p| format!(":(top,literal){p}"))
            .collect();

        let mut args = vec!["diff", "--staged", "--no-renames", "--"];
        args.extend(pathspecs.iter().map(String::as_str));
        let mut diff = git(repo, &args).await?;

        if diff.len() > MAX_CHUNK_BYTES {
            tracing::info!(dir = %dir, bytes = diff.len(), "directory diff too large, sending --stat summary");
            let mut stat_args = vec!["diff", "--staged", "--no-renames", "--stat", "--"];
            stat_args.extend(pathspecs.iter().map(String::as_str));
            diff = summarize(&git(repo, &stat_args).await?);
        }

        if !diff.trim().is_empty() {
            chunks.push(DiffChunk { dir, diff });
        }
    }
    Ok(chunks)
}

/// Group repository-relative paths by their immediate parent directory.
pub fn group_by_dir<'a>(paths: impl IntoIterator<Item = &'a str>) -> BTreeMap<String, Vec<String>> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for path in paths {
        if path.trim().is_empty() {
            continue;
        }
        let dir = match path.rsplit_once('/') {
            Some((dir, _)) if !dir.is_empty() => dir.to_string(),
            _ => ".".to_string(),
        };
        groups.entry(dir).or_default().push(path.to_string());
    }
    groups
}

/// Prefix a `--stat` summary with the truncation notice, bounding its size.
pub fn summarize(stat: &str) -> String {
    let mut end = stat.len().min(MAX_SUMMARY_BYTES);
    while !stat.is_char_boundary(end) {
        end -= 1;
    }
    format!("{TRUNCATION_NOTICE}{}", &stat[..end])
}

//! Shared git utilities for resolving worktree/branch info from a working
//! directory. Merge-strategy execution is the client's job; the host only
//! reports enough for the exit-action UI.

use std::process::Stdio;

use tokio::process::Command;

use gangway_protocol::WorktreeInfo;

/// Resolve worktree details when `path` is a linked git worktree.
///
/// A linked worktree has a `--git-dir` distinct from `--git-common-dir`;
/// a plain checkout (or a non-repo) returns `None`.
pub async fn worktree_info(path: &str, merge_target: Option<String>) -> Option<WorktreeInfo> {
    let git_dir = run_git(&["rev-parse", "--git-dir"], path).await?;
    let common_dir = run_git(&["rev-parse", "--git-common-dir"], path).await?;
    if git_dir == common_dir {
        return None;
    }
    let branch = run_git(&["rev-parse", "--abbrev-ref", "HEAD"], path).await?;
    Some(WorktreeInfo {
        path: path.to_string(),
        branch,
        merge_target,
    })
}

/// Resolve just the git branch from a working directory.
pub async fn resolve_git_branch(path: &str) -> Option<String> {
    run_git(&["rev-parse", "--abbrev-ref", "HEAD"], path).await
}

async fn run_git(args: &[&str], cwd: &str) -> Option<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn non_repo_dir_has_no_worktree_info() {
        let dir = tempfile::tempdir().unwrap();
        let info = worktree_info(dir.path().to_str().unwrap(), None).await;
        assert!(info.is_none());
    }
}

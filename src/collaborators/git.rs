//! Git adapter for the version-control collaborator.
//!
//! Local object-database work (branching, committing, commit lookup) goes
//! through `git2`. Anything that talks to the remote or needs porcelain
//! behaviour (push, ls-remote, merge, diff) shells out to the `git` CLI.

use super::{MergeStrategy, VersionControl};
use crate::issue::PullRequest;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use git2::{BranchType, IndexAddOption, Oid, Repository, Signature, build::CheckoutBuilder};
use std::path::{Path, PathBuf};
use tokio::process::Command;

pub struct GitRepository {
    workdir: PathBuf,
    remote: String,
}

impl GitRepository {
    pub fn new(workdir: &Path, remote: &str) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            remote: remote.to_string(),
        }
    }

    fn open(&self) -> Result<Repository> {
        Repository::open(&self.workdir).context("Failed to open git repository")
    }

    /// URL of the configured remote, if any.
    pub fn remote_url(&self) -> Option<String> {
        let repo = self.open().ok()?;
        let remote = repo.find_remote(&self.remote).ok()?;
        remote.url().map(String::from)
    }

    /// Name of the checked-out branch.
    pub fn current_branch(&self) -> Result<String> {
        let repo = self.open()?;
        let head = repo.head().context("Repository has no HEAD")?;
        head.shorthand()
            .map(String::from)
            .context("HEAD is not a named branch")
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.join(" ")))
    }

    /// Run git and fail with its stderr on a non-zero exit.
    async fn git_ok(&self, args: &[&str]) -> Result<String> {
        let output = self.git(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn signature(repo: &Repository) -> Result<Signature<'static>> {
        match repo.signature() {
            Ok(sig) => Ok(sig.to_owned()),
            Err(_) => Signature::now("conductor", "conductor@localhost")
                .context("Failed to build commit signature"),
        }
    }

    async fn merge_into_base(&self, pr: &PullRequest, strategy: MergeStrategy) -> Result<()> {
        let head = pr.head_branch.as_str();
        let base = pr.base_branch.as_str();
        match strategy {
            MergeStrategy::Squash => {
                self.git_ok(&["checkout", base]).await?;
                self.git_ok(&["merge", "--squash", head]).await?;
                let message = format!("Resolve {} (#{})", pr.issue, pr.number);
                self.git_ok(&["commit", "-m", &message]).await?;
            }
            MergeStrategy::Merge => {
                self.git_ok(&["checkout", base]).await?;
                let message = format!("Merge pull request #{} from {}", pr.number, head);
                self.git_ok(&["merge", "--no-ff", "-m", &message, head]).await?;
            }
            MergeStrategy::Rebase => {
                self.git_ok(&["checkout", head]).await?;
                self.git_ok(&["rebase", base]).await?;
                self.git_ok(&["checkout", base]).await?;
                self.git_ok(&["merge", "--ff-only", head]).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl VersionControl for GitRepository {
    async fn create_branch(&self, base: &str, name: &str) -> Result<()> {
        let repo = self.open()?;

        if repo.find_branch(name, BranchType::Local).is_err() {
            let remote_ref = format!("refs/remotes/{}/{}", self.remote, base);
            let local_ref = format!("refs/heads/{}", base);
            let base_commit = repo
                .find_reference(&remote_ref)
                .or_else(|_| repo.find_reference(&local_ref))
                .with_context(|| format!("Base branch '{}' not found", base))?
                .peel_to_commit()
                .with_context(|| format!("Base branch '{}' does not point at a commit", base))?;
            repo.branch(name, &base_commit, false)
                .with_context(|| format!("Failed to create branch '{}'", name))?;
        }

        let refname = format!("refs/heads/{}", name);
        let target = repo.revparse_single(&refname)?;
        repo.checkout_tree(&target, Some(CheckoutBuilder::new().safe()))
            .with_context(|| format!("Failed to check out branch '{}'", name))?;
        repo.set_head(&refname)?;
        Ok(())
    }

    async fn branch_exists(&self, name: &str) -> Result<bool> {
        let output = self
            .git(&["ls-remote", "--exit-code", "--heads", &self.remote, name])
            .await?;
        match output.status.code() {
            Some(0) => Ok(true),
            // ls-remote --exit-code reports "no matching refs" as 2
            Some(2) => Ok(false),
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                bail!("Failed to query remote '{}': {}", self.remote, stderr.trim())
            }
        }
    }

    async fn commit(&self, paths: &[String], message: &str) -> Result<Option<String>> {
        let repo = self.open()?;
        let mut index = repo.index()?;

        let specs: Vec<&str> = if paths.is_empty() {
            vec!["*"]
        } else {
            paths.iter().map(String::as_str).collect()
        };
        index.add_all(specs.iter().copied(), IndexAddOption::DEFAULT, None)?;
        index.update_all(specs.iter().copied(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        if let Some(parent) = &parent
            && parent.tree_id() == tree_id
        {
            return Ok(None);
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = Self::signature(&repo)?;
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let oid = repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .context("Failed to create commit")?;
        Ok(Some(oid.to_string()))
    }

    async fn commit_exists(&self, sha: &str) -> Result<bool> {
        let Ok(oid) = Oid::from_str(sha) else {
            return Ok(false);
        };
        let repo = self.open()?;
        Ok(repo.find_commit(oid).is_ok())
    }

    async fn push(&self, branch: &str) -> Result<()> {
        self.git_ok(&["push", "-u", &self.remote, branch]).await?;
        Ok(())
    }

    async fn diff(&self, range: &str) -> Result<String> {
        self.git_ok(&["diff", range]).await
    }

    async fn changed_paths(&self, range: &str) -> Result<Vec<String>> {
        let out = self.git_ok(&["diff", "--name-only", range]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn merge(&self, pr: &PullRequest, strategy: MergeStrategy) -> Result<()> {
        let original_branch = self.current_branch().unwrap_or_else(|_| pr.head_branch.clone());

        if let Err(e) = self.merge_into_base(pr, strategy).await {
            tracing::warn!(
                pr = pr.number,
                strategy = %strategy,
                "Merge failed, restoring working copy: {:#}",
                e
            );
            // Best-effort recovery; the merge error is what gets reported.
            for abort in [["merge", "--abort"], ["rebase", "--abort"]] {
                let _ = self.git(&abort).await;
            }
            if let Err(checkout_err) = self.git_ok(&["checkout", &original_branch]).await {
                tracing::error!("Checkout recovery to {} failed: {:#}", original_branch, checkout_err);
            }
            return Err(e);
        }

        self.git_ok(&["push", &self.remote, &pr.base_branch]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn setup_repo() -> (GitRepository, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        (GitRepository::new(dir.path(), "origin"), dir)
    }

    #[tokio::test]
    async fn test_commit_returns_sha_and_skips_empty() {
        let (git, dir) = setup_repo();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let sha = git.commit(&[], "init").await.unwrap().unwrap();
        assert_eq!(sha.len(), 40);
        assert!(git.commit_exists(&sha).await.unwrap());

        let again = git.commit(&[], "nothing changed").await.unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn test_commit_leaves_state_directory_out() {
        use crate::config::ConductorConfig;
        use crate::issue::IssueId;
        use crate::orchestrator::{Checkpoint, CheckpointStore};

        let (git, dir) = setup_repo();
        let config = ConductorConfig::new(dir.path().to_path_buf()).unwrap();
        config.ensure_directories().unwrap();
        let store = CheckpointStore::open(&config.checkpoints_dir()).unwrap();
        store
            .save(&Checkpoint::new(IssueId(25), "conductor/issue-25"))
            .unwrap();
        fs::write(config.plans_dir().join("25.md"), "plan").unwrap();
        fs::write(dir.path().join("a.rs"), "fn a() {}").unwrap();
        fs::write(dir.path().join("a_test.rs"), "fn t() {}").unwrap();

        git.commit(&[".".to_string()], "work").await.unwrap().unwrap();

        let repo = Repository::open(dir.path()).unwrap();
        let tree = repo.head().unwrap().peel_to_tree().unwrap();
        let mut paths = Vec::new();
        tree.walk(git2::TreeWalkMode::PreOrder, |root, entry| {
            paths.push(format!("{}{}", root, entry.name().unwrap_or("")));
            git2::TreeWalkResult::Ok
        })
        .unwrap();
        assert_eq!(paths, vec!["a.rs", "a_test.rs"]);
    }

    #[tokio::test]
    async fn test_commit_exists_rejects_garbage() {
        let (git, _dir) = setup_repo();
        assert!(!git.commit_exists("not-a-sha").await.unwrap());
        assert!(
            !git.commit_exists("0123456789abcdef0123456789abcdef01234567")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_create_branch_from_local_base() {
        let (git, dir) = setup_repo();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        git.commit(&[], "init").await.unwrap();
        let base = git.current_branch().unwrap();

        git.create_branch(&base, "conductor/issue-1-test").await.unwrap();
        assert_eq!(git.current_branch().unwrap(), "conductor/issue-1-test");

        // Creating it again reuses the existing branch
        git.create_branch(&base, "conductor/issue-1-test").await.unwrap();
    }

    #[tokio::test]
    async fn test_create_branch_unknown_base_fails() {
        let (git, dir) = setup_repo();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        git.commit(&[], "init").await.unwrap();
        let err = git.create_branch("does-not-exist", "feature").await.unwrap_err();
        assert!(err.to_string().contains("does-not-exist"));
    }

    #[tokio::test]
    async fn test_commit_only_given_paths() {
        let (git, dir) = setup_repo();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        git.commit(&[], "init").await.unwrap();

        fs::write(dir.path().join("a.txt"), "a2").unwrap();
        fs::write(dir.path().join("b.txt"), "b").unwrap();
        git.commit(&["b.txt".to_string()], "add b").await.unwrap().unwrap();

        let repo = Repository::open(dir.path()).unwrap();
        let statuses = repo.statuses(None).unwrap();
        let dirty: Vec<String> = statuses
            .iter()
            .filter_map(|s| s.path().map(String::from))
            .collect();
        assert_eq!(dirty, vec!["a.txt"]);
    }
}

use std::path::{Path, PathBuf};

use git2::{
    BranchType, ErrorCode, IndexAddOption, Oid, Repository, ResetType, Signature, StatusOptions,
};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Result of integrating one branch into another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Source already contained in the target.
    UpToDate { commit: String },
    FastForward { commit: String },
    /// A merge commit was created.
    Merged { commit: String },
    /// Nothing was written; these paths conflict.
    Conflicts { files: Vec<String> },
}

impl MergeOutcome {
    pub fn commit(&self) -> Option<&str> {
        match self {
            MergeOutcome::UpToDate { commit }
            | MergeOutcome::FastForward { commit }
            | MergeOutcome::Merged { commit } => Some(commit),
            MergeOutcome::Conflicts { .. } => None,
        }
    }
}

/// Isolation provider over git branches and worktrees.
#[derive(Debug, Clone)]
pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        debug!(path = %repo_path.display(), "GitOps::new");
        let repo = Repository::discover(repo_path)?;
        let root = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo_path.to_path_buf());
        Ok(Self { repo_path: root })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::open(&self.repo_path)?)
    }

    /// Root of the main working tree.
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn signature(repo: &Repository) -> Result<Signature<'static>> {
        Ok(repo
            .signature()
            .or_else(|_| Signature::now("weir", "weir@localhost"))?)
    }

    /// Name of the branch checked out in the main worktree.
    pub fn current_branch(&self) -> Result<String> {
        let repo = self.repo()?;
        let head = repo.head()?;
        if head.is_branch() {
            if let Some(name) = head.shorthand() {
                return Ok(name.to_string());
            }
        }
        Err(Error::Config(
            "HEAD is detached; set baseline_branch explicitly".to_string(),
        ))
    }

    /// Full commit id at the tip of `branch`.
    pub fn branch_head(&self, branch: &str) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo
            .find_branch(branch, BranchType::Local)?
            .get()
            .peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let result = repo.find_branch(branch, BranchType::Local);
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Create `branch` at `start` (a branch name or commit) unless it exists.
    pub fn ensure_branch(&self, branch: &str, start: &str) -> Result<()> {
        if self.branch_exists(branch)? {
            return Ok(());
        }
        let repo = self.repo()?;
        let commit = repo.revparse_single(start)?.peel_to_commit()?;
        repo.branch(branch, &commit, false)?;
        debug!(branch, start, commit = %commit.id(), "branch created");
        Ok(())
    }

    /// Check out `branch` into a new worktree at `worktree_path`, creating
    /// the branch from `start` when it does not exist yet. An existing
    /// worktree at that path is reused.
    pub fn create_worktree(&self, branch: &str, worktree_path: &Path, start: &str) -> Result<()> {
        debug!(branch, path = %worktree_path.display(), start, "GitOps::create_worktree");
        if worktree_path.join(".git").exists() {
            debug!("worktree already present, reusing");
            return Ok(());
        }
        self.ensure_branch(branch, start)?;

        let repo = self.repo()?;
        let reference = repo.find_branch(branch, BranchType::Local)?.into_reference();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&reference));

        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Worktree names cannot contain slashes; branches here always do.
        let name = branch.replace('/', "-");
        repo.worktree(&name, worktree_path, Some(&opts))?;
        debug!(name = %name, "worktree created");
        Ok(())
    }

    /// Remove a worktree directory and prune its administrative files.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        debug!(path = %worktree_path.display(), "GitOps::remove_worktree");
        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }
        self.prune_worktrees()
    }

    /// Prune administrative entries for worktrees whose directory is gone.
    pub fn prune_worktrees(&self) -> Result<()> {
        let repo = self.repo()?;
        let worktrees = repo.worktrees()?;
        for name in worktrees.iter().flatten() {
            if let Ok(wt) = repo.find_worktree(name) {
                if !wt.path().exists() {
                    debug!(name, "pruning stale worktree");
                    if let Err(e) = wt.prune(Some(
                        git2::WorktreePruneOptions::new()
                            .valid(true)
                            .working_tree(true)
                            .locked(true),
                    )) {
                        warn!(name, error = %e, "worktree prune failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// Delete a local branch. Missing branches are not an error.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        let repo = self.repo()?;
        match repo.find_branch(branch, BranchType::Local) {
            Ok(mut b) => {
                if let Err(e) = b.delete() {
                    warn!(branch, error = %e, "failed to delete branch");
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Local branches whose name starts with `prefix`, sorted.
    pub fn branches_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let repo = self.repo()?;
        let mut names = Vec::new();
        for entry in repo.branches(Some(BranchType::Local))? {
            let (branch, _) = entry?;
            if let Some(name) = branch.name()? {
                if name.starts_with(prefix) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Paths (relative to the worktree root) that differ from `HEAD`,
    /// untracked files included.
    pub fn changed_files(&self, worktree_path: &Path) -> Result<Vec<PathBuf>> {
        let repo = Repository::open(worktree_path)?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        let mut files: Vec<PathBuf> = statuses
            .iter()
            .filter_map(|entry| entry.path().map(PathBuf::from))
            .collect();
        files.sort();
        files.dedup();
        Ok(files)
    }

    /// Whether tracked files in `worktree_path` differ from `HEAD`.
    /// Untracked files are ignored.
    pub fn has_tracked_changes(&self, worktree_path: &Path) -> Result<bool> {
        let repo = Repository::open(worktree_path)?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(false).include_ignored(false);
        let dirty = !repo.statuses(Some(&mut opts))?.is_empty();
        Ok(dirty)
    }

    /// Stage everything and commit on the worktree's branch. Returns the
    /// resulting head commit; with nothing to commit that is the old head.
    pub fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<String> {
        debug!(path = %worktree_path.display(), message, "GitOps::commit_all");
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["."].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        if let Some(parent) = &parent {
            if parent.tree_id() == tree_id {
                debug!("nothing to commit");
                return Ok(parent.id().to_string());
            }
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = Self::signature(&repo)?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        debug!(commit = %commit_id, "commit created");
        Ok(commit_id.to_string())
    }

    /// Throw away every uncommitted change, untracked files included.
    pub fn discard_changes(&self, worktree_path: &Path) -> Result<()> {
        let repo = Repository::open(worktree_path)?;
        let head = repo.head()?.peel_to_commit()?;
        repo.reset(head.as_object(), ResetType::Hard, None)?;
        remove_untracked(&repo, worktree_path)
    }

    /// Point the worktree's branch at `target` (branch or commit) and make
    /// the working tree match it exactly.
    pub fn reset_worktree_to(&self, worktree_path: &Path, target: &str) -> Result<String> {
        let repo = Repository::open(worktree_path)?;
        let commit = repo.revparse_single(target)?.peel_to_commit()?;
        repo.reset(commit.as_object(), ResetType::Hard, None)?;
        remove_untracked(&repo, worktree_path)?;
        debug!(path = %worktree_path.display(), target, commit = %commit.id(), "worktree reset");
        Ok(commit.id().to_string())
    }

    /// Integrate `source` into the branch `target` without touching any
    /// working tree.
    ///
    /// Fast-forwards when possible, otherwise writes a merge commit from an
    /// in-memory merge. On conflict nothing is written.
    pub fn merge_branch(&self, target: &str, source: &str, message: &str) -> Result<MergeOutcome> {
        let repo = self.repo()?;
        let target_ref_name = format!("refs/heads/{}", target);
        let ours = repo.find_reference(&target_ref_name)?.peel_to_commit()?;
        let theirs = repo.revparse_single(source)?.peel_to_commit()?;

        if ours.id() == theirs.id() || repo.graph_descendant_of(ours.id(), theirs.id())? {
            return Ok(MergeOutcome::UpToDate {
                commit: ours.id().to_string(),
            });
        }

        if repo.graph_descendant_of(theirs.id(), ours.id())? {
            repo.reference(
                &target_ref_name,
                theirs.id(),
                true,
                &format!("weir: fast-forward {} to {}", target, source),
            )?;
            debug!(target, source, commit = %theirs.id(), "fast-forward");
            return Ok(MergeOutcome::FastForward {
                commit: theirs.id().to_string(),
            });
        }

        let mut index = repo.merge_commits(&ours, &theirs, None)?;
        if index.has_conflicts() {
            let mut files = Vec::new();
            for conflict in index.conflicts()? {
                let conflict = conflict?;
                let path = conflict
                    .our
                    .as_ref()
                    .or(conflict.their.as_ref())
                    .or(conflict.ancestor.as_ref())
                    .map(|e| String::from_utf8_lossy(&e.path).to_string())
                    .unwrap_or_default();
                files.push(path);
            }
            files.sort();
            files.dedup();
            debug!(target, source, ?files, "merge conflicts");
            return Ok(MergeOutcome::Conflicts { files });
        }

        let tree_id = index.write_tree_to(&repo)?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Self::signature(&repo)?;
        let commit_id: Oid = repo.commit(None, &sig, &sig, message, &tree, &[&ours, &theirs])?;
        repo.reference(
            &target_ref_name,
            commit_id,
            true,
            &format!("weir: merge {} into {}", source, target),
        )?;
        debug!(target, source, commit = %commit_id, "merge commit created");
        Ok(MergeOutcome::Merged {
            commit: commit_id.to_string(),
        })
    }

    /// Force `branch` to point at `target`.
    pub fn set_branch(&self, branch: &str, target: &str) -> Result<()> {
        let repo = self.repo()?;
        let commit = repo.revparse_single(target)?.peel_to_commit()?;
        repo.reference(
            &format!("refs/heads/{}", branch),
            commit.id(),
            true,
            &format!("weir: reset {} to {}", branch, target),
        )?;
        Ok(())
    }

    /// Whether `ancestor` is reachable from the tip of `branch`.
    pub fn branch_contains(&self, branch: &str, ancestor: &str) -> Result<bool> {
        let repo = self.repo()?;
        let tip = repo
            .find_branch(branch, BranchType::Local)?
            .get()
            .peel_to_commit()?
            .id();
        let other = repo.revparse_single(ancestor)?.peel_to_commit()?.id();
        Ok(tip == other || repo.graph_descendant_of(tip, other)?)
    }

    /// Make the main working tree match `HEAD` after its branch moved.
    /// Untracked files are left alone.
    pub fn refresh_checkout(&self) -> Result<()> {
        let repo = self.repo()?;
        let mut opts = git2::build::CheckoutBuilder::new();
        opts.force();
        repo.checkout_head(Some(&mut opts))?;
        debug!(path = %self.repo_path.display(), "main checkout refreshed");
        Ok(())
    }

    /// The main worktree has `branch` checked out and no tracked changes.
    pub fn main_worktree_clean_on(&self, branch: &str) -> Result<bool> {
        let on_branch = matches!(self.current_branch(), Ok(b) if b == branch);
        Ok(on_branch && !self.has_tracked_changes(&self.repo_path)?)
    }
}

fn remove_untracked(repo: &Repository, worktree_path: &Path) -> Result<()> {
    // Untracked directories are reported once, as `dir/`.
    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .recurse_untracked_dirs(false)
        .include_ignored(false);
    let statuses = repo.statuses(Some(&mut opts))?;
    for entry in statuses.iter() {
        if !entry.status().is_wt_new() {
            continue;
        }
        if let Some(path) = entry.path() {
            let full = worktree_path.join(path);
            if full.is_dir() {
                std::fs::remove_dir_all(&full)?;
            } else if full.exists() {
                std::fs::remove_file(&full)?;
            }
        }
    }
    Ok(())
}

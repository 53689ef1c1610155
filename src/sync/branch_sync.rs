//! Keeps the sync branch's head identical in the user's checkout and the
//! sandbox.
//!
//! Only the two loose ref files are watched. Whichever side moved gets
//! fast-forwarded into the other; anything that isn't a fast-forward pauses
//! the session until the user merges by hand.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, trace};

use super::error::{ExpectedStartupBlocker, Result, SyncError};
use super::notice::{is_pause_necessary, Notice};
use super::reconciler::SubPathReconciler;
use crate::environment::Environment;
use crate::git::{GitError, GitRepo};

pub const BRANCH_SYNC_TAG: &str = "local_git_sync";

/// Ref events without a content change before the watcher is considered broken
const SUSPICIOUS_EVENT_COUNT: u64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    User,
    Agent,
}

impl Side {
    fn other(self) -> Side {
        match self {
            Side::User => Side::Agent,
            Side::Agent => Side::User,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::User => f.write_str("user"),
            Side::Agent => f.write_str("agent"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchRelationship {
    Equal,
    AgentAhead,
    UserAhead,
    Diverged,
}

/// The sandbox's checkout, driven through `git -C <workspace>` in the
/// environment
#[derive(Debug, Clone)]
pub struct AgentCheckout {
    environment: Arc<dyn Environment>,
    branch: String,
}

impl AgentCheckout {
    pub fn new(environment: Arc<dyn Environment>, branch: impl Into<String>) -> Self {
        Self {
            environment,
            branch: branch.into(),
        }
    }

    pub fn refs_dir(&self) -> PathBuf {
        self.environment
            .workspace_dir()
            .join(".git")
            .join("refs")
            .join("heads")
    }

    pub fn ref_file(&self) -> PathBuf {
        self.refs_dir().join(&self.branch)
    }

    fn head_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }

    fn run_git(&self, args: &[&str]) -> Result<crate::environment::CommandOutput> {
        let workspace = self.environment.workspace_dir().to_string_lossy().into_owned();
        let command: Vec<String> = ["git", "-C", workspace.as_str()]
            .iter()
            .chain(args.iter())
            .map(|s| s.to_string())
            .collect();
        trace!("sandbox git {}", args.join(" "));
        Ok(self.environment.run_command(&command)?)
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let output = self.run_git(args)?;
        if !output.success() {
            return Err(GitError::CommandFailed {
                args: args.join(" "),
                code: output.exit_code,
                stderr: output.stderr,
            }
            .into());
        }
        Ok(output.stdout)
    }

    pub fn head_commit(&self) -> Result<String> {
        let rev = format!("{}^{{commit}}", self.head_ref());
        Ok(self.git(&["rev-parse", "--verify", &rev])?.trim().to_string())
    }

    pub fn current_branch(&self) -> Result<Option<String>> {
        let output = self.run_git(&["symbolic-ref", "--quiet", "--short", "HEAD"])?;
        if !output.success() {
            return Ok(None);
        }
        Ok(Some(output.stdout.trim().to_string()))
    }

    /// True if `commit` is an ancestor of this branch's head. Unknown commits
    /// are not.
    pub fn contains(&self, commit: &str) -> Result<bool> {
        let head_ref = self.head_ref();
        let output = self.run_git(&["merge-base", "--is-ancestor", commit, &head_ref])?;
        Ok(output.success())
    }

    pub fn read_ref(&self) -> Result<Option<String>> {
        Ok(self.environment.read_file(&self.ref_file())?)
    }

    pub fn ref_exists(&self) -> Result<bool> {
        Ok(self.environment.exists(&self.ref_file())?)
    }

    /// Packed refs have no file to watch, so write the loose one
    pub fn ensure_loose_ref(&self) -> Result<()> {
        if self.ref_exists()? {
            return Ok(());
        }
        let commit = self.head_commit()?;
        self.environment
            .write_file(&self.ref_file(), &format!("{}\n", commit))?;
        debug!(branch = %self.branch, "Wrote loose branch ref in sandbox");
        Ok(())
    }

    fn reset_mixed(&self) -> Result<()> {
        let head_ref = self.head_ref();
        self.git(&["reset", "--mixed", &head_ref])?;
        Ok(())
    }

    fn delete_branch(&self, branch: &str) -> Result<()> {
        self.git(&["branch", "-D", branch])?;
        Ok(())
    }
}

/// Fast-forwards one sync branch between the user's checkout and the sandbox
#[derive(Debug)]
pub struct BranchSyncReconciler {
    branch: String,
    user: GitRepo,
    agent: AgentCheckout,
    last_seen_contents: HashMap<PathBuf, String>,
    events_since_last_change: u64,
    is_suspicious_watcher_reported: bool,
}

impl BranchSyncReconciler {
    /// Make sure both sides have the branch as a loose ref and remember what
    /// the ref files say right now.
    pub fn build(
        branch: &str,
        user: GitRepo,
        environment: Arc<dyn Environment>,
    ) -> Result<Self> {
        let agent = AgentCheckout::new(environment, branch);
        if !user.branch_exists(branch)? {
            debug!(branch, "Fetching sync branch into local repo");
            let head_ref = format!("refs/heads/{}", branch);
            user.fetch(&agent.environment.git_remote(), &head_ref, &head_ref, false)
                .map_err(|e| SyncError::Startup {
                    message: format!(
                        "Likely invalid branch: failed to fetch {} from the sandbox: {}",
                        branch, e
                    ),
                    task_id: None,
                    task_branch: Some(branch.to_string()),
                })?;
        }
        let user_ref = user.ensure_loose_branch_ref(branch)?;
        agent.ensure_loose_ref()?;

        let mut last_seen_contents = HashMap::new();
        let user_content = std::fs::read_to_string(&user_ref).ok();
        let agent_content = agent.read_ref()?;
        let (Some(user_content), Some(agent_content)) = (user_content, agent_content) else {
            return Err(SyncError::Startup {
                message: "Branch refs exist but could not be read".to_string(),
                task_id: None,
                task_branch: Some(branch.to_string()),
            });
        };
        last_seen_contents.insert(user_ref, user_content.trim().to_string());
        last_seen_contents.insert(agent.ref_file(), agent_content.trim().to_string());

        Ok(Self {
            branch: branch.to_string(),
            user,
            agent,
            last_seen_contents,
            events_since_last_change: 0,
            is_suspicious_watcher_reported: false,
        })
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn user_repo(&self) -> &GitRepo {
        &self.user
    }

    pub fn user_ref_file(&self) -> PathBuf {
        self.user.branch_ref_file(&self.branch)
    }

    pub fn agent_ref_file(&self) -> PathBuf {
        self.agent.ref_file()
    }

    fn head_commit(&self, side: Side) -> Result<String> {
        match side {
            Side::User => Ok(self.user.branch_head_commit(&self.branch)?),
            Side::Agent => self.agent.head_commit(),
        }
    }

    fn current_branch(&self, side: Side) -> Result<Option<String>> {
        match side {
            Side::User => Ok(self.user.current_branch()?),
            Side::Agent => self.agent.current_branch(),
        }
    }

    fn read_ref(&self, side: Side) -> Option<String> {
        let content = match side {
            Side::User => std::fs::read_to_string(self.user_ref_file()).ok(),
            Side::Agent => self.agent.read_ref().ok().flatten(),
        };
        content.map(|c| c.trim().to_string())
    }

    /// Compare the two heads. The sandbox's head is fetched into a private
    /// tracking ref so the comparison runs against local history.
    pub fn relationship(&self) -> Result<BranchRelationship> {
        let user_head = self.head_commit(Side::User)?;
        let agent_head = self
            .user
            .fetch_agent_branch(&self.agent.environment.git_remote(), &self.branch)?;
        if user_head == agent_head {
            return Ok(BranchRelationship::Equal);
        }
        if self.user.is_ancestor(&user_head, &agent_head)? {
            return Ok(BranchRelationship::AgentAhead);
        }
        if self.user.is_ancestor(&agent_head, &user_head)? {
            return Ok(BranchRelationship::UserAhead);
        }
        Ok(BranchRelationship::Diverged)
    }

    fn is_head_different(&self) -> Result<bool> {
        Ok(self.head_commit(Side::User)? != self.head_commit(Side::Agent)?)
    }

    fn summarize_heads(&self) -> String {
        let short = |side| {
            self.head_commit(side)
                .map(|c| c.chars().take(8).collect::<String>())
                .unwrap_or_else(|_| "unknown".to_string())
        };
        format!("user@{} agent@{}", short(Side::User), short(Side::Agent))
    }

    fn missing_ref_notice(&self) -> Option<Notice> {
        let missing: Vec<String> = [
            (self.user_ref_file(), self.user_ref_file().exists()),
            (
                self.agent_ref_file(),
                self.agent.ref_exists().unwrap_or(false),
            ),
        ]
        .into_iter()
        .filter(|(_, exists)| !exists)
        .map(|(path, _)| path.display().to_string())
        .collect();
        if missing.is_empty() {
            return None;
        }
        Some(Notice::pause(
            BRANCH_SYNC_TAG,
            format!(
                "ref for {} missing in repo {}",
                self.branch,
                missing.join(" and ")
            ),
        ))
    }

    fn divergence_notices(&self) -> Result<Vec<Notice>> {
        if !self.is_head_different()? {
            return Ok(Vec::new());
        }
        if self.relationship()? != BranchRelationship::Diverged {
            return Ok(Vec::new());
        }
        let short = |commit: String| commit.chars().take(8).collect::<String>();
        Ok(vec![Notice::pause(
            BRANCH_SYNC_TAG,
            format!(
                "local head@{} and agent head@{} require manual merging",
                short(self.head_commit(Side::User)?),
                short(self.head_commit(Side::Agent)?)
            ),
        )])
    }

    /// Bring `from`'s commits into `to`. Fetches refuse non-fast-forwards.
    fn bring_commits_into(&self, to: Side, is_updating_checked_out_head: bool) -> Result<()> {
        let head_ref = format!("refs/heads/{}", self.branch);
        let remote = self.agent.environment.git_remote();
        match to {
            Side::User => {
                self.user
                    .fetch(&remote, &head_ref, &head_ref, is_updating_checked_out_head)?;
            }
            Side::Agent => {
                let tmp_branch = uuid::Uuid::new_v4().to_string();
                self.user
                    .push(&remote, &head_ref, &format!("refs/heads/{}", tmp_branch))?;
                let refspec = format!("{}:{}", tmp_branch, head_ref);
                let mut args = vec!["fetch", "--show-forced-updates"];
                if is_updating_checked_out_head {
                    args.push("--update-head-ok");
                }
                args.extend([".", refspec.as_str()]);
                let fetched = self.agent.git(&args).map(|_| ());
                if let Err(e) = self.agent.delete_branch(&tmp_branch) {
                    debug!("Failed to delete temporary branch {}: {}", tmp_branch, e);
                }
                fetched?;
            }
        }
        Ok(())
    }

    fn reset_mixed(&self, side: Side) -> Result<()> {
        match side {
            Side::User => Ok(self.user.reset_mixed(&format!("refs/heads/{}", self.branch))?),
            Side::Agent => self.agent.reset_mixed(),
        }
    }

    /// Fetch into `to` and, if it has the branch checked out and the head
    /// moved, `reset --mixed` so the index follows while the working tree
    /// (already synced) stays as-is.
    pub fn fetch_and_reset_mixed(&self, to: Side) -> Result<()> {
        let head_before = self.head_commit(to)?;
        let is_checked_out = self.current_branch(to)?.as_deref() == Some(self.branch.as_str());
        if !is_checked_out {
            debug!(
                side = %to,
                branch = %self.branch,
                "Sync branch not checked out, just fetching"
            );
        }

        self.bring_commits_into(to, is_checked_out)?;
        if !is_checked_out {
            return Ok(());
        }
        if head_before == self.head_commit(to)? {
            debug!(side = %to, "No change in head after fetch");
            return Ok(());
        }
        if self.current_branch(to)?.as_deref() != Some(self.branch.as_str()) {
            debug!(side = %to, "Branch switched during fetch, not resetting");
            return Ok(());
        }

        debug!(side = %to, "Head changed after fetch, running reset --mixed");
        self.reset_mixed(to)
    }

    fn fetch_and_reset_mixed_with_reverse_retry(&self, to: Side) -> Result<()> {
        match self.fetch_and_reset_mixed(to) {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(
                    "Fetch into {} failed, attempting the reverse direction",
                    to
                );
                trace!("Fetch into {} failed because: {}", to, e);
                self.fetch_and_reset_mixed(to.other())?;
                debug!("Reverse fetch into {} succeeded", to.other());
                Ok(())
            }
        }
    }

    /// Returns whether anything was synced
    pub fn sync_heads(&self, changed_path: &Path) -> Result<bool> {
        if let Some(notice) = self.missing_ref_notice() {
            return Err(SyncError::NewNotices(vec![notice]));
        }
        if !self.is_head_different()? {
            trace!(
                path = %changed_path.display(),
                "Heads equal despite change signal, skipping ({})",
                self.summarize_heads()
            );
            return Ok(false);
        }

        let summary = self.summarize_heads();
        if changed_path == self.user_ref_file() {
            debug!(branch = %self.branch, "User change triggered head sync ({})", summary);
            self.fetch_and_reset_mixed_with_reverse_retry(Side::Agent)?;
        } else if changed_path == self.agent_ref_file() {
            debug!(branch = %self.branch, "Agent change triggered head sync ({})", summary);
            self.fetch_and_reset_mixed_with_reverse_retry(Side::User)?;
        } else {
            return Err(SyncError::State {
                message: format!("{}: unexpected changed path {}", BRANCH_SYNC_TAG, changed_path.display()),
                task_id: None,
                current_state: None,
                expected_state: None,
            });
        }
        debug!("Head sync complete: {}", self.summarize_heads());
        Ok(true)
    }

    /// Startup preflight. Every blocker found is reported at once.
    pub fn validate_branches_are_safely_syncable(&self) -> Result<()> {
        let mut messages = Vec::new();
        let mut blockers = Vec::new();

        match self.relationship()? {
            BranchRelationship::Equal | BranchRelationship::AgentAhead => {}
            BranchRelationship::UserAhead => {
                messages.push(format!(
                    "Must push to agent: There are local commits to {} that would be lost.",
                    self.branch
                ));
                blockers.push(ExpectedStartupBlocker::UserBranchAheadOfAgent);
            }
            BranchRelationship::Diverged => {
                messages.push(format!(
                    "Must merge into agent: local and agent histories have diverged for {}.",
                    self.branch
                ));
                blockers.push(ExpectedStartupBlocker::BranchesDiverged);
            }
        }

        let status = self.user.status()?;
        if !status.is_clean_and_safe_to_operate_on() {
            messages.push(format!(
                "Local git state must be pristine with no in-progress operations or untracked files.\nCurrent status:\n{}",
                status.describe()
            ));
            blockers.push(ExpectedStartupBlocker::UserGitStateDirty);
        }

        if blockers.is_empty() {
            return Ok(());
        }
        Err(SyncError::ExpectedStartup {
            message: format!("Cannot start sync: {}", messages.join("Also: ")),
            blockers,
            task_branch: self.branch.clone(),
        })
    }

    /// Mirror the sandbox's branch into the user's repo, switching to it if
    /// the user started elsewhere
    pub fn mirror_agent_into_user(&self, is_switching_branches: bool) -> Result<()> {
        self.fetch_and_reset_mixed(Side::User)?;
        if is_switching_branches {
            self.user.checkout_branch(&self.branch)?;
        }
        Ok(())
    }

    fn fallback_to_cache(&mut self, path: &Path, content: Option<String>) -> Option<String> {
        let Some(content) = content else {
            trace!(path = %path.display(), "Ref file missing, using last seen content");
            return self.last_seen_contents.get(path).cloned();
        };
        if self.last_seen_contents.get(path) != Some(&content) {
            self.last_seen_contents.insert(path.to_path_buf(), content.clone());
            self.events_since_last_change = 0;
        }
        Some(content)
    }

    fn track_event_and_report_if_suspicious(&mut self) {
        self.events_since_last_change += 1;
        if self.is_suspicious_watcher_reported
            || self.events_since_last_change < SUSPICIOUS_EVENT_COUNT
        {
            return;
        }
        error!(
            events = self.events_since_last_change,
            "Suspicious local sync state: too many branch ref events without a change"
        );
        self.is_suspicious_watcher_reported = true;
    }
}

impl SubPathReconciler for BranchSyncReconciler {
    fn tag(&self) -> &str {
        BRANCH_SYNC_TAG
    }

    /// Only the two ref files, and only while their contents disagree
    fn is_relevant_subpath(&mut self, path: &Path) -> bool {
        let user_ref = self.user_ref_file();
        let agent_ref = self.agent_ref_file();
        if path != user_ref && path != agent_ref {
            return false;
        }
        let user_content = self.read_ref(Side::User);
        let agent_content = self.read_ref(Side::Agent);
        let user_content = self.fallback_to_cache(&user_ref, user_content);
        let agent_content = self.fallback_to_cache(&agent_ref, agent_content);

        if user_content == agent_content {
            self.track_event_and_report_if_suspicious();
            debug!(
                events_since_last_change = self.events_since_last_change,
                "Ignoring ref event: no divergence"
            );
            return false;
        }
        true
    }

    fn dirs_to_watch(&self) -> Vec<PathBuf> {
        vec![self.user.head_refs_dir(), self.agent.refs_dir()]
    }

    fn local_dirs_to_watch(&self) -> Vec<PathBuf> {
        vec![self.user.head_refs_dir()]
    }

    fn environment_dirs_to_watch(&self) -> Vec<PathBuf> {
        vec![self.agent.refs_dir()]
    }

    fn notices(&mut self) -> Vec<Notice> {
        if let Some(notice) = self.missing_ref_notice() {
            return vec![notice];
        }
        match self.divergence_notices() {
            Ok(notices) => notices,
            Err(e) => vec![Notice::pause(
                BRANCH_SYNC_TAG,
                format!("could not compare {} heads: {}", self.branch, e),
            )],
        }
    }

    fn handle_path_changes(&mut self, paths: &[PathBuf]) -> Result<()> {
        let Some(changed) = paths.first() else {
            return Ok(());
        };
        match self.sync_heads(changed) {
            Ok(_) => Ok(()),
            Err(e @ (SyncError::Git(_) | SyncError::Environment(_))) => {
                let notices = self.notices();
                if is_pause_necessary(&notices) {
                    return Err(SyncError::NewNotices(notices));
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

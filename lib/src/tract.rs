// Copyright 2024-2025 The Tract Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The per-tract handle: commit, branch, switch, reset, checkout, compile,
//! and generate, plus entry points into the structural operations. One
//! handle owns one store session and serializes its operations in call
//! order; open one handle per task for parallelism.

use std::cell::Cell;
use std::cell::RefCell;
use std::num::NonZeroUsize;
use std::sync::Arc;

use clru::CLruCache;
use thiserror::Error;
use tracing::debug;
use tracing::instrument;

use crate::annotate::Annotation;
use crate::annotate::Priority;
use crate::annotate::annotation_fingerprint;
use crate::commit::Commit;
use crate::commit::CommitData;
use crate::commit::CommitOp;
use crate::commit::GenerationUsage;
use crate::commit::MillisSinceEpoch;
use crate::compile::CompileCacheKey;
use crate::compile::CompiledContext;
use crate::compile::ContextCompiler;
use crate::compress;
use crate::compress::CompressOptions;
use crate::compress::CompressOutcome;
use crate::compress::PendingCompress;
use crate::config::LlmConfig;
use crate::config::OperationConfigs;
use crate::content::DialogueRole;
use crate::content::Payload;
use crate::dag_walk;
use crate::gc;
use crate::gc::GcOptions;
use crate::gc::GcStats;
use crate::hooks::HookOutcome;
use crate::hooks::HookRegistry;
use crate::llm::ChatResponse;
use crate::llm::LlmClient;
use crate::llm::LlmError;
use crate::llm::RetryPolicy;
use crate::llm::chat_with_retry;
use crate::merge;
use crate::merge::MergeOutcome;
use crate::merge::MergeStrategy;
use crate::object_id::CommitId;
use crate::object_id::TractId;
use crate::rewrite;
use crate::rewrite::ImportOutcome;
use crate::rewrite::RebaseOutcome;
use crate::spawn;
use crate::spawn::Curation;
use crate::spawn::SpawnMode;
use crate::store::Head;
use crate::store::Store;
use crate::store::StoreError;
use crate::tokenize::Tokenizer;

const COMPILE_CACHE_CAPACITY: usize = 32;

/// The injected external collaborators a handle needs.
#[derive(Clone, Debug)]
pub struct Capabilities {
    pub tokenizer: Arc<dyn Tokenizer>,
    pub llm: Arc<dyn LlmClient>,
    pub compiler: Arc<dyn ContextCompiler>,
}

#[derive(Debug, Error)]
pub enum TractError {
    #[error("HEAD is detached; attach a branch before mutating")]
    DetachedHead,
    #[error("Branch {0} not found")]
    UnknownBranch(String),
    #[error("Branch {0} already exists")]
    BranchExists(String),
    #[error("Cannot delete the branch HEAD is attached to ({0})")]
    DeleteCurrentBranch(String),
    #[error("Edit target {0} is not reachable from HEAD")]
    InvalidEditTarget(CommitId),
    #[error("EDIT commits require an edit target; APPEND commits forbid one")]
    EditTargetMismatch,
    #[error("Reset target {0} is not an ancestor of the current head")]
    NotAnAncestor(CommitId),
    #[error("{operation} rejected by hook: {reason}")]
    HookRejected {
        operation: &'static str,
        reason: String,
    },
    #[error("Merge conflict: {reason}")]
    MergeConflict { reason: String },
    #[error("Importing an edit whose target {0} is not in the destination chain")]
    EditBeforeTarget(CommitId),
    #[error("Conflicting options: {0}")]
    ConflictingOptions(&'static str),
    #[error("Pending {0} is stale; the head moved since it was drafted")]
    StalePending(&'static str),
    #[error("Tract has no commits yet")]
    EmptyTract,
    #[error("Tract {child} is not a spawn descendant of {parent}")]
    NotSpawnRelated { parent: TractId, child: TractId },
    #[error("Cycle detected in the spawn graph at {0}")]
    SpawnCycle(TractId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Llm(#[from] LlmError),
}

pub type TractResult<T> = Result<T, TractError>;

/// Soft keeps forward commits provenance-protected; hard leaves them to the
/// orphan collector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetMode {
    Soft,
    Hard,
}

/// A handle on one tract within a shared store.
#[derive(Debug)]
pub struct Tract {
    store: Arc<Store>,
    id: TractId,
    capabilities: Capabilities,
    configs: OperationConfigs,
    hooks: HookRegistry,
    retry: RetryPolicy,
    compile_cache: RefCell<CLruCache<CompileCacheKey, Arc<CompiledContext>>>,
    verify_cache: Cell<bool>,
}

impl Tract {
    pub(crate) fn new(
        store: Arc<Store>,
        id: TractId,
        capabilities: Capabilities,
        configs: OperationConfigs,
    ) -> Self {
        Self {
            store,
            id,
            capabilities,
            configs,
            hooks: HookRegistry::default(),
            retry: RetryPolicy::default(),
            compile_cache: RefCell::new(CLruCache::new(
                NonZeroUsize::new(COMPILE_CACHE_CAPACITY).unwrap(),
            )),
            verify_cache: Cell::new(false),
        }
    }

    pub fn id(&self) -> &TractId {
        &self.id
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.capabilities.tokenizer
    }

    pub fn llm(&self) -> &Arc<dyn LlmClient> {
        &self.capabilities.llm
    }

    pub fn compiler(&self) -> &Arc<dyn ContextCompiler> {
        &self.capabilities.compiler
    }

    pub(crate) fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn configs(&self) -> &OperationConfigs {
        &self.configs
    }

    pub fn configs_mut(&mut self) -> &mut OperationConfigs {
        &mut self.configs
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn set_retry_policy(&mut self, policy: RetryPolicy) {
        self.retry = policy;
    }

    /// Recompute every compile-cache hit and assert it matches. Debug aid.
    pub fn set_verify_cache(&self, verify: bool) {
        self.verify_cache.set(verify);
    }
}

// HEAD, refs, history
impl Tract {
    pub fn head(&self) -> TractResult<Head> {
        Ok(self.store.head(&self.id)?)
    }

    pub fn head_commit_id(&self) -> TractResult<Option<CommitId>> {
        Ok(self.store.head_commit(&self.id)?)
    }

    pub fn head_commit(&self) -> TractResult<Option<Commit>> {
        self.head_commit_id()?
            .map(|id| self.store.get_commit(&id).map_err(TractError::from))
            .transpose()
    }

    /// The branch HEAD is attached to, or `DetachedHead`.
    pub fn current_branch(&self) -> TractResult<String> {
        match self.head()? {
            Head::Attached { branch } => Ok(branch),
            Head::Detached { .. } => Err(TractError::DetachedHead),
        }
    }

    /// Creates a branch at the current head.
    pub fn branch(&self, name: &str) -> TractResult<()> {
        let head = self.head_commit_id()?.ok_or(TractError::EmptyTract)?;
        self.branch_at(name, &head)
    }

    pub fn branch_at(&self, name: &str, commit: &CommitId) -> TractResult<()> {
        if self.store.branch_exists(&self.id, name)? {
            return Err(TractError::BranchExists(name.to_string()));
        }
        self.store.set_branch(&self.id, name, commit)?;
        Ok(())
    }

    /// Attaches HEAD to an existing branch.
    pub fn switch(&self, name: &str) -> TractResult<()> {
        if !self.store.branch_exists(&self.id, name)? {
            return Err(TractError::UnknownBranch(name.to_string()));
        }
        self.store.set_head(
            &self.id,
            &Head::Attached {
                branch: name.to_string(),
            },
        )?;
        Ok(())
    }

    /// Enters detached HEAD at `commit` for read-only compiles.
    pub fn checkout(&self, commit: &CommitId) -> TractResult<()> {
        self.store.set_head(
            &self.id,
            &Head::Detached {
                commit: commit.clone(),
            },
        )?;
        Ok(())
    }

    pub fn delete_branch(&self, name: &str) -> TractResult<()> {
        if let Head::Attached { branch } = self.head()?
            && branch == name
        {
            return Err(TractError::DeleteCurrentBranch(branch));
        }
        match self.store.delete_branch(&self.id, name) {
            Err(StoreError::UnknownRef { .. }) => Err(TractError::UnknownBranch(name.to_string())),
            other => Ok(other?),
        }
    }

    pub fn list_branches(&self) -> TractResult<Vec<(String, CommitId)>> {
        Ok(self.store.list_branches(&self.id)?)
    }

    /// Moves the current branch back to an ancestor. Soft reset records a
    /// reorganize event over the abandoned forward commits, which keeps them
    /// reachable for provenance; hard reset leaves them as GC candidates.
    #[instrument(skip(self))]
    pub fn reset(&self, target: &CommitId, mode: ResetMode) -> TractResult<()> {
        let branch = self.current_branch()?;
        let head = self.head_commit_id()?.ok_or(TractError::EmptyTract)?;
        if !dag_walk::has_ancestor(&self.store, &head, target)? {
            return Err(TractError::NotAnAncestor(target.clone()));
        }
        let forward = dag_walk::between(&self.store, target, &head)?.unwrap_or_default();
        self.store.in_savepoint(|| {
            if mode == ResetMode::Soft && !forward.is_empty() {
                self.store.record_event(
                    &self.id,
                    crate::op_store::EventKind::Reorganize,
                    &serde_json::json!({"operation": "reset", "mode": "soft", "branch": branch}),
                    0,
                    0,
                    &forward,
                    &[],
                    &[],
                )?;
            }
            self.store.set_branch(&self.id, &branch, target)?;
            Ok::<_, TractError>(())
        })?;
        debug!(tract = %self.id, %target, ?mode, "reset branch");
        Ok(())
    }

    /// First-parent history from HEAD, newest first.
    pub fn log(&self, limit: Option<usize>) -> TractResult<Vec<Commit>> {
        let Some(head) = self.head_commit_id()? else {
            return Ok(Vec::new());
        };
        dag_walk::ancestors(&self.store, &head, limit)?
            .into_iter()
            .map(|id| self.store.get_commit(&id).map_err(TractError::from))
            .collect()
    }

    /// `(commit count, token sum)` over the whole tract.
    pub fn stats(&self) -> TractResult<(u64, u64)> {
        Ok(self.store.tract_stats(&self.id)?)
    }

    pub fn commit_info(&self, id: &CommitId) -> TractResult<Commit> {
        Ok(self.store.get_commit(id)?)
    }
}

// Commits
impl Tract {
    /// Records a commit on the attached branch. EDIT commits must target a
    /// commit reachable from HEAD. A missing message is auto-generated,
    /// deterministically from the content.
    #[instrument(skip(self, payload, message))]
    pub fn commit(
        &self,
        payload: Payload,
        op: CommitOp,
        edit_target: Option<CommitId>,
        message: Option<String>,
    ) -> TractResult<Commit> {
        let branch = self.current_branch()?;
        let head = self.head_commit_id()?;

        match (op, &edit_target) {
            (CommitOp::Append, None) | (CommitOp::Edit, Some(_)) => {}
            _ => return Err(TractError::EditTargetMismatch),
        }
        if let Some(target) = &edit_target {
            let reachable = match &head {
                Some(head) => dag_walk::has_ancestor(&self.store, head, target)?,
                None => false,
            };
            if !reachable {
                return Err(TractError::InvalidEditTarget(target.clone()));
            }
        }

        let tokens = self.capabilities.tokenizer.count_payload(&payload);
        let message = message.unwrap_or_else(|| auto_message(&payload));
        let plan = serde_json::json!({
            "kind": payload.kind(),
            "op": op.as_str(),
            "message": message,
            "tokens": tokens,
        });
        let message = match self.hooks.fire("commit", plan) {
            HookOutcome::Rejected { reason } => {
                return Err(TractError::HookRejected {
                    operation: "commit",
                    reason,
                });
            }
            HookOutcome::Approved { plan } => plan
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_owned)
                .unwrap_or(message),
        };

        self.store.in_savepoint(|| {
            let commit = self.write_payload_commit(
                payload,
                head.clone().into_iter().collect(),
                op,
                edit_target.clone(),
                Some(message.clone()),
                Some(tokens),
                None,
                None,
            )?;
            self.store.set_branch(&self.id, &branch, commit.id())?;
            Ok(commit)
        })
    }

    pub fn append(&self, payload: Payload) -> TractResult<Commit> {
        self.commit(payload, CommitOp::Append, None, None)
    }

    pub fn append_dialogue(&self, role: DialogueRole, text: impl Into<String>) -> TractResult<Commit> {
        self.append(Payload::dialogue(role, text))
    }

    pub fn append_instruction(&self, text: impl Into<String>) -> TractResult<Commit> {
        self.append(Payload::instruction(text))
    }

    /// Writes blob and commit without touching any ref. Used by the
    /// structural operations, which manage refs themselves.
    #[expect(clippy::too_many_arguments)]
    pub(crate) fn write_payload_commit(
        &self,
        payload: Payload,
        parents: Vec<CommitId>,
        op: CommitOp,
        edit_target: Option<CommitId>,
        message: Option<String>,
        token_count: Option<u64>,
        generation_config: Option<LlmConfig>,
        usage: Option<GenerationUsage>,
    ) -> TractResult<Commit> {
        let tokens =
            token_count.unwrap_or_else(|| self.capabilities.tokenizer.count_payload(&payload));
        let content = self.store.put_blob(&payload, tokens)?;
        let commit = self.store.write_commit(CommitData {
            tract: self.id.clone(),
            content,
            parents,
            op,
            edit_target,
            token_count: tokens,
            timestamp: MillisSinceEpoch::now(),
            message,
            generation_config,
            usage,
        })?;
        Ok(commit)
    }
}

// Annotations
impl Tract {
    pub fn annotate(
        &self,
        target: &CommitId,
        priority: Priority,
        reason: Option<&str>,
    ) -> TractResult<()> {
        Ok(self.store.annotate(&self.id, target, priority, reason)?)
    }

    pub fn pin(&self, target: &CommitId, reason: Option<&str>) -> TractResult<()> {
        self.annotate(target, Priority::Pinned, reason)
    }

    pub fn skip(&self, target: &CommitId, reason: Option<&str>) -> TractResult<()> {
        self.annotate(target, Priority::Skip, reason)
    }

    /// Soft reset to NORMAL, recorded in the history like any other change.
    pub fn unannotate(&self, target: &CommitId) -> TractResult<()> {
        self.annotate(target, Priority::Normal, None)
    }

    pub fn priority_of(&self, target: &CommitId) -> TractResult<Priority> {
        Ok(self.store.priority_of(&self.id, target)?)
    }

    pub fn annotation_history(&self, target: &CommitId) -> TractResult<Vec<Annotation>> {
        Ok(self.store.annotation_history(&self.id, target)?)
    }

    /// Current non-NORMAL priorities by target.
    pub fn annotations(
        &self,
    ) -> TractResult<std::collections::BTreeMap<CommitId, Priority>> {
        Ok(self.store.effective_annotations(&self.id)?)
    }
}

// Compile
impl Tract {
    fn branch_name(&self) -> TractResult<Option<String>> {
        Ok(match self.head()? {
            Head::Attached { branch } => Some(branch),
            Head::Detached { .. } => None,
        })
    }

    fn compile_fresh(
        &self,
        head: Option<&CommitId>,
        branch: Option<&str>,
    ) -> TractResult<CompiledContext> {
        Ok(crate::compile::compile(
            &self.store,
            &self.id,
            head,
            branch,
            self.capabilities.compiler.as_ref(),
            self.capabilities.tokenizer.as_ref(),
            None,
        )?)
    }

    /// Compiles the current head through the per-handle cache.
    pub fn compile(&self) -> TractResult<Arc<CompiledContext>> {
        let head = self.head_commit_id()?;
        self.compile_cached(head.as_ref())
    }

    /// Compiles an arbitrary commit without moving HEAD.
    pub fn compile_at(&self, commit: &CommitId) -> TractResult<Arc<CompiledContext>> {
        self.compile_cached(Some(commit))
    }

    fn compile_cached(&self, head: Option<&CommitId>) -> TractResult<Arc<CompiledContext>> {
        let branch = self.branch_name()?;
        let annotations = self.store.effective_annotations(&self.id)?;
        let key = CompileCacheKey {
            tract: self.id.clone(),
            head: head.cloned(),
            annotation_fingerprint: annotation_fingerprint(&annotations),
            compiler_fingerprint: format!(
                "{}+{}",
                self.capabilities.compiler.name(),
                self.capabilities.tokenizer.name()
            ),
        };
        if let Some(hit) = self.compile_cache.borrow_mut().get(&key).cloned() {
            if self.verify_cache.get() {
                let fresh = self.compile_fresh(head, branch.as_deref())?;
                // The branch label is not part of the cache key; everything
                // the model would see must match bit for bit.
                assert_eq!(hit.messages, fresh.messages, "compile cache verification failed");
                assert_eq!(hit.token_count, fresh.token_count);
                assert_eq!(hit.effective, fresh.effective);
            }
            return Ok(hit);
        }
        let compiled = Arc::new(self.compile_fresh(head, branch.as_deref())?);
        self.compile_cache.borrow_mut().put(key, compiled.clone());
        Ok(compiled)
    }

    /// Compiles the current head and persists a compile record attributed to
    /// `triggered_by`.
    pub fn compile_recorded(&self, triggered_by: &str) -> TractResult<CompiledContext> {
        let compiled = self.compile()?;
        let Some(head) = &compiled.head else {
            // Nothing was sent anywhere; an empty compile is not recorded.
            return Ok((*compiled).clone());
        };
        let branch = self.branch_name()?;
        let record = self.store.record_compile(
            &self.id,
            head,
            branch.as_deref(),
            compiled.token_count,
            Some(triggered_by),
            &compiled.effective,
        )?;
        let mut out = (*compiled).clone();
        out.record = Some(record);
        out.branch = branch;
        Ok(out)
    }
}

// Generation
impl Tract {
    /// Compiles the head, sends it to the model, and appends the reply as an
    /// APPEND commit carrying the effective config and provider usage. The
    /// provider's completion token count, when present, overrides the
    /// tokenizer estimate.
    #[instrument(skip(self, config))]
    pub fn generate(&self, config: Option<&LlmConfig>) -> TractResult<Commit> {
        let branch = self.current_branch()?;
        let head = self.head_commit_id()?.ok_or(TractError::EmptyTract)?;
        let compiled = self.compile_recorded("generate")?;

        let effective_config = self.configs.resolve(&self.configs.chat, config);
        let response: ChatResponse = chat_with_retry(
            self.capabilities.llm.as_ref(),
            &compiled.messages,
            &effective_config,
            &self.retry,
        )?;

        let mut recorded_config = effective_config;
        if recorded_config.model.is_none() {
            recorded_config.model = response.model.clone();
        }
        let tokens = response
            .usage
            .map(|usage| usage.completion_tokens)
            .unwrap_or_else(|| self.capabilities.tokenizer.count(&response.text));

        self.store.in_savepoint(|| {
            let commit = self.write_payload_commit(
                Payload::dialogue(DialogueRole::Assistant, response.text.clone()),
                vec![head.clone()],
                CommitOp::Append,
                None,
                Some("model reply".to_string()),
                Some(tokens),
                Some(recorded_config),
                response.usage,
            )?;
            self.store.set_branch(&self.id, &branch, commit.id())?;
            Ok(commit)
        })
    }

    /// Appends a user message and generates the reply.
    pub fn chat(&self, text: impl Into<String>, config: Option<&LlmConfig>) -> TractResult<Commit> {
        self.append_dialogue(DialogueRole::User, text)?;
        self.generate(config)
    }
}

// Structural operations
impl Tract {
    pub fn merge(
        &self,
        source_ref: &str,
        strategy: MergeStrategy,
        config: Option<&LlmConfig>,
    ) -> TractResult<MergeOutcome> {
        merge::merge(self, source_ref, strategy, config)
    }

    pub fn rebase(&self, branch: Option<&str>, onto: &str) -> TractResult<RebaseOutcome> {
        rewrite::rebase(self, branch, onto)
    }

    pub fn import(&self, commit: &CommitId) -> TractResult<ImportOutcome> {
        rewrite::import(self, commit)
    }

    pub fn compress(&self, options: CompressOptions) -> TractResult<CompressOutcome> {
        compress::compress(self, options)
    }

    pub fn apply_compress(&self, pending: PendingCompress) -> TractResult<CompressOutcome> {
        compress::apply_pending(self, pending)
    }

    pub fn spawn(
        &self,
        mode: SpawnMode,
        purpose: &str,
        curation: Option<Curation>,
    ) -> TractResult<Tract> {
        spawn::spawn(self, mode, purpose, curation)
    }

    pub fn collapse(&self, child: &Tract, config: Option<&LlmConfig>) -> TractResult<Commit> {
        spawn::collapse(self, child, config)
    }

    pub fn gc(&self, options: GcOptions) -> TractResult<GcStats> {
        gc::collect(self, options)
    }
}

/// Deterministic fallback commit message derived from the content.
fn auto_message(payload: &Payload) -> String {
    let text = payload.prompt_text();
    let mut summary: String = text.chars().take(48).collect();
    if text.chars().count() > 48 {
        summary.push('…');
    }
    if summary.is_empty() {
        payload.kind().to_string()
    } else {
        format!("{}: {summary}", payload.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_message_deterministic() {
        let payload = Payload::dialogue(DialogueRole::User, "hello world");
        assert_eq!(auto_message(&payload), auto_message(&payload));
        assert_eq!(auto_message(&payload), "dialogue: hello world");

        let marker = Payload::Session {
            marker: "s".to_string(),
        };
        assert_eq!(auto_message(&marker), "session");

        let long = Payload::opaque("x".repeat(100));
        assert!(auto_message(&long).ends_with('…'));
    }
}

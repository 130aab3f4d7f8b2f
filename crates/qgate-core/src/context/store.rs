//! In-memory store of orchestration contexts.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, RwLock};

use super::run::OrchestrationContext;
use crate::domain::StateError;

pub type SharedContext = Arc<Mutex<OrchestrationContext>>;

#[derive(Default)]
struct Index {
    by_id: HashMap<String, SharedContext>,
    by_commit: HashMap<(String, String), String>,
}

/// Owns every run record. Each run is its own unit of mutual exclusion, so
/// runs never contend with each other beyond the brief index lookup.
#[derive(Default)]
pub struct ContextStore {
    index: RwLock<Index>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new run.
    ///
    /// Fails if the id is taken, or if a non-terminal run already exists for
    /// the same `(repository, commit)`.
    pub async fn create(&self, context: OrchestrationContext) -> Result<SharedContext, StateError> {
        let mut index = self.index.write().await;
        if index.by_id.contains_key(&context.id) {
            return Err(StateError::Duplicate(context.id));
        }
        let key = (context.repository.clone(), context.commit.clone());
        if let Some(existing) = index.by_commit.get(&key).and_then(|id| index.by_id.get(id)) {
            let existing = existing.lock().await;
            if !existing.status.is_terminal() {
                return Err(StateError::Duplicate(existing.id.clone()));
            }
        }

        let id = context.id.clone();
        let shared = Arc::new(Mutex::new(context));
        index.by_id.insert(id.clone(), shared.clone());
        index.by_commit.insert(key, id);
        Ok(shared)
    }

    pub async fn get(&self, id: &str) -> Option<SharedContext> {
        self.index.read().await.by_id.get(id).cloned()
    }

    /// The most recent run for `(repository, commit)`.
    pub async fn find_by_commit(&self, repository: &str, commit: &str) -> Option<SharedContext> {
        let index = self.index.read().await;
        let id = index
            .by_commit
            .get(&(repository.to_string(), commit.to_string()))?;
        index.by_id.get(id).cloned()
    }

    /// A point-in-time copy of the run.
    pub async fn snapshot(&self, id: &str) -> Option<OrchestrationContext> {
        let shared = self.get(id).await?;
        let ctx = shared.lock().await;
        Some(ctx.clone())
    }

    /// Apply `f` to the run atomically with respect to every other mutation
    /// of the same run. Progress is recomputed afterwards.
    pub async fn mutate<F, R>(&self, id: &str, f: F) -> Result<R, StateError>
    where
        F: FnOnce(&mut OrchestrationContext) -> R,
    {
        let shared = self
            .get(id)
            .await
            .ok_or_else(|| StateError::UnknownOrchestration(id.to_string()))?;
        let mut ctx = shared.lock().await;
        let result = f(&mut ctx);
        ctx.recompute_progress();
        Ok(result)
    }

    /// Evict terminal runs that finished more than `retention` before `now`.
    pub async fn sweep(&self, retention: Duration, now: DateTime<Utc>) -> Vec<String> {
        let mut index = self.index.write().await;
        let mut expired = Vec::new();
        for (id, shared) in &index.by_id {
            let ctx = shared.lock().await;
            let finished_long_ago = ctx
                .finished_at
                .is_some_and(|finished| now - finished > retention);
            if ctx.status.is_terminal() && finished_long_ago {
                expired.push(id.clone());
            }
        }
        for id in &expired {
            index.by_id.remove(id);
        }
        index.by_commit.retain(|_, id| !expired.contains(id));
        expired
    }

    pub async fn ids(&self) -> Vec<String> {
        self.index.read().await.by_id.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::OrchestrationStatus;
    use crate::domain::{GateOutcome, GateType, RepositoryTier, ValidationRequest};
    use crate::plan::PlanBuilder;

    fn context(id: &str, commit: &str) -> OrchestrationContext {
        let request = ValidationRequest::new("org/api", commit, RepositoryTier::Experimental)
            .validate()
            .unwrap();
        let builder = PlanBuilder::default();
        let plan = builder.build(&request).unwrap();
        let policy = builder.policies().policy_for(request.tier);
        let mut ctx = OrchestrationContext::new(id, request, plan, policy, "main");
        ctx.set_status(OrchestrationStatus::Running);
        ctx
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let store = ContextStore::new();
        store.create(context("orch-1", "abc")).await.unwrap();
        assert!(store.get("orch-1").await.is_some());
        let found = store.find_by_commit("org/api", "abc").await.unwrap();
        assert_eq!(found.lock().await.id, "orch-1");
        assert!(store.find_by_commit("org/api", "def").await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_active_commit_is_rejected() {
        let store = ContextStore::new();
        store.create(context("orch-1", "abc")).await.unwrap();
        assert!(matches!(
            store.create(context("orch-2", "abc")).await,
            Err(StateError::Duplicate(_))
        ));
        store
            .mutate("orch-1", |ctx| ctx.set_status(OrchestrationStatus::Failed))
            .await
            .unwrap();
        store.create(context("orch-2", "abc")).await.unwrap();
        let found = store.find_by_commit("org/api", "abc").await.unwrap();
        assert_eq!(found.lock().await.id, "orch-2");
    }

    #[tokio::test]
    async fn test_repeated_success_mutation_is_idempotent() {
        let store = ContextStore::new();
        store.create(context("orch-1", "abc")).await.unwrap();
        for _ in 0..4 {
            store
                .mutate("orch-1", |ctx| {
                    let _ = ctx.record_outcome(&GateOutcome::success(GateType::CodeQuality));
                })
                .await
                .unwrap();
        }
        let snap = store.snapshot("orch-1").await.unwrap();
        assert_eq!(snap.completed().len(), 1);
        assert!(snap.completed().is_disjoint(snap.failed()));
        assert_eq!(snap.progress, 50);
    }

    #[tokio::test]
    async fn test_concurrent_updates_to_different_gates_are_kept() {
        let store = Arc::new(ContextStore::new());
        store.create(context("orch-1", "abc")).await.unwrap();
        let mut handles = Vec::new();
        for gate in [GateType::CodeQuality, GateType::UnitTests] {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .mutate("orch-1", |ctx| ctx.record_outcome(&GateOutcome::success(gate)))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap().unwrap();
        }
        assert_eq!(store.snapshot("orch-1").await.unwrap().progress, 100);
    }

    #[tokio::test]
    async fn test_mutate_unknown_id() {
        let store = ContextStore::new();
        assert_eq!(
            store.mutate("nope", |_| ()).await,
            Err(StateError::UnknownOrchestration("nope".into()))
        );
    }

    #[tokio::test]
    async fn test_sweep_evicts_only_old_terminal_runs() {
        let store = ContextStore::new();
        store.create(context("orch-1", "abc")).await.unwrap();
        store.create(context("orch-2", "def")).await.unwrap();
        store
            .mutate("orch-1", |ctx| ctx.set_status(OrchestrationStatus::Completed))
            .await
            .unwrap();

        let later = Utc::now() + Duration::hours(2);
        let evicted = store.sweep(Duration::hours(1), later).await;
        assert_eq!(evicted, vec!["orch-1".to_string()]);
        assert!(store.get("orch-2").await.is_some());
        assert!(store.find_by_commit("org/api", "abc").await.is_none());
    }
}

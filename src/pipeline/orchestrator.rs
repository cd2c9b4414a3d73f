//! Classification orchestrator: sequences heuristics, the model, and user
//! rules into one run.
//!
//! Flow per run:
//! 1. optional force reset of the recent window
//! 2. ensure buckets, load rules
//! 3. fetch uncategorized threads from the window
//! 4. heuristics, then batched LLM calls for the remainder
//! 5. commit heuristic + LLM writes in one transaction
//! 6. re-read the window and apply rule overrides in a second transaction
//!
//! Heuristics and the model only ever see sentinel-bucket threads. The rule
//! pass covers the whole window, so rules always have the last word.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{BatchFailurePolicy, ClassifierConfig};
use crate::error::ClassifyError;
use crate::llm::LlmProvider;
use crate::pipeline::buckets::BucketRegistry;
use crate::pipeline::guard::RunGuard;
use crate::pipeline::heuristics;
use crate::pipeline::llm_classifier::{Classification, LlmClassifier};
use crate::pipeline::rules::RuleEngine;
use crate::pipeline::types::{
    Bucket, ClassificationWrite, Provenance, RunSummary, Thread, UNCATEGORIZED,
};
use crate::store::Database;

/// Runs the three-tier pipeline for one user at a time.
pub struct ClassificationOrchestrator {
    store: Arc<dyn Database>,
    registry: BucketRegistry,
    classifier: Arc<LlmClassifier>,
    limiter: Arc<Semaphore>,
    guard: RunGuard,
    config: ClassifierConfig,
}

impl ClassificationOrchestrator {
    pub fn new(
        store: Arc<dyn Database>,
        llm: Arc<dyn LlmProvider>,
        config: ClassifierConfig,
    ) -> Self {
        let classifier = LlmClassifier::new(llm, config.prompt_version.clone())
            .with_max_batch_size(config.batch_size);
        Self {
            registry: BucketRegistry::new(Arc::clone(&store)),
            store,
            classifier: Arc::new(classifier),
            limiter: Arc::new(Semaphore::new(config.max_concurrent_llm_calls.max(1))),
            guard: RunGuard::new(),
            config,
        }
    }

    /// Share a limiter across orchestrators, or pin one in tests.
    pub fn with_limiter(mut self, limiter: Arc<Semaphore>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn guard(&self) -> &RunGuard {
        &self.guard
    }

    /// Run the pipeline for `user_id` over the `n` most recent threads.
    ///
    /// Fails with `AlreadyRunning` if this user has a run in flight, and with
    /// `TimedOut` once the configured run timeout elapses. LLM batches already
    /// dispatched when the timeout fires run to completion in the background;
    /// their results are discarded.
    pub async fn run(
        &self,
        user_id: &str,
        n: usize,
        force: bool,
    ) -> Result<RunSummary, ClassifyError> {
        let _permit = self.guard.try_acquire(user_id)?;
        let after = self.config.run_timeout;

        let outcome = match tokio::time::timeout(after, self.execute(user_id, n, force)).await {
            Ok(result) => result,
            Err(_) => Err(ClassifyError::TimedOut { after }),
        };
        if let Err(e) = &outcome {
            error!(user_id, error = %e, "Classification run failed");
        }
        outcome
    }

    async fn execute(
        &self,
        user_id: &str,
        n: usize,
        force: bool,
    ) -> Result<RunSummary, ClassifyError> {
        info!(user_id, n, force, "Classification run started");
        if force {
            let reset = self.store.reset_recent_threads(user_id, n).await?;
            info!(user_id, reset, "Force reset recent threads");
        }

        let buckets = self.registry.ensure_defaults(user_id).await?;
        let engine = RuleEngine::new(self.store.list_rules(user_id).await?);

        let pending = self
            .store
            .list_threads(user_id, Some(UNCATEGORIZED), n)
            .await?;

        let mut summary = RunSummary {
            total_uncategorized: pending.len(),
            ..RunSummary::default()
        };

        // Heuristics first; whatever they leave goes to the model. A hit on a
        // bucket the user has deleted falls through to the model as well.
        let bucket_names: HashSet<&str> = buckets.iter().map(|b| b.name.as_str()).collect();
        let mut writes = Vec::with_capacity(pending.len());
        let mut llm_targets = Vec::new();
        for thread in pending {
            match heuristics::classify(&thread) {
                Some(hit) if !bucket_names.contains(hit.bucket) => {
                    debug!(user_id, thread_id = %thread.id, bucket = hit.bucket, "Heuristic bucket missing, deferring to model");
                    llm_targets.push(thread);
                }
                Some(hit) => {
                    debug!(user_id, thread_id = %thread.id, bucket = hit.bucket, "Heuristic match");
                    writes.push(ClassificationWrite {
                        thread_id: thread.id,
                        bucket: hit.bucket.to_string(),
                        provenance: Provenance::heuristic(hit.reason),
                    });
                }
                None => llm_targets.push(thread),
            }
        }
        summary.heuristics = writes.len();
        summary.llm = llm_targets.len();

        if !llm_targets.is_empty() {
            writes.extend(self.classify_with_llm(user_id, llm_targets, &buckets).await?);
        }

        let applied = self.store.apply_classifications(user_id, &writes).await?;
        debug!(user_id, queued = writes.len(), applied, "Committed heuristic and model writes");

        // Rule pass over the full window, including threads just classified.
        let window = self.store.list_threads(user_id, None, n).await?;
        let (overrides, matches) = rule_overrides(&engine, &window, &buckets);
        summary.rules = matches;

        let overridden = self.store.apply_classifications(user_id, &overrides).await?;

        info!(
            user_id,
            total_uncategorized = summary.total_uncategorized,
            heuristics = summary.heuristics,
            llm = summary.llm,
            rules = summary.rules,
            overridden,
            "Classification run complete"
        );
        Ok(summary)
    }

    /// Dispatch batches under the limiter and gather accepted writes.
    async fn classify_with_llm(
        &self,
        user_id: &str,
        targets: Vec<Thread>,
        buckets: &[Bucket],
    ) -> Result<Vec<ClassificationWrite>, ClassifyError> {
        let buckets = Arc::new(buckets.to_vec());
        let batch_size = self.classifier.max_batch_size();

        let handles: Vec<_> = targets
            .chunks(batch_size)
            .map(|chunk| {
                let batch = chunk.to_vec();
                let classifier = Arc::clone(&self.classifier);
                let limiter = Arc::clone(&self.limiter);
                let buckets = Arc::clone(&buckets);
                tokio::spawn(async move {
                    let _permit = limiter
                        .acquire_owned()
                        .await
                        .map_err(|e| ClassifyError::Task(format!("limiter closed: {e}")))?;
                    let results = classifier.classify_batch(&batch, &buckets).await?;
                    Ok::<_, ClassifyError>((batch, results))
                })
            })
            .collect();

        debug!(user_id, batches = handles.len(), batch_size, "Dispatched LLM batches");

        let mut writes = Vec::new();
        let mut first_error = None;
        let mut failed = 0usize;

        for (index, joined) in join_all(handles).await.into_iter().enumerate() {
            let outcome = joined
                .map_err(|e| ClassifyError::Task(e.to_string()))
                .and_then(|result| result);
            match outcome {
                Ok((batch, results)) => {
                    writes.extend(accept_batch_results(user_id, index, &batch, results));
                }
                Err(e) => {
                    error!(user_id, batch = index, error = %e, "LLM batch failed");
                    failed += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(error) = first_error {
            match self.config.batch_failure_policy {
                BatchFailurePolicy::AllOrNothing => return Err(error),
                BatchFailurePolicy::CommitSuccessful => {
                    warn!(
                        user_id,
                        failed,
                        accepted = writes.len(),
                        "Committing successful batches; failed threads stay uncategorized"
                    );
                }
            }
        }

        Ok(writes)
    }
}

/// Turn one batch's results into writes, dropping ids outside the batch and
/// repeats of an id already accepted.
fn accept_batch_results(
    user_id: &str,
    batch_index: usize,
    batch: &[Thread],
    results: Vec<Classification>,
) -> Vec<ClassificationWrite> {
    let members: HashSet<&str> = batch.iter().map(|t| t.id.as_str()).collect();
    let mut seen = HashSet::new();
    let mut writes = Vec::with_capacity(results.len());

    for item in results {
        if !members.contains(item.thread_id.as_str()) {
            warn!(
                user_id,
                batch = batch_index,
                thread_id = %item.thread_id,
                "Dropping model result for thread outside its batch"
            );
            continue;
        }
        if !seen.insert(item.thread_id.clone()) {
            debug!(user_id, thread_id = %item.thread_id, "Dropping duplicate model result");
            continue;
        }
        writes.push(ClassificationWrite {
            thread_id: item.thread_id,
            bucket: item.bucket,
            provenance: Provenance::llm(item.reason),
        });
    }

    let missing = members.len().saturating_sub(writes.len());
    if missing > 0 {
        debug!(user_id, batch = batch_index, missing, "Model left some threads unclassified");
    }
    writes
}

/// Evaluate rules over the window. Returns override writes for threads whose
/// bucket changes, and the number of threads any rule matched.
fn rule_overrides(
    engine: &RuleEngine,
    window: &[Thread],
    buckets: &[Bucket],
) -> (Vec<ClassificationWrite>, usize) {
    if engine.is_empty() {
        return (Vec::new(), 0);
    }

    let names: HashMap<Uuid, &str> = buckets.iter().map(|b| (b.id, b.name.as_str())).collect();
    let mut overrides = Vec::new();
    let mut matches = 0usize;

    for thread in window {
        let Some(hit) = engine.evaluate(thread) else {
            continue;
        };
        matches += 1;

        let Some(target) = names.get(&hit.bucket_id()) else {
            warn!(
                thread_id = %thread.id,
                rule_id = %hit.rule_id(),
                bucket_id = %hit.bucket_id(),
                "Rule targets a bucket that no longer exists"
            );
            continue;
        };

        if thread.bucket != *target {
            overrides.push(ClassificationWrite {
                thread_id: thread.id.clone(),
                bucket: (*target).to_string(),
                provenance: Provenance::rule(hit.rule_id(), hit.reason),
            });
        }
    }

    (overrides, matches)
}

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, warn};

use super::registry::GuardRegistry;
use super::types::{EvaluationMode, GuardContext, GuardResult};
use crate::config::GuardSettings;
use crate::observability::metrics;

/// Runs named guards concurrently on a bounded pool.
pub struct GuardEvaluator {
    registry: Arc<GuardRegistry>,
    settings: GuardSettings,
    permits: Arc<Semaphore>,
}

impl GuardEvaluator {
    pub fn new(registry: Arc<GuardRegistry>, settings: GuardSettings) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrency.max(1)));
        Self {
            registry,
            settings,
            permits,
        }
    }

    pub fn registry(&self) -> &Arc<GuardRegistry> {
        &self.registry
    }

    /// Evaluate `names` against `ctx`.
    ///
    /// Each guard runs under the per-guard timeout and the whole batch under
    /// the overall deadline; anything still pending at the deadline reports
    /// `GUARD_TIMEOUT`. In `FailFast` mode the first failure is returned
    /// alone and the remaining guard futures are dropped. Results come back
    /// in declaration order; a name listed twice is evaluated once.
    pub async fn evaluate(
        &self,
        names: &[String],
        ctx: &GuardContext,
        mode: EvaluationMode,
    ) -> Vec<GuardResult> {
        if names.is_empty() {
            return Vec::new();
        }

        let deadline = Instant::now() + self.settings.overall_deadline();
        let per_guard = self.settings.per_guard_timeout();

        let mut seen = HashSet::new();
        let declared: Vec<&String> = names.iter().filter(|name| seen.insert(name.as_str())).collect();

        let mut pending = FuturesUnordered::new();
        let mut results: HashMap<&str, GuardResult> = HashMap::new();

        for &name in &declared {
            let Some(guard) = self.registry.get(name).await else {
                warn!(guard = %name, instance_id = %ctx.instance_id, "Guard not registered");
                let result = GuardResult::not_registered(name.as_str());
                if mode == EvaluationMode::FailFast {
                    return vec![result];
                }
                results.insert(name.as_str(), result);
                continue;
            };

            let permits = Arc::clone(&self.permits);
            pending.push(async move {
                let _permit = permits.acquire_owned().await;
                let result = match timeout(per_guard, guard.evaluate(ctx)).await {
                    Ok(result) => result,
                    Err(_) => GuardResult::timed_out(name.as_str()),
                };
                (name.as_str(), result)
            });
        }

        loop {
            match timeout_at(deadline, pending.next()).await {
                Ok(Some((name, result))) => {
                    debug!(guard = %name, passed = result.passed(), "Guard evaluated");
                    if !result.passed() {
                        record_failure(&result);
                        if mode == EvaluationMode::FailFast {
                            return vec![result];
                        }
                    }
                    results.insert(name, result);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        instance_id = %ctx.instance_id,
                        pending = pending.len(),
                        "Guard evaluation hit the overall deadline"
                    );
                    break;
                }
            }
        }

        let mut out = Vec::with_capacity(declared.len());
        for name in declared {
            let result = results
                .remove(name.as_str())
                .unwrap_or_else(|| GuardResult::timed_out(name.as_str()));
            if mode == EvaluationMode::FailFast && !result.passed() {
                record_failure(&result);
                return vec![result];
            }
            out.push(result);
        }
        out
    }
}

fn record_failure(result: &GuardResult) {
    if result.is_timeout() {
        metrics().record_guard_timeout();
    } else {
        metrics().record_guard_failure();
    }
}

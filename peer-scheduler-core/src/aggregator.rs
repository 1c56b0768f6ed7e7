//! C6 — Score Aggregator.
//!
//! One evaluator per pod key, created lazily on the first reported
//! score and torn down the moment it fires. Firing happens exactly
//! once, whichever trips first: quorum (every expected peer has
//! reported) or a deadline timer. Every waiter on a key observes the
//! same winner, chosen uniformly at random among the max-score
//! candidates (capped at 100, per the bounded-memory requirement).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, Notify};

use crate::metrics::Metrics;
use crate::types::{NodeScore, PodKey, Winner};

const MAX_CANDIDATES: usize = 100;

/// Default quorum deadline (§4.6, §5 timeouts).
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(5);

struct Evaluator {
    limit: usize,
    scores: Vec<NodeScore>,
    winner: Option<Winner>,
}

impl Evaluator {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            scores: Vec::new(),
            winner: None,
        }
    }

    /// Picks a winner among the current max-score candidates and
    /// records it. Idempotent: a second call is a no-op, matching "fire
    /// exactly once, whichever trips first." Returns whether this call
    /// is the one that fired.
    fn fire(&mut self) -> bool {
        if self.winner.is_some() {
            return false;
        }
        let Some(max_score) = self.scores.iter().map(|s| s.score).max() else {
            return false;
        };
        let candidates: Vec<&NodeScore> = self
            .scores
            .iter()
            .filter(|s| s.score == max_score)
            .take(MAX_CANDIDATES)
            .collect();
        let idx = if candidates.len() <= 1 {
            0
        } else {
            rand::thread_rng().gen_range(0..candidates.len())
        };
        self.winner = Some(Winner {
            node_name: candidates[idx].node_name.clone(),
            score: max_score,
        });
        true
    }
}

/// An evaluator plus the `Notify` waiters subscribe to. Kept outside the
/// evaluator's own mutex so a caller can construct its `notified()`
/// future — which only needs to exist before a concurrent `fire()`, not
/// be polled — without first taking that lock, the same subscribe-before-
/// check idiom `EnginePool::pop` uses.
struct EvaluatorEntry {
    state: Mutex<Evaluator>,
    notify: Notify,
}

impl EvaluatorEntry {
    fn new(limit: usize) -> Self {
        Self {
            state: Mutex::new(Evaluator::new(limit)),
            notify: Notify::new(),
        }
    }
}

/// Global table of in-flight evaluators, one per pod key.
pub struct ScoreAggregator {
    evaluators: Mutex<HashMap<PodKey, Arc<EvaluatorEntry>>>,
    deadline: Duration,
    metrics: Arc<dyn Metrics>,
}

impl ScoreAggregator {
    pub fn new(deadline: Duration) -> Self {
        Self::with_metrics(deadline, Arc::new(crate::metrics::NoopMetrics))
    }

    pub fn with_metrics(deadline: Duration, metrics: Arc<dyn Metrics>) -> Self {
        Self {
            evaluators: Mutex::new(HashMap::new()),
            deadline,
            metrics,
        }
    }

    /// Records one peer's score for `key` and waits for the winner,
    /// either because this call completed the quorum or because
    /// another caller's quorum/deadline already fired (or will).
    ///
    /// Every caller for the same `key` shares one evaluator and
    /// therefore one winner, satisfying property (ii) of §4.6.
    pub async fn record_and_wait(&self, key: &PodKey, score: NodeScore, limit: usize) -> Winner {
        let entry = self.get_or_create(key, limit).await;

        // Subscribe before taking the state lock: `fire()` is only ever
        // called by a caller already holding that lock, so constructing
        // this future first guarantees it can't miss a `notify_waiters()`
        // that a racing caller's `fire()` is about to issue.
        let notified = entry.notify.notified();
        {
            let mut guard = entry.state.lock().await;
            guard.scores.push(score);
            if guard.scores.len() >= guard.limit && guard.fire() {
                self.metrics.aggregator_fired_on_quorum();
                entry.notify.notify_waiters();
            }
            if let Some(winner) = &guard.winner {
                let winner = winner.clone();
                drop(guard);
                self.remove_if_fired(key, &entry).await;
                return winner;
            }
        }

        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(self.deadline) => {
                let mut guard = entry.state.lock().await;
                if guard.fire() {
                    self.metrics.aggregator_fired_on_deadline();
                    entry.notify.notify_waiters();
                }
            }
        }

        let winner = {
            let guard = entry.state.lock().await;
            guard
                .winner
                .clone()
                .expect("notify only fires after fire() sets a winner")
        };
        self.remove_if_fired(key, &entry).await;
        winner
    }

    async fn get_or_create(&self, key: &PodKey, limit: usize) -> Arc<EvaluatorEntry> {
        let mut table = self.evaluators.lock().await;
        table
            .entry(key.clone())
            .or_insert_with(|| Arc::new(EvaluatorEntry::new(limit.max(1))))
            .clone()
    }

    /// Removes the table entry once it has fired, so the table never
    /// grows unbounded across the cluster's lifetime (§4.6 invariant iv).
    async fn remove_if_fired(&self, key: &PodKey, entry: &Arc<EvaluatorEntry>) {
        if entry.state.lock().await.winner.is_some() {
            let mut table = self.evaluators.lock().await;
            table.remove(key);
        }
    }

    #[cfg(test)]
    async fn evaluator_count(&self) -> usize {
        self.evaluators.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    fn score(node: &str, value: i64) -> NodeScore {
        NodeScore {
            node_name: node.into(),
            score: value,
        }
    }

    #[tokio::test]
    async fn quorum_fires_without_waiting_for_deadline() {
        let agg = StdArc::new(ScoreAggregator::new(Duration::from_secs(30)));
        let key = PodKey::new("default", "web-0");

        let a = {
            let agg = agg.clone();
            let key = key.clone();
            tokio::spawn(async move { agg.record_and_wait(&key, score("node-a", 5), 2).await })
        };
        let b = {
            let agg = agg.clone();
            let key = key.clone();
            tokio::spawn(async move { agg.record_and_wait(&key, score("node-b", 9), 2).await })
        };

        let (winner_a, winner_b) = tokio::join!(a, b);
        let winner_a = winner_a.unwrap();
        let winner_b = winner_b.unwrap();
        assert_eq!(winner_a, winner_b);
        assert_eq!(winner_a.node_name, "node-b");
        assert_eq!(agg.evaluator_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fires_with_fewer_than_limit_reports() {
        let agg = ScoreAggregator::new(Duration::from_millis(50));
        let key = PodKey::new("default", "web-0");

        // Only one of five expected reports arrives; with paused time the
        // runtime fast-forwards through the 50ms deadline once nothing
        // else is left to poll, so this resolves without a real sleep.
        let waiter = agg.record_and_wait(&key, score("node-a", 3), 5).await;
        assert_eq!(waiter.node_name, "node-a");
    }

    #[tokio::test]
    async fn zero_score_cannot_beat_a_positive_score() {
        let agg = ScoreAggregator::new(Duration::from_secs(30));
        let key = PodKey::new("default", "web-0");

        let winner = {
            let agg = StdArc::new(agg);
            let a = {
                let agg = agg.clone();
                let key = key.clone();
                tokio::spawn(async move { agg.record_and_wait(&key, score("node-a", 0), 2).await })
            };
            let b = {
                let agg = agg.clone();
                let key = key.clone();
                tokio::spawn(async move { agg.record_and_wait(&key, score("node-b", 1), 2).await })
            };
            let (a, b) = tokio::join!(a, b);
            assert_eq!(a.unwrap(), b.unwrap());
            b.unwrap()
        };
        assert_eq!(winner.node_name, "node-b");
    }

    #[tokio::test]
    async fn single_reporter_wins_trivially() {
        let agg = ScoreAggregator::new(Duration::from_secs(30));
        let key = PodKey::new("default", "web-0");
        let winner = agg.record_and_wait(&key, score("node-a", 4), 1).await;
        assert_eq!(winner.node_name, "node-a");
        assert_eq!(winner.score, 4);
    }
}

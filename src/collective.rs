//! Collective intelligence: voting, shared knowledge, reputation.
//!
//! The collective queries a set of workers for independent votes over a
//! discrete option set, aggregates them under one of several voting
//! algorithms, and maintains a confirmation-weighted knowledge store plus an
//! exponentially-smoothed reputation score per worker. A participant that
//! errors or times out contributes a low-confidence fallback vote so partial
//! failures never abort a round; failure of the round as a whole (quorum or
//! consensus threshold not met) is surfaced explicitly.

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::task::TaskResult;
use crate::worker::{WorkerId, MSG_VOTE_REQUEST};
use crate::{hlog, hlog_warn};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Weighted confidence a consensus round must reach to produce a decision.
pub const CONSENSUS_THRESHOLD: f64 = 0.7;
/// Minimum votes required before any decision can be computed.
pub const MIN_VOTES_FOR_DECISION: usize = 2;
/// Exponential smoothing factor for reputation updates.
pub const REPUTATION_DECAY: f64 = 0.95;
/// Confirmations required before knowledge counts as confirmed.
pub const KNOWLEDGE_CONFIRMATION_THRESHOLD: usize = 2;
/// Reputation assigned to a worker on registration.
pub const INITIAL_REPUTATION: f64 = 1.0;
/// Confidence attached to a fallback vote.
pub const FALLBACK_CONFIDENCE: f64 = 0.1;

/// How votes are combined into a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotingMethod {
    /// Plurality of raw vote counts.
    Majority,
    /// Votes weighted by confidence and voter reputation.
    Weighted,
    /// Weighted voting that fails closed below a confidence threshold.
    Consensus,
    /// Borda count scaled by confidence and reputation.
    BordaCount,
}

impl VotingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            VotingMethod::Majority => "majority",
            VotingMethod::Weighted => "weighted",
            VotingMethod::Consensus => "consensus",
            VotingMethod::BordaCount => "borda_count",
        }
    }
}

impl std::fmt::Display for VotingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One worker's opinion in a decision round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub worker_id: WorkerId,
    pub option: String,
    /// Voter's confidence in [0, 1].
    pub confidence: f64,
    pub rationale: Option<String>,
    pub cast_at: DateTime<Utc>,
}

/// The outcome of a decision round.
///
/// `decision` is None for a failed consensus round (method
/// `consensus_failed`, confidence 0); callers must treat that as a failed
/// round, not a valid choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectiveDecision {
    pub decision: Option<String>,
    pub confidence: f64,
    pub votes: Vec<Vote>,
    pub method: String,
    pub decided_at: DateTime<Utc>,
    pub metadata: HashMap<String, Value>,
}

/// A shared fact with accumulated confirmations and contradictions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub key: String,
    pub value: Value,
    pub source: WorkerId,
    pub confidence: f64,
    pub recorded_at: DateTime<Utc>,
    pub confirmations: Vec<WorkerId>,
    pub contradictions: Vec<WorkerId>,
}

/// Per-worker slice of a performance evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReputation {
    pub success_rate: f64,
    pub average_confidence: f64,
    pub average_execution_time: f64,
    pub reputation: f64,
    pub task_count: usize,
}

/// Whole-swarm slice of a performance evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectiveSummary {
    pub success_rate: f64,
    pub average_execution_time: f64,
    pub total_tasks: usize,
    pub worker_count: usize,
}

/// Result of `update_performance` over a batch of task results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub per_worker: HashMap<WorkerId, WorkerReputation>,
    pub collective: Option<CollectiveSummary>,
}

/// Confidence trajectory over recent decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceTrend {
    pub increasing: bool,
    pub average: f64,
    pub variance: f64,
}

/// Spread of reputation scores across known workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationDistribution {
    pub mean: f64,
    pub std_dev: f64,
    pub max: f64,
    pub min: f64,
}

/// Knowledge-base composition counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeStats {
    pub total_items: usize,
    pub confirmed_items: usize,
    pub contested_items: usize,
}

/// Descriptive statistics over recent collective behavior.
/// Observability only; never used for control decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patterns {
    pub method_preference: HashMap<String, usize>,
    pub confidence_trend: Option<ConfidenceTrend>,
    pub reputation_distribution: Option<ReputationDistribution>,
    pub knowledge: KnowledgeStats,
}

/// Compact view of a past decision for metrics snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionSummary {
    pub decision: Option<String>,
    pub confidence: f64,
    pub method: String,
    pub decided_at: DateTime<Utc>,
}

/// Point-in-time collective metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectiveMetrics {
    pub registered_workers: usize,
    pub knowledge_items: usize,
    pub decisions_made: usize,
    pub average_reputation: f64,
    pub confirmed_knowledge_items: usize,
    pub consensus_threshold: f64,
    pub recent_decisions: Vec<DecisionSummary>,
}

/// The collective-intelligence engine.
///
/// Interior locks guard short critical sections and are never held across
/// an await; vote collection runs entirely outside them.
pub struct Collective {
    channel: Arc<Channel>,
    registered: RwLock<Vec<WorkerId>>,
    reputation: RwLock<HashMap<WorkerId, f64>>,
    knowledge: RwLock<HashMap<String, KnowledgeItem>>,
    history: RwLock<Vec<CollectiveDecision>>,
}

impl Collective {
    /// Create a collective that queries voters through `channel`.
    pub fn new(channel: Arc<Channel>) -> Self {
        Self {
            channel,
            registered: RwLock::new(Vec::new()),
            reputation: RwLock::new(HashMap::new()),
            knowledge: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
        }
    }

    /// Register a worker as a voting participant, (re)setting its
    /// reputation to the initial value.
    pub fn register_worker(&self, worker_id: WorkerId) {
        let mut registered = self.registered.write().expect("registered lock poisoned");
        if !registered.contains(&worker_id) {
            registered.push(worker_id);
        }
        self.reputation
            .write()
            .expect("reputation lock poisoned")
            .insert(worker_id, INITIAL_REPUTATION);
        hlog!("collective registered worker {}", worker_id.short());
    }

    /// Remove a worker from voting. Its reputation is retained for audit.
    pub fn unregister_worker(&self, worker_id: WorkerId) {
        self.registered
            .write()
            .expect("registered lock poisoned")
            .retain(|id| *id != worker_id);
        hlog!("collective unregistered worker {}", worker_id.short());
    }

    /// Current reputation for a worker (initial value when unknown).
    pub fn reputation(&self, worker_id: WorkerId) -> f64 {
        self.reputation
            .read()
            .expect("reputation lock poisoned")
            .get(&worker_id)
            .copied()
            .unwrap_or(INITIAL_REPUTATION)
    }

    /// Run a decision round over `options`.
    ///
    /// Queries each participant concurrently over the channel's
    /// request/response path, waits at most `timeout` per participant, and
    /// aggregates under `method`. Participants default to every registered
    /// worker. Fails with `InsufficientVotes` below the quorum.
    pub async fn decide(
        &self,
        question: &str,
        options: &[String],
        method: VotingMethod,
        timeout: Duration,
        participants: Option<Vec<WorkerId>>,
    ) -> Result<CollectiveDecision> {
        let participants = participants.unwrap_or_else(|| {
            self.registered
                .read()
                .expect("registered lock poisoned")
                .clone()
        });

        let votes = self
            .collect_votes(question, options, &participants, timeout)
            .await;
        if votes.len() < MIN_VOTES_FOR_DECISION {
            return Err(Error::InsufficientVotes {
                got: votes.len(),
                need: MIN_VOTES_FOR_DECISION,
            });
        }

        let decision = match method {
            VotingMethod::Majority => self.majority_voting(votes),
            VotingMethod::Weighted => self.weighted_voting(votes),
            VotingMethod::Consensus => self.consensus_voting(votes),
            VotingMethod::BordaCount => self.borda_voting(votes, options),
        };

        hlog!(
            "collective decision via {}: {:?} (confidence {:.2})",
            decision.method,
            decision.decision,
            decision.confidence
        );
        self.history
            .write()
            .expect("history lock poisoned")
            .push(decision.clone());
        Ok(decision)
    }

    async fn collect_votes(
        &self,
        question: &str,
        options: &[String],
        participants: &[WorkerId],
        timeout: Duration,
    ) -> Vec<Vote> {
        let requests = participants
            .iter()
            .map(|worker_id| self.request_vote(*worker_id, question, options, timeout));
        join_all(requests).await
    }

    /// Query one participant for a vote through an ephemeral requester
    /// mailbox, so concurrent queries cannot steal each other's correlated
    /// replies. Any failure yields the fallback vote.
    async fn request_vote(
        &self,
        worker_id: WorkerId,
        question: &str,
        options: &[String],
        timeout: Duration,
    ) -> Vote {
        let requester = WorkerId::new();
        self.channel.register(requester);
        let response = self
            .channel
            .request_response(
                requester,
                worker_id,
                MSG_VOTE_REQUEST,
                json!({
                    "question": question,
                    "options": options,
                    "timeout_secs": timeout.as_secs_f64(),
                }),
                timeout,
            )
            .await;
        self.channel.unregister(requester);

        match response.and_then(|content| parse_vote(worker_id, options, &content)) {
            Some(vote) => vote,
            None => {
                hlog_warn!(
                    "no usable vote from worker {}, substituting fallback",
                    worker_id.short()
                );
                fallback_vote(worker_id, options)
            }
        }
    }

    fn majority_voting(&self, votes: Vec<Vote>) -> CollectiveDecision {
        let mut counts: Vec<(String, usize)> = Vec::new();
        for vote in &votes {
            match counts.iter_mut().find(|(option, _)| option == &vote.option) {
                Some((_, count)) => *count += 1,
                None => counts.push((vote.option.clone(), 1)),
            }
        }

        let winner = pick_max(counts.iter().map(|(o, c)| (o.clone(), *c as f64)));
        let (option, count) = winner.unwrap_or_default();
        CollectiveDecision {
            decision: Some(option),
            confidence: count / votes.len() as f64,
            method: "majority".to_string(),
            decided_at: Utc::now(),
            metadata: HashMap::from([(
                "vote_counts".to_string(),
                json!(counts.iter().cloned().collect::<HashMap<String, usize>>()),
            )]),
            votes,
        }
    }

    fn weighted_voting(&self, votes: Vec<Vote>) -> CollectiveDecision {
        let mut scores: Vec<(String, f64)> = Vec::new();
        let mut total_weight = 0.0;
        for vote in &votes {
            let weight = vote.confidence * self.reputation(vote.worker_id);
            total_weight += weight;
            match scores.iter_mut().find(|(option, _)| option == &vote.option) {
                Some((_, score)) => *score += weight,
                None => scores.push((vote.option.clone(), weight)),
            }
        }
        if total_weight > 0.0 {
            for (_, score) in scores.iter_mut() {
                *score /= total_weight;
            }
        }

        let winner = pick_max(scores.iter().cloned());
        let (option, confidence) = winner.unwrap_or_default();
        CollectiveDecision {
            decision: Some(option),
            confidence,
            method: "weighted".to_string(),
            decided_at: Utc::now(),
            metadata: HashMap::from([(
                "weighted_scores".to_string(),
                json!(scores.iter().cloned().collect::<HashMap<String, f64>>()),
            )]),
            votes,
        }
    }

    fn consensus_voting(&self, votes: Vec<Vote>) -> CollectiveDecision {
        let weighted = self.weighted_voting(votes);
        if weighted.confidence >= CONSENSUS_THRESHOLD {
            CollectiveDecision {
                method: "consensus".to_string(),
                ..weighted
            }
        } else {
            // Fail closed: no choice rather than a low-confidence guess.
            CollectiveDecision {
                decision: None,
                confidence: 0.0,
                votes: weighted.votes,
                method: "consensus_failed".to_string(),
                decided_at: Utc::now(),
                metadata: HashMap::from([(
                    "required_threshold".to_string(),
                    json!(CONSENSUS_THRESHOLD),
                )]),
            }
        }
    }

    fn borda_voting(&self, votes: Vec<Vote>, options: &[String]) -> CollectiveDecision {
        let mut scores: Vec<(String, f64)> =
            options.iter().map(|o| (o.clone(), 0.0)).collect();
        for vote in &votes {
            if let Some((_, score)) = scores.iter_mut().find(|(o, _)| o == &vote.option) {
                let points = (options.len().saturating_sub(1)) as f64;
                *score += points * vote.confidence * self.reputation(vote.worker_id);
            }
        }
        let total: f64 = scores.iter().map(|(_, s)| s).sum();
        if total > 0.0 {
            for (_, score) in scores.iter_mut() {
                *score /= total;
            }
        }

        let winner = pick_max(scores.iter().cloned());
        let (option, confidence) = winner.unwrap_or_default();
        CollectiveDecision {
            decision: Some(option),
            confidence,
            method: "borda_count".to_string(),
            decided_at: Utc::now(),
            metadata: HashMap::from([(
                "borda_scores".to_string(),
                json!(scores.iter().cloned().collect::<HashMap<String, f64>>()),
            )]),
            votes,
        }
    }

    /// Contribute a fact to the shared knowledge base.
    ///
    /// A new key creates an item; a matching value adds the worker as a
    /// confirmation (idempotent); a conflicting value adds a contradiction
    /// and the original value is retained.
    pub fn share_knowledge(&self, worker_id: WorkerId, key: &str, value: Value, confidence: f64) {
        let mut knowledge = self.knowledge.write().expect("knowledge lock poisoned");
        match knowledge.get_mut(key) {
            Some(item) => {
                if item.value == value {
                    if !item.confirmations.contains(&worker_id) {
                        item.confirmations.push(worker_id);
                        hlog!("knowledge '{}' confirmed by {}", key, worker_id.short());
                    }
                } else if !item.contradictions.contains(&worker_id) {
                    item.contradictions.push(worker_id);
                    hlog_warn!("knowledge '{}' contradicted by {}", key, worker_id.short());
                }
            }
            None => {
                knowledge.insert(
                    key.to_string(),
                    KnowledgeItem {
                        key: key.to_string(),
                        value,
                        source: worker_id,
                        confidence,
                        recorded_at: Utc::now(),
                        confirmations: Vec::new(),
                        contradictions: Vec::new(),
                    },
                );
                hlog!("knowledge '{}' recorded from {}", key, worker_id.short());
            }
        }
    }

    /// The stored value for a key, only once sufficiently confirmed:
    /// confirmations at or above the threshold with zero contradictions, or
    /// confirmations strictly outnumbering contradictions.
    pub fn get_knowledge(&self, key: &str) -> Option<Value> {
        let knowledge = self.knowledge.read().expect("knowledge lock poisoned");
        let item = knowledge.get(key)?;
        let confirmations = item.confirmations.len();
        let contradictions = item.contradictions.len();
        if (confirmations >= KNOWLEDGE_CONFIRMATION_THRESHOLD && contradictions == 0)
            || confirmations > contradictions
        {
            Some(item.value.clone())
        } else {
            None
        }
    }

    /// Raw knowledge item for introspection, regardless of confirmation.
    pub fn knowledge_item(&self, key: &str) -> Option<KnowledgeItem> {
        self.knowledge
            .read()
            .expect("knowledge lock poisoned")
            .get(key)
            .cloned()
    }

    /// Re-evaluate reputation from a batch of task results.
    ///
    /// Each involved worker's reputation decays toward the new evidence:
    /// `new = old·decay + (success_rate·avg_confidence)·(1−decay)`.
    pub fn update_performance(&self, results: &[TaskResult]) -> PerformanceReport {
        let mut grouped: HashMap<WorkerId, Vec<&TaskResult>> = HashMap::new();
        for result in results {
            if let Some(worker_id) = result.worker_id {
                grouped.entry(worker_id).or_default().push(result);
            }
        }

        let mut per_worker = HashMap::new();
        {
            let mut reputation = self.reputation.write().expect("reputation lock poisoned");
            for (worker_id, worker_results) in &grouped {
                let count = worker_results.len();
                let success_rate = worker_results.iter().filter(|r| r.success).count() as f64
                    / count as f64;
                let average_confidence =
                    worker_results.iter().map(|r| r.confidence).sum::<f64>() / count as f64;
                let average_execution_time = worker_results
                    .iter()
                    .map(|r| r.execution_time.as_secs_f64())
                    .sum::<f64>()
                    / count as f64;

                let old = reputation
                    .get(worker_id)
                    .copied()
                    .unwrap_or(INITIAL_REPUTATION);
                let new = old * REPUTATION_DECAY
                    + success_rate * average_confidence * (1.0 - REPUTATION_DECAY);
                reputation.insert(*worker_id, new);

                per_worker.insert(
                    *worker_id,
                    WorkerReputation {
                        success_rate,
                        average_confidence,
                        average_execution_time,
                        reputation: new,
                        task_count: count,
                    },
                );
            }
        }

        let collective = if results.is_empty() {
            None
        } else {
            Some(CollectiveSummary {
                success_rate: results.iter().filter(|r| r.success).count() as f64
                    / results.len() as f64,
                average_execution_time: results
                    .iter()
                    .map(|r| r.execution_time.as_secs_f64())
                    .sum::<f64>()
                    / results.len() as f64,
                total_tasks: results.len(),
                worker_count: grouped.len(),
            })
        };

        PerformanceReport {
            per_worker,
            collective,
        }
    }

    /// Descriptive statistics over recent decisions and the reputation
    /// distribution. Observability only.
    pub fn detect_patterns(&self) -> Patterns {
        let history = self.history.read().expect("history lock poisoned");
        let mut method_preference = HashMap::new();
        let mut confidence_trend = None;

        if history.len() >= 5 {
            let recent: Vec<&CollectiveDecision> =
                history.iter().rev().take(10).rev().collect();
            for decision in &recent {
                *method_preference.entry(decision.method.clone()).or_insert(0) += 1;
            }
            let confidences: Vec<f64> = recent.iter().map(|d| d.confidence).collect();
            if confidences.len() > 1 {
                confidence_trend = Some(ConfidenceTrend {
                    increasing: confidences[confidences.len() - 1] > confidences[0],
                    average: mean(&confidences),
                    variance: sample_variance(&confidences),
                });
            }
        }
        drop(history);

        let reputation = self.reputation.read().expect("reputation lock poisoned");
        let reputation_distribution = if reputation.is_empty() {
            None
        } else {
            let values: Vec<f64> = reputation.values().copied().collect();
            Some(ReputationDistribution {
                mean: mean(&values),
                std_dev: sample_variance(&values).sqrt(),
                max: values.iter().cloned().fold(f64::MIN, f64::max),
                min: values.iter().cloned().fold(f64::MAX, f64::min),
            })
        };
        drop(reputation);

        let knowledge = self.knowledge.read().expect("knowledge lock poisoned");
        let stats = KnowledgeStats {
            total_items: knowledge.len(),
            confirmed_items: knowledge
                .values()
                .filter(|item| item.confirmations.len() >= KNOWLEDGE_CONFIRMATION_THRESHOLD)
                .count(),
            contested_items: knowledge
                .values()
                .filter(|item| !item.contradictions.is_empty())
                .count(),
        };

        Patterns {
            method_preference,
            confidence_trend,
            reputation_distribution,
            knowledge: stats,
        }
    }

    /// Point-in-time metrics snapshot.
    pub fn metrics(&self) -> CollectiveMetrics {
        let history = self.history.read().expect("history lock poisoned");
        let reputation = self.reputation.read().expect("reputation lock poisoned");
        let knowledge = self.knowledge.read().expect("knowledge lock poisoned");

        CollectiveMetrics {
            registered_workers: self
                .registered
                .read()
                .expect("registered lock poisoned")
                .len(),
            knowledge_items: knowledge.len(),
            decisions_made: history.len(),
            average_reputation: if reputation.is_empty() {
                0.0
            } else {
                reputation.values().sum::<f64>() / reputation.len() as f64
            },
            confirmed_knowledge_items: knowledge
                .values()
                .filter(|item| item.confirmations.len() >= KNOWLEDGE_CONFIRMATION_THRESHOLD)
                .count(),
            consensus_threshold: CONSENSUS_THRESHOLD,
            recent_decisions: history
                .iter()
                .rev()
                .take(10)
                .rev()
                .map(|d| DecisionSummary {
                    decision: d.decision.clone(),
                    confidence: d.confidence,
                    method: d.method.clone(),
                    decided_at: d.decided_at,
                })
                .collect(),
        }
    }
}

/// First entry with the strictly greatest score; ties keep the earliest.
fn pick_max(entries: impl Iterator<Item = (String, f64)>) -> Option<(String, f64)> {
    let mut best: Option<(String, f64)> = None;
    for (option, score) in entries {
        match &best {
            Some((_, best_score)) if score <= *best_score => {}
            _ => best = Some((option, score)),
        }
    }
    best
}

fn parse_vote(worker_id: WorkerId, options: &[String], content: &Value) -> Option<Vote> {
    let option = content.get("option")?.as_str()?.to_string();
    if !options.contains(&option) {
        return None;
    }
    Some(Vote {
        worker_id,
        option,
        confidence: content
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(1.0),
        rationale: content
            .get("rationale")
            .and_then(Value::as_str)
            .map(String::from),
        cast_at: Utc::now(),
    })
}

fn fallback_vote(worker_id: WorkerId, options: &[String]) -> Vote {
    let option = options
        .choose(&mut rand::thread_rng())
        .cloned()
        .unwrap_or_default();
    Vote {
        worker_id,
        option,
        confidence: FALLBACK_CONFIDENCE,
        rationale: Some("no valid response from worker".to_string()),
        cast_at: Utc::now(),
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64
}

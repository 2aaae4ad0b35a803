use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use marshal_core::error::{MarshalError, Result};

/// A voter's verdict. Ordered from least to most conservative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteOutcome {
    Approve,
    RequestChanges,
    Reject,
}

impl fmt::Display for VoteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approve => write!(f, "approve"),
            Self::RequestChanges => write!(f, "request_changes"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ballot {
    pub voter: String,
    pub outcome: VoteOutcome,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub can_veto: bool,
}

fn default_weight() -> f64 {
    1.0
}

impl Ballot {
    pub fn new(voter: impl Into<String>, outcome: VoteOutcome) -> Self {
        Self {
            voter: voter.into(),
            outcome,
            weight: 1.0,
            can_veto: false,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_veto(mut self) -> Self {
        self.can_veto = true;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotingStrategy {
    /// Most frequent outcome wins.
    #[default]
    Majority,
    /// Highest share of total weight wins.
    Weighted,
    /// A vetoing REJECT decides; otherwise weighted.
    Veto,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoteResult {
    pub outcome: VoteOutcome,
    pub strategy: VotingStrategy,
    /// Count (majority) or weight share (weighted) per outcome.
    pub tally: BTreeMap<VoteOutcome, f64>,
    pub vetoed_by: Option<String>,
    pub ballots: usize,
}

/// Vote declared on a parallel group: each successful branch contributes the
/// value at `ballot_key`, the decision lands in `output_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteSpec {
    #[serde(default)]
    pub strategy: VotingStrategy,
    pub ballot_key: String,
    pub output_key: String,
    /// Branch name → weight. Missing branches weigh 1.0.
    #[serde(default)]
    pub weights: HashMap<String, f64>,
    /// Branches whose REJECT is a veto.
    #[serde(default)]
    pub vetoers: Vec<String>,
}

impl VoteSpec {
    pub fn new(
        strategy: VotingStrategy,
        ballot_key: impl Into<String>,
        output_key: impl Into<String>,
    ) -> Self {
        Self {
            strategy,
            ballot_key: ballot_key.into(),
            output_key: output_key.into(),
            weights: HashMap::new(),
            vetoers: Vec::new(),
        }
    }

    pub fn with_weight(mut self, branch: impl Into<String>, weight: f64) -> Self {
        self.weights.insert(branch.into(), weight);
        self
    }

    pub fn with_vetoer(mut self, branch: impl Into<String>) -> Self {
        self.vetoers.push(branch.into());
        self
    }

    /// Turn a branch's written value into a ballot.
    pub fn ballot(&self, branch: &str, value: &serde_json::Value) -> Result<Ballot> {
        let outcome: VoteOutcome = serde_json::from_value(value.clone()).map_err(|e| {
            MarshalError::Voting(format!(
                "branch {} wrote an invalid ballot at {}: {}",
                branch, self.ballot_key, e
            ))
        })?;
        Ok(Ballot {
            voter: branch.to_string(),
            outcome,
            weight: self.weights.get(branch).copied().unwrap_or(1.0),
            can_veto: self.vetoers.iter().any(|v| v == branch),
        })
    }
}

const EPSILON: f64 = 1e-9;

/// Reconciles several ballots into one decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct VotingCoordinator {
    strategy: VotingStrategy,
}

impl VotingCoordinator {
    pub fn new(strategy: VotingStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> VotingStrategy {
        self.strategy
    }

    pub fn decide(&self, ballots: &[Ballot]) -> Result<VoteResult> {
        if ballots.is_empty() {
            return Err(MarshalError::Voting("no ballots cast".into()));
        }
        if let Some(b) = ballots.iter().find(|b| !b.weight.is_finite() || b.weight < 0.0) {
            return Err(MarshalError::Voting(format!(
                "invalid weight {} for voter {}",
                b.weight, b.voter
            )));
        }

        let result = match self.strategy {
            VotingStrategy::Majority => self.majority(ballots),
            VotingStrategy::Weighted => self.weighted(ballots)?,
            VotingStrategy::Veto => match ballots
                .iter()
                .find(|b| b.can_veto && b.outcome == VoteOutcome::Reject)
            {
                Some(veto) => VoteResult {
                    outcome: VoteOutcome::Reject,
                    strategy: self.strategy,
                    tally: BTreeMap::new(),
                    vetoed_by: Some(veto.voter.clone()),
                    ballots: ballots.len(),
                },
                None => self.weighted(ballots)?,
            },
        };
        debug!(
            strategy = ?result.strategy,
            outcome = %result.outcome,
            ballots = result.ballots,
            "Vote decided"
        );
        Ok(result)
    }

    fn majority(&self, ballots: &[Ballot]) -> VoteResult {
        let mut tally = BTreeMap::new();
        for b in ballots {
            *tally.entry(b.outcome).or_insert(0.0) += 1.0;
        }
        VoteResult {
            outcome: winner(&tally),
            strategy: self.strategy,
            tally,
            vetoed_by: None,
            ballots: ballots.len(),
        }
    }

    fn weighted(&self, ballots: &[Ballot]) -> Result<VoteResult> {
        let total: f64 = ballots.iter().map(|b| b.weight).sum();
        if total <= 0.0 {
            return Err(MarshalError::Voting("total ballot weight is zero".into()));
        }
        let mut tally = BTreeMap::new();
        for b in ballots {
            *tally.entry(b.outcome).or_insert(0.0) += b.weight / total;
        }
        Ok(VoteResult {
            outcome: winner(&tally),
            strategy: self.strategy,
            tally,
            vetoed_by: None,
            ballots: ballots.len(),
        })
    }
}

/// Highest score wins; ties go to the most conservative outcome.
fn winner(tally: &BTreeMap<VoteOutcome, f64>) -> VoteOutcome {
    let best = tally.values().cloned().fold(f64::MIN, f64::max);
    tally
        .iter()
        .filter(|(_, score)| (best - **score).abs() < EPSILON)
        .map(|(outcome, _)| *outcome)
        .max()
        .unwrap_or(VoteOutcome::Reject)
}

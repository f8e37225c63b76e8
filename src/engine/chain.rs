//! Immutable chain specifications.
//!
//! A [`ChainSpec`] is assembled in one pass from an ordered list of
//! [`StageSpec`]s plus a unique registration, and validated before it is
//! handed to a scheduler.

use crate::model::{Constraints, StageKind, WorkData};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// What to do when a chain is submitted under a name that is already live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExistingWorkPolicy {
    /// Cancel the live chain and run the new one.
    Replace,
    /// Leave the live chain alone and drop the new one.
    Keep,
    /// Run the new chain once the live one finishes, seeded with its output.
    Append,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("chain has no stages")]
    Empty,

    #[error("chain name must not be empty")]
    EmptyName,

    #[error("expected exactly one tagged terminal stage, found {0} tagged stages")]
    TaggedStages(usize),

    #[error("only the last stage may carry tags (stage {0} is tagged)")]
    TagOnInnerStage(usize),

    #[error("duplicate stage id {0}")]
    DuplicateStage(String),

    #[error("scheduler is not running inside a Tokio runtime")]
    NoRuntime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub id: String,
    pub kind: StageKind,
    #[serde(default)]
    pub input: Option<WorkData>,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl StageSpec {
    /// A stage with a fresh random id and no input, constraints or tags.
    pub fn new(kind: StageKind) -> Self {
        Self {
            id: gen_stage_id(),
            kind,
            input: None,
            constraints: Constraints::default(),
            tags: BTreeSet::new(),
        }
    }

    pub fn with_input(mut self, input: WorkData) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tags.insert(tag.to_string());
        self
    }
}

/// Ordered stage list registered under a unique name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSpec {
    name: String,
    policy: ExistingWorkPolicy,
    stages: Vec<StageSpec>,
}

impl ChainSpec {
    /// Build and validate a chain. See [`ChainSpec::validate`] for the rules.
    pub fn new(
        name: impl Into<String>,
        policy: ExistingWorkPolicy,
        stages: Vec<StageSpec>,
    ) -> Result<Self, ChainError> {
        let spec = Self {
            name: name.into(),
            policy,
            stages,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// A chain is valid when it is named, non-empty, has unique stage ids and
    /// exactly one tagged stage, which must be the terminal one.
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.name.trim().is_empty() {
            return Err(ChainError::EmptyName);
        }
        if self.stages.is_empty() {
            return Err(ChainError::Empty);
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.id.as_str()) {
                return Err(ChainError::DuplicateStage(stage.id.clone()));
            }
        }

        let last = self.stages.len() - 1;
        if let Some(idx) = self.stages[..last].iter().position(|s| !s.tags.is_empty()) {
            return Err(ChainError::TagOnInnerStage(idx));
        }
        let tagged = self.stages.iter().filter(|s| !s.tags.is_empty()).count();
        if tagged != 1 {
            return Err(ChainError::TaggedStages(tagged));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> ExistingWorkPolicy {
        self.policy
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn terminal(&self) -> Option<&StageSpec> {
        self.stages.last()
    }
}

/// Random 64-bit hex id for a stage.
fn gen_stage_id() -> String {
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    format!("{:016x}", u64::from_le_bytes(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged_save() -> StageSpec {
        StageSpec::new(StageKind::Save).with_tag("OUTPUT")
    }

    #[test]
    fn accepts_single_tagged_terminal() {
        let chain = ChainSpec::new(
            "work",
            ExistingWorkPolicy::Replace,
            vec![
                StageSpec::new(StageKind::Cleanup),
                StageSpec::new(StageKind::Blur),
                tagged_save(),
            ],
        )
        .unwrap();
        assert_eq!(chain.stages().len(), 3);
        assert_eq!(chain.terminal().map(|s| s.kind), Some(StageKind::Save));
    }

    #[test]
    fn rejects_empty_and_unnamed_chains() {
        assert_eq!(
            ChainSpec::new("work", ExistingWorkPolicy::Replace, vec![]).unwrap_err(),
            ChainError::Empty
        );
        assert_eq!(
            ChainSpec::new(" ", ExistingWorkPolicy::Replace, vec![tagged_save()]).unwrap_err(),
            ChainError::EmptyName
        );
    }

    #[test]
    fn rejects_missing_or_misplaced_tags() {
        let err = ChainSpec::new(
            "work",
            ExistingWorkPolicy::Replace,
            vec![StageSpec::new(StageKind::Blur)],
        )
        .unwrap_err();
        assert_eq!(err, ChainError::TaggedStages(0));

        let err = ChainSpec::new(
            "work",
            ExistingWorkPolicy::Replace,
            vec![StageSpec::new(StageKind::Blur).with_tag("OUTPUT"), tagged_save()],
        )
        .unwrap_err();
        assert_eq!(err, ChainError::TagOnInnerStage(0));
    }

    #[test]
    fn rejects_duplicate_stage_ids() {
        let blur = StageSpec::new(StageKind::Blur);
        let err = ChainSpec::new(
            "work",
            ExistingWorkPolicy::Replace,
            vec![blur.clone(), blur.clone(), tagged_save()],
        )
        .unwrap_err();
        assert_eq!(err, ChainError::DuplicateStage(blur.id));
    }

    #[test]
    fn stage_ids_are_unique() {
        let a = StageSpec::new(StageKind::Blur);
        let b = StageSpec::new(StageKind::Blur);
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.len(), 16);
    }
}

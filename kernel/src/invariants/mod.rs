// Invariant Framework
//
// Invariants are pure rules that must hold for every transition between
// two consecutive metadata versions. The catalog evaluates them before a
// new version is written, and replay evaluates them over stored history.

use std::collections::HashSet;

use crate::catalog::TableMetadata;

/// Result of invariant evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantResult {
    Pass,
    Fail(String),
}

/// Trait implemented by all invariants.
///
/// Invariants must be:
/// - Pure
/// - Deterministic
/// - Side-effect free
pub trait Invariant: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate(&self, previous: &TableMetadata, next: &TableMetadata) -> InvariantResult;
}

/// Invariant engine that evaluates a set of invariants.
#[derive(Default)]
pub struct InvariantEngine {
    invariants: Vec<Box<dyn Invariant>>,
}

impl InvariantEngine {
    /// Create an engine with no rules.
    pub fn new() -> Self {
        Self {
            invariants: Vec::new(),
        }
    }

    /// Engine with every built-in history rule.
    pub fn standard() -> Self {
        let mut engine = Self::new();
        engine.register(VersionsAdvanceByOne);
        engine.register(ParentIsPreviousSnapshot);
        engine.register(SegmentsAppendOnly);
        engine.register(NoDuplicateSegments);
        engine.register(FencingTokensNeverRegress);
        engine
    }

    /// Register an invariant.
    pub fn register<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Evaluate all invariants.
    ///
    /// Stops at the first failure.
    pub fn evaluate(
        &self,
        previous: &TableMetadata,
        next: &TableMetadata,
    ) -> Result<(), InvariantViolation> {
        for invariant in &self.invariants {
            match invariant.validate(previous, next) {
                InvariantResult::Pass => continue,
                InvariantResult::Fail(reason) => {
                    return Err(InvariantViolation {
                        invariant: invariant.name(),
                        version: next.version,
                        reason,
                    })
                }
            }
        }
        Ok(())
    }
}

/// Returned when an invariant is violated.
#[derive(Debug, thiserror::Error)]
#[error("invariant `{invariant}` violated at version {version}: {reason}")]
pub struct InvariantViolation {
    pub invariant: &'static str,
    pub version: u64,
    pub reason: String,
}

pub struct VersionsAdvanceByOne;

impl Invariant for VersionsAdvanceByOne {
    fn name(&self) -> &'static str {
        "versions-advance-by-one"
    }

    fn validate(&self, previous: &TableMetadata, next: &TableMetadata) -> InvariantResult {
        if next.version != previous.version + 1 {
            return InvariantResult::Fail(format!(
                "version {} does not follow {}",
                next.version, previous.version
            ));
        }
        if next.current_snapshot_id != Some(next.version) {
            return InvariantResult::Fail(format!(
                "current snapshot {:?} differs from version {}",
                next.current_snapshot_id, next.version
            ));
        }
        if next.table_uuid != previous.table_uuid {
            return InvariantResult::Fail("table uuid changed".into());
        }
        InvariantResult::Pass
    }
}

pub struct ParentIsPreviousSnapshot;

impl Invariant for ParentIsPreviousSnapshot {
    fn name(&self) -> &'static str {
        "parent-is-previous-snapshot"
    }

    fn validate(&self, previous: &TableMetadata, next: &TableMetadata) -> InvariantResult {
        match &next.current_snapshot {
            Some(snapshot) if snapshot.parent_snapshot_id == previous.current_snapshot_id => {
                InvariantResult::Pass
            }
            Some(snapshot) => InvariantResult::Fail(format!(
                "parent {:?} is not previous snapshot {:?}",
                snapshot.parent_snapshot_id, previous.current_snapshot_id
            )),
            None => InvariantResult::Fail("new version carries no snapshot".into()),
        }
    }
}

pub struct SegmentsAppendOnly;

impl Invariant for SegmentsAppendOnly {
    fn name(&self) -> &'static str {
        "segments-append-only"
    }

    fn validate(&self, previous: &TableMetadata, next: &TableMetadata) -> InvariantResult {
        if next.segments().starts_with(previous.segments()) {
            InvariantResult::Pass
        } else {
            InvariantResult::Fail("committed segments were removed or reordered".into())
        }
    }
}

pub struct NoDuplicateSegments;

impl Invariant for NoDuplicateSegments {
    fn name(&self) -> &'static str {
        "no-duplicate-segments"
    }

    fn validate(&self, previous: &TableMetadata, next: &TableMetadata) -> InvariantResult {
        let mut seen: HashSet<&str> = previous.segments().iter().map(|s| s.path.as_str()).collect();
        for segment in &next.segments()[previous.segments().len().min(next.segments().len())..] {
            if !seen.insert(segment.path.as_str()) {
                return InvariantResult::Fail(format!("segment {} committed twice", segment.path));
            }
        }
        InvariantResult::Pass
    }
}

pub struct FencingTokensNeverRegress;

impl Invariant for FencingTokensNeverRegress {
    fn name(&self) -> &'static str {
        "fencing-tokens-never-regress"
    }

    fn validate(&self, previous: &TableMetadata, next: &TableMetadata) -> InvariantResult {
        let token = next
            .current_snapshot
            .as_ref()
            .map(|s| s.fencing_token)
            .unwrap_or_default();
        if token < previous.max_fencing_token {
            InvariantResult::Fail(format!(
                "token {token} committed after token {}",
                previous.max_fencing_token
            ))
        } else {
            InvariantResult::Pass
        }
    }
}

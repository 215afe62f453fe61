//! Execution ordering.
//!
//! Entries run in three fixed phases: deletes, then creates/updates/patches
//! in submission order, then reads and searches. The plan only stores entry
//! positions, so responses can always be put back in submission order.

use std::collections::HashMap;
use std::fmt;

use crate::entry::{OperationKind, Resolution, TransactionEntry};
use crate::error::{BundleError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    Delete,
    Mutate,
    Read,
}

impl Phase {
    pub const ORDER: [Phase; 3] = [Phase::Delete, Phase::Mutate, Phase::Read];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Delete => write!(f, "delete"),
            Phase::Mutate => write!(f, "mutate"),
            Phase::Read => write!(f, "read"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseGroup {
    pub phase: Phase,
    /// Positions into the entry list, in submission order.
    pub entries: Vec<usize>,
}

/// Order in which the entries of one submission execute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPlan {
    groups: Vec<PhaseGroup>,
}

impl ExecutionPlan {
    /// Builds the plan for `entries`. Empty phases are omitted.
    pub fn build(entries: &[TransactionEntry]) -> Self {
        Self::from_phases(entries.iter().enumerate().map(|(pos, e)| (pos, e.kind.phase())))
    }

    /// Builds a plan from `(position, phase)` pairs given in submission order.
    pub fn from_phases(items: impl IntoIterator<Item = (usize, Phase)>) -> Self {
        let mut by_phase: HashMap<Phase, Vec<usize>> = HashMap::new();
        for (pos, phase) in items {
            by_phase.entry(phase).or_default().push(pos);
        }
        let groups = Phase::ORDER
            .iter()
            .filter_map(|phase| {
                by_phase.remove(phase).map(|entries| PhaseGroup {
                    phase: *phase,
                    entries,
                })
            })
            .collect();
        Self { groups }
    }

    pub fn groups(&self) -> &[PhaseGroup] {
        &self.groups
    }

    /// Every position in execution order.
    pub fn order(&self) -> impl Iterator<Item = usize> + '_ {
        self.groups.iter().flat_map(|g| g.entries.iter().copied())
    }

    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Rejects two mutating entries that name the same identity in their request URL.
pub fn check_duplicate_targets(entries: &[TransactionEntry]) -> Result<()> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for entry in entries {
        let Some(key) = entry.literal_target_key() else {
            continue;
        };
        if seen.insert(key.clone(), entry.original_index).is_some() {
            return Err(BundleError::DuplicateTarget { identity: key });
        }
    }
    Ok(())
}

/// Rejects two mutating entries whose resolved targets are the same resource,
/// however each one addressed it.
///
/// Creates are not counted, so changing a resource created earlier in the
/// same bundle stays legal.
pub fn check_resolved_targets<'e>(
    entries: impl IntoIterator<Item = &'e TransactionEntry>,
) -> Result<()> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for entry in entries {
        if !entry.kind.is_mutating() || entry.kind == OperationKind::Create {
            continue;
        }
        let identities = match &entry.resolution {
            Resolution::Create { identity } | Resolution::Target { identity } => {
                std::slice::from_ref(identity)
            }
            Resolution::DeleteMany { identities } => identities.as_slice(),
            _ => continue,
        };
        for identity in identities {
            let key = identity.unversioned().to_relative();
            if let Some(first) = seen.insert(key.clone(), entry.original_index)
                && first != entry.original_index
            {
                return Err(BundleError::DuplicateTarget { identity: key });
            }
        }
    }
    Ok(())
}

/// Rejects two entries declaring the same `fullUrl`.
pub fn check_duplicate_full_urls(entries: &[TransactionEntry]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for entry in entries {
        if let Some(full_url) = entry.full_url.as_deref()
            && !seen.insert(full_url)
        {
            return Err(BundleError::DuplicateFullUrl {
                index: entry.original_index,
                full_url: full_url.to_string(),
            });
        }
    }
    Ok(())
}

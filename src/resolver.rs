//! Cache hit resolution.
//!
//! A target may reuse an entry only if every target the entry was built
//! against is itself reused at the recorded fingerprint. Hits therefore
//! propagate from the leaves of the dependency graph upward: each pass over
//! the unresolved targets accepts every candidate whose dependency targets
//! are already confirmed, and resolution stops at the first pass that
//! changes nothing. Whatever is left, including every member of a
//! dependency cycle, is a miss.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use tracing::info;
use xcache_store::{CacheStore, Candidate, FileHashCache, StoreResult};

use crate::context::{TargetContext, TargetStatus};

/// Outcome counts of a resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolutionSummary {
    pub total: usize,
    pub hit: usize,
    pub miss: usize,
    /// Full passes run, including the final one that changed nothing
    pub iterations: usize,
}

impl fmt::Display for ResolutionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total {} hit {} miss {} iteration {}",
            self.total, self.hit, self.miss, self.iterations
        )
    }
}

/// Look up and verify candidates for every context, in order.
///
/// The returned list is parallel to `contexts`; each context's
/// `candidates` is filled in as well.
pub fn discover_candidates(
    contexts: &mut [TargetContext],
    store: &CacheStore,
    working_dir: &Path,
    hashes: &FileHashCache,
) -> StoreResult<Vec<Vec<Candidate>>> {
    let mut all = Vec::with_capacity(contexts.len());
    for context in contexts.iter_mut() {
        let candidates =
            store.find_candidates(context.name(), &context.fingerprint, working_dir, hashes)?;
        context.candidates = candidates.iter().map(|c| c.dir.clone()).collect();
        all.push(candidates);
    }
    Ok(all)
}

/// Decide Hit or Miss for every context.
///
/// `candidates[i]` are the verified candidates of `contexts[i]`, newest
/// first. Contexts must be Unresolved on entry.
pub fn resolve(contexts: &mut [TargetContext], candidates: &[Vec<Candidate>]) -> ResolutionSummary {
    let mut summary = ResolutionSummary {
        total: contexts.len(),
        ..Default::default()
    };

    for (context, found) in contexts.iter_mut().zip(candidates) {
        if found.is_empty() && context.mark_miss() {
            info!("miss {} {} in iteration {}", context.name(), context.fingerprint, 0);
            summary.miss += 1;
        }
    }

    let mut confirmed: HashSet<(String, String)> = HashSet::new();
    loop {
        summary.iterations += 1;
        let resolved_before = summary.hit + summary.miss;

        for (context, found) in contexts.iter_mut().zip(candidates) {
            if context.status != TargetStatus::Unresolved {
                continue;
            }
            let accepted = found.iter().find(|candidate| {
                candidate
                    .metadata
                    .dependency_targets
                    .iter()
                    .all(|dep| confirmed.contains(&(dep.name.clone(), dep.fingerprint.clone())))
            });
            let Some(candidate) = accepted else {
                continue;
            };
            if context.mark_hit(candidate) {
                info!(
                    "hit {} {} in iteration {} potential {}",
                    context.name(),
                    context.fingerprint,
                    summary.iterations,
                    found.len()
                );
                confirmed.insert((context.name().to_string(), context.fingerprint.clone()));
                summary.hit += 1;
            }
        }

        if summary.hit + summary.miss == resolved_before {
            break;
        }
    }

    for context in contexts.iter_mut() {
        if context.mark_miss() {
            info!(
                "miss {} {} in iteration {}",
                context.name(),
                context.fingerprint,
                summary.iterations
            );
            summary.miss += 1;
        }
    }

    summary
}

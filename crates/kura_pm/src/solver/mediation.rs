//! Nearest-wins conflict mediation over a pre-order dependency listing.

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::model::Dependency;

/// Collapses `discovered` to one entry per mediation id.
///
/// A later occurrence replaces the registered one only when its ring is
/// strictly lower; the replacement takes over the original position, so the
/// output keeps discovery order. Equal rings keep the first registration.
pub fn mediate(discovered: Vec<Dependency>) -> Vec<Dependency> {
    let mut selected: IndexMap<String, Dependency> = IndexMap::with_capacity(discovered.len());
    for candidate in discovered {
        let id = candidate.mediation_id();
        let Some(existing) = selected.get_mut(&id) else {
            selected.insert(id, candidate);
            continue;
        };

        if candidate.ring < existing.ring {
            warn!(
                dependency = %id,
                selected = %candidate.version,
                selected_ring = candidate.ring,
                replaced = %existing.version,
                replaced_ring = existing.ring,
                "より近い依存関係でバージョン競合を解決しました"
            );
            *existing = candidate;
        } else if candidate.version != existing.version {
            debug!(
                dependency = %id,
                selected = %existing.version,
                ignored = %candidate.version,
                ring = candidate.ring,
                "遠い依存関係のバージョンを無視しました"
            );
        }
    }
    selected.into_values().collect()
}

/// Drops entries matched by `owner`'s exclusions together with the
/// subtree that follows them in pre-order.
pub(crate) fn prune(subtree: Vec<Dependency>, owner: &Dependency) -> Vec<Dependency> {
    if owner.exclusions.is_empty() {
        return subtree;
    }

    let mut kept = Vec::with_capacity(subtree.len());
    let mut skipping_below: Option<u32> = None;
    for dependency in subtree {
        if let Some(ring) = skipping_below {
            if dependency.ring > ring {
                continue;
            }
            skipping_below = None;
        }
        if owner.excludes(&dependency) {
            debug!(owner = %owner, excluded = %dependency, "除外設定により推移的依存関係を除きました");
            skipping_below = Some(dependency.ring);
            continue;
        }
        kept.push(dependency);
    }
    kept
}

/// Appends `entries` with their rings offset by `shift`.
pub(crate) fn append_shifted(target: &mut Vec<Dependency>, entries: Vec<Dependency>, shift: u32) {
    target.extend(entries.into_iter().map(|mut dependency| {
        dependency.ring += shift;
        dependency
    }));
}

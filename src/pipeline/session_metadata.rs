//! Session identity under demultiplexing.
//!
//! A [`NodeSessionMetadata`] records, for every demultiplexer a request has
//! passed through, which shard this (sub)session is and how many siblings it
//! has. The root session of a request has an empty mapping and the empty
//! session key.
//!
//! Levels are pushed in demultiplexing order and must be collapsed (gathered)
//! in reverse order. Violating that order, or demultiplexing twice under the
//! same name, is a graph construction bug and panics.

use std::collections::{BTreeMap, BTreeSet};

/// Key identifying one node session within a request.
pub type SessionKey = String;

/// Index of a shard within its demultiplexer level.
pub type SessionId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Subsession {
    id: SessionId,
    size: SessionId,
}

/// Which levels a gathering node collapses, outermost first, and how many
/// shards each level had.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollapseDetails {
    pub collapsed_session_names: Vec<String>,
    pub collapsed_session_sizes: Vec<SessionId>,
}

impl CollapseDetails {
    /// Number of shards expected per input before the gather is complete.
    pub fn total_shards(&self) -> usize {
        self.collapsed_session_sizes
            .iter()
            .map(|&s| s as usize)
            .product()
    }

    pub fn is_empty(&self) -> bool {
        self.collapsed_session_names.is_empty()
    }
}

/// Identity of one (sub)invocation of the graph.
#[derive(Debug, Clone, Default)]
pub struct NodeSessionMetadata {
    details: BTreeMap<String, Subsession>,
    sessions_levels: Vec<String>,
}

impl PartialEq for NodeSessionMetadata {
    fn eq(&self, other: &Self) -> bool {
        self.details == other.details
    }
}

impl Eq for NodeSessionMetadata {}

impl NodeSessionMetadata {
    /// Root metadata of a new request.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_root(&self) -> bool {
        self.details.is_empty()
    }

    /// Demultiplexer names in the order they were applied.
    pub fn levels(&self) -> &[String] {
        &self.sessions_levels
    }

    /// Shard index of this session within the level named `name`.
    pub fn subsession_id(&self, name: &str) -> Option<SessionId> {
        self.details.get(name).map(|s| s.id)
    }

    /// Number of shards produced by the level named `name`.
    pub fn subsession_size(&self, name: &str) -> Option<SessionId> {
        self.details.get(name).map(|s| s.size)
    }

    /// Split this session into `size` shards under `demultiplexer`.
    ///
    /// # Panics
    ///
    /// Panics if `demultiplexer` is empty or was already used in this lineage.
    pub fn generate_subsessions(&self, demultiplexer: &str, size: SessionId) -> Vec<Self> {
        assert!(
            !demultiplexer.is_empty(),
            "cannot generate subsessions with an empty demultiplexer name"
        );
        assert!(
            !self.details.contains_key(demultiplexer),
            "demultiplexer {} already spawned subsessions in this lineage",
            demultiplexer
        );
        let metas: Vec<Self> = (0..size)
            .map(|id| {
                let mut meta = self.clone();
                meta.details
                    .insert(demultiplexer.to_string(), Subsession { id, size });
                meta.sessions_levels.push(demultiplexer.to_string());
                meta
            })
            .collect();
        tracing::trace!(
            "Generated {} subsessions, levels: {}",
            size,
            metas
                .first()
                .map(|m| m.sessions_levels.join(", "))
                .unwrap_or_default()
        );
        metas
    }

    /// Session key covering every level.
    pub fn session_key(&self) -> SessionKey {
        self.build_key(|_| true)
    }

    /// Session key with the `ignored` levels collapsed away. The ignored
    /// names must be the innermost levels.
    ///
    /// # Panics
    ///
    /// Panics if a name is unknown or the levels are not innermost.
    pub fn session_key_ignoring(&self, ignored: &BTreeSet<String>) -> SessionKey {
        if ignored.is_empty() {
            return self.session_key();
        }
        self.assert_collapsible(ignored);
        self.build_key(|name| !ignored.contains(name))
    }

    /// Metadata of the session that gathers the `ignored` levels, plus the
    /// details needed to reassemble their shards.
    ///
    /// # Panics
    ///
    /// Panics if `ignored` is empty, names an unknown level, or the levels
    /// are not innermost.
    pub fn collapsed_metadata(&self, ignored: &BTreeSet<String>) -> (Self, CollapseDetails) {
        assert!(!ignored.is_empty(), "tried to collapse sessions with an empty set");
        self.assert_collapsible(ignored);

        let mut collapsed = Self::default();
        let mut details = CollapseDetails::default();
        for level in &self.sessions_levels {
            let sub = self.details[level];
            if ignored.contains(level) {
                details.collapsed_session_names.push(level.clone());
                details.collapsed_session_sizes.push(sub.size);
            } else {
                collapsed.details.insert(level.clone(), sub);
                collapsed.sessions_levels.push(level.clone());
            }
        }
        (collapsed, details)
    }

    /// Row-major position of this session among the shards collapsed by
    /// `collapsed`, innermost level varying fastest.
    ///
    /// # Panics
    ///
    /// Panics if more levels are collapsed than exist or they are not innermost.
    /// Returns `None` if the collapsed shard count does not fit a [`SessionId`].
    pub fn shard_id(&self, collapsed: &BTreeSet<String>) -> Option<SessionId> {
        if collapsed.is_empty() {
            return Some(0);
        }
        self.assert_collapsible(collapsed);
        let mut multiply_factor: SessionId = 1;
        let mut shard_id: SessionId = 0;
        for level in self.sessions_levels.iter().rev().take(collapsed.len()) {
            let sub = self.details[level];
            shard_id = shard_id.checked_add(multiply_factor.checked_mul(sub.id)?)?;
            multiply_factor = multiply_factor.checked_mul(sub.size)?;
        }
        Some(shard_id)
    }

    /// `{len}:{name}_{id}` per level. The length prefix keeps names containing `_` distinct.
    fn build_key(&self, include: impl Fn(&str) -> bool) -> SessionKey {
        self.details
            .iter()
            .filter(|(name, _)| include(name))
            .map(|(name, sub)| format!("{}:{}_{}", name.len(), name, sub.id))
            .collect::<Vec<_>>()
            .join("_")
    }

    fn assert_collapsible(&self, names: &BTreeSet<String>) {
        if let Some(missing) = names.iter().find(|n| !self.details.contains_key(*n)) {
            panic!("tried to collapse non-existing subsession {}", missing);
        }
        assert!(
            names.len() <= self.sessions_levels.len(),
            "tried to collapse more subsession levels than exist"
        );
        for level in self.sessions_levels.iter().rev().take(names.len()) {
            assert!(
                names.contains(level),
                "cannot collapse sessions out of LIFO order, {} must be collapsed first (levels: {})",
                level,
                self.sessions_levels.join(", ")
            );
        }
    }
}

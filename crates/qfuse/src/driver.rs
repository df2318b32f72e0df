use std::collections::BTreeMap;

use thiserror::Error;

use crate::catalog::CompiledCatalog;
use crate::env;
use crate::graph::Graph;
use crate::pattern::Match;
use crate::rewriter::SubgraphRewriter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusionConfig {
    /// Upper bound on rewrites per run; `None` means `catalog_len * node_count` (at least 1).
    pub max_rewrites: Option<usize>,
    /// Remove constants that only fed a rewritten match.
    pub prune_orphaned_constants: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            max_rewrites: None,
            prune_orphaned_constants: true,
        }
    }
}

impl FusionConfig {
    /// Defaults overridden by `QFUSE_MAX_REWRITES` and `QFUSE_PRUNE_CONSTANTS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_rewrites: env::max_rewrites().or(defaults.max_rewrites),
            prune_orphaned_constants: env::prune_constants()
                .unwrap_or(defaults.prune_orphaned_constants),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FusionStats {
    /// Full catalog scans, including the final one that found nothing.
    pub scans: usize,
    pub rewrites: usize,
    pub pruned_constants: usize,
    /// Rewrites per entry name.
    pub applied: BTreeMap<String, usize>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FusionError {
    #[error("fusion did not reach a fixpoint within {limit} rewrites ({rewrites} applied)")]
    NonConvergence { rewrites: usize, limit: usize },
}

enum DriverState {
    Scanning,
    Rewriting { entry: usize, matched: Match },
    Done,
}

/// Applies a compiled catalog to a graph until no entry matches.
///
/// Each scan walks the catalog in order and stops at the first match accepted
/// by its entry's filter; that match is rewritten and the scan restarts from
/// the first entry. Earlier entries therefore always win over later ones.
pub struct FusionDriver<'c> {
    catalog: &'c CompiledCatalog,
    config: FusionConfig,
}

impl<'c> FusionDriver<'c> {
    pub fn new(catalog: &'c CompiledCatalog) -> Self {
        Self {
            catalog,
            config: FusionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: FusionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn run(&self, graph: &mut Graph) -> Result<FusionStats, FusionError> {
        let limit = self
            .config
            .max_rewrites
            .unwrap_or_else(|| (self.catalog.len() * graph.node_count()).max(1));
        let mut stats = FusionStats::default();
        let mut state = DriverState::Scanning;

        loop {
            state = match state {
                DriverState::Scanning => {
                    stats.scans += 1;
                    match self.scan(graph) {
                        Some((entry, matched)) => DriverState::Rewriting { entry, matched },
                        None => DriverState::Done,
                    }
                }
                DriverState::Rewriting { entry, matched } => {
                    if stats.rewrites >= limit {
                        tracing::warn!(
                            rewrites = stats.rewrites,
                            limit,
                            "fusion did not converge"
                        );
                        return Err(FusionError::NonConvergence {
                            rewrites: stats.rewrites,
                            limit,
                        });
                    }
                    self.rewrite(graph, entry, &matched, &mut stats);
                    DriverState::Scanning
                }
                DriverState::Done => break,
            };
        }

        tracing::debug!(
            scans = stats.scans,
            rewrites = stats.rewrites,
            pruned_constants = stats.pruned_constants,
            "fusion reached fixpoint"
        );
        Ok(stats)
    }

    /// First filter-accepted match of the earliest entry that has one.
    fn scan(&self, graph: &Graph) -> Option<(usize, Match)> {
        for (index, entry) in self.catalog.entries().iter().enumerate() {
            for matched in entry.matches(graph) {
                if entry.accepts(graph, &matched) {
                    return Some((index, matched));
                }
                tracing::trace!(
                    entry = entry.name(),
                    anchor = %matched.anchor(),
                    "match rejected by filter"
                );
            }
        }
        None
    }

    fn rewrite(&self, graph: &mut Graph, entry: usize, matched: &Match, stats: &mut FusionStats) {
        let compiled = &self.catalog.entries()[entry];
        let mut rewriter = SubgraphRewriter::new(graph);
        let outcome = rewriter.apply(matched, compiled.pattern(), compiled.replacement());
        let pruned = if self.config.prune_orphaned_constants {
            rewriter.prune_constants(&outcome.orphaned_constants)
        } else {
            0
        };
        debug_assert!(rewriter.verify(), "rewrite left the graph inconsistent");

        stats.rewrites += 1;
        stats.pruned_constants += pruned;
        *stats.applied.entry(compiled.name().to_string()).or_default() += 1;
        tracing::debug!(
            entry = compiled.name(),
            anchor = %matched.anchor(),
            removed = outcome.removed,
            inserted = outcome.inserted.len(),
            pruned,
            "applied fusion"
        );
    }
}

/// Runs `catalog` over `graph` with [`FusionConfig::from_env`].
pub fn fuse(graph: &mut Graph, catalog: &CompiledCatalog) -> Result<FusionStats, FusionError> {
    FusionDriver::new(catalog)
        .with_config(FusionConfig::from_env())
        .run(graph)
}

//! Fusion catalogs: ordered pattern/replacement records and their compiled form.

pub mod quantization;

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::filter::MatchFilter;
use crate::graph::Graph;
use crate::pattern::{compile, compile_replacement, match_all, Match, Matches, PatternError, PatternGraph};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("entry `{name}`: invalid pattern: {source}")]
    Pattern {
        name: String,
        #[source]
        source: PatternError,
    },
    #[error("entry `{name}`: invalid replacement: {source}")]
    Replacement {
        name: String,
        #[source]
        source: PatternError,
    },
    #[error("entry `{name}`: pattern has {pattern} inputs but replacement has {replacement}")]
    InputArity {
        name: String,
        pattern: usize,
        replacement: usize,
    },
    #[error("entry `{name}`: pattern has {pattern} outputs but replacement has {replacement}")]
    OutputArity {
        name: String,
        pattern: usize,
        replacement: usize,
    },
    #[error("entry `{name}`: filter references unknown symbol `%{symbol}`")]
    UnknownSymbol { name: String, symbol: String },
    #[error("invalid fusion catalog json: {0}")]
    Json(#[from] serde_json::Error),
}

/// One declarative fusion: rewrite occurrences of `pattern` into `replacement`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionEntry {
    /// Name of the fused operator, used for statistics and logs.
    pub name: String,
    pub pattern: String,
    pub replacement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<MatchFilter>,
}

impl FusionEntry {
    pub fn new(
        name: impl Into<String>,
        pattern: impl Into<String>,
        replacement: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            replacement: replacement.into(),
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: MatchFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Compiles pattern and replacement and checks that they fit together.
    pub fn compile(&self) -> Result<CompiledEntry, CatalogError> {
        let pattern = compile(&self.pattern).map_err(|source| CatalogError::Pattern {
            name: self.name.clone(),
            source,
        })?;
        let replacement =
            compile_replacement(&self.replacement).map_err(|source| CatalogError::Replacement {
                name: self.name.clone(),
                source,
            })?;

        if pattern.inputs().len() != replacement.inputs().len() {
            return Err(CatalogError::InputArity {
                name: self.name.clone(),
                pattern: pattern.inputs().len(),
                replacement: replacement.inputs().len(),
            });
        }
        if pattern.outputs().len() != replacement.outputs().len() {
            return Err(CatalogError::OutputArity {
                name: self.name.clone(),
                pattern: pattern.outputs().len(),
                replacement: replacement.outputs().len(),
            });
        }
        if let Some(filter) = &self.filter {
            if let Some(symbol) = filter
                .symbols()
                .into_iter()
                .find(|symbol| !pattern.symbols().contains(symbol))
            {
                return Err(CatalogError::UnknownSymbol {
                    name: self.name.clone(),
                    symbol: symbol.trim_start_matches('%').to_string(),
                });
            }
        }

        Ok(CompiledEntry {
            name: self.name.clone(),
            pattern,
            replacement,
            filter: self.filter.clone(),
        })
    }
}

/// Ordered list of fusion entries.
///
/// Order is priority: the driver always applies a match of the earliest entry
/// that has one, so specific patterns (e.g. `add` followed by `relu`) must be
/// listed before the general patterns they contain (plain `add`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FusionCatalog {
    entries: Vec<FusionEntry>,
}

impl FusionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: FusionEntry) {
        self.entries.push(entry);
    }

    pub fn with(mut self, entry: FusionEntry) -> Self {
        self.push(entry);
        self
    }

    pub fn entries(&self) -> &[FusionEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parses a JSON array of entries.
    pub fn from_json(text: &str) -> Result<Self, CatalogError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, CatalogError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reads a catalog from a JSON file.
    pub fn load_json(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fusion catalog {}", path.display()))?;
        Self::from_json(&text)
            .with_context(|| format!("failed to parse fusion catalog {}", path.display()))
    }

    /// Compiles every entry, skipping (and reporting) the malformed ones.
    pub fn compile(&self) -> CompiledCatalog {
        let mut entries = Vec::with_capacity(self.entries.len());
        let mut rejected = Vec::new();
        for (index, entry) in self.entries.iter().enumerate() {
            match entry.compile() {
                Ok(compiled) => entries.push(compiled),
                Err(error) => {
                    tracing::warn!(
                        index,
                        entry = %entry.name,
                        error = %error,
                        "skipping malformed fusion entry"
                    );
                    rejected.push(RejectedEntry {
                        index,
                        name: entry.name.clone(),
                        error,
                    });
                }
            }
        }
        tracing::debug!(
            compiled = entries.len(),
            rejected = rejected.len(),
            "compiled fusion catalog"
        );
        CompiledCatalog { entries, rejected }
    }
}

impl FromIterator<FusionEntry> for FusionCatalog {
    fn from_iter<I: IntoIterator<Item = FusionEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// A fusion entry with its pattern and replacement compiled.
#[derive(Debug, Clone)]
pub struct CompiledEntry {
    name: String,
    pattern: PatternGraph,
    replacement: PatternGraph,
    filter: Option<MatchFilter>,
}

impl CompiledEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> &PatternGraph {
        &self.pattern
    }

    pub fn replacement(&self) -> &PatternGraph {
        &self.replacement
    }

    pub fn filter(&self) -> Option<&MatchFilter> {
        self.filter.as_ref()
    }

    /// Raw structural matches of the pattern in `graph`, filter not applied.
    pub fn matches<'a>(&'a self, graph: &'a Graph) -> Matches<'a> {
        match_all(graph, &self.pattern)
    }

    /// Returns `true` when the entry has no filter or its filter accepts `matched`.
    pub fn accepts(&self, graph: &Graph, matched: &Match) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |filter| filter.accept(matched, self.pattern.symbols(), graph))
    }
}

/// Entry that failed to compile, with its position in the source catalog.
#[derive(Debug)]
pub struct RejectedEntry {
    pub index: usize,
    pub name: String,
    pub error: CatalogError,
}

/// Compiled catalog, immutable and shareable across threads.
#[derive(Debug)]
pub struct CompiledCatalog {
    entries: Vec<CompiledEntry>,
    rejected: Vec<RejectedEntry>,
}

impl CompiledCatalog {
    /// Compiled entries in priority order.
    pub fn entries(&self) -> &[CompiledEntry] {
        &self.entries
    }

    pub fn rejected(&self) -> &[RejectedEntry] {
        &self.rejected
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

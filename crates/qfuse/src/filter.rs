use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::graph::{Graph, Literal, ValueId, ValueType};
use crate::pattern::{Match, SymbolMap};

/// View handed to filters: the target graph, the match and the pattern's symbols.
pub struct FilterContext<'a> {
    graph: &'a Graph,
    matched: &'a Match,
    symbols: &'a SymbolMap,
}

impl<'a> FilterContext<'a> {
    pub fn new(graph: &'a Graph, matched: &'a Match, symbols: &'a SymbolMap) -> Self {
        Self {
            graph,
            matched,
            symbols,
        }
    }

    pub fn graph(&self) -> &'a Graph {
        self.graph
    }

    pub fn matched(&self) -> &'a Match {
        self.matched
    }

    /// Target value bound to the pattern variable `symbol`.
    pub fn value(&self, symbol: &str) -> Option<ValueId> {
        self.matched.symbol(self.symbols, symbol)
    }

    /// Literal of the constant node producing the value bound to `symbol`.
    pub fn constant(&self, symbol: &str) -> Option<&'a Literal> {
        self.graph.constant_value(self.value(symbol)?)
    }

    pub fn value_type(&self, symbol: &str) -> Option<&'a ValueType> {
        self.graph.value_type(self.value(symbol)?)
    }
}

type Predicate = dyn Fn(&FilterContext<'_>) -> bool + Send + Sync;

/// Named user predicate; not serializable.
#[derive(Clone)]
pub struct CustomFilter {
    name: String,
    predicate: Arc<Predicate>,
}

impl CustomFilter {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for CustomFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomFilter")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Match-time semantic check attached to a fusion entry.
///
/// Evaluation is total: a symbol missing from the pattern, an unbound value, a
/// value not produced by a constant or a constant without a `value` attribute
/// all reject the match instead of failing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchFilter {
    /// The value bound to `symbol` comes from a constant equal to `value`.
    /// Integers and floats never compare equal to each other.
    ConstantEquals { symbol: String, value: Literal },
    /// The value bound to `symbol` is typed `int`, `float` or `number`.
    IsScalar { symbol: String },
    All(Vec<MatchFilter>),
    #[serde(skip)]
    Custom(CustomFilter),
}

impl MatchFilter {
    pub fn constant_equals(symbol: impl Into<String>, value: impl Into<Literal>) -> Self {
        MatchFilter::ConstantEquals {
            symbol: symbol.into(),
            value: value.into(),
        }
    }

    pub fn is_scalar(symbol: impl Into<String>) -> Self {
        MatchFilter::IsScalar {
            symbol: symbol.into(),
        }
    }

    pub fn all(filters: impl IntoIterator<Item = MatchFilter>) -> Self {
        MatchFilter::All(filters.into_iter().collect())
    }

    /// Wraps a user predicate. A predicate that panics rejects the match.
    pub fn custom<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&FilterContext<'_>) -> bool + Send + Sync + 'static,
    {
        MatchFilter::Custom(CustomFilter {
            name: name.into(),
            predicate: Arc::new(predicate),
        })
    }

    /// Conjunction of `self` and `other`, flattening nested `All`s.
    pub fn and(self, other: MatchFilter) -> Self {
        let mut filters = match self {
            MatchFilter::All(filters) => filters,
            single => vec![single],
        };
        match other {
            MatchFilter::All(more) => filters.extend(more),
            single => filters.push(single),
        }
        MatchFilter::All(filters)
    }

    pub fn accept(&self, matched: &Match, symbols: &SymbolMap, graph: &Graph) -> bool {
        self.evaluate(&FilterContext::new(graph, matched, symbols))
    }

    fn evaluate(&self, cx: &FilterContext<'_>) -> bool {
        match self {
            MatchFilter::ConstantEquals { symbol, value } => cx.constant(symbol) == Some(value),
            MatchFilter::IsScalar { symbol } => cx
                .value_type(symbol)
                .map(ValueType::is_scalar)
                .unwrap_or(false),
            MatchFilter::All(filters) => filters.iter().all(|filter| filter.evaluate(cx)),
            MatchFilter::Custom(custom) => {
                let verdict = panic::catch_unwind(AssertUnwindSafe(|| (custom.predicate)(cx)));
                verdict.unwrap_or_else(|_| {
                    tracing::warn!(filter = %custom.name, "custom filter panicked; rejecting match");
                    false
                })
            }
        }
    }

    /// Pattern symbols referenced by the built-in variants.
    pub fn symbols(&self) -> Vec<&str> {
        match self {
            MatchFilter::ConstantEquals { symbol, .. } | MatchFilter::IsScalar { symbol } => {
                vec![symbol.as_str()]
            }
            MatchFilter::All(filters) => filters.iter().flat_map(MatchFilter::symbols).collect(),
            MatchFilter::Custom(_) => Vec::new(),
        }
    }
}

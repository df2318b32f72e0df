pub mod catalog;
pub mod driver;
mod env;
pub mod filter;
pub mod graph;
pub mod pattern;
pub mod rewriter;
pub mod text_ir;

pub use catalog::{CompiledCatalog, FusionCatalog, FusionEntry};
pub use driver::{fuse, FusionConfig, FusionDriver, FusionError, FusionStats};
pub use filter::MatchFilter;
pub use graph::{Graph, NodeId, ValueId, ValueType};
pub use pattern::{compile, Match, PatternGraph};
pub use rewriter::SubgraphRewriter;

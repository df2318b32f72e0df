use std::env;
use std::sync::OnceLock;

static QFUSE_MAX_REWRITES: OnceLock<Option<usize>> = OnceLock::new();
static QFUSE_PRUNE_CONSTANTS: OnceLock<Option<bool>> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// Rewrite budget from `QFUSE_MAX_REWRITES`, `None` when unset or invalid.
pub(crate) fn max_rewrites() -> Option<usize> {
    *QFUSE_MAX_REWRITES.get_or_init(|| match env::var("QFUSE_MAX_REWRITES") {
        Ok(value) if !value.trim().is_empty() => match value.trim().parse() {
            Ok(limit) => Some(limit),
            Err(_) => {
                tracing::warn!(value = %value, "ignoring invalid QFUSE_MAX_REWRITES");
                None
            }
        },
        _ => None,
    })
}

/// `QFUSE_PRUNE_CONSTANTS` as a flag, `None` when unset.
pub(crate) fn prune_constants() -> Option<bool> {
    *QFUSE_PRUNE_CONSTANTS.get_or_init(|| match env::var("QFUSE_PRUNE_CONSTANTS") {
        Ok(value) if !value.trim().is_empty() => Some(parse_bool(&value)),
        _ => None,
    })
}

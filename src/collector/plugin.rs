//! Per-object enrichment plugin dispatch.
//!
//! Plugins run over the emitted matrix map after post-processing (NIC
//! speed derivation, volume roll-ups, and the like). The engine only owns
//! the dispatch seam; object plugins register by kind.

use tracing::info;

use super::MatrixMap;

/// A per-object enrichment hook.
pub trait Plugin {
    /// Plugin name for logging.
    fn name(&self) -> &str;

    /// Runs over the emitted matrices; may add derived metrics or labels.
    fn run(&mut self, matrices: &mut MatrixMap) -> anyhow::Result<()>;
}

/// Resolves a plugin by template kind. Unknown kinds resolve to nothing.
pub fn load_plugin(kind: &str) -> Option<Box<dyn Plugin>> {
    info!(kind, "no plugin found");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_kind_resolves_to_none() {
        assert!(load_plugin("Nic").is_none());
        assert!(load_plugin("").is_none());
    }
}

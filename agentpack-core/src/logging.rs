//! Tracing setup for binaries and tests embedding the package manager.

use tracing_subscriber::EnvFilter;

/// Default directive applied on top of `RUST_LOG`.
pub const DEFAULT_DIRECTIVE: &str = "agentpack_core=info";

/// Installs a `fmt` subscriber filtered by `RUST_LOG` plus `default_directive`.
///
/// Returns false if a global subscriber was already installed, so it is safe
/// to call more than once.
pub fn init_tracing(default_directive: &str) -> bool {
    let mut filter = EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into());
    match default_directive.parse() {
        Ok(directive) => filter = filter.add_directive(directive),
        Err(e) => eprintln!("Ignoring invalid log directive '{}': {}", default_directive, e),
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_tracing(DEFAULT_DIRECTIVE);
        assert!(!init_tracing("agentpack_core=debug"));
    }

    #[test]
    fn test_invalid_directive_does_not_panic() {
        init_tracing("=[not a directive");
    }
}

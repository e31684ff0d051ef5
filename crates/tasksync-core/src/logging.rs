//! Tracing subscriber setup for embedding applications.

use tracing_subscriber::EnvFilter;

/// Default filter applied when `RUST_LOG` does not mention this crate
pub const DEFAULT_DIRECTIVE: &str = "tasksync=info";

/// Install a fmt subscriber filtered by `RUST_LOG` plus `directive`.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init(directive: &str) -> bool {
    let mut filter = EnvFilter::from_default_env();
    match directive.parse() {
        Ok(directive) => filter = filter.add_directive(directive),
        Err(error) => eprintln!("Ignoring invalid log directive '{directive}': {error}"),
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}

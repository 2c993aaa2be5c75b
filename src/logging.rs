use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_DIRECTIVE: &str = "wakey=info";
const VERBOSE_DIRECTIVE: &str = "wakey=debug";

/// Installs the global subscriber. `RUST_LOG` wins over `verbose` when set.
/// Logs go to stderr so stdout stays free for command output.
pub fn init(verbose: bool) {
    let fallback = if verbose {
        VERBOSE_DIRECTIVE
    } else {
        DEFAULT_DIRECTIVE
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}

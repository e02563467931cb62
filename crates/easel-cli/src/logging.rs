//! Tracing subscriber setup from the `logging` config section.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use easel_core::config::LoggingConfig;

/// Filter directives for the given settings, ignoring `RUST_LOG`.
/// `--verbose` forces debug over the configured level.
pub fn directives(config: Option<&LoggingConfig>, verbose: bool) -> Vec<String> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config
            .and_then(|c| c.level.clone())
            .unwrap_or_else(|| "info".to_string())
    };

    let mut directives = vec![level];
    if let Some(config) = config {
        directives.extend(config.filters.iter().cloned());
    }
    directives
}

fn build_filter(config: Option<&LoggingConfig>, verbose: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let mut filter = EnvFilter::new("");
    for directive in directives(config, verbose) {
        match directive.parse() {
            Ok(d) => filter = filter.add_directive(d),
            Err(e) => eprintln!("Warning: ignoring log filter '{directive}': {e}"),
        }
    }
    filter
}

/// Install the global subscriber. `RUST_LOG` wins over the config when set.
pub fn init(config: Option<&LoggingConfig>, verbose: bool) -> anyhow::Result<()> {
    let filter = build_filter(config, verbose);
    let json = config.is_some_and(|c| c.format == "json");
    let writer = match config.map(|c| c.output.as_str()) {
        Some("stdout") => BoxMakeWriter::new(std::io::stdout),
        _ => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialise logging: {e}"))
}

// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result, bail};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

// dependencies that trace every request; nobody reading release logs wants them
const SILENCED: &[&str] = &["h2", "hyper", "hyper_util", "rustls", "reqwest", "tough"];

fn filter(log_level: &str) -> Result<EnvFilter> {
    let mut filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level '{}'", log_level))?;
    for target in SILENCED {
        filter = filter.add_directive(format!("{}=off", target).parse()?);
    }
    Ok(filter)
}

/// Sends log events to stderr; stdout is reserved for the JSON reports.
pub(crate) fn setup_tracing(log_level: &str, log_fmt: &str, log_no_color: bool) -> Result<()> {
    let filter_layer = filter(log_level)?;

    match log_fmt {
        "json" => tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?,
        "text" => tracing_subscriber::registry()
            .with(filter_layer)
            .with(
                fmt::layer()
                    .with_ansi(!log_no_color)
                    .with_writer(std::io::stderr),
            )
            .try_init()?,
        other => bail!("Unknown log message format '{}'", other),
    };

    Ok(())
}

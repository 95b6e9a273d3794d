use survey_kernel_core::SurveyError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global subscriber. `RUST_LOG` wins over `default_level`.
/// Output goes to stderr so command output on stdout stays parseable.
///
/// # Errors
/// Returns [`SurveyError::Configuration`] for an invalid filter or when a
/// subscriber is already installed.
pub fn init_tracing(default_level: &str) -> Result<(), SurveyError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|err| SurveyError::Configuration(format!("invalid log filter: {err}")))?;

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|err| SurveyError::Configuration(format!("failed to initialize logging: {err}")))
}

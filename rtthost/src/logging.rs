use std::{fs::File, path::Path};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Level used when neither the config nor `RUST_LOG` says otherwise.
const DEFAULT_LEVEL: LevelFilter = LevelFilter::WARN;

/// Serde support for an optional [`LevelFilter`], written as its name (`"debug"`, `"off"`).
pub mod level_filter {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use tracing::level_filters::LevelFilter;

    pub fn serialize<S: Serializer>(
        level: &Option<LevelFilter>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match level {
            Some(level) => serializer.serialize_some(&level.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<LevelFilter>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|name| name.parse().map_err(D::Error::custom))
            .transpose()
    }
}

/// Filter directives for the stderr log at `level`.
///
/// The read and write engines log every cycle at trace level, which floods a terminal at the
/// poll rate. They are capped at debug here, the log file still gets their debug output.
fn console_directives(level: LevelFilter) -> String {
    let engine = level.min(LevelFilter::DEBUG);
    format!("{level},rtt_relay::reader={engine},rtt_relay::writer={engine}")
}

/// Installs the global subscriber.
///
/// Log lines go to stderr, stdout belongs to the console channel. With a `level` from the
/// config or the command line `RUST_LOG` is ignored. With a `log_file`, debug output is also
/// written there as JSON by a background thread that lives as long as the returned guard.
pub fn setup_logging(
    log_file: Option<&Path>,
    level: Option<LevelFilter>,
) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = match level {
        Some(level) => EnvFilter::builder().parse_lossy(console_directives(level)),
        None => EnvFilter::builder()
            .with_default_directive(DEFAULT_LEVEL.into())
            .from_env_lossy(),
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .without_time()
        .with_writer(std::io::stderr)
        .with_filter(filter);

    let Some(path) = log_file else {
        tracing_subscriber::registry().with(stderr_layer).init();
        return Ok(None);
    };

    let (writer, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .lossy(false)
        .thread_name("rtthost-log")
        .finish(File::create(path)?);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_thread_names(true)
        .with_current_span(false)
        .with_writer(writer)
        .with_filter(LevelFilter::DEBUG);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    tracing::info!("Writing log to {}", path.display());
    Ok(Some(guard))
}

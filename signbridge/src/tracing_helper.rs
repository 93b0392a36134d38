use std::{num::NonZeroU8, panic, path::Path};

use anyhow::Result;
use time::format_description::well_known::{iso8601, Iso8601};
use tracing::{error, Level};
use tracing_subscriber::{
    fmt::{time::LocalTime, writer::MakeWriterExt},
    prelude::__tracing_subscriber_SubscriberExt,
    EnvFilter, Layer,
};

const MY_CONFIG: iso8601::EncodedConfig = iso8601::Config::DEFAULT
    .set_time_precision(iso8601::TimePrecision::Second {
        decimal_digits: NonZeroU8::new(3),
    })
    .encode();

fn make_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("signbridge=debug,signbridge_lib=debug")
        } else {
            EnvFilter::new("signbridge=info,signbridge_lib=info")
        }
    })
}

/// Logs to stderr, and mirrors warnings to `log_file` when given.
pub fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    fn default_layer<S>() -> tracing_subscriber::fmt::Layer<
        S,
        tracing_subscriber::fmt::format::DefaultFields,
        tracing_subscriber::fmt::format::Format<
            tracing_subscriber::fmt::format::Compact,
            LocalTime<Iso8601<MY_CONFIG>>,
        >,
    > {
        const WITH_FILE_PATH: bool = cfg!(debug_assertions);
        tracing_subscriber::fmt::layer()
            .compact()
            .with_file(WITH_FILE_PATH)
            .with_line_number(WITH_FILE_PATH)
            .with_target(!WITH_FILE_PATH)
            .with_thread_ids(true)
            .with_timer(LocalTime::new(Iso8601::<MY_CONFIG>))
    }
    let console = default_layer()
        .with_writer(std::io::stderr)
        .with_filter(make_filter());

    let file = log_file.map(|path| {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let file_name = path.file_name().unwrap_or(path.as_os_str());
        let writer = tracing_appender::rolling::never(dir, file_name);
        default_layer()
            .with_ansi(false)
            .with_writer(writer.with_max_level(Level::WARN))
            .with_filter(make_filter())
    });

    tracing::subscriber::set_global_default(
        tracing_subscriber::registry().with(console).with(file),
    )?;

    panic::set_hook(Box::new(|panic| error!("{}", panic)));
    Ok(())
}

use time::{UtcOffset, format_description::well_known::Iso8601};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, time::OffsetTime},
    layer::SubscriberExt,
};

/// Used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "opto_rig=info,rig_sync=info,rig_video_writer=info,warn";

struct Guard {}

impl Drop for Guard {
    fn drop(&mut self) {
        tracing::debug!("logging done");
    }
}

/// Start logging to file and console, both optional. Keep the returned
/// guard alive until the program ends.
pub fn initiate_logging<P: AsRef<std::path::Path>>(
    path: Option<P>,
    disable_console: bool,
) -> Result<impl Drop, Box<dyn std::error::Error + Send + Sync + 'static>> {
    // Fixed offset of the local timezone at startup.
    let timer = OffsetTime::new(
        UtcOffset::from_whole_seconds(chrono::Local::now().offset().local_minus_utc())?,
        Iso8601::DEFAULT,
    );

    let file_layer = if let Some(path) = &path {
        let file = std::fs::File::create(path)?;
        Some(
            fmt::layer()
                .with_timer(timer.clone())
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true),
        )
    } else {
        None
    };

    let console_layer = if disable_console {
        None
    } else {
        Some(
            fmt::layer()
                .with_timer(timer)
                .with_ansi(!cfg!(windows))
                .with_thread_names(true),
        )
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let collector = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(filter);
    tracing::subscriber::set_global_default(collector)?;

    match (&path, std::env::var("RUST_LOG")) {
        (Some(path), Ok(var)) => tracing::debug!(
            "logging to \"{}\" with RUST_LOG=\"{var}\"",
            path.as_ref().display()
        ),
        (Some(path), Err(_)) => tracing::debug!("logging to \"{}\"", path.as_ref().display()),
        (None, _) => {}
    }

    Ok(Guard {})
}

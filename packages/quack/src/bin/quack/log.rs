use clap::ValueEnum;
use color_eyre::{Result, eyre::Context as _};
use tracing_error::ErrorLayer;
use tracing_subscriber::{Layer as _, fmt::MakeWriter, layer::SubscriberExt as _};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Default, ValueEnum)]
pub enum WhenColor {
    Always,
    Never,
    #[default]
    Auto,
}

/// Build the subscriber for the invocation.
///
/// Filtering comes from `QUACK_LOG` when set, otherwise from the
/// `--log-level` flag / `log_level` config default.
pub fn make_logger<W>(
    writer: W,
    color: WhenColor,
    default_level: &str,
) -> Result<impl tracing::Subscriber>
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let default_directive = default_level
        .to_lowercase()
        .parse()
        .with_context(|| format!("invalid log level: {default_level}"))?;

    let logger = tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with({
            let layer = tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(false)
                .with_writer(writer);
            match color {
                WhenColor::Always => layer.with_ansi(true),
                WhenColor::Never => layer.with_ansi(false),
                WhenColor::Auto => layer,
            }
            .with_filter(
                tracing_subscriber::EnvFilter::builder()
                    .with_env_var("QUACK_LOG")
                    .with_default_directive(default_directive)
                    .from_env_lossy(),
            )
        });

    Ok(logger)
}

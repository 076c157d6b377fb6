use crate::config::Config;
use anyhow::Result;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// `RUST_LOG`, when set, replaces the levels picked by the flags.
pub fn init(config: &Config) -> Result<()> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(_) => EnvFilter::try_from_default_env()?,
        Err(_) => EnvFilter::builder()
            .with_default_directive(config.all_log_level().into())
            .parse(format!(
                "localctl={level},pod_logs={level}",
                level = config.log_level()
            ))?,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(config.log_level() >= LevelFilter::DEBUG))
        .with(filter)
        .init();

    Ok(())
}

/// Installs a global `tracing` subscriber printing log lines above the
/// progress bars of running tasks. The filter is read from `RUST_LOG` and
/// defaults to `info`.
///
/// Fails if a global subscriber has already been installed.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .try_init()?;

    Ok(())
}

/// Without the `logging` feature the application is expected to install its
/// own subscriber.
#[cfg(not(feature = "logging"))]
pub fn init_logging() -> anyhow::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(feature = "logging")]
    fn test_init_logging_once() {
        init_logging().unwrap();
        assert!(init_logging().is_err());
    }

    #[test]
    #[cfg(not(feature = "logging"))]
    fn test_init_logging_noop() {
        assert!(init_logging().is_ok());
        assert!(init_logging().is_ok());
    }
}

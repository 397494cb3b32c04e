use crate::Result;

/// Initialize tracing for the relay.
///
/// Default: info for the relay crates, warn for everything else.
/// Can be overridden with `RUST_LOG`. A second call is a no-op.
pub fn init(service_name: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,relay=info,relay_core=info,relay_telegram=info,{service_name}=info"
        ))
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(true)
        .try_init();

    Ok(())
}

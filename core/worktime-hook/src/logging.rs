use tracing_subscriber::EnvFilter;

pub const DEBUG_ENV: &str = "WORKTIME_DEBUG";

/// True when `WORKTIME_DEBUG` is set to anything but `0`/`false`/empty.
pub fn debug_from_env() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|value| {
            let value = value.trim();
            !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false")
        })
        .unwrap_or(false)
}

/// Installs a stderr subscriber only in debug mode. Outside debug mode no
/// subscriber exists, so the capture path does no logging I/O at all.
pub fn init(debug: bool) {
    if !debug {
        return;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("worktime_hook=debug,worktime_core=debug"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

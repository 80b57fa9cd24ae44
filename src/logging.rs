use tracing_subscriber::EnvFilter;

const FILTER_VAR: &str = "FINANCE_MIGRATION_LOG";
const JSON_VAR: &str = "FINANCE_MIGRATION_LOG_JSON";
const DEFAULT_FILTER: &str = "finance_migration=info";

/// Install the global tracing subscriber.
///
/// The filter comes from `FINANCE_MIGRATION_LOG` (falls back to
/// `finance_migration=info`). Setting `FINANCE_MIGRATION_LOG_JSON=1` switches
/// to one JSON object per line. Calling this twice is harmless: the second
/// install is ignored.
pub fn init() {
    let filter = EnvFilter::try_from_env(FILTER_VAR)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let json = std::env::var(JSON_VAR)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

use kestrel_pbr::cli::CliOverrides;
use kestrel_pbr::config::AppConfig;
use kestrel_pbr::run;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();

    let cli = match CliOverrides::parse_from_env() {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("[cli] {err}");
            std::process::exit(2);
        }
    };
    let mut config = AppConfig::load_or_default(cli.config_path());
    let overrides = cli.config_overrides();
    if !overrides.is_empty() {
        tracing::info!(fields = ?overrides.applied_fields(), "applying command-line overrides");
    }
    config.apply_overrides(&overrides);
    if let Err(err) = config.validate() {
        tracing::error!("Invalid configuration: {err}");
        std::process::exit(2);
    }
    if let Err(err) = run(config, cli.debug_overlay().unwrap_or_default()) {
        tracing::error!("Application error: {err:?}");
        std::process::exit(1);
    }
}

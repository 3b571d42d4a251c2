pub mod models {
    pub mod energy;
    pub mod pointt;
}

pub mod aggregate;
pub mod client;
pub mod config;
pub mod shutdown;
pub mod tokens;
pub mod transport;
pub mod services {
    pub mod publish;
    pub mod sync;
}

use crate::client::PointtClient;
use crate::config::{Config, load_env_file};
use crate::models::pointt::GatewayId;
use crate::services::publish;
use crate::services::sync::{CycleOutcome, CycleStatus, SyncCoordinator, run_loop};
use crate::shutdown::Shutdown;
use crate::tokens::{TokenState, TokenStore};
use crate::transport::{Transport, UreqTransport};
use chrono::Local;
use log::{error, info, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

#[derive(Debug, Default)]
struct CliArgs {
    env_file: Option<PathBuf>,
    once: bool,
}

/// Configured gateway if set, else the account's only gateway.
fn select_gateway(configured: Option<&GatewayId>, discovered: &BTreeSet<GatewayId>) -> Result<GatewayId, String> {
    if let Some(id) = configured {
        if !discovered.contains(id) {
            warn!("Configured gateway {} is not among the account's gateways; using it anyway", id);
        }
        return Ok(id.clone());
    }
    let listed = || discovered.iter().map(|g| g.0.as_str()).collect::<Vec<_>>().join(", ");
    match discovered.len() {
        0 => Err("No gateways found; ensure the account has a paired heat pump".to_string()),
        1 => discovered
            .first()
            .cloned()
            .ok_or_else(|| "No gateways found".to_string()),
        n => Err(format!("{} gateways found ({}); set IVT_GATEWAY_ID to pick one", n, listed())),
    }
}

fn publish_snapshot(cfg: &Config, coordinator: &SyncCoordinator) {
    let snapshot = coordinator.snapshot();
    publish::log_readings(&snapshot);
    if let Some(path) = &cfg.readings_file
        && let Err(e) = publish::write_snapshot(path, &snapshot)
    {
        error!("Publishing readings failed: {}", e);
    }
}

/// Re-read the tokens file while authentication is failing; a new refresh
/// token there (e.g. from a fresh browser login) resumes syncing.
fn reload_credentials(cfg: &Config, coordinator: &SyncCoordinator) {
    if !cfg.tokens_file.is_file() {
        return;
    }
    match TokenState::load(&cfg.tokens_file) {
        Ok(state) if state.refresh_token != coordinator.token_state().refresh_token => {
            info!("New credentials found in {}", cfg.tokens_file.display());
            coordinator.replace_credentials(state);
        }
        Ok(_) => warn!(
            "Re-authentication required: put a new refresh token into {}",
            cfg.tokens_file.display()
        ),
        Err(e) => warn!("{}", e),
    }
}

/// Trigger `shutdown` on SIGINT/SIGTERM.
fn install_signal_handlers(shutdown: &Shutdown) -> Result<(), String> {
    let mut signals = Signals::new([SIGTERM, SIGINT]).map_err(|e| format!("registering signal handler failed: {}", e))?;
    let shutdown = shutdown.clone();
    thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!("Signal {} received; shutting down", signal);
            shutdown.trigger();
        }
    });
    Ok(())
}

fn run(args: &CliArgs) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (sync_interval={}s, bulk_max_attempts={}, retry_base_delay={}ms, http_timeout={}s, tokens_file={}, readings_file={})",
        cfg.sync_interval.as_secs(),
        cfg.bulk_max_attempts.get(),
        cfg.retry_base_delay.as_millis(),
        cfg.http_timeout.as_secs(),
        cfg.tokens_file.display(),
        cfg.readings_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string()),
    );

    let shutdown = Shutdown::new();
    install_signal_handlers(&shutdown)?;

    // 2) Init client
    let transport: Arc<dyn Transport> = Arc::new(UreqTransport::new(cfg.http_timeout));
    let tokens = TokenStore::new(transport.clone(), cfg.initial_token_state()?, cfg.token_expiry_margin)
        .with_tokens_file(Some(cfg.tokens_file.clone()));
    let client = PointtClient::new(transport, Arc::new(tokens), shutdown.clone())
        .with_policies(cfg.retry_policy(), cfg.retry_policy());

    // 3) Discover gateways
    let discovered = client
        .fetch_gateways()
        .map_err(|e| format!("Gateway discovery failed (refresh token invalid/expired?): {}", e))?;
    info!("Discovered {} gateway(s)", discovered.len());
    let gateway = select_gateway(cfg.gateway_id.as_ref(), &discovered)?;
    info!("Using gateway {}", gateway);

    let coordinator = SyncCoordinator::new(client, gateway);

    // 4) Single cycle or steady-cadence loop
    if args.once {
        let outcome = coordinator.run_cycle(Local::now().naive_local());
        publish_snapshot(&cfg, &coordinator);
        return match outcome {
            CycleOutcome::Published | CycleOutcome::Cancelled | CycleOutcome::Skipped => Ok(()),
            CycleOutcome::Failed | CycleOutcome::AuthFailed => Err(format!(
                "Sync cycle {:?}: {}",
                outcome,
                coordinator.snapshot().last_error.unwrap_or_default()
            )),
        };
    }

    info!("Starting sync loop: interval={}s", cfg.sync_interval.as_secs());
    run_loop(&coordinator, cfg.sync_interval, &shutdown, |coordinator, outcome| {
        if outcome != CycleOutcome::Skipped {
            publish_snapshot(&cfg, coordinator);
        }
        if coordinator.status() == CycleStatus::AuthFailed {
            reload_credentials(&cfg, coordinator);
        }
    });
    info!("Sync loop stopped");
    Ok(())
}

fn parse_cli(args: impl IntoIterator<Item = std::ffi::OsString>) -> Result<CliArgs, String> {
    let mut args = args.into_iter();
    let mut cli = CliArgs::default();

    while let Some(arg) = args.next() {
        match arg.to_str() {
            Some("--env-file") => {
                if cli.env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                let value = args
                    .next()
                    .ok_or_else(|| "`--env-file` requires a path argument".to_string())?;
                cli.env_file = Some(PathBuf::from(value));
            }
            Some(s) if s.starts_with("--env-file=") => {
                if cli.env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                let path_str = &s["--env-file=".len()..];
                if path_str.is_empty() {
                    return Err("`--env-file` requires a path argument".to_string());
                }
                cli.env_file = Some(PathBuf::from(path_str));
            }
            Some("--once") => cli.once = true,
            Some("--") => break,
            Some(other) => return Err(format!("unrecognised argument: {}", other)),
            None => return Err("argument contains invalid UTF-8".to_string()),
        }
    }
    Ok(cli)
}

fn configure_env(cli: &CliArgs) -> Result<Option<LoadedEnvFile>, String> {
    if let Some(path) = &cli.env_file {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        load_env_file(path)?;
        return Ok(Some(LoadedEnvFile {
            path: path.clone(),
            explicit: true,
        }));
    }

    let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
    let default_path = cwd.join(".env");
    if default_path.is_file() {
        load_env_file(&default_path)?;
        Ok(Some(LoadedEnvFile {
            path: default_path,
            explicit: false,
        }))
    } else {
        Ok(None)
    }
}

fn main() {
    let (cli, loaded_env) = match parse_cli(std::env::args_os().skip(1))
        .and_then(|cli| configure_env(&cli).map(|loaded| (cli, loaded)))
    {
        Ok(v) => v,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "ivt-energy-sync {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(&cli) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    fn args(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    fn ids(list: &[&str]) -> BTreeSet<GatewayId> {
        list.iter().map(|s| GatewayId(s.to_string())).collect()
    }

    #[test]
    fn cli_flags() {
        let cli = parse_cli(args(&["--env-file", "prod.env", "--once"])).unwrap();
        assert_eq!(cli.env_file, Some(PathBuf::from("prod.env")));
        assert!(cli.once);

        let cli = parse_cli(args(&["--env-file=x.env"])).unwrap();
        assert_eq!(cli.env_file, Some(PathBuf::from("x.env")));
        assert!(!cli.once);

        assert!(parse_cli(args(&["--env-file"])).is_err());
        assert!(parse_cli(args(&["--env-file=a", "--env-file=b"])).is_err());
        assert!(parse_cli(args(&["--verbose"])).is_err());
    }

    #[test]
    fn termination_signal_triggers_shutdown() {
        let shutdown = Shutdown::new();
        install_signal_handlers(&shutdown).unwrap();
        signal_hook::low_level::raise(SIGTERM).unwrap();
        assert!(shutdown.sleep(std::time::Duration::from_secs(5)).is_err());
    }

    #[test]
    fn single_gateway_is_selected_automatically() {
        assert_eq!(select_gateway(None, &ids(&["101"])).unwrap(), GatewayId("101".into()));
    }

    #[test]
    fn several_gateways_need_configuration() {
        let err = select_gateway(None, &ids(&["101", "202"])).unwrap_err();
        assert!(err.contains("101, 202"));
        assert!(select_gateway(None, &ids(&[])).is_err());
        assert_eq!(
            select_gateway(Some(&GatewayId("202".into())), &ids(&["101", "202"])).unwrap(),
            GatewayId("202".into())
        );
    }

    #[test]
    fn configured_gateway_wins_even_if_not_discovered() {
        assert_eq!(
            select_gateway(Some(&GatewayId("303".into())), &ids(&["101"])).unwrap(),
            GatewayId("303".into())
        );
    }
}

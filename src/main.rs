use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use simple_logger::SimpleLogger;

use freeproxy_engine::api::server::ApiServer;
use freeproxy_engine::config::Config;
use freeproxy_engine::manager::{Manager, ManagerConfig};
use freeproxy_engine::scraper::{Scraper, ScraperConfig};
use freeproxy_engine::utils::error::ProxyError;
use freeproxy_engine::utils::shutdown::setup_signal_handlers;
use freeproxy_engine::validator::{get_origin_ip, HttpbinValidator, ResponseMatchValidator, Validator};

/// Minimal CLI surface: a config file and ad-hoc `-s NAME=VALUE` overrides,
/// matching §6's "recognized keys" table. Everything else (daemonizing,
/// the Squid reconfigurator, on-disk persistence) is an external
/// collaborator this binary does not implement.
#[derive(Parser, Debug)]
#[command(name = "freeproxy-engine", version)]
struct Cli {
    /// Path to a TOML config file.
    #[arg(short, long)]
    config: Option<String>,

    /// Override a config key, e.g. `-s queueSize=200`. May be repeated.
    #[arg(short = 's', long = "set", value_name = "NAME=VALUE")]
    overrides: Vec<String>,
}

fn load_config(cli: &Cli) -> Result<Config, ProxyError> {
    let mut config = match &cli.config {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .map_err(|e| ProxyError::Config(format!("failed to read {}: {}", path, e)))?;
            Config::from_toml(&content)?
        }
        None => Config::default(),
    };
    for pair in &cli.overrides {
        config.apply_override(pair)?;
    }
    Ok(config)
}

fn init_logging(config: &Config) -> Result<(), ProxyError> {
    let level = match config.log_level.as_str() {
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Warn,
    };
    SimpleLogger::new()
        .with_level(log::LevelFilter::Off)
        .with_module_level("freeproxy_engine", level)
        .init()
        .map_err(|e| ProxyError::Config(format!("failed to initialize logger: {}", e)))
}

/// Select a `Validator` impl by the `checker` config key, matching §9's
/// "selected by a config string" dispatch. Any value not naming
/// `ResponseMatchValidator`/`response_match_checker` falls back to the
/// default `HttpbinValidator`.
fn build_validator(config: &Config) -> Result<Arc<dyn Validator>, ProxyError> {
    if config.checker.to_lowercase().contains("responsematch") {
        let target_host = url::Url::parse(&config.checker_target_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| {
                ProxyError::Config(
                    "checker_target_url must be a valid absolute URL when checker selects ResponseMatchValidator".to_string(),
                )
            })?;
        return Ok(Arc::new(ResponseMatchValidator {
            timeout: Duration::from_secs(config.checker_timeout),
            target_url: config.checker_target_url.clone(),
            target_host,
            status_pattern: config.checker_status_pattern.clone(),
        }));
    }
    Ok(Arc::new(HttpbinValidator {
        timeout: Duration::from_secs(config.checker_timeout),
    }))
}

async fn run(config: Config) -> Result<(), ProxyError> {
    let origin_ip = get_origin_ip(Duration::from_secs(config.checker_timeout))
        .await
        .ok_or_else(|| ProxyError::Config("could not determine origin IP; cannot bootstrap anonymity checks".to_string()))?;
    log::info!("origin IP resolved to {}", origin_ip);

    let validator = build_validator(&config)?;

    let manager = Arc::new(Manager::new(
        ManagerConfig {
            queue_size: config.queue_size,
            backup_size: config.backup_size(),
            block_time: config.block_time as i64,
            max_fail_times: config.max_fail_times,
            check_interval: config.check_interval as i64,
            checker_clients: config.checker_clients,
            min_anonymity: config.min_anonymity,
            wait_queue_capacity: config.queue_size.max(16) * 2,
            label_queue_capacity: config.queue_size.max(16) * 2,
        },
        validator,
        origin_ip,
    ));
    manager.clone().run().await;

    let sources: HashMap<String, Vec<String>> = config.proxy_pages.clone();
    let scraper = Arc::new(Scraper::new(
        sources,
        ScraperConfig {
            sleep_time: Duration::from_secs(config.spider_sleep_time),
            spider_timeout: Duration::from_secs(config.spider_timeout),
            scrap_interval: Duration::from_secs(config.scrap_interval),
        },
    ));
    let mut feed = scraper.subscribe().await;
    let _scraper_handles = scraper.clone().open();

    let feed_manager = manager.clone();
    tokio::spawn(async move {
        while let Some(addresses) = feed.recv().await {
            for addr in addresses {
                feed_manager.add_proxy(addr).await;
            }
        }
    });

    let api_server = ApiServer::new(config.bind.clone(), manager.clone());
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api_server.start().await {
            log::error!("API server exited: {}", e);
        }
    });

    setup_signal_handlers().await;
    api_handle.abort();
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::from(1);
        }
    };

    if let Err(e) = init_logging(&config) {
        eprintln!("{}", e);
        return ExitCode::from(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            log::error!("fatal error: {}", e);
            ExitCode::from(1)
        }
    }
}

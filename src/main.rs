use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use futures_util::StreamExt;
use serde::Serialize;
use tracing::{error, info};

use uptime_monitor::{create_error_response, Config, MonitorResult, UptimeMonitor};

/// Website uptime monitor
#[derive(Parser, Debug)]
#[command(name = "uptime-monitor")]
#[command(version, about, long_about = None)]
#[command(after_help = r#"ENVIRONMENT VARIABLES:
    CONFIG_PATH                  Config file (default: config/uptime_monitor.toml)
    RUST_LOG                     Log filter (default: uptime_monitor=<log_level>)
    STORAGE_PATH                 JSON datastore (default: users.db)
    SCHEDULER_TICK_SECS          Scheduler tick (default: 5)
    PROBE_TIMEOUT_SECS           Per-check timeout (default: 10)
    MIN_CHECK_INTERVAL_SECS      Smallest accepted interval (default: 30)
"#)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the monitor until interrupted (default)
    Run,
    /// Create an account
    Signup {
        username: String,
        password: String,
    },
    /// Add a target and run its first check
    Add {
        #[command(flatten)]
        login: Login,
        url: String,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long, default_value_t = 60)]
        interval: u64,
    },
    /// Print the current snapshot
    List {
        #[command(flatten)]
        login: Login,
    },
    /// Pause an active target or resume a paused one
    Pause {
        #[command(flatten)]
        login: Login,
        url: String,
    },
    /// Delete a target and its history
    Remove {
        #[command(flatten)]
        login: Login,
        url: String,
    },
    /// Check a target now
    Check {
        #[command(flatten)]
        login: Login,
        url: String,
    },
    /// Stream snapshots while the monitor runs
    Watch {
        #[command(flatten)]
        login: Login,
    },
}

#[derive(Args, Debug)]
struct Login {
    #[arg(long, short)]
    username: String,
    #[arg(long, short)]
    password: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;

    // Initialize logging with environment variable support
    let log_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| format!("uptime_monitor={}", config.server.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    info!("Configuration loaded successfully");
    info!("{}", config.summary());
    let monitor = UptimeMonitor::open(config).await?;

    let outcome = match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            run(&monitor).await?;
            return Ok(());
        }
        Command::Watch { login } => {
            watch(&monitor, &login).await?;
            return Ok(());
        }
        command => one_shot(&monitor, command).await,
    };

    monitor.shutdown().await;

    if let Err(e) = outcome {
        println!("{}", serde_json::to_string_pretty(&create_error_response(&e))?);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(monitor: &UptimeMonitor) -> Result<()> {
    info!("🚀 Starting uptime monitor...");
    monitor.start().await;

    tokio::signal::ctrl_c().await?;
    info!("Received interrupt");
    monitor.shutdown().await;
    info!("Scheduler {:?}", monitor.scheduler().state().await);

    let stats = monitor.stats().await;
    info!(
        "📊 {} probes ({} up, {} down), {} persistence failures",
        stats.total_probes, stats.up_probes, stats.down_probes, stats.persistence_failures
    );
    Ok(())
}

async fn watch(monitor: &UptimeMonitor, login: &Login) -> Result<()> {
    let token = match monitor.login(&login.username, &login.password).await {
        Ok(token) => token,
        Err(e) => {
            println!("{}", serde_json::to_string_pretty(&create_error_response(&e))?);
            std::process::exit(1);
        }
    };

    monitor.start().await;
    let mut updates = monitor.subscribe(&token).await?;

    loop {
        tokio::select! {
            snapshot = updates.next() => match snapshot {
                Some(snapshot) => println!("{}", serde_json::to_string(&snapshot)?),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    monitor.shutdown().await;
    Ok(())
}

async fn one_shot(monitor: &UptimeMonitor, command: Command) -> MonitorResult<()> {
    match command {
        Command::Signup { username, password } => {
            let owner_id = monitor.signup(&username, &password, &password).await?;
            print_json(&serde_json::json!({ "success": true, "owner_id": owner_id }));
        }
        Command::Add {
            login,
            url,
            name,
            interval,
        } => {
            let token = login_with(monitor, &login).await?;
            let target = monitor.add_target(&token, &name, &url, interval).await?;
            let snapshot = monitor.snapshot(&token).await?;
            print_json(&serde_json::json!({
                "success": true,
                "target": target,
                "status": snapshot.status.get(&target.url),
            }));
        }
        Command::List { login } => {
            let token = login_with(monitor, &login).await?;
            print_json(&monitor.snapshot(&token).await?);
        }
        Command::Pause { login, url } => {
            let token = login_with(monitor, &login).await?;
            print_json(&monitor.toggle_pause(&token, &url).await?);
        }
        Command::Remove { login, url } => {
            let token = login_with(monitor, &login).await?;
            let removed = monitor.remove_target(&token, &url).await?;
            print_json(&serde_json::json!({ "success": true, "removed": removed }));
        }
        Command::Check { login, url } => {
            let token = login_with(monitor, &login).await?;
            print_json(&monitor.check_now(&token, &url).await?);
        }
        Command::Run | Command::Watch { .. } => {}
    }
    Ok(())
}

async fn login_with(monitor: &UptimeMonitor, login: &Login) -> MonitorResult<String> {
    monitor.login(&login.username, &login.password).await
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Failed to serialize output: {}", e),
    }
}

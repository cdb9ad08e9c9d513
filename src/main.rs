mod action;
mod clock;
mod config;
mod http;
mod logging;
mod signals;
mod switch;

use action::{Action, ShutdownAction};
use clap::Parser;
use config::DmsConfig;
use std::path::PathBuf;
use std::sync::Arc;
use switch::{Switch, SwitchConfig, SwitchError};
use tokio::sync::watch;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A dead man's switch which invokes one or more actions unless postponed on
/// regular intervals. To postpone the actions, issue an HTTP PUT to
/// /postpone, with no body, to the configured HTTP address.
#[derive(Parser, Debug)]
#[command(name = "dms", version, about)]
pub struct Cli {
    /// Command to execute when the switch triggers (repeatable)
    #[arg(short, long, value_name = "COMMAND")]
    exec: Vec<String>,

    /// Working directory for all commands (overrides config)
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// HTTP listen address or port (overrides config)
    #[arg(long, value_name = "ADDRESS")]
    http: Option<String>,

    /// Maximum interval between postpones, e.g. "30s" or "1m" (overrides config)
    #[arg(short, long)]
    ttl: Option<String>,

    /// Missed intervals tolerated before the switch triggers (overrides config)
    #[arg(short, long)]
    misses: Option<u32>,

    /// Config file path
    #[arg(short, long, default_value = "dms.toml")]
    config: PathBuf,

    /// Produce debug logging
    #[arg(long)]
    debug: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,
}

impl Cli {
    /// Merge command-line overrides into the loaded config. Exec commands
    /// given on the command line replace the configured list.
    fn apply(&self, config: &mut DmsConfig) {
        if !self.exec.is_empty() {
            config.actions.exec = self.exec.clone();
        }
        if let Some(dir) = &self.dir {
            config.actions.dir = Some(dir.clone());
        }
        if let Some(http) = &self.http {
            config.http.address = http.clone();
        }
        if let Some(ttl) = &self.ttl {
            config.switch.ttl = ttl.clone();
        }
        if let Some(misses) = self.misses {
            config.switch.misses = misses;
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    logging::init(cli.debug);
    tracing::debug!(?cli, "parsed CLI arguments");

    if let Err(e) = run(cli).await {
        eprintln!("dms: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), BoxError> {
    let mut config = config::load(&cli.config)?;
    cli.apply(&mut config);
    config.validate()?;

    let ttl = config.ttl()?;
    let exec = action::parse_exec(&config.actions.exec, config.actions.dir.as_deref())?;

    if cli.dry_run {
        println!("dms v{}", env!("CARGO_PKG_VERSION"));
        println!("ttl:     {:?}", ttl);
        println!("misses:  {}", config.switch.misses);
        println!("http:    {}", http::listen_address(&config.http.address));
        for a in &exec {
            println!("exec:    {}", a.describe());
        }
        if let Some(dir) = &config.actions.dir {
            println!("dir:     {}", dir.display());
        }
        return Ok(());
    }

    // The switch asks the process to exit once its actions have run.
    let (triggered_tx, triggered_rx) = watch::channel(false);
    let mut actions: Vec<Box<dyn Action>> = exec
        .into_iter()
        .map(|a| Box::new(a) as Box<dyn Action>)
        .collect();
    actions.push(Box::new(ShutdownAction::new(triggered_tx)));

    let switch = Switch::new(
        SwitchConfig {
            ttl,
            max_misses: config.switch.misses,
        },
        actions,
    );

    let listener = http::bind(&config.http.address).await?;
    let app = http::router(Arc::new(switch.clone()), switch.subscribe());
    let (server_tx, server_rx) = watch::channel(false);
    let mut server = tokio::spawn(http::serve(listener, app, server_rx));

    switch.start()?;

    let server_exit = tokio::select! {
        _ = signals::shutdown_signal() => None,
        _ = signals::wait_for_shutdown(triggered_rx) => {
            tracing::info!("switch triggered, shutting down");
            None
        }
        result = &mut server => Some(result),
    };

    server_tx.send_replace(true);
    match switch.stop() {
        Ok(()) => tracing::info!("switch stopped"),
        Err(SwitchError::NotStarted) => {
            tracing::debug!(state = %switch.state(), "switch was not running at shutdown")
        }
        Err(e) => return Err(e.into()),
    }

    match server_exit {
        Some(result) => result??,
        None => server.await??,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::time::Duration;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_typical() {
        let cli = Cli::try_parse_from([
            "dms", "--http", ":8080", "--ttl", "10s", "--exec", "echo 'hi there'",
        ])
        .unwrap();
        assert_eq!(cli.http.as_deref(), Some(":8080"));
        assert_eq!(cli.ttl.as_deref(), Some("10s"));
        assert_eq!(cli.exec, ["echo 'hi there'"]);
        assert!(!cli.debug);
        assert_eq!(cli.config, PathBuf::from("dms.toml"));
    }

    #[test]
    fn test_cli_short_flags_and_repeated_exec() {
        let cli = Cli::try_parse_from([
            "dms", "-e", "ls -al", "-e", "echo test", "-d", "/tmp", "-t", "1m", "-m", "2",
            "--debug",
        ])
        .unwrap();
        assert_eq!(cli.exec, ["ls -al", "echo test"]);
        assert_eq!(cli.dir, Some(PathBuf::from("/tmp")));
        assert_eq!(cli.misses, Some(2));
        assert!(cli.debug);
    }

    #[test]
    fn test_cli_unrecognized_flag() {
        assert!(Cli::try_parse_from(["dms", "--unrecognized"]).is_err());
    }

    #[test]
    fn test_cli_negative_misses_rejected() {
        assert!(Cli::try_parse_from(["dms", "--misses", "-1"]).is_err());
    }

    #[test]
    fn test_apply_overrides_config() {
        let cli = Cli::try_parse_from([
            "dms", "-e", "true", "--http", "0", "-t", "500ms", "-m", "3", "-d", "/srv",
        ])
        .unwrap();
        let mut config = DmsConfig::default();
        config.actions.exec = vec!["from-file".to_string()];

        cli.apply(&mut config);
        assert_eq!(config.actions.exec, ["true"]);
        assert_eq!(config.actions.dir, Some(PathBuf::from("/srv")));
        assert_eq!(config.http.address, "0");
        assert_eq!(config.ttl().unwrap(), Duration::from_millis(500));
        assert_eq!(config.switch.misses, 3);
    }

    #[test]
    fn test_apply_keeps_config_without_flags() {
        let cli = Cli::try_parse_from(["dms"]).unwrap();
        let mut config = DmsConfig::default();
        config.actions.exec = vec!["from-file".to_string()];
        config.switch.misses = 7;

        cli.apply(&mut config);
        assert_eq!(config.actions.exec, ["from-file"]);
        assert_eq!(config.switch.misses, 7);
        assert_eq!(config.http.address, ":8080");
    }

    #[tokio::test]
    async fn test_run_rejects_missing_actions() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("dms.toml");
        let cli = Cli::try_parse_from(["dms", "-c", config.to_str().unwrap()]).unwrap();
        let err = run(cli).await.unwrap_err();
        assert!(err.to_string().contains("--exec"), "{err}");
    }

    #[tokio::test]
    async fn test_run_rejects_empty_command() {
        let cli = Cli::try_parse_from(["dms", "-e", "ls", "-e", "", "-c", "/nonexistent/dms.toml"])
            .unwrap();
        let err = run(cli).await.unwrap_err();
        assert_eq!(err.to_string(), "a non-empty command is required");
    }

    #[tokio::test]
    async fn test_run_dry_run() {
        let cli = Cli::try_parse_from([
            "dms", "-e", "true", "-t", "10s", "--dry-run", "-c", "/nonexistent/dms.toml",
        ])
        .unwrap();
        run(cli).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_exits_after_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("fired");
        let command = format!("touch {}", marker.display());
        let cli = Cli::try_parse_from([
            "dms",
            "-e",
            &command,
            "-t",
            "50ms",
            "--http",
            "127.0.0.1:0",
            "-c",
            "/nonexistent/dms.toml",
        ])
        .unwrap();

        tokio::time::timeout(Duration::from_secs(10), run(cli))
            .await
            .expect("dms did not exit after triggering")
            .unwrap();
        assert!(marker.exists());
    }
}

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing_subscriber::EnvFilter;

use prediction_arb_bot::bot;
use prediction_arb_bot::types::{AppConfig, ExecutionMode};

const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_CREDENTIAL_ERROR: i32 = 2;
const EXIT_VENUE_ERROR: i32 = 3;
const EXIT_KILL_SWITCH: i32 = 4;

fn redact_host(url: &str) -> String {
    url.split('@')
        .nth(1)
        .and_then(|s| s.split('/').next())
        .unwrap_or("?")
        .to_string()
}

#[derive(Parser, Debug)]
#[command(name = "prediction-arb-bot")]
#[command(about = "Kalshi/Polymarket 15m crypto cross-venue arbitrage bot", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.toml")]
    config: String,

    /// Override execution mode (paper/live)
    #[arg(long)]
    mode: Option<ExecutionMode>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the arbitrage bot
    Run {},
}

#[tokio::main]
async fn main() {
    dotenv().ok();

    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "prediction_arb_bot=debug,bot=debug,info");
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    tracing::info!(target: "bot", "prediction-arb-bot starting");

    let cli = Cli::parse();
    tracing::debug!(target: "bot", config = %cli.config, "loading config");

    let mut settings = match AppConfig::from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            tracing::error!(target: "bot", error = %format!("{err:#}"), "configuration error");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    if let Some(mode) = cli.mode {
        settings.execution.mode = mode;
    }

    tracing::info!(
        target: "bot",
        config = %cli.config,
        execution_mode = settings.execution.mode.as_str(),
        postgres_host = redact_host(&settings.postgres.url),
        "config loaded"
    );

    match cli.command.unwrap_or(Commands::Run {}) {
        Commands::Run {} => {
            if let Err(err) = bot::run_bot(settings).await {
                let code = exit_code_for(&err);
                tracing::error!(target: "bot", error = %format!("{err:#}"), exit_code = code, "bot exited with error");
                std::process::exit(code);
            }
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let text = format!("{err:#}").to_lowercase();
    if text.contains("kill switch") {
        EXIT_KILL_SWITCH
    } else if text.contains("not set in environment")
        || text.contains("private key")
        || text.contains("pem")
        || text.contains("401")
        || text.contains("credential")
    {
        EXIT_CREDENTIAL_ERROR
    } else {
        EXIT_VENUE_ERROR
    }
}

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use errand::record::FfmpegFinalizer;
use errand::session::EokaProvisioner;
use errand::{Config, Controller, ModelRegistry};

#[derive(Parser)]
#[command(name = "errand")]
#[command(about = "On-demand browser agent service")]
#[command(version)]
struct Cli {
    /// Config file (YAML). Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(long)]
    bind: Option<String>,

    /// Force headless browser launches (overrides config)
    #[arg(long)]
    headless: bool,

    /// Validate config without starting the server
    #[arg(long)]
    check: bool,

    /// Verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (only errors)
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.quiet {
        Level::ERROR
    } else {
        match cli.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();

    let mut config = match cli.config {
        Some(ref path) => Config::load(path)?,
        None => Config::from_env()?,
    };
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if cli.headless {
        config.browser.headless = true;
    }

    if cli.check {
        println!("Config valid");
        println!("  Bind          : {}", config.server.bind);
        println!("  Engine        : {:?}", config.browser.engine);
        println!("  Default steps : {}", config.run.default_max_steps);
        println!("  Steps ceiling : {}", config.run.max_steps_ceiling);
        println!("  Run budget    : {}s", config.run.max_duration_secs);
        println!("  Artifacts dir : {}", config.video.artifacts_dir.display());
        return Ok(());
    }

    std::fs::create_dir_all(&config.video.artifacts_dir)?;

    let registry = Arc::new(ModelRegistry::builtin());
    let default_model = registry.default_id();
    let provisioner = Arc::new(EokaProvisioner::new(&config)?);
    let finalizer = Arc::new(FfmpegFinalizer::new(&config.video));
    let controller = Arc::new(Controller::new(provisioner, finalizer));

    let state = errand::server::AppState::new(config.clone(), registry, controller);
    let app = errand::server::router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(
        "errand listening on http://{} (default model: {}, engine: {:?})",
        config.server.bind,
        default_model,
        config.browser.engine
    );
    axum::serve(listener, app).await?;
    Ok(())
}

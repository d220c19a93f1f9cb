use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use prism_core::config::{finalize_config, read_config, Config};
use prism_core::observability::init_logging;
use prismd::dispatcher::Dispatcher;
use prismd::listener;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "prismd",
    version,
    about = "prism application gateway (static files, CGI and FastCGI)"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve requests until interrupted.
    Run(RunArgs),
    /// Load and validate a configuration file.
    Check {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Configuration file. Without it the defaults are used with the working
    /// directory as document root.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Port reported to applications and used for the default listener.
    #[arg(short, long)]
    port: Option<u16>,
    #[arg(short = 'd', long)]
    document_root: Option<PathBuf>,
    #[arg(long)]
    allow_path_info: bool,
    #[arg(long)]
    enable_cgi_bin: bool,
    /// Execute `.cgi` documents as CGI scripts.
    #[arg(long)]
    enable_cgi_extension: bool,
    /// Address to listen on (repeatable). Replaces the configured listeners.
    #[arg(long)]
    listen: Vec<String>,
    /// Default document name (repeatable). Replaces the configured list.
    #[arg(long)]
    default_document: Vec<String>,
    /// System log file.
    #[arg(long)]
    log: Option<PathBuf>,
    #[arg(long, value_parser = ["json", "compact", "pretty"])]
    log_format: Option<String>,
    #[arg(long)]
    log_level: Option<String>,
}

impl RunArgs {
    fn apply(self, config: &mut Config) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(root) = self.document_root {
            config.document_root = root;
        }
        config.allow_path_info |= self.allow_path_info;
        config.enable_cgi_bin |= self.enable_cgi_bin;
        config.cgi_extension |= self.enable_cgi_extension;
        if !self.listen.is_empty() {
            config.listen = self.listen;
        }
        if !self.default_document.is_empty() {
            config.default_documents = self.default_document;
        }
        if let Some(path) = self.log {
            config.logging.path = Some(path);
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => {
            let config = prepare_config(args)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(run(config))
        }
        Command::Check { config } => {
            let mut loaded = read_config(&config)?;
            finalize_config(&mut loaded, &working_dir()?)?;
            println!("config ok");
            Ok(())
        }
    }
}

fn working_dir() -> Result<PathBuf> {
    std::env::current_dir().context("failed to resolve working directory")
}

fn prepare_config(args: RunArgs) -> Result<Config> {
    let mut config = match args.config.as_deref() {
        Some(path) => read_config(path)?,
        None => Config::default(),
    };
    args.apply(&mut config);
    finalize_config(&mut config, &working_dir()?)?;
    Ok(config)
}

async fn run(config: Config) -> Result<()> {
    let _log_guards = init_logging(&config.logging)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        document_root = %config.document_root.display(),
        port = config.port,
        "starting prismd"
    );

    let config = Arc::new(config);
    let dispatcher = Arc::new(Dispatcher::new(config.clone())?);
    if let Err(err) = dispatcher.initialize().await {
        dispatcher.dispose().await;
        return Err(err);
    }

    let mut listeners = Vec::with_capacity(config.listen.len());
    for address in &config.listen {
        match listener::bind(address).await {
            Ok(bound) => listeners.push(bound),
            Err(err) => {
                dispatcher.dispose().await;
                return Err(err.into());
            }
        }
    }

    let (stop, stopped) = watch::channel(false);
    let mut tasks: JoinSet<(String, Result<()>)> = JoinSet::new();
    for bound in listeners {
        let label = bound
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "listener".to_string());
        let dispatcher = dispatcher.clone();
        let stopped = stopped.clone();
        tasks.spawn(async move {
            (label, listener::serve(bound, dispatcher, stopped).await)
        });
    }
    info!("prismd started");

    let outcome = tokio::select! {
        signal = shutdown_signal() => {
            signal?;
            info!("shutting down");
            Ok(())
        }
        Some(joined) = tasks.join_next() => match joined {
            Ok((label, Ok(()))) => Err(anyhow!("listener {label} exited")),
            Ok((label, Err(err))) => Err(err).with_context(|| format!("listener {label} failed")),
            Err(err) => Err(anyhow!("listener task failed: {err}")),
        },
    };

    let _ = stop.send(true);
    while let Some(joined) = tasks.join_next().await {
        if let Ok((label, Err(err))) = joined {
            error!(listener = %label, error = ?err, "listener failed during shutdown");
        }
    }
    dispatcher.dispose().await;
    info!("prismd stopped");
    outcome
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

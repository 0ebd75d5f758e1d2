use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::{LevelFilter, debug, info, warn};
use serde::Serialize;

use tabrelay::config::{self, APP_NAME, AppConfig};
use tabrelay::host::{EchoExecutor, HostConnection, HostOptions};
use tabrelay::hub::HubServer;
use tabrelay::proxy::{ProcessLauncher, ProxyManager, RelayProcessRecord, hub_url_for_target};
use tabrelay::transport::ConnectionMode;
use tabrelay::Gateway;

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_hub(ctx: RuntimeContext, cmd: HubCommand) -> Result<()> {
    handle_hub(&ctx, cmd).await
}

#[tokio::main]
async fn async_gateway(ctx: RuntimeContext, cmd: GatewayCommand) -> Result<()> {
    handle_gateway(&ctx, cmd).await
}

#[tokio::main]
async fn async_host(ctx: RuntimeContext, cmd: HostCommand) -> Result<()> {
    handle_host(&ctx, cmd).await
}

#[tokio::main]
async fn async_request(ctx: RuntimeContext, cmd: RequestCommand) -> Result<()> {
    handle_request(&ctx, cmd).await
}

#[tokio::main]
async fn async_proxy(ctx: RuntimeContext, cmd: ProxyCommand) -> Result<()> {
    handle_proxy(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Hub(cmd) => async_hub(ctx, cmd),
        Command::Gateway(cmd) => async_gateway(ctx, cmd),
        Command::Host(cmd) => async_host(ctx, cmd),
        Command::Request(cmd) => async_request(ctx, cmd),
        Command::Proxy { command } => async_proxy(ctx, command),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Tabrelay - reach a browser-hosted backend from the command line.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the connection hub
    Hub(HubCommand),
    /// Run one relay gateway
    Gateway(GatewayCommand),
    /// Attach a loopback echo host to a hub
    Host(HostCommand),
    /// Send one request through a relay, then tear the relay down
    Request(RequestCommand),
    /// Manage relays for a target
    Proxy {
        #[command(subcommand)]
        command: ProxyCommand,
    },
    /// Create config directories and default files
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct HubCommand {
    /// Host address to bind to
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,
    /// Token a host must present to claim the host role
    #[arg(long, env = "TABRELAY_HOST_TOKEN", hide_env_values = true)]
    host_token: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct GatewayCommand {
    /// Host address to bind to
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (0 picks a free port)
    #[arg(short, long)]
    port: Option<u16>,
    /// Target this gateway relays for
    #[arg(long, value_name = "URL")]
    target_url: Option<String>,
    /// Hub WebSocket URL (derived from the target when omitted)
    #[arg(long, value_name = "URL")]
    hub_url: Option<String>,
    /// Transport to the host
    #[arg(long, value_enum)]
    mode: Option<ConnectionMode>,
}

#[derive(Debug, Clone, Args)]
struct HostCommand {
    /// Hub WebSocket URL
    #[arg(long, value_name = "URL")]
    hub_url: Option<String>,
    /// Token presented when identifying as host
    #[arg(long, env = "TABRELAY_HOST_TOKEN", hide_env_values = true)]
    token: Option<String>,
    /// Skip the identify frame and let the hub infer the role
    #[arg(long = "no-identify")]
    no_identify: bool,
}

#[derive(Debug, Clone, Args)]
struct RequestCommand {
    /// Target whose backend should answer
    #[arg(value_name = "TARGET")]
    target: String,
    /// HTTP method
    #[arg(value_name = "METHOD")]
    method: String,
    /// Path (and query) on the backend
    #[arg(value_name = "PATH")]
    path: String,
    /// Request body
    #[arg(short, long)]
    data: Option<String>,
    /// Extra header as `Name: value` (repeatable)
    #[arg(short = 'H', long = "header", value_name = "HEADER")]
    headers: Vec<String>,
    /// Transport the relay uses to reach the host
    #[arg(long, value_enum)]
    mode: Option<ConnectionMode>,
}

#[derive(Debug, Subcommand)]
enum ProxyCommand {
    /// Start a relay and keep it running until Ctrl+C
    Start {
        #[arg(value_name = "TARGET")]
        target: String,
        /// Transport the relay uses to reach the host
        #[arg(long, value_enum)]
        mode: Option<ConnectionMode>,
    },
    /// Show whether a target needs a relay
    Check {
        #[arg(value_name = "TARGET")]
        target: String,
    },
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&paths, &common)?;
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::fmt::writer::BoxMakeWriter;
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("tabrelay={level},tower_http={level}")));

        let log_file = match &self.config.logging.file {
            Some(path) => Some(open_log_file(Path::new(path))?),
            None => None,
        };
        let writer = || -> Result<BoxMakeWriter> {
            Ok(match &log_file {
                Some(file) => BoxMakeWriter::new(Mutex::new(
                    file.try_clone().context("duplicating log file handle")?,
                )),
                None => BoxMakeWriter::new(io::stderr),
            })
        };

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(writer()?))
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || log_file.is_some()
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer()?)
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // The library logs through `log`.
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        if let Some(file) = &log_file {
            let file = file.try_clone().context("duplicating log file handle")?;
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    /// Relay manager whose relays re-run this binary with the same config file.
    fn proxy_manager(&self, mode: Option<ConnectionMode>) -> Result<ProxyManager> {
        let mut args = vec![
            "--config".to_string(),
            self.paths.config_file.display().to_string(),
        ];
        if self.effective_log_level() >= LevelFilter::Debug {
            args.push("--debug".to_string());
        }
        let launcher = ProcessLauncher::current_exe()
            .context("preparing relay launcher")?
            .with_args(args);

        let manager = ProxyManager::new(self.config.proxy.clone(), Arc::new(launcher));
        Ok(match mode.or(self.config.gateway.mode) {
            Some(mode) => manager.with_mode(mode),
            None => manager,
        })
    }

    fn print<T: Serialize + fmt::Display>(&self, value: &T) -> Result<()> {
        if self.common.json {
            println!(
                "{}",
                serde_json::to_string_pretty(value).context("serializing output to JSON")?
            );
        } else if self.common.yaml {
            println!(
                "{}",
                serde_yaml::to_string(value).context("serializing output to YAML")?
            );
        } else {
            println!("{value}");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self { config_file })
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config: {}", self.config_file.display())
    }
}

async fn handle_hub(ctx: &RuntimeContext, cmd: HubCommand) -> Result<()> {
    let mut hub_config = ctx.config.hub.clone();
    if let Some(host) = cmd.host {
        hub_config.host = host;
    }
    if let Some(port) = cmd.port {
        hub_config.port = port;
    }
    if cmd.host_token.is_some() {
        hub_config.host_token = cmd.host_token;
    }

    let server = HubServer::start(&hub_config).await?;
    info!(
        "hub ready at {} (role inference {})",
        server.ws_url(),
        if hub_config.allow_role_inference { "on" } else { "off" }
    );

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = server.stopped() => {}
    }
    info!("shutting down hub");
    server.stop().await;
    Ok(())
}

async fn handle_gateway(ctx: &RuntimeContext, cmd: GatewayCommand) -> Result<()> {
    let mut gateway_config = ctx.config.gateway.clone();
    if let Some(host) = cmd.host {
        gateway_config.host = host;
    }
    if cmd.target_url.is_some() {
        gateway_config.target_url = cmd.target_url;
    }
    if cmd.hub_url.is_some() {
        gateway_config.hub_url = cmd.hub_url;
    }
    if cmd.mode.is_some() {
        gateway_config.mode = cmd.mode;
    }
    let port = cmd.port.unwrap_or(gateway_config.port);

    let gateway = Gateway::from_config(gateway_config, &ctx.config.proxy.hub_path)
        .context("configuring gateway")?;
    let handle = gateway.start(port).await?;

    tokio::select! {
        _ = shutdown_signal() => info!("shutdown signal received"),
        _ = handle.completed() => info!("completion signal received"),
    }
    handle.stop().await;
    Ok(())
}

async fn handle_host(ctx: &RuntimeContext, cmd: HostCommand) -> Result<()> {
    let hub_url = cmd
        .hub_url
        .or_else(|| ctx.config.gateway.hub_url.clone())
        .unwrap_or_else(|| format!("ws://127.0.0.1:{}/ws", ctx.config.hub.port));
    let options = HostOptions {
        identify: !cmd.no_identify,
        token: cmd.token,
        max_message_bytes: ctx.config.hub.max_message_bytes,
    };

    let connection = HostConnection::connect(&hub_url, Arc::new(EchoExecutor), options)
        .await
        .with_context(|| format!("attaching host to {hub_url}"))?;

    tokio::select! {
        _ = shutdown_signal() => info!("shutdown signal received"),
        _ = connection.closed() => warn!("hub closed the connection"),
    }
    info!("served {} request(s)", connection.served());
    connection.disconnect().await;
    Ok(())
}

/// What `tabrelay request` prints.
#[derive(Debug, Serialize)]
struct RequestOutput {
    status: u16,
    headers: BTreeMap<String, String>,
    body: serde_json::Value,
}

impl fmt::Display for RequestOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "HTTP {}", self.status)?;
        for (name, value) in &self.headers {
            writeln!(f, "{name}: {value}")?;
        }
        writeln!(f)?;
        match &self.body {
            serde_json::Value::String(text) => write!(f, "{text}"),
            serde_json::Value::Null => Ok(()),
            other => match serde_json::to_string_pretty(other) {
                Ok(text) => write!(f, "{text}"),
                Err(_) => write!(f, "{other}"),
            },
        }
    }
}

async fn handle_request(ctx: &RuntimeContext, cmd: RequestCommand) -> Result<()> {
    let manager = ctx.proxy_manager(cmd.mode)?;
    let base = manager
        .ensure_proxy(&cmd.target)
        .await
        .with_context(|| format!("preparing relay for {}", cmd.target))?;
    debug!("sending request through {base}");

    let outcome = tokio::select! {
        result = perform_request(&base, &cmd) => result,
        _ = shutdown_signal() => Err(anyhow!("interrupted")),
    };

    if manager.is_proxy_needed(&cmd.target) {
        match manager.send_completion_signal_and_exit(&cmd.target).await {
            Ok(true) => debug!("host acknowledged completion"),
            Ok(false) => warn!("completion signal was not delivered to the host"),
            Err(e) => warn!("failed to stop relay: {e}"),
        }
    }

    let output = outcome?;
    ctx.print(&output)?;
    if output.status >= 400 {
        return Err(anyhow!("request failed with status {}", output.status));
    }
    Ok(())
}

async fn perform_request(base: &str, cmd: &RequestCommand) -> Result<RequestOutput> {
    let method = reqwest::Method::from_bytes(cmd.method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("invalid HTTP method {}", cmd.method))?;
    let path = if cmd.path.starts_with('/') {
        cmd.path.clone()
    } else {
        format!("/{}", cmd.path)
    };
    let url = format!("{}{path}", base.trim_end_matches('/'));

    let mut request = reqwest::Client::new().request(method, &url);
    for header in &cmd.headers {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| anyhow!("invalid header {header:?} (expected `Name: value`)"))?;
        request = request.header(name.trim(), value.trim());
    }
    if let Some(data) = &cmd.data {
        if !cmd
            .headers
            .iter()
            .any(|h| h.to_ascii_lowercase().starts_with("content-type"))
            && serde_json::from_str::<serde_json::Value>(data).is_ok()
        {
            request = request.header(reqwest::header::CONTENT_TYPE, "application/json");
        }
        request = request.body(data.clone());
    }

    let response = request
        .send()
        .await
        .with_context(|| format!("sending request to {url}"))?;
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect::<BTreeMap<_, _>>();
    let bytes = response.bytes().await.context("reading response body")?;
    let body = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(_) if bytes.is_empty() => serde_json::Value::Null,
        Err(_) => serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned()),
    };

    Ok(RequestOutput {
        status,
        headers,
        body,
    })
}

/// What `tabrelay proxy start` prints.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProxyStartOutput {
    target_url: String,
    effective_url: String,
    relays: Vec<RelayProcessRecord>,
}

impl fmt::Display for ProxyStartOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} -> {}", self.target_url, self.effective_url)?;
        if self.relays.is_empty() {
            return write!(f, "no relay needed");
        }
        for relay in &self.relays {
            writeln!(
                f,
                "  {:<40} {:<24} pid {:<8} {:?}",
                relay.target_url,
                relay.local_url,
                relay
                    .pid
                    .map(|pid| pid.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                relay.state
            )?;
        }
        Ok(())
    }
}

/// What `tabrelay proxy check` prints.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProxyCheckOutput {
    target_url: String,
    proxy_needed: bool,
    hub_url: Option<String>,
}

impl fmt::Display for ProxyCheckOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "target:       {}", self.target_url)?;
        writeln!(f, "relay needed: {}", if self.proxy_needed { "yes" } else { "no" })?;
        write!(f, "hub url:      {}", self.hub_url.as_deref().unwrap_or("-"))
    }
}

async fn handle_proxy(ctx: &RuntimeContext, command: ProxyCommand) -> Result<()> {
    match command {
        ProxyCommand::Start { target, mode } => {
            let manager = ctx.proxy_manager(mode)?;
            let effective_url = manager
                .ensure_proxy(&target)
                .await
                .with_context(|| format!("starting relay for {target}"))?;
            ctx.print(&ProxyStartOutput {
                target_url: target.clone(),
                effective_url,
                relays: manager.get_running_proxies().await,
            })?;

            if !manager.is_proxy_needed(&target) {
                return Ok(());
            }
            shutdown_signal().await;
            info!("stopping relay for {target}");
            if let Err(e) = manager.send_completion_signal_and_exit(&target).await {
                warn!("failed to stop relay: {e}");
            }
            manager.shutdown_all().await;
            Ok(())
        }
        ProxyCommand::Check { target } => {
            let proxy_needed =
                tabrelay::proxy::is_proxy_needed(&target, &ctx.config.proxy.local_hosts);
            let hub_url = hub_url_for_target(&target, &ctx.config.proxy.hub_path).ok();
            ctx.print(&ProxyCheckOutput {
                target_url: target,
                proxy_needed,
                hub_url,
            })
        }
    }
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    // Loading already created a missing file.
    if ctx.paths.config_file.exists() && !cmd.force {
        info!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write default config to {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }

    config::write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else if ctx.common.yaml {
                println!(
                    "{}",
                    serde_yaml::to_string(&ctx.config).context("serializing config to YAML")?
                );
            } else {
                println!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            config::write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn load_or_init_config(paths: &AppPaths, common: &CommonOpts) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if common.dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            config::write_default_config(&paths.config_file)?;
        }
    }

    let mut config = config::load_config(&paths.config_file)?;

    if let Some(ref file) = config.logging.file {
        let expanded = expand_str_path(file)?;
        config.logging.file = Some(expanded.display().to_string());
    }

    Ok(config)
}

/// Open `path` for appending, creating it and its directory as needed.
fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {}", path.display()))
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

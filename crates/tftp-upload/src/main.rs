use anyhow::Context;
use clap::{CommandFactory, Parser};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use tftp_upload::config::{load_config, validate_config, write_config};
use tftp_upload::{AuditLogger, LogFormat, LoggingConfig, TftpConfig, UploadServer};

#[derive(Parser, Debug)]
#[command(
    name = "tftp-upload",
    about = "Receive a single file over TFTP and exit"
)]
struct Cli {
    /// UDP port to wait for the upload on
    port: Option<String>,

    /// Path to the TOML configuration file
    #[arg(long, default_value = "/etc/tftp-upload/tftp.toml")]
    config: PathBuf,

    /// Write the effective TOML configuration and exit
    #[arg(long)]
    init_config: bool,

    /// Validate the configuration and exit (no socket bind)
    #[arg(long)]
    check_config: bool,

    /// Create the root directory if it does not exist
    #[arg(long)]
    create_root_dir: bool,

    /// Directory uploads are stored in
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Address to bind; the positional port replaces its port
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run(Cli::parse()).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_exists = cli.config.exists();
    let mut config = if config_exists {
        load_config(&cli.config).inspect_err(|e| report_config_error(&cli.config, e))?
    } else {
        TftpConfig::default()
    };

    if let Some(root_dir) = cli.root_dir {
        config.root_dir = root_dir;
    }
    if let Some(bind_addr) = cli.bind {
        config.bind_addr = bind_addr;
    }
    if cli.create_root_dir {
        config.create_root_dir = true;
    }

    if cli.init_config {
        write_config(&cli.config, &config)
            .with_context(|| format!("writing {}", cli.config.display()))?;
        println!("Wrote config to {}", cli.config.display());
        return Ok(());
    }

    if config.create_root_dir {
        std::fs::create_dir_all(&config.root_dir)
            .with_context(|| format!("creating {}", config.root_dir.display()))?;
    }

    if cli.check_config {
        validate_config(&config, false).inspect_err(|e| report_config_error(&cli.config, e))?;
        println!("Config OK: {}", cli.config.display());
        return Ok(());
    }

    let Some(port) = cli.port.as_deref().and_then(|p| p.parse::<u16>().ok()) else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };
    config.bind_addr.set_port(port);

    validate_config(&config, true).inspect_err(|e| report_config_error(&cli.config, e))?;

    let _log_guard = init_logging(&config.logging)?;
    let audit = AuditLogger::new(config.logging.audit_enabled);
    if config_exists {
        audit.configuration_loaded(&cli.config);
    }
    info!(
        "Receiving into {} on {}",
        config.root_dir.display(),
        config.bind_addr
    );

    let server = UploadServer::new(config)?.with_audit(audit);
    let outcome = server
        .serve_one(Some(Box::new(|percent| {
            debug!("Upload progress: {}%", percent)
        })))
        .await?;

    println!("Successfully received: {}", outcome.path.display());
    Ok(())
}

/// Emit the configuration error as an audit event on a stderr subscriber.
fn report_config_error(config_file: &Path, err: &tftp_upload::TftpError) {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .try_init();
    AuditLogger::new(true).configuration_error(config_file, &err.to_string());
}

fn init_logging(logging: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let (writer, guard) = if let Some(ref log_file) = logging.file {
        let dir = match log_file.parent() {
            Some(path) => path,
            None => Path::new("."),
        };
        let file_name = log_file
            .file_name()
            .and_then(|name| name.to_str())
            .context("logging.file must include a file name")?;
        let file_appender = tracing_appender::rolling::never(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        (BoxMakeWriter::new(non_blocking), Some(guard))
    } else {
        (BoxMakeWriter::new(std::io::stderr), None)
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&logging.level))
        .with_writer(writer);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }

    Ok(guard)
}

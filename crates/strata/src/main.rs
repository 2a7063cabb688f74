//! strata: run analysis plugins over a memory image.
//!
//! Records are printed to stdout as JSON lines; logs go to stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use strata::config::parse_u64;
use strata::memory::translators::PagingMode;
use strata::memory::FillPolicy;
use strata::plugins::PluginRegistry;
use strata::{ProfileSource, Session, SessionConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the available plugins
    Plugins,

    /// Run a plugin against an image
    Run(RunArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Plugin name
    plugin: String,

    /// Memory image (raw, LiME, ELF core or container manifest)
    #[arg(short, long, env = "STRATA_IMAGE")]
    image: PathBuf,

    /// ISF profile (.json or .json.xz)
    #[arg(short, long)]
    profile: Option<PathBuf>,

    /// Profile overlays, applied in order
    #[arg(long, requires = "profile")]
    overlay: Vec<PathBuf>,

    /// Session config file (JSON); flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Physical address of the top-level page table
    #[arg(long, value_parser = parse_u64)]
    dtb: Option<u64>,

    #[arg(long)]
    paging_mode: Option<PagingMode>,

    #[arg(long)]
    fill_policy: Option<FillPolicy>,

    /// Relocation base for profile symbols
    #[arg(long, value_parser = parse_u64)]
    kernel_base: Option<u64>,

    /// Stream to open inside a container
    #[arg(long)]
    stream: Option<String>,

    /// Plugin parameters as a JSON object
    #[arg(long, default_value = "{}")]
    params: String,
}

impl RunArgs {
    fn session_config(&self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::from_file(path)?,
            None => SessionConfig::default(),
        };
        if let Some(dtb) = self.dtb {
            config.physical_offset = Some(dtb);
        }
        if let Some(mode) = self.paging_mode {
            config.paging_mode = mode;
        }
        if let Some(policy) = self.fill_policy {
            config.fill_policy = policy;
        }
        if let Some(base) = self.kernel_base {
            config.kernel_base = Some(base);
        }
        if let Some(stream) = &self.stream {
            config.stream = Some(stream.clone());
        }
        Ok(config)
    }
}

fn run(args: RunArgs) -> Result<()> {
    let params: serde_json::Value =
        serde_json::from_str(&args.params).context("--params is not valid JSON")?;
    let config = args.session_config()?;
    let profile = args.profile.as_ref().map(|base| ProfileSource {
        base: base.clone(),
        overlays: args.overlay.clone(),
    });

    let session = Session::open(&args.image, profile.as_ref(), config)
        .with_context(|| format!("opening {}", args.image.display()))?;
    let records = session.run(&args.plugin, &params)?;

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for record in records {
        serde_json::to_writer(&mut out, &record.to_json())?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    // Logs to stderr so stdout carries only records.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Plugins => {
            let plugins = PluginRegistry::with_builtins().list();
            println!("{}", serde_json::to_string_pretty(&plugins)?);
            Ok(())
        }
        Commands::Run(args) => run(args),
    }
}

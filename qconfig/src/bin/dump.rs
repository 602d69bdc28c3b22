use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use itertools::Itertools;
use qconfig::{BackendConfig, BackendPatternConfig, get_onednn_backend_config};
use tracing::info;
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum Format {
    /// One line per pattern.
    #[default]
    Text,
    Json,
    Msgpack,
}

/// Dumps the onednn quantization backend configuration.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Output format.
    #[arg(short, long, env = "QCONFIG_FORMAT", value_enum, default_value_t)]
    format: Format,

    /// File to write to. Defaults to stdout.
    #[arg(short, long, env = "QCONFIG_OUTPUT")]
    output: Option<PathBuf>,

    /// Only dump the patterns that carry a fuser method.
    #[arg(long)]
    fusions_only: bool,
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .init();
}

fn text_line(config: &BackendPatternConfig) -> String {
    let mut line = format!(
        "{} [{:?}] dtypes: {}",
        config.pattern(),
        config.observation_type(),
        config.dtype_configs().iter().join(" | ")
    );
    if let Some(method) = config.fuser_method() {
        line += &format!(" fuser: {}", method.name());
    }
    if let Some(fused) = config.fused_module() {
        line += &format!(" fused: {}", fused.name());
    }
    line
}

fn write_backend(
    backend: &BackendConfig,
    format: Format,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    match format {
        Format::Text => {
            writeln!(out, "backend {} ({} patterns)", backend.name(), backend.len())?;
            for config in backend.configs() {
                writeln!(out, "{}", text_line(config))?;
            }
        }
        Format::Json => {
            serde_json::to_writer_pretty(&mut *out, backend).context("serializing to json")?;
            writeln!(out)?;
        }
        Format::Msgpack => {
            let bytes = rmp_serde::to_vec_named(backend).context("serializing to msgpack")?;
            out.write_all(&bytes)?;
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    setup_logging();
    let args = Args::parse();

    let mut backend = get_onednn_backend_config().context("building onednn backend config")?;
    if args.fusions_only {
        let fusions = backend.fusion_configs().cloned().collect::<Vec<_>>();
        backend = BackendConfig::new(backend.name()).with_pattern_configs(fusions);
    }
    info!(patterns = backend.len(), format = ?args.format, "dumping backend config");

    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(std::io::stdout().lock())),
    };
    write_backend(&backend, args.format, out.as_mut())?;
    out.flush().context("flushing output")?;
    Ok(())
}

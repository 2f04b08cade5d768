use clap::Parser;
use std::io::Write;
use std::path::{Path, PathBuf};

use wfc::config::Settings;
use wfc::diag::CompileError;
use wfc::pipeline::CompileOutput;

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum EmitStage {
    Ir,
    Json,
    Defs,
    BuildInfo,
}

#[derive(Parser, Debug)]
#[command(
    name = "wfc",
    version,
    about = "Weft Frontend Compiler — lowers .weft dataflow scripts to wait/task IR"
)]
struct Cli {
    /// Main .weft source file
    source: PathBuf,

    /// Module search directory (repeatable, searched before configured ones)
    #[arg(short = 'I', long = "module-path")]
    module_path: Vec<PathBuf>,

    /// JSON settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Ir)]
    emit: EmitStage,

    /// Output file path (stdout if omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log loader and lowering progress
    #[arg(long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    if cli.verbose {
        eprintln!("wfc: source = {}", cli.source.display());
        eprintln!("wfc: emit   = {:?}", cli.emit);
    }

    // ── Settings ──
    let settings = match &cli.config {
        Some(path) => match Settings::load(path) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("wfc: error: {}", e);
                std::process::exit(2);
            }
        },
        None => Settings::default(),
    };
    let mut settings = settings.with_search_dirs(&cli.module_path);
    let bundled = Path::new(env!("CARGO_MANIFEST_DIR")).join("lib");
    if bundled.is_dir() && !settings.module_path.contains(&bundled) {
        settings.module_path.push(bundled);
    }

    if cli.verbose {
        let dirs: Vec<String> = settings
            .module_path
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        eprintln!("wfc: module path = [{}]", dirs.join(", "));
    }

    // ── Compile ──
    let output = match wfc::pipeline::compile_file(&cli.source, settings) {
        Ok(out) => out,
        Err(e) => {
            eprintln!("wfc: {}", e);
            let code = match e {
                CompileError::Io { .. } => 2,
                _ => 1,
            };
            std::process::exit(code);
        }
    };

    for w in &output.warnings {
        eprintln!("wfc: {}", w);
    }
    if cli.verbose {
        eprintln!(
            "wfc: {} modules, {} instructions",
            output.modules.len(),
            output.ir.instrs.len()
        );
    }

    // ── Emit ──
    let text = match render(&output, cli.emit) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("wfc: error: {}", e);
            std::process::exit(2);
        }
    };
    let written = match &cli.output {
        Some(path) => std::fs::write(path, text),
        None => std::io::stdout().write_all(text.as_bytes()),
    };
    if let Err(e) = written {
        eprintln!("wfc: error: {}", e);
        std::process::exit(2);
    }
}

fn render(output: &CompileOutput, emit: EmitStage) -> Result<String, serde_json::Error> {
    Ok(match emit {
        EmitStage::Ir => output.ir.render(),
        EmitStage::Json => serde_json::to_string_pretty(&output.ir)? + "\n",
        EmitStage::Defs => output
            .definitions
            .iter()
            .map(|d| format!("{}\n", d))
            .collect(),
        EmitStage::BuildInfo => output.provenance.to_json(),
    })
}

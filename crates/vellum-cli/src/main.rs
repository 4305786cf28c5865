//! Vellum CLI - TeX compiles with an on-demand distribution.

mod colors;
mod compile;
mod host;
mod sync;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use vellum_core::{CompileOptions, DriverConfig, EngineKind};

use crate::compile::{CompileArgs, Resources};

#[derive(Parser)]
#[command(name = "vellum")]
#[command(about = "TeX compile driver that fetches its distribution on demand")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Driver configuration (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct ResourceArgs {
    /// Bundle manifest (JSON)
    #[arg(long)]
    manifest: PathBuf,

    /// Bundle directory or HTTP mirror
    #[arg(long)]
    bundles: String,

    /// Package directory or HTTP mirror
    #[arg(long)]
    ctan: Option<String>,
}

impl From<ResourceArgs> for Resources {
    fn from(args: ResourceArgs) -> Self {
        Self {
            manifest: args.manifest,
            bundles: args.bundles,
            ctan: args.ctan,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a document to PDF
    Compile {
        /// Path to the document (.tex file)
        input: PathBuf,

        #[command(flatten)]
        resources: ResourceArgs,

        /// Engine: pdflatex, xelatex or lualatex
        #[arg(short, long, default_value = "pdflatex")]
        engine: EngineKind,

        /// Output path (default: input with .pdf)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Retry ceiling
        #[arg(long)]
        max_retries: Option<u32>,

        /// Mount lazily and fetch single files on demand
        #[arg(long)]
        lazy: bool,

        /// Fall back to the package source for files no bundle has
        #[arg(long)]
        ctan_fallback: bool,

        /// Directory holding auxiliary files between runs
        #[arg(long)]
        aux_dir: Option<PathBuf>,

        /// Precompiled preamble format
        #[arg(long)]
        format: Option<PathBuf>,

        /// Bundle to fetch up front (repeatable)
        #[arg(long = "bundle")]
        bundle_names: Vec<String>,

        /// Bundle to mount deferred (repeatable, needs --lazy)
        #[arg(long = "deferred")]
        deferred: Vec<String>,
    },

    /// Dump a document preamble into a reusable format
    Format {
        /// Path to the document or preamble
        input: PathBuf,

        #[command(flatten)]
        resources: ResourceArgs,

        /// Engine: pdflatex, xelatex or lualatex
        #[arg(short, long, default_value = "pdflatex")]
        engine: EngineKind,

        /// Output path (default: input with .fmt)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Look up positions in a SyncTeX file
    Sync {
        #[command(subcommand)]
        query: SyncQuery,
    },
}

#[derive(Subcommand)]
enum SyncQuery {
    /// Output position of a source line
    View {
        /// Position log (.synctex or .synctex.gz)
        synctex: PathBuf,
        /// Source file
        file: String,
        /// Line number
        line: u32,
    },

    /// Source location under a point on a page
    Edit {
        /// Position log (.synctex or .synctex.gz)
        synctex: PathBuf,
        /// Page number
        page: u32,
        /// Horizontal position in big points
        x: f64,
        /// Vertical position in big points, from the top
        y: f64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Helper to format vellum-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(vellum_err) = err.downcast_ref::<vellum_core::Error>() {
            anyhow::anyhow!("{}", vellum_err.with_hint())
        } else {
            err
        }
    };

    let config = match &cli.config {
        Some(path) => DriverConfig::load(path)?,
        None => DriverConfig::default(),
    };

    match cli.command {
        Commands::Compile {
            input,
            resources,
            engine,
            output,
            max_retries,
            lazy,
            ctan_fallback,
            aux_dir,
            format,
            bundle_names,
            deferred,
        } => {
            let args = CompileArgs {
                input,
                engine,
                output,
                format,
                aux_dir,
                bundles: bundle_names,
                deferred,
                options: CompileOptions {
                    verbose: cli.verbose,
                    max_retries,
                    enable_lazy_fs: lazy,
                    enable_ctan: ctan_fallback,
                },
            };
            compile::execute(args, &resources.into(), config)
                .await
                .map_err(format_error)?;
        }

        Commands::Format {
            input,
            resources,
            engine,
            output,
        } => {
            compile::execute_format(&input, engine, output, &resources.into(), config)
                .await
                .map_err(format_error)?;
        }

        Commands::Sync { query } => match query {
            SyncQuery::View {
                synctex,
                file,
                line,
            } => sync::view(&synctex, &file, line).map_err(format_error)?,
            SyncQuery::Edit { synctex, page, x, y } => {
                sync::edit(&synctex, page, x, y).map_err(format_error)?
            }
        },
    }

    Ok(())
}

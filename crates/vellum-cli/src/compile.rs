//! Compile and format commands.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tokio::task::JoinHandle;
use vellum_core::{
    Blob, CompileOptions, CompileRequest, CompileStats, DriverConfig, EngineKind, FetchGateway,
    FormatRequest, Manifest, OperationQueue, ProcessSandboxFactory, SessionDriver,
};

use crate::colors;
use crate::host::{self, ResourceStore, Source};

/// Where resources come from.
pub struct Resources {
    pub manifest: PathBuf,
    pub bundles: String,
    pub ctan: Option<String>,
}

/// Switches of the compile command.
pub struct CompileArgs {
    pub input: PathBuf,
    pub engine: EngineKind,
    pub output: Option<PathBuf>,
    pub format: Option<PathBuf>,
    pub aux_dir: Option<PathBuf>,
    pub bundles: Vec<String>,
    pub deferred: Vec<String>,
    pub options: CompileOptions,
}

struct Host {
    queue: OperationQueue,
    manifest: Arc<Manifest>,
    _responder: JoinHandle<()>,
}

async fn start(resources: &Resources, config: DriverConfig) -> anyhow::Result<Host> {
    let bytes = tokio::fs::read(&resources.manifest)
        .await
        .with_context(|| format!("reading manifest {}", resources.manifest.display()))?;
    let manifest = Arc::new(Manifest::from_json(&bytes)?);

    let client = reqwest::Client::new();
    let store = ResourceStore::new(
        Source::parse(&resources.bundles, &client),
        resources.ctan.as_deref().map(|ctan| Source::parse(ctan, &client)),
    );

    let (gateway, endpoint) = FetchGateway::channel(config.fetch_timeouts());
    let responder = host::serve(Arc::new(store), endpoint);
    let driver = SessionDriver::new(
        Arc::clone(&manifest),
        gateway,
        Arc::new(ProcessSandboxFactory::new()),
        config,
    );
    let (queue, _worker) = OperationQueue::spawn(driver);

    Ok(Host {
        queue,
        manifest,
        _responder: responder,
    })
}

/// Compile a document and write the PDF, position log and auxiliary files.
pub async fn execute(
    args: CompileArgs,
    resources: &Resources,
    config: DriverConfig,
) -> anyhow::Result<()> {
    let start_time = Instant::now();
    let source = tokio::fs::read_to_string(&args.input)
        .await
        .with_context(|| format!("reading {}", args.input.display()))?;
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| args.input.with_extension("pdf"));

    print_header("Compiling", &args.input, args.engine);
    let host = start(resources, config).await?;

    let mut request = CompileRequest::new(source, args.engine).with_options(args.options);
    request.bundle_names = args.bundles;
    request.deferred_bundle_names = args.deferred;
    if let Some(format) = &args.format {
        let bytes = tokio::fs::read(format)
            .await
            .with_context(|| format!("reading format {}", format.display()))?;
        request = request.with_format(Blob::from(bytes));
    }
    if let Some(dir) = &args.aux_dir {
        request = request.with_aux_files(read_aux_dir(dir).await?);
    }

    let outcome = host.queue.compile(request).await?;
    print_stats(&outcome.stats);

    if !outcome.success {
        eprintln!("{}", outcome.log);
        anyhow::bail!(
            "compile failed with exit code {} after {} retries",
            outcome.exit_code,
            outcome.stats.retries
        );
    }

    if let Some(pdf) = &outcome.output {
        tokio::fs::write(&output, pdf)
            .await
            .with_context(|| format!("writing {}", output.display()))?;
    }
    if let Some(position_log) = &outcome.position_log {
        tokio::fs::write(position_log_path(&output, position_log), position_log).await?;
    }
    if let Some(dir) = &args.aux_dir {
        tokio::fs::create_dir_all(dir).await?;
        for (name, bytes) in &outcome.aux_files_to_cache {
            tokio::fs::write(dir.join(name), bytes).await?;
        }
    }
    if !outcome.shims.is_empty() {
        let names: Vec<&str> = outcome.shims.keys().map(String::as_str).collect();
        println!("{}  ! Shimmed:{} {}", colors::YELLOW, colors::RESET, names.join(", "));
    }

    println!(
        "{}Wrote{} {} in {:.2}s",
        colors::GREEN,
        colors::RESET,
        output.display(),
        start_time.elapsed().as_secs_f64()
    );
    Ok(())
}

/// Dump a document's preamble into a format file.
pub async fn execute_format(
    input: &Path,
    engine: EngineKind,
    output: Option<PathBuf>,
    resources: &Resources,
    config: DriverConfig,
) -> anyhow::Result<()> {
    let preamble = tokio::fs::read_to_string(input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;
    let output = output.unwrap_or_else(|| input.with_extension("fmt"));

    print_header("Format", input, engine);
    let host = start(resources, config).await?;

    let mut request = FormatRequest::new(preamble, engine);
    request.manifest = Some(Arc::clone(&host.manifest));
    let outcome = host.queue.generate_format(request).await?;
    print_stats(&outcome.stats);

    match outcome.format_bytes {
        Some(bytes) if outcome.success => {
            tokio::fs::write(&output, &bytes)
                .await
                .with_context(|| format!("writing {}", output.display()))?;
            println!(
                "{}Wrote{} {} ({} bytes)",
                colors::GREEN,
                colors::RESET,
                output.display(),
                bytes.len()
            );
            Ok(())
        }
        _ => {
            eprintln!("{}", outcome.log);
            anyhow::bail!(
                "format generation failed: {}",
                outcome.error.unwrap_or_else(|| "unknown error".to_string())
            )
        }
    }
}

async fn read_aux_dir(dir: &Path) -> anyhow::Result<BTreeMap<String, Blob>> {
    let mut files = BTreeMap::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e).with_context(|| format!("reading {}", dir.display())),
    };
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let bytes = tokio::fs::read(entry.path()).await?;
        files.insert(name, Blob::from(bytes));
    }
    Ok(files)
}

fn position_log_path(output: &Path, bytes: &[u8]) -> PathBuf {
    if bytes.starts_with(&[0x1f, 0x8b]) {
        output.with_extension("synctex.gz")
    } else {
        output.with_extension("synctex")
    }
}

fn print_header(action: &str, input: &Path, engine: EngineKind) {
    println!("\n{}Vellum {action}{} {}", colors::BOLD, colors::RESET, input.display());
    println!("{}", "─".repeat(50));
    println!("{}  ◆ Engine:{} {engine}", colors::CYAN, colors::RESET);
}

fn print_stats(stats: &CompileStats) {
    println!(
        "{}  attempts {} · retries {} · reruns {} · bundles {} · ranges {} · packages {}{}",
        colors::DIM,
        stats.attempts,
        stats.retries,
        stats.reruns,
        stats.bundles_fetched,
        stats.ranges_fetched,
        stats.packages_fetched,
        colors::RESET
    );
}

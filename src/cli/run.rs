use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Args;
use console::style;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use massip_core::{
    BatchDispatcher, CancelFlag, InvocationKind, ParserSet, PluginInvoker, PluginRegistry,
    ProgressEvent, ProgressSender, Settings,
};

use super::print_rejections;

#[derive(Args)]
pub struct RunArgs {
    /// CSV files to analyze
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,
    /// Plugin to run on every entity (repeatable, runs in the given order)
    #[arg(short = 'p', long = "plugin", required = true)]
    pub plugins: Vec<String>,
    /// Parameter for a plugin, as name=value (repeatable)
    #[arg(long = "param", value_parser = parse_param)]
    pub params: Vec<(String, String)>,
    /// Parser used to find entities; without one every cell is an entity
    #[arg(long)]
    pub parser: Option<String>,
    /// Output file (single input only)
    #[arg(short, long, conflicts_with = "output_dir")]
    pub output: Option<PathBuf>,
    /// Directory for output files
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
    /// First row of each input is a header
    #[arg(long)]
    pub header: bool,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected name=value, got '{raw}'")),
    }
}

/// `<stem>_analysis.csv`, next to the input unless a directory is given.
pub fn output_path(input: &Path, output_dir: Option<&Path>) -> PathBuf {
    let stem = input
        .file_stem()
        .map_or_else(|| "output".into(), |s| s.to_string_lossy());
    let name = format!("{stem}_analysis.csv");
    match output_dir {
        Some(dir) => dir.join(name),
        None => input.with_file_name(name),
    }
}

/// The path as it will be opened: canonical when it exists, otherwise the
/// canonical parent joined with the file name.
fn resolved(path: &Path) -> PathBuf {
    if let Ok(path) = path.canonicalize() {
        return path;
    }
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match (parent.canonicalize(), path.file_name()) {
        (Ok(dir), Some(name)) => dir.join(name),
        _ => path.to_path_buf(),
    }
}

/// Pair every input with its output. Each batch must own its output file, so
/// two batches writing the same file, or a batch overwriting any input, is an
/// error.
pub fn plan_outputs(
    inputs: &[PathBuf],
    output: Option<&Path>,
    output_dir: Option<&Path>,
) -> Result<Vec<(PathBuf, PathBuf)>> {
    if output.is_some() && inputs.len() > 1 {
        bail!("--output can only be used with a single input; use --output-dir instead");
    }

    let plan: Vec<(PathBuf, PathBuf)> = inputs
        .iter()
        .map(|input| {
            let target = output.map_or_else(|| output_path(input, output_dir), Path::to_path_buf);
            (input.clone(), target)
        })
        .collect();

    let sources: HashMap<PathBuf, &Path> =
        plan.iter().map(|(input, _)| (resolved(input), input.as_path())).collect();
    let mut targets: HashMap<PathBuf, &Path> = HashMap::new();

    for (input, target) in &plan {
        let key = resolved(target);
        if let Some(source) = sources.get(&key) {
            bail!(
                "output {} for {} would overwrite input {}",
                target.display(),
                input.display(),
                source.display()
            );
        }
        if let Some(other) = targets.insert(key, input.as_path()) {
            bail!(
                "{} and {} would both write {}",
                other.display(),
                input.display(),
                target.display()
            );
        }
    }

    Ok(plan)
}

pub async fn run(settings: &Settings, args: RunArgs) -> Result<()> {
    let plan = plan_outputs(&args.inputs, args.output.as_deref(), args.output_dir.as_deref())?;

    let registry = PluginRegistry::discover(&settings.plugin_dir);
    print_rejections("plugin manifests", registry.rejected());
    let selection = registry.select(args.plugins.as_slice())?;

    let parser = match &args.parser {
        Some(name) => {
            let parsers = ParserSet::discover(&settings.parser_dir);
            print_rejections("parser definitions", parsers.rejected());
            Some(parsers.require(name)?)
        }
        None => None,
    };

    let parameters: HashMap<String, String> = args.params.into_iter().collect();
    let invoker = Arc::new(PluginInvoker::from_settings(settings));
    let (progress, events) = ProgressSender::channel(settings.progress_buffer);
    let printer = tokio::spawn(print_progress(events));
    let drops = progress.detached();

    let cancel = CancelFlag::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{}", style("Interrupted, finishing current rows...").yellow());
                cancel.cancel();
            }
        })
    };

    let mut batches = JoinSet::new();
    for (input, output) in plan {
        let dispatcher = BatchDispatcher::new(
            input.display().to_string(),
            selection.clone(),
            Arc::clone(&invoker),
        )
        .with_parser(parser.clone())
        .with_parameters(parameters.clone())
        .with_progress(progress.clone())
        .with_header(args.header);
        let cancel = cancel.clone();

        batches.spawn(async move {
            let result = dispatcher.run_csv(&input, &output, &cancel).await;
            (input, output, result)
        });
    }
    drop(progress);

    let mut failed = 0;
    while let Some(joined) = batches.join_next().await {
        match joined {
            Ok((_, output, Ok(summary))) => {
                tracing::debug!(output = %output.display(), ?summary, "batch joined");
            }
            Ok((input, _, Err(error))) => {
                failed += 1;
                tracing::debug!(input = %input.display(), %error, "batch joined with error");
            }
            Err(error) => {
                failed += 1;
                tracing::error!(%error, "batch task failed");
            }
        }
    }

    interrupt.abort();
    if let Err(error) = printer.await {
        tracing::warn!(%error, "progress printer stopped");
    }

    let dropped = drops.dropped();
    if dropped > 0 {
        eprintln!(
            "{}",
            style(format!("{dropped} progress events were dropped (channel full)")).yellow()
        );
    }

    if failed > 0 {
        bail!("{failed} batch(es) failed");
    }
    Ok(())
}

async fn print_progress(mut events: mpsc::Receiver<ProgressEvent>) {
    while let Some(event) = events.recv().await {
        let batch = style(format!("[{}]", event.batch())).dim();
        match &event {
            ProgressEvent::Invocation {
                kind: InvocationKind::Invoking,
                ..
            } => eprintln!("{batch} {event}"),
            ProgressEvent::Invocation { .. } => eprintln!("{batch} {}", style(&event).dim()),
            ProgressEvent::InvocationFailed { .. } | ProgressEvent::RowFailed { .. } => {
                eprintln!("{batch} {}", style(&event).yellow());
            }
            ProgressEvent::BatchComplete { cancelled, .. } => {
                let marker = if *cancelled {
                    style("!").yellow()
                } else {
                    style("✓").green()
                };
                eprintln!("{batch} {marker} {event}");
            }
            ProgressEvent::BatchFailed { .. } => {
                eprintln!("{batch} {} {}", style("✗").red().bold(), style(&event).red());
            }
        }
    }
}

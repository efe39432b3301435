//! A small inspection binary that exercises [`taskstow::history`] against a
//! real temporary directory. This is NOT the build tool's own CLI — the
//! engine is explicit that no CLI is owned by its core (spec §6) — it
//! exists purely so a developer can watch the engine make a skip/run
//! decision and see what it persists, the way the teacher's own `ui`
//! commands exist to exercise its library layer from a terminal.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use tracing::info;

use taskstow::config;
use taskstow::counters::{self, Op};
use taskstow::history::{TaskHistoryRepository, TaskInputs};
use taskstow::hashing::ContentHash;
use taskstow::implementation::ImplementationSnapshot;
use taskstow::prettify;
use taskstow::snapshotter::FilesystemSnapshotter;
use taskstow::store::Store;
use taskstow::value::StructuralValueSnapshotter;

#[derive(Debug, Parser)]
#[command(about = "Drive a toy task through the task-history engine")]
struct Args {
    /// Verbosity (-v, -vv, -vvv, ...)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Where the persistent store lives.
    #[arg(short, long, default_value = ".taskstow")]
    store: Utf8PathBuf,

    #[command(subcommand)]
    subcommand: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run (or skip) a toy task: one input directory, one output
    /// directory, and an optional scalar input value.
    Run {
        /// Stable identity string for the task (the store's cache key).
        task_path: String,
        /// Declared input root.
        #[arg(long)]
        input: Utf8PathBuf,
        /// Declared output root.
        #[arg(long)]
        output: Utf8PathBuf,
        /// An arbitrary input value property, snapshotted structurally.
        #[arg(long)]
        value: Option<String>,
    },
    /// Print the persisted record for a task path, if any.
    Dump {
        task_path: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.subcommand {
        Command::Run {
            task_path,
            input,
            output,
            value,
        } => run(&args.store, &task_path, &input, &output, value.as_deref()),
        Command::Dump { task_path } => dump(&args.store, &task_path),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(format!("taskstow_cli={level},taskstow={level}")))
        .init();
}

fn run(
    store_dir: &Utf8PathBuf,
    task_path: &str,
    input: &Utf8PathBuf,
    output: &Utf8PathBuf,
    value: Option<&str>,
) -> Result<()> {
    let conf = config::load().unwrap_or_default();

    let store = Store::open(store_dir, &conf).context("Couldn't open store")?;
    let mut repo = TaskHistoryRepository::new(store, FilesystemSnapshotter, StructuralValueSnapshotter);
    let mut history = repo.history_for(task_path);

    // `History` itself looks up the previous run's stored value for this
    // property and decides whether to reuse it by `Arc` identity (§8
    // property 3) — callers just hand over the raw value.
    let mut input_properties = BTreeMap::new();
    if let Some(v) = value {
        let snapshot = history
            .snapshot_input_property("value", &v)
            .context("snapshotting input property \"value\"")?;
        input_properties.insert("value".to_owned(), snapshot);
    }

    let task_implementation = ImplementationSnapshot::new(
        "taskstow_cli::ToyTask",
        ContentHash::of_bytes(b"taskstow-cli:toy-task:v1"),
    );
    info!(
        "{task_path}: implementation {} ({})",
        task_implementation.type_name,
        task_implementation.classloader_hash.short_name()
    );

    let inputs = TaskInputs {
        task_path: task_path.to_owned(),
        build_invocation_id: format!("cli-{}", std::process::id()),
        task_implementation,
        task_action_implementations: vec![],
        input_properties,
        cacheable_output_property_names: ["out".to_owned()].into_iter().collect(),
        input_file_roots: [("in".to_owned(), vec![input.clone()])].into_iter().collect(),
        output_file_roots: [("out".to_owned(), vec![output.clone()])].into_iter().collect(),
    };

    if history.is_up_to_date(&inputs)? {
        println!("{task_path}: UP-TO-DATE, nothing to do");
    } else {
        info!("{task_path}: running (inputs or implementation changed)");
        // Snapshot outputs as they stand right now, before the toy task
        // below touches anything, so overlap detection and the output
        // filter can tell "modified this run" apart from "already there".
        history.prepare_execution(&inputs)?;
        println!("{task_path}: RAN");
        history.update_current(&inputs, &[], true)?;
        history.persist()?;
    }

    counters::log_counts();
    if counters::count(Op::OverlapDetected) > 0 {
        println!("note: overlapping outputs were detected for {task_path}");
    }
    Ok(())
}

fn dump(store_dir: &Utf8PathBuf, task_path: &str) -> Result<()> {
    prettify::prettify_serialize();
    let conf = config::load().unwrap_or_default();
    let store = Store::open(store_dir, &conf).context("Couldn't open store")?;
    let mut repo = TaskHistoryRepository::new(store, FilesystemSnapshotter, StructuralValueSnapshotter);
    let mut history = repo.history_for(task_path);
    match history.previous_execution() {
        Some(record) => println!("{record:#?}"),
        None => println!("{task_path}: no persisted record"),
    }
    Ok(())
}

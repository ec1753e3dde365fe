use anyhow::{bail, Context, Result};
use clap::Parser;
use medvba::cli::{Cli, ClusterArgs, Command, ReportArgs, RunArgs, WelchArgs};
use medvba::cluster::{ClusterConfig, ClusterExtractor, CorrectionPolicy, OutputMode};
use medvba::config::AnalysisConfig;
use medvba::labels::LabelDictionary;
use medvba::pipeline::TaskState;
use medvba::report::RegionVolumeReporter;
use medvba::stats::GroupStatistics;
use medvba::table::Table;
use medvba::{cli, smoothness};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber, level from `-v` unless `RUST_LOG` is set
fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn welch(args: WelchArgs) -> Result<()> {
    let table = Table::load(&args.table)
        .with_context(|| format!("cannot read data table {}", args.table.display()))?;
    let root = match args.root {
        Some(root) => root,
        None => std::env::current_dir()?,
    };
    let groups = cli::load_groups(&table, &args.group, &root, &args.table)?;
    if groups.len() != 2 {
        bail!(
            "expected two groups in column {:?}, found {}",
            args.group,
            groups.len()
        );
    }
    tracing::info!(
        a = %groups[0].0,
        n_a = groups[0].1.len(),
        b = %groups[1].0,
        n_b = groups[1].1.len(),
        "comparing groups"
    );

    let images: Vec<_> = groups.into_iter().map(|(_, images)| images).collect();
    let map = GroupStatistics::compute_paths(&images, args.mask.as_deref())?;
    map.save(&args.t, args.p.as_deref(), args.z.as_deref())?;
    Ok(())
}

fn cluster(args: ClusterArgs) -> Result<()> {
    let policy = CorrectionPolicy::from_value(args.p_or_size)?;
    let output = if args.binary {
        OutputMode::Binary
    } else {
        OutputMode::Magnitude
    };
    let config = ClusterConfig::new(args.threshold, policy)
        .with_connectivity(args.connectivity)
        .with_output(output);
    let result = ClusterExtractor::new(config)?.run(
        &args.statistic,
        Some(args.mask.as_path()),
        args.smoothness.as_deref(),
        &args.clusters,
        args.table.as_deref(),
    )?;
    if let Some(min_extent) = result.min_extent {
        println!("Minimum cluster size under p-threshold = {min_extent}");
    }
    println!(
        "{} cluster(s), {} voxel(s)",
        result.table.len(),
        result.surviving_voxels()
    );
    Ok(())
}

fn report(args: ReportArgs) -> Result<()> {
    let report = RegionVolumeReporter::new(args.min_size).run(
        &args.clusters,
        &args.atlas,
        &args.labels,
        &args.output,
    )?;
    println!("{}", report.render());
    Ok(())
}

fn run(args: RunArgs) -> Result<()> {
    let config = AnalysisConfig::load(&args.config)
        .with_context(|| format!("invalid analysis {}", args.config.display()))?;
    let mut graph = config.to_graph()?;
    let state_file = config.state_file();

    if args.dry_run {
        for (id, state) in graph.dry_run(&state_file)? {
            let marker = if state == TaskState::UpToDate { "up-to-date" } else { "pending" };
            println!("{marker:>10}  {id}");
        }
        return Ok(());
    }

    std::fs::create_dir_all(&config.output)
        .with_context(|| format!("cannot create {}", config.output.display()))?;
    let summary = graph.execute(&state_file)?;
    println!(
        "{} task(s) run, {} up to date",
        summary.executed, summary.up_to_date
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Welch(args) => welch(args),
        Command::Cluster(args) => cluster(args),
        Command::Report(args) => report(args),
        Command::Smoothness(args) => {
            let descriptor = smoothness::estimate_files(&args.z, &args.mask)?;
            match args.output {
                Some(path) => descriptor.save(path)?,
                None => print!("{}", descriptor.to_text()),
            }
            Ok(())
        }
        Command::Labels(args) => {
            LabelDictionary::load(&args.input)?.save(&args.output)?;
            Ok(())
        }
        Command::Run(args) => run(args),
    }
}

use clap::Parser;
use smart_bin::{
    batch::{DEFAULT_SUBSET_LIMIT, Dataset, run_subset},
    build_analyzer,
    cli::{AnalyzerArgs, LogArgs, ModelArgs},
    init_logging,
    system_info::system_info,
};
use std::path::PathBuf;

/// Runs the analysis over the first images of `subset/` and writes `outputs/subset_results.json`.
#[derive(Parser)]
#[command(version=env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Dataset directory with subset/ and processed/
    #[clap(long, default_value = ".")]
    data_dir: PathBuf,
    /// Number of images to analyze
    #[clap(long, default_value_t = DEFAULT_SUBSET_LIMIT)]
    limit: usize,
    #[command(flatten)]
    model: ModelArgs,
    #[command(flatten)]
    analyzer: AnalyzerArgs,
    #[command(flatten)]
    log: LogArgs,
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let _guard = init_logging(args.log.log_level, args.log.log_path.clone())?;
    system_info()?;

    let dataset = Dataset::new(&args.data_dir);
    let mut analyzer = build_analyzer(&args.model, args.analyzer.resolve()?)?;
    let results = run_subset(&mut analyzer, &dataset, args.limit)?;
    println!(
        "Done! {} results saved to {}",
        results.len(),
        dataset.subset_results().display()
    );
    Ok(())
}

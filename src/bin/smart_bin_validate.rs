use clap::Parser;
use smart_bin::{
    batch::{DEFAULT_VALIDATION_IMAGES, DEFAULT_VALIDATION_SEED, Dataset, run_validation},
    build_analyzer,
    cli::{AnalyzerArgs, LogArgs, ModelArgs},
    init_logging,
    system_info::system_info,
};
use std::path::PathBuf;

/// Zero-shot validation: item recall over a seeded random sample of bin images.
#[derive(Parser)]
#[command(version=env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Dataset directory with subset/ and processed/
    #[clap(long, default_value = ".")]
    data_dir: PathBuf,
    /// Number of images to sample
    #[clap(long, default_value_t = DEFAULT_VALIDATION_IMAGES)]
    num_images: usize,
    /// Seed for the image sample
    #[clap(long, default_value_t = DEFAULT_VALIDATION_SEED)]
    seed: u64,
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
    let summary = run_validation(&mut analyzer, &dataset, args.num_images, args.seed)?;
    println!("{summary}");
    Ok(())
}

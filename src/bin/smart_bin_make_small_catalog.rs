use clap::Parser;
use smart_bin::{
    batch::{DEFAULT_SMALL_CATALOG_SIZE, Dataset, make_small_catalog},
    cli::LogArgs,
    init_logging,
};
use std::path::PathBuf;

/// Builds processed/asin_text_small.json from the most frequent ASINs in the metadata.
#[derive(Parser)]
#[command(version=env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Dataset directory with processed/
    #[clap(long, default_value = ".")]
    data_dir: PathBuf,
    /// Number of ASINs to keep
    #[clap(long, default_value_t = DEFAULT_SMALL_CATALOG_SIZE)]
    top: usize,
    #[command(flatten)]
    log: LogArgs,
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let _guard = init_logging(args.log.log_level, args.log.log_path.clone())?;

    let dataset = Dataset::new(&args.data_dir);
    let small = make_small_catalog(
        &dataset.metadata_csv(),
        &dataset.full_catalog(),
        &dataset.small_catalog(),
        args.top,
    )?;
    println!("Created: {}", dataset.small_catalog().display());
    println!("Total ASINs in small file: {}", small.len());
    Ok(())
}

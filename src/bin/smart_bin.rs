//! Verifies one bin photo against an order.
//!
//! ```sh
//! smart_bin --image bin.jpg --item "Red Nike Shoes=2" --item "Blue coffee mug"
//! smart_bin --image bin.jpg --asin B000123=2 --data-dir data
//! smart_bin --search mug --data-dir data
//! ```
use anyhow::bail;
use clap::Parser;
use smart_bin::{
    api::VerificationResponse,
    batch::Dataset,
    build_analyzer,
    cli::{AnalyzerArgs, LogArgs, ModelArgs},
    init_logging,
    system_info::system_info,
    verification::{Order, parse_item_arg, verify_order},
};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(version=env!("CARGO_PKG_VERSION"), about = "
Smart bin order verification

Detects the objects in a bin photo, compares every crop against the ordered item
descriptions and reports MATCH when at least the ordered quantity was found.")]
struct Cli {
    /// Path to the bin image (JPEG or PNG)
    #[clap(long, required_unless_present = "search")]
    image: Option<PathBuf>,
    /// Ordered item as DESC or DESC=QTY, may be repeated
    #[clap(long = "item")]
    items: Vec<String>,
    /// Ordered ASIN as ASIN or ASIN=QTY, resolved through the catalog, may be repeated
    #[clap(long = "asin")]
    asins: Vec<String>,
    /// JSON order file: { "description": quantity, ... }
    #[clap(long)]
    order: Option<PathBuf>,
    /// Search the catalog descriptions for a term and exit
    #[clap(long)]
    search: Option<String>,
    /// Dataset directory holding processed/asin_text.json or processed/asin_text_small.json
    #[clap(long, default_value = ".")]
    data_dir: PathBuf,
    /// Print the verification as JSON
    #[clap(long, default_value_t = false)]
    json: bool,
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
    if let Some(term) = &args.search {
        let catalog = dataset.load_catalog()?;
        let matches = catalog.search(term);
        println!("{} descriptions match {:?}", matches.len(), term);
        for description in matches {
            println!("  {description}");
        }
        return Ok(());
    }

    let order = build_order(&args, &dataset)?;
    let Some(image) = args.image.clone() else {
        bail!("--image is required");
    };
    let image_name = image.display().to_string();
    info!(
        "Verifying {} order lines ({} units) against {}",
        order.len(),
        order.total_quantity(),
        image_name
    );

    let config = args.analyzer.resolve()?;
    let mut analyzer = build_analyzer(&args.model, config)?;
    let analysis = match analyzer.analyze_image(&image, &order.descriptions()) {
        Ok(analysis) => analysis,
        Err(e) => {
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&VerificationResponse::failure(image_name, &e))?
                );
            }
            return Err(e);
        }
    };
    let verification = verify_order(&order, &analysis.counts)?;
    info!(
        all_verified = verification.all_verified,
        "Verified {} in {:?}", image_name, analysis.processing_time
    );

    if args.json {
        let response = VerificationResponse::from_verification(
            image_name,
            &verification,
            analysis.counts,
            analysis.detections,
            analysis.processing_time.as_millis() as i32,
        );
        for item in response.mismatched_items() {
            warn!(
                "{}: expected {}, found {}",
                item.item, item.quantity, item.found
            );
        }
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        println!("{verification}");
    }
    Ok(())
}

fn build_order(args: &Cli, dataset: &Dataset) -> anyhow::Result<Order> {
    let mut order = match &args.order {
        Some(path) => Order::from_json_file(path)?,
        None => Order::default(),
    };
    for item in &args.items {
        let (description, quantity) = parse_item_arg(item)?;
        order.add(&description, quantity)?;
    }
    if !args.asins.is_empty() {
        let catalog = dataset.load_catalog()?;
        for asin in &args.asins {
            let (asin, quantity) = parse_item_arg(asin)?;
            let Some(description) = catalog.get(&asin) else {
                bail!("ASIN {asin} is not in the catalog");
            };
            order.increment(description, quantity)?;
        }
    }
    if order.is_empty() {
        bail!("Order is empty, pass --item, --asin or --order");
    }
    Ok(order)
}

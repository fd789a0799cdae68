use clap::{CommandFactory, Parser};
use smart_bin::download_models::{Model, download_model, list_models};
use smart_bin::{LogLevel, init_logging};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "smart_bin_download_models",
    about = "A tool to download the detector and CLIP models used by smart bin"
)]
struct Cli {
    /// The file name of the model to download (optional)
    #[clap(short, long, conflicts_with_all = &["all", "default", "clip", "rt_detrv2", "list_models"])]
    model: Option<String>,

    /// Download all models
    #[clap(short, long, conflicts_with_all = &["model", "default", "clip", "rt_detrv2", "list_models"])]
    all: bool,

    /// Download the small RT-DETRv2 detector and the CLIP models
    #[clap(long, conflicts_with_all = &["model", "all", "clip", "rt_detrv2", "list_models"])]
    default: bool,

    /// Download the CLIP vision and text models and the tokenizer
    #[clap(long, conflicts_with_all = &["model", "all", "default", "rt_detrv2", "list_models"])]
    clip: bool,

    /// Download every RT-DETRv2 model
    #[clap(long, conflicts_with_all = &["model", "all", "default", "clip", "list_models"])]
    rt_detrv2: bool,

    /// List all available models
    #[clap(long, conflicts_with_all = &["model", "all", "default", "clip", "rt_detrv2", "destination"])]
    list_models: bool,

    /// Optional destination path where the models will be downloaded
    #[clap(short, long)]
    destination: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(LogLevel::Info, None)?;

    if cli.list_models {
        list_models();
        return Ok(());
    }

    let model = if cli.all {
        Model::All
    } else if cli.default {
        Model::Default
    } else if cli.clip {
        Model::Clip
    } else if cli.rt_detrv2 {
        Model::AllRtDetr2
    } else if let Some(name) = cli.model {
        Model::Model(name)
    } else {
        Cli::command().print_help()?;
        return Ok(());
    };

    let model_path = match cli.destination {
        Some(destination) => destination,
        None => std::env::current_exe()?
            .parent()
            .map(|p| p.to_path_buf())
            .ok_or_else(|| anyhow::anyhow!("Failed to get parent directory of executable"))?,
    };

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(download_model(model_path, model))
}

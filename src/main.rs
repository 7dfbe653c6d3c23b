use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

use inpaint_rs::{Config, DownloadProgress, Inpainter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    config.validate()?;

    let mut builder = Inpainter::builder()
        .model_name(&config.model)
        .cache_dir(&config.cache_dir)
        .device_id(config.device_id);
    if let Some(url) = &config.model_url {
        builder = builder.model_url(url);
    }
    let inpainter = builder.build()?;

    let progress = tokio::spawn(render_progress(inpainter.model_cache().subscribe()));

    let output = inpainter
        .inpaint(config.image_source(), config.mask_source())
        .await
        .with_context(|| format!("Failed to inpaint {}", config.image.display()))?;
    progress.abort();

    output
        .save(&config.output)
        .with_context(|| format!("Failed to save image: {}", config.output.display()))?;
    if config.data_uri {
        println!("{}", output.to_data_uri()?);
    }

    Ok(())
}

async fn render_progress(mut events: broadcast::Receiver<DownloadProgress>) {
    let mut bar: Option<ProgressBar> = None;
    loop {
        match events.recv().await {
            Ok(DownloadProgress { model, percent }) => {
                let bar = bar.get_or_insert_with(|| download_bar(&model));
                bar.set_position(percent.into());
                if percent == 100 {
                    bar.finish();
                }
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }
}

fn download_bar(model: &str) -> ProgressBar {
    let bar = ProgressBar::new(100);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} {msg} [{elapsed}] [{bar:40.cyan/blue}] {pos}% ({eta})",
    ) {
        bar.set_style(style.progress_chars("#>-"));
    }
    bar.set_message(format!("model `{}`", model));
    bar
}

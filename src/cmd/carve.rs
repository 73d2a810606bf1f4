use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use ocipeek::introspect::{ImageIntrospector, IntrospectOptionsBuilder};
use ocipeek::reference::ImageRef;
use ocipeek::RegistryClient;
use snafu::ResultExt as _;

use super::context::Ctx;

#[derive(Parser, Debug)]
#[clap(version, about = "Extract one file from an image without pulling it", long_about = None)]
pub struct Carve {
    /// Image reference, e.g. library/alpine:edge
    image: String,
    /// Path of the file inside the image, e.g. /etc/os-release
    path: String,
    /// Where to save the carved bytes, defaults to the file's basename
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Range request chunk size, in KiB
    #[arg(long, default_value_t = 64)]
    chunk_kib: u64,
    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,
}

impl Carve {
    pub async fn run(&self, ctx: &Ctx) -> anyhow::Result<()> {
        let image: ImageRef = self.image.parse()?;
        let client = RegistryClient::new(self.insecure)?;
        let options = IntrospectOptionsBuilder::default()
            .carve_chunk_bytes(self.chunk_kib * 1024)
            .build()
            .context(ocipeek::error::OptionsSnafu)?;

        let bar = ctx.multi().add(ProgressBar::new(0));
        bar.set_style(
            ProgressStyle::with_template("{prefix}: searching layer {pos}/{len}").unwrap(),
        );
        bar.set_prefix(self.path.clone());
        let progress = bar.clone();
        let introspector = ImageIntrospector::new(client, None, options).with_progress(Arc::new(
            move |stage: &str, current: usize, total: usize| {
                if stage == "carve" {
                    progress.set_length(total as u64);
                    progress.set_position(current as u64);
                }
            },
        ));

        let carved = introspector
            .carve_file(
                &image.namespace,
                &image.repository,
                &image.reference.to_string(),
                &self.path,
            )
            .await?;
        bar.finish_and_clear();

        let output = match &self.output {
            Some(output) => output.clone(),
            None => PathBuf::from(
                self.path
                    .trim_end_matches('/')
                    .rsplit('/')
                    .next()
                    .filter(|name| !name.is_empty())
                    .unwrap_or("carved.out"),
            ),
        };
        tokio::fs::write(&output, &carved.data)
            .await
            .map_err(|source| anyhow!("failed to write {}: {source}", output.display()))?;

        println!(
            "saved {} ({} bytes) from layer {} to {}",
            carved.entry.name,
            carved.data.len(),
            carved.layer_digest,
            output.display(),
        );
        println!(
            "downloaded {} of {} compressed bytes in {:.2?}",
            carved.bytes_downloaded, carved.layer_size, carved.elapsed,
        );
        Ok(())
    }
}

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use snafu::ResultExt;

use ocipeek::cache::MetadataCache;
use ocipeek::error;
use ocipeek::introspect::{ImageIntrospector, IntrospectOptionsBuilder};
use ocipeek::overlay::merge_layers;
use ocipeek::reference::ImageRef;
use ocipeek::tar::TarEntry;
use ocipeek::RegistryClient;

use super::context::Ctx;

#[derive(Parser, Debug)]
#[clap(version, about = "List the files visible in every layer of an image", long_about = None)]
pub struct Peek {
    /// Image reference, e.g. nginx, library/nginx:latest
    image: String,
    /// Metadata cache file
    #[arg(long, default_value = "ocipeek.db")]
    cache: PathBuf,
    /// Run without the metadata cache
    #[arg(long)]
    no_cache: bool,
    /// Compressed prefix to fetch per layer, in KiB
    #[arg(long, default_value_t = 256)]
    prefix_kib: u64,
    /// Collapse layers into a single merged view with whiteouts applied
    #[arg(long)]
    merged: bool,
    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,
}

impl Peek {
    pub async fn run(&self, ctx: &Ctx) -> anyhow::Result<()> {
        let image: ImageRef = self.image.parse()?;
        let client = RegistryClient::new(self.insecure)?;
        let cache = if self.no_cache {
            None
        } else {
            Some(MetadataCache::open(&self.cache).await?)
        };
        let options = IntrospectOptionsBuilder::default()
            .image_peek_prefix_bytes(self.prefix_kib * 1024)
            .build()
            .context(error::OptionsSnafu)?;

        let bar = ctx.multi().add(ProgressBar::new(0));
        bar.set_style(
            ProgressStyle::with_template("{prefix}: {bar:40.cyan/blue} {pos}/{len} {msg}")
                .unwrap()
                .progress_chars("##-"),
        );
        bar.set_prefix(image.to_string());
        let progress = bar.clone();
        let introspector = ImageIntrospector::new(client, cache, options).with_progress(
            Arc::new(move |stage: &str, current: usize, total: usize| {
                progress.set_length(total as u64);
                progress.set_position(current as u64);
                progress.set_message(stage.to_string());
            }),
        );

        let index = introspector
            .peek_image(
                &image.namespace,
                &image.repository,
                &image.reference.to_string(),
            )
            .await?;
        bar.finish_and_clear();

        if self.merged {
            let per_layer: Vec<Vec<TarEntry>> = index
                .results
                .iter()
                .map(|result| result.entries.clone())
                .collect();
            for entry in merge_layers(&per_layer) {
                println!("{}", ls_line(&entry));
            }
        } else {
            for (number, result) in index.results.iter().enumerate() {
                println!(
                    "layer {number} {} ({} entries, {} bytes fetched)",
                    result.digest, result.entries_found, result.bytes_downloaded,
                );
                if let Some(failure) = &result.error {
                    println!("  ! {failure}");
                }
                for entry in &result.entries {
                    println!("  {}", ls_line(entry));
                }
            }
        }
        println!(
            "{} entries across {} layers ({} from cache, {} bytes downloaded)",
            index.total_entries,
            index.layers_peeked,
            index.layers_from_cache,
            index.total_bytes_downloaded,
        );
        Ok(())
    }
}

fn ls_line(entry: &TarEntry) -> String {
    let link = if entry.linkname.is_empty() {
        String::new()
    } else if entry.is_hardlink() {
        format!(" link to {}", entry.linkname)
    } else {
        format!(" -> {}", entry.linkname)
    };
    format!(
        "{} {:>5}/{:<5} {:>9} {} {}{}",
        entry.mode_string(),
        entry.uid,
        entry.gid,
        entry.size,
        entry.format_mtime(),
        entry.name,
        link,
    )
}

use clap::Parser;

use ocipeek::introspect::{ImageIntrospector, IntrospectOptions};
use ocipeek::reference::ImageRef;
use ocipeek::RegistryClient;

use super::context::Ctx;

#[derive(Parser, Debug)]
#[clap(version, about = "Resolve an image to its ordered layer descriptors", long_about = None)]
pub struct Manifest {
    /// Image reference, e.g. nginx, library/nginx:latest, grafana/loki@sha256:…
    image: String,
    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,
}

impl Manifest {
    pub async fn run(&self, _ctx: &Ctx) -> anyhow::Result<()> {
        let image: ImageRef = self.image.parse()?;
        let client = RegistryClient::new(self.insecure)?;
        let introspector = ImageIntrospector::new(client, None, IntrospectOptions::default());
        let resolved = introspector
            .resolve(
                &image.namespace,
                &image.repository,
                &image.reference.to_string(),
            )
            .await?;

        if let Some(platform) = &resolved.platform {
            println!("platform: {platform}");
        }
        for (index, layer) in resolved.layers.iter().enumerate() {
            println!("{index}\t{}\t{} bytes", layer.digest, layer.size);
        }
        Ok(())
    }
}

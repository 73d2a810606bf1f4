use anyhow::anyhow;
use indicatif::MultiProgress;
use tracing_subscriber::EnvFilter;

pub struct Ctx {
    multi: MultiProgress,
}

impl Ctx {
    pub fn init() -> anyhow::Result<Self> {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|source| anyhow!("failed to initialize logging: {source}"))?;
        Ok(Self {
            multi: MultiProgress::new(),
        })
    }

    pub fn multi(&self) -> &MultiProgress {
        &self.multi
    }
}

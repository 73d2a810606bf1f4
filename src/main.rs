use clap::Parser;
use cmd::carve::Carve;
use cmd::context::Ctx;
use cmd::manifest::Manifest;
use cmd::peek::Peek;

mod cmd;

#[derive(Parser, Debug)]
struct Args {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Parser, Debug)]
enum Commands {
    Manifest(Manifest),
    Peek(Peek),
    Carve(Carve),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ctx = Ctx::init()?;
    let args = Args::parse();

    match args.command {
        Commands::Manifest(cmd) => cmd.run(&ctx).await?,
        Commands::Peek(cmd) => cmd.run(&ctx).await?,
        Commands::Carve(cmd) => cmd.run(&ctx).await?,
    }
    Ok(())
}

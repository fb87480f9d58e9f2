mod cli;
mod paths;
mod run;

use anyhow::Result;
use cli::Command;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::parse();
    run::initialise_tracing();

    match cli.command {
        Command::Generate(args) => run::generate(args).await,
        Command::New(args) => run::new_template(args),
        Command::Where(args) => run::describe(args),
    }
}

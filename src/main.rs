use clap::{CommandFactory, Parser};
use colored::*;

use study_watch_room::cli::{Args, Command};
use study_watch_room::config::ServerConfig;
use study_watch_room::logging::init_logging;
use study_watch_room::web::{self, HubState};
use study_watch_room::{watch, Result};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = run(args).await {
        eprintln!("{} {}", "error:".bright_red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Serve(serve) => {
            let mut config = ServerConfig::load(&serve.config)?;
            serve.apply_to(&mut config);

            let hub = HubState::new(config)?;
            let restored = hub.restore()?;
            if restored > 0 {
                tracing::info!(rooms = restored, "restored open rooms from archive");
            }
            web::serve(hub).await
        }
        Command::Watch(watch_args) => watch::run_watch(&watch_args).await,
        Command::Completions { shell } => {
            let mut cmd = Args::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
            Ok(())
        }
    }
}

use clap::Parser;

use korsync_server::cli::{self, Cli, Command};

fn main() -> anyhow::Result<()> {
    korsync_core::config::load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Cli::parse();
    let config = match &args.profile {
        Some(profile) => korsync_core::Config::for_profile(profile),
        None => korsync_core::Config::from_env(),
    };

    match args.command {
        Command::Serve { host, port } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(cli::serve(config, host, port))
        }
        Command::RunOnce { days } => {
            let runtime = tokio::runtime::Runtime::new()?;
            let code = runtime.block_on(cli::run_once(config, days))?;
            drop(runtime);
            std::process::exit(code);
        }
        Command::Worker { schedule, days } => {
            config.validate()?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(config.worker.concurrency)
                .enable_all()
                .build()?;
            runtime.block_on(cli::worker(config, schedule, days))
        }
        Command::Crontab {
            schedule,
            days,
            log,
            binary,
        } => {
            println!("{}", cli::crontab_line(&config, schedule, days, log, binary)?);
            Ok(())
        }
    }
}

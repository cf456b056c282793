use clap::{Arg, Command};

mod commands;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn config_arg() -> Arg {
    Arg::new("config")
        .short('c')
        .long("config")
        .value_name("PATH")
        .help("Path to a paperflow TOML configuration file")
}

#[tokio::main]
async fn main() {
    paperflow_runtime::logging::init_logging();

    let matches = Command::new("paperflow")
        .version(VERSION)
        .about("Paperflow - research-paper processing pipeline runtime")
        .subcommand(
            Command::new("dump-stats")
                .about("Print retry, circuit, and token accounting counters")
                .arg(config_arg()),
        )
        .subcommand(
            Command::new("reset-stats")
                .about("Reset the per-agent retry counters")
                .arg(config_arg()),
        )
        .subcommand(
            Command::new("reaper-run")
                .about("Force one timeout-reaper sweep over processing tasks")
                .arg(config_arg()),
        )
        .subcommand(
            Command::new("drain")
                .about("Refuse new runs, finish in-flight ones, stop workers")
                .arg(config_arg()),
        )
        .get_matches();

    let result = match matches.subcommand() {
        Some(("dump-stats", sub)) => {
            commands::stats::dump(sub.get_one::<String>("config").cloned()).await
        }
        Some(("reset-stats", sub)) => {
            commands::stats::reset(sub.get_one::<String>("config").cloned()).await
        }
        Some(("reaper-run", sub)) => {
            commands::reaper::run(sub.get_one::<String>("config").cloned()).await
        }
        Some(("drain", sub)) => {
            commands::drain::run(sub.get_one::<String>("config").cloned()).await
        }
        _ => {
            eprintln!("No subcommand given. Try: paperflow dump-stats");
            std::process::exit(2);
        }
    };

    if let Err(error) = result {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

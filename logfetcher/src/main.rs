use structopt::StructOpt;

mod engine;
mod scheduler;
#[cfg(test)]
mod test_support;
mod transfer;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "logfetcher",
    about = "`logfetcher` periodically harvests rotated log files from a fleet of remote hosts \
    over ssh and archives them, gzip-compressed, into a date-stamped local directory tree.

The configuration file is read from ./etc/logfetcher.cfg unless the LOGFETCHER_CFG environment \
variable points elsewhere."
)]
enum Command {
    /// Start fetching logs from all configured hosts
    Fetch {
        /// Force the debug log level and mirror log output to stdout
        #[structopt(short = "v", long)]
        verbose: bool,
    },
}

fn main() {
    let command = Command::from_args();
    match command {
        Command::Fetch { verbose } => {
            if let Err(err) = run_fetch(verbose) {
                eprintln!("{:#}", err);
                std::process::exit(1);
            }
        }
    }
}

fn run_fetch(verbose: bool) -> anyhow::Result<()> {
    let config_path = common::config::config_path();
    let config = common::config::load(&config_path)?;
    common::logging::init(&config.general.log_file, config.general.log_level, verbose)?;
    tracing::info!(
        "logfetcher starting with {} host(s) from {:?}",
        config.hosts.len(),
        config_path
    );
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(scheduler::run(config))
}

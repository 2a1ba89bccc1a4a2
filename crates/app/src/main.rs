use clap::Parser;

mod cli;
mod watch;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    cli::handle(cli::Cli::parse())
}

mod cli;

use bisectbot::utils;
use clap::Parser;
use std::panic;
use std::process;

fn main() {
    let _ = dotenv::dotenv();

    let mut env = env_logger::Builder::new();
    env.filter_module("bisectbot", log::LevelFilter::Info);
    if let Ok(content) = std::env::var("RUST_LOG") {
        env.parse_filters(&content);
    }
    env.init();

    let success = match panic::catch_unwind(main_) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            utils::report_failure(&e);
            false
        }
        Err(e) => {
            utils::report_panic(&*e);
            false
        }
    };
    process::exit(if success { 0 } else { 1 });
}

fn main_() -> anyhow::Result<()> {
    cli::Cli::parse().run()
}

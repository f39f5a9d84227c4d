use clap::Parser;
use cli::AppOptions;
use human_panic::setup_panic;
use log::debug;
use std::process::ExitCode;

mod cli;
mod commands;

fn main() -> ExitCode {
    setup_panic!();

    // arg parsing
    let args = AppOptions::parse();

    // logger
    simple_logger::init_with_level(args.log_level).unwrap();

    // run
    if let Err(e) = commands::classify::run(args) {
        eprintln!("error: {e:#}");
        debug!("{e:?}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

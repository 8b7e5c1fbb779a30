//! Command line program for running `campaign` studies.

#[macro_use]
extern crate log;

extern crate anyhow;
extern crate clap;
extern crate colored;

extern crate campaign_core as campaign;

pub mod cli;
mod util;

use colored::*;

fn main() {
    // Run the program based on user input
    let code = match cli::start(cli::app_matches()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}{}", "error: ".red(), e);
            if e.root_cause().to_string() != e.to_string() {
                eprintln!("Caused by:\n{}", e.root_cause())
            }
            util::exit_code(&e)
        }
    };
    std::process::exit(code);
}

use clap::Parser;

use bootripper::cmd::Cmd;

fn main() {
    if let Err(e) = Cmd::parse().run() {
        eprintln!("\nERROR: {:#}", e);
        std::process::exit(1);
    }
}

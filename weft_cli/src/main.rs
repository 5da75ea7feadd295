//! `weftd`: the `weft` server binary.

use clap::Parser;
use weft_cli::{Application, Cli};

fn main() {
    weft_cli::logging::init();
    let cli = Cli::parse();
    let code = Application::new(cli).run();
    std::process::exit(code);
}

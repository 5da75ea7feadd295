//! Command-line argument parsing, grounded in
//! `bin/fimo/src/main.rs`'s `clap` derive usage (the teacher already
//! depends on `clap`) and the startup-argument surface of
//! `original_source/ljrServer/env.{h,cpp}` (`-s`, `-d`, `-c`, `-p`).

use clap::Parser;
use std::path::PathBuf;

/// A `weft` server process: loads configuration, optionally daemonizes,
/// and brings up the HTTP servers named under the `http_servers` config
/// key.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML config file to merge over compiled-in defaults. Falls back
    /// to the `WEFT_CONFIG` environment variable when omitted.
    #[arg(short = 'c', long = "config", env = "WEFT_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Run in the foreground, attached to the calling terminal.
    #[arg(short = 's', long = "start")]
    pub start: bool,

    /// Run as a background daemon; a supervisor process restarts the
    /// worker after a crash (see `daemon.restart_interval`).
    #[arg(short = 'd', long = "daemon")]
    pub daemon: bool,
}

impl Cli {
    /// `true` once exactly one of `-s`/`-d` has been chosen; mirrors the
    /// original's "must pick a run mode" check in `Application::init`.
    pub fn has_run_mode(&self) -> bool {
        self.start || self.daemon
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_flag_alone_selects_a_run_mode() {
        let cli = Cli::parse_from(["weftd", "-d"]);
        assert!(cli.has_run_mode());
        assert!(cli.daemon);
        assert!(!cli.start);
    }

    #[test]
    fn no_flags_has_no_run_mode() {
        let cli = Cli::parse_from(["weftd"]);
        assert!(!cli.has_run_mode());
    }

    #[test]
    fn config_path_can_come_from_the_flag() {
        let cli = Cli::parse_from(["weftd", "-s", "-c", "/etc/weft/weft.yml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/weft/weft.yml")));
    }
}

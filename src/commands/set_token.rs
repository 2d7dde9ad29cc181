//! The `set-token` subcommand: store a pool's PAT in the OS keyring.

use std::io::{BufRead, IsTerminal, Write};
use std::os::fd::AsFd;

use anyhow::{bail, Context, Result};
use clap::Args;
use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg};

use incus_azure_pipelines::config;

#[derive(Args, Debug)]
pub struct SetTokenCmd {
    /// Pool name the PAT belongs to.
    pool: String,
}

impl SetTokenCmd {
    pub async fn run(self) -> Result<()> {
        eprint!("Enter PAT: ");
        let _ = std::io::stderr().flush();
        let pat = read_password().context("failed to read PAT")?;
        eprintln!();

        if pat.is_empty() {
            bail!("PAT cannot be empty");
        }

        config::store_pat(&self.pool, &pat).context("failed to store PAT in keyring")?;
        eprintln!("PAT stored in keyring for pool {:?}", self.pool);
        Ok(())
    }
}

/// Read one line from stdin with terminal echo disabled. Piped input is
/// read as-is.
fn read_password() -> Result<String> {
    let stdin = std::io::stdin();

    if !stdin.is_terminal() {
        let mut line = String::new();
        stdin.lock().read_line(&mut line)?;
        return Ok(trim_newline(line));
    }

    let saved = tcgetattr(stdin.as_fd()).context("tcgetattr")?;
    let mut silent = saved.clone();
    silent.local_flags.remove(LocalFlags::ECHO);
    tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &silent).context("tcsetattr")?;

    let mut line = String::new();
    let read = stdin.lock().read_line(&mut line);

    // Restore echo before surfacing any read error.
    let restored = tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &saved);
    read?;
    restored.context("restoring terminal")?;

    Ok(trim_newline(line))
}

fn trim_newline(line: String) -> String {
    line.trim_end_matches(['\r', '\n']).to_string()
}

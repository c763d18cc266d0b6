//! Shell completions generation command
//!
//! Generates shell completions for bash, zsh, fish, elvish, and powershell.
//! Usage: `lockstep completions bash > ~/.local/share/bash-completion/completions/lockstep`

use std::io::{self, Write};

use anyhow::Result;
use clap::CommandFactory;
use clap_complete::Shell;

use crate::output::OutputFormat;

#[derive(Debug, clap::Args)]
pub struct CompletionsCommand {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsCommand {
    /// Writes the completion script for the `lockstep` binary to `out`
    fn generate(&self, out: &mut dyn Write) {
        let mut cmd = crate::Cli::command();
        let bin_name = cmd.get_name().to_string();
        clap_complete::generate(self.shell, &mut cmd, bin_name, out);
    }

    pub async fn execute(&self, _format: OutputFormat) -> Result<()> {
        self.generate(&mut io::stdout());
        Ok(())
    }
}

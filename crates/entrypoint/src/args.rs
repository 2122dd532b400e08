//! Command line flags, as written into step containers by the controller.

use std::path::PathBuf;

use clap::Parser;

use crate::termination::TERMINATION_MESSAGE_PATH;

/// Run one workflow step in order with its siblings.
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "skyflow-entrypoint", version)]
pub struct Args {
    /// Base64 script to decode in place before running
    #[arg(long = "encode_script", default_value = "")]
    pub encode_script: String,

    /// File that must exist before the step starts
    #[arg(long = "wait_file", default_value = "")]
    pub wait_file: String,

    /// Expected contents of the wait file, any contents when empty
    #[arg(long = "wait_content", default_value = "", allow_hyphen_values = true)]
    pub wait_content: String,

    /// File written once the step succeeded
    #[arg(long = "post_file", default_value = "")]
    pub post_file: String,

    #[arg(long = "post_content", default_value = "", allow_hyphen_values = true)]
    pub post_content: String,

    /// Program to run
    #[arg(long, default_value = "/bin/sh")]
    pub command: String,

    /// Comma-separated result names to report
    #[arg(long, default_value = "")]
    pub outputs: String,

    #[arg(long = "termination_message_path", default_value = TERMINATION_MESSAGE_PATH)]
    pub termination_message_path: PathBuf,

    /// Comma-separated arguments for the program
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub params: String,

    /// Directory the step writes result files into
    #[arg(long = "results_dir", default_value = "/skyflow/outputs")]
    pub results_dir: PathBuf,
}

impl Args {
    pub fn params(&self) -> Vec<&str> {
        split_list(&self.params)
    }

    pub fn outputs(&self) -> Vec<&str> {
        split_list(&self.outputs)
    }
}

fn split_list(raw: &str) -> Vec<&str> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .collect()
}

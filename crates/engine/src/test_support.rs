//! Fake encoders for tests

use crate::config::EncoderConfig;
use crate::encode::EncoderInvoker;
use std::path::Path;
use tokio::process::Command;

/// Runs a shell script in place of the encoder: `$1` is the input, `$2` the output
pub(crate) struct ShellInvoker {
    script: String,
}

impl ShellInvoker {
    pub(crate) fn new(script: &str) -> Self {
        Self {
            script: script.to_string(),
        }
    }
}

impl EncoderInvoker for ShellInvoker {
    fn command(&self, input: &str, output: &Path, _config: &EncoderConfig) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.script)
            .arg("tiercast")
            .arg(input)
            .arg(output);
        cmd
    }
}

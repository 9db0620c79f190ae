use std::process::Command;

use log::{debug, warn};

use crate::error::FirewallError;

/// Runs `args[0]` with the remaining arguments and waits for it.
///
/// With `ignore_failure` a non-zero exit is only logged at debug level;
/// teardown commands for rules that were never installed fail routinely.
pub fn run_command<S: AsRef<str>>(args: &[S], ignore_failure: bool) -> Result<(), FirewallError> {
    let Some((program, rest)) = args.split_first() else {
        return Ok(());
    };
    let program = program.as_ref();
    let command = args.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(" ");

    let output = match Command::new(program).args(rest.iter().map(AsRef::as_ref)).output() {
        Ok(output) => output,
        Err(source) if ignore_failure => {
            debug!("{command}: {source}");
            return Ok(());
        }
        Err(source) => {
            return Err(FirewallError::Spawn {
                program: program.to_string(),
                source,
            });
        }
    };

    if output.status.success() {
        debug!("{command}");
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if ignore_failure {
        debug!("{command}: {} {stderr}", output.status);
        return Ok(());
    }
    warn!("{command}: {} {stderr}", output.status);
    Err(FirewallError::Failed {
        command,
        status: output.status.to_string(),
        stderr,
    })
}

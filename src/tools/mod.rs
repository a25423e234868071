//! Wrappers around the external programs the patcher drives: `adb`, `apksigner` and `zipalign`.

pub mod apksigner;
pub mod device;

use crate::error::{PatchError, PatchResult};
use log::{debug, error};
use std::ffi::OsStr;
use std::process::Command;

/// Run `cmd` with `args` and return its stdout. A non-zero exit is a [`PatchError::Tool`].
pub fn execute_command<S: AsRef<OsStr>>(cmd: &str, args: &[S]) -> PatchResult<String> {
    let printable: Vec<_> = args.iter().map(|arg| arg.as_ref().to_string_lossy()).collect();
    debug!("running {cmd} {}", printable.join(" "));
    let output = Command::new(cmd)
        .args(args)
        .output()
        .map_err(|err| PatchError::Tool(format!("failed to start {cmd}: {err}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!("{cmd} {} exited with {}", printable.join(" "), output.status);
        return Err(PatchError::Tool(format!(
            "{cmd} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    String::from_utf8(output.stdout)
        .map_err(|_| PatchError::Tool(format!("{cmd} printed non UTF-8 output")))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout() {
        assert_eq!(execute_command("echo", &["hello"]).unwrap().trim(), "hello");
    }

    #[test]
    fn failing_command_is_a_tool_error() {
        assert!(matches!(
            execute_command::<&str>("false", &[]),
            Err(PatchError::Tool(_))
        ));
        assert!(matches!(
            execute_command::<&str>("/nonexistent/stubpatch-tool", &[]),
            Err(PatchError::Tool(_))
        ));
    }
}

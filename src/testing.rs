//! Shared test helpers: cross-platform exit statuses and canned
//! process outputs. Used by inline unit tests and the `tests/`
//! integration suite.

/// Build an `ExitStatus` from a logical exit code (cross-platform).
///
/// On Unix the raw wait-status encodes the exit code in bits 8-15, so
/// we shift. On Windows `ExitStatusExt::from_raw` takes the code
/// directly.
#[cfg(unix)]
#[must_use]
pub fn exit_status(code: i32) -> std::process::ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    std::process::ExitStatus::from_raw(code << 8)
}

#[cfg(windows)]
#[must_use]
pub fn exit_status(code: i32) -> std::process::ExitStatus {
    use std::os::windows::process::ExitStatusExt;
    #[allow(clippy::cast_sign_loss)]
    std::process::ExitStatus::from_raw(code as u32)
}

#[must_use]
pub fn ok_output(stdout: &[u8]) -> std::process::Output {
    std::process::Output {
        status: exit_status(0),
        stdout: stdout.to_vec(),
        stderr: Vec::new(),
    }
}

#[must_use]
pub fn err_output(code: i32, stderr: &[u8]) -> std::process::Output {
    std::process::Output {
        status: exit_status(code),
        stdout: Vec::new(),
        stderr: stderr.to_vec(),
    }
}

// Verification command runner
//
// Runs the externally supplied command in the target's working directory.
// Exit code zero is the sole success signal; output is captured for
// diagnostics only. The deadline is a hard one: the process is killed when
// the budget elapses.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::error::CoreError;

/// Captured output cap. Matches what the task record can reasonably hold.
const MAX_CAPTURED_OUTPUT: usize = 20_000;

#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    /// `None` when the deadline elapsed before the command exited.
    pub exit_code: Option<i32>,
    pub output: String,
    pub timed_out: bool,
}

impl VerifyOutcome {
    pub fn passed(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Execute `command` via `sh -c` in `working_dir`, bounded by `deadline`.
///
/// A command that cannot be spawned at all is a crash ([`CoreError`]); a
/// non-zero exit or an elapsed deadline is a normal outcome for the engine's
/// decision loop.
pub async fn run_verification(
    command: &str,
    working_dir: &Path,
    deadline: Duration,
) -> Result<VerifyOutcome, CoreError> {
    tracing::debug!(command, working_dir = %working_dir.display(), "running verification");

    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(deadline, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(CoreError::VerificationCommandCrash(format!(
                "could not execute '{}': {}",
                command, e
            )))
        }
        Err(_) => {
            return Ok(VerifyOutcome {
                exit_code: None,
                output: format!(
                    "verification command exceeded its {}s deadline and was killed",
                    deadline.as_secs()
                ),
                timed_out: true,
            })
        }
    };

    let mut captured = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !captured.is_empty() {
            captured.push('\n');
        }
        captured.push_str("STDERR:\n");
        captured.push_str(stderr.trim_end());
    }
    if captured.len() > MAX_CAPTURED_OUTPUT {
        captured.truncate(floor_char_boundary(&captured, MAX_CAPTURED_OUTPUT));
        captured.push_str("\n[output truncated]");
    }

    Ok(VerifyOutcome {
        exit_code: output.status.code(),
        output: captured,
        timed_out: false,
    })
}

/// Largest index `<= max` that falls on a UTF-8 character boundary. Cutting
/// captured output at an arbitrary byte would split a multi-byte character.
pub(crate) fn floor_char_boundary(text: &str, max: usize) -> usize {
    if max >= text.len() {
        return text.len();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn cwd() -> PathBuf {
        PathBuf::from(".")
    }

    #[tokio::test]
    async fn test_zero_exit_passes() {
        let outcome = run_verification("true", &cwd(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(outcome.passed());
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let outcome = run_verification("exit 3", &cwd(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!outcome.passed());
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let outcome = run_verification("echo out; echo err >&2; false", &cwd(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(outcome.output.contains("out"));
        assert!(outcome.output.contains("STDERR:"));
        assert!(outcome.output.contains("err"));
    }

    #[tokio::test]
    async fn test_deadline_kills_command() {
        let outcome = run_verification("sleep 5", &cwd(), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, None);
        assert!(!outcome.passed());
    }

    #[tokio::test]
    async fn test_truncation_lands_on_a_char_boundary() {
        // 19_999 ASCII bytes followed by a two-byte character straddling the
        // capture cap; the cut must back off instead of splitting it.
        let command = format!(
            "head -c {} /dev/zero | tr '\\0' 'a'; printf 'é'",
            MAX_CAPTURED_OUTPUT - 1
        );
        let outcome = run_verification(&command, &cwd(), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(outcome.passed());
        assert!(outcome.output.ends_with("[output truncated]"));
        assert!(outcome.output.len() <= MAX_CAPTURED_OUTPUT + "\n[output truncated]".len());
    }

    #[test]
    fn test_floor_char_boundary_backs_off_multibyte() {
        let text = "aé"; // 'é' occupies bytes 1..3
        assert_eq!(floor_char_boundary(text, 2), 1);
        assert_eq!(floor_char_boundary(text, 3), 3);
        assert_eq!(floor_char_boundary(text, 10), 3);
    }

    #[tokio::test]
    async fn test_missing_working_dir_is_a_crash() {
        let err = run_verification("true", &PathBuf::from("/no/such/dir/4821"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::VerificationCommandCrash(_)));
    }
}

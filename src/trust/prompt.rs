//! User confirmation for trust decisions.

use std::io::{self, BufRead, Write};

/// Asks the user whether to accept a certificate problem.
///
/// Called from a blocking thread; implementations may block on I/O.
pub trait Confirm: Send + Sync {
    fn confirm(&self, message: &str, title: &str, prompt: &str) -> bool;
}

impl<F> Confirm for F
where
    F: Fn(&str, &str, &str) -> bool + Send + Sync,
{
    fn confirm(&self, message: &str, title: &str, prompt: &str) -> bool {
        self(message, title, prompt)
    }
}

/// Prompts on stderr and reads a yes/no answer from stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn confirm(&self, message: &str, title: &str, prompt: &str) -> bool {
        let stdin = io::stdin();
        let mut stderr = io::stderr();
        if writeln!(stderr, "{}\n  {}\n{} [y/N] ", title, message, prompt).is_err() {
            return false;
        }
        let _ = stderr.flush();
        let mut answer = String::new();
        match stdin.lock().read_line(&mut answer) {
            Ok(_) => is_yes(&answer),
            Err(_) => false,
        }
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closures_confirm() {
        let accept = |_: &str, title: &str, _: &str| title.starts_with("SSL");
        assert!(accept.confirm("m", "SSL Certificate Verification Failure", "p"));
        assert!(!accept.confirm("m", "other", "p"));
    }

    #[test]
    fn test_answers() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes("\n"));
        assert!(!is_yes("no"));
    }
}

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Create a spinner that also shows how long the step has been running.
fn create_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.enable_steady_tick(Duration::from_millis(120));
    if let Ok(spinner_style) = ProgressStyle::default_spinner()
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
        .template("{spinner:.blue} {msg} {elapsed:.dim}")
    {
        pb.set_style(spinner_style);
    }
    pb.set_message(msg.to_string());
    pb
}

/// Run a step with a spinner, marking it as passed or failed when done.
pub fn with_spinner<T, E, F>(msg: &str, op: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E>,
{
    with_spinner_judged(msg, op, Result::is_ok)
}

/// Like `with_spinner`, for steps whose result carries its own verdict.
pub fn with_spinner_judged<T, F, J>(msg: &str, op: F, succeeded: J) -> T
where
    F: FnOnce() -> T,
    J: FnOnce(&T) -> bool,
{
    let pb = create_spinner(msg);
    let result = op();
    pb.finish_with_message(finish_message(msg, succeeded(&result)));
    result
}

fn finish_message(msg: &str, succeeded: bool) -> String {
    if succeeded {
        format!("{} {}", style("✔").green(), msg)
    } else {
        format!("{} {}", style("✘").red(), msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_marks_failure() {
        assert!(finish_message("teardown", true).contains('✔'));
        assert!(finish_message("teardown", false).contains('✘'));
    }

    #[test]
    fn judged_step_uses_verdict_not_return() {
        let out = with_spinner_judged("step", || 3, |v| *v > 5);
        assert_eq!(out, 3);
        let err: Result<(), &str> = with_spinner("step", || Err("boom"));
        assert_eq!(err, Err("boom"));
    }
}

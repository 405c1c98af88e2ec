use colored::{ColoredString, Colorize};
use converge::StepOutcome;
use std::time::Duration;

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Colored symbol for a step outcome
pub fn outcome_symbol(outcome: StepOutcome) -> ColoredString {
    match outcome {
        StepOutcome::Applied => "✓".green(),
        StepOutcome::Skipped => "○".dimmed(),
        StepOutcome::Failed => "✗".red(),
        StepOutcome::Blocked => "⊘".yellow(),
        StepOutcome::Unknown => "?".dimmed(),
    }
}

/// Colored label for a step outcome
pub fn outcome_label(outcome: StepOutcome) -> ColoredString {
    let label = outcome.as_str();
    match outcome {
        StepOutcome::Applied => label.green(),
        StepOutcome::Skipped | StepOutcome::Unknown => label.dimmed(),
        StepOutcome::Failed => label.red(),
        StepOutcome::Blocked => label.yellow(),
    }
}

/// Format a duration compactly (e.g. `850ms`, `12.3s`, `4m05s`)
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms < 1000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", d.as_secs_f64())
    } else {
        let secs = d.as_secs();
        format!("{}m{:02}s", secs / 60, secs % 60)
    }
}

//! Output formatting utilities for CLI commands

use colored::Colorize;
use oa_metrics_shared::ReportReason;

/// Print success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print warning message
pub fn warning(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Section heading
pub fn heading(msg: &str) {
    println!("{}", msg.bold());
}

/// Short name of the reasons in a report id, `-` when none are set.
pub fn reason_name(reason: ReportReason) -> String {
    if reason.is_empty() {
        return "-".to_string();
    }
    if reason.contains(ReportReason::QUERY_TRIGGER) {
        return "query-trigger".to_string();
    }
    reason
        .iter_names()
        .map(|(name, _)| name.to_lowercase().replace('_', "-"))
        .collect::<Vec<_>>()
        .join("|")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_name() {
        assert_eq!(reason_name(ReportReason::empty()), "-");
        assert_eq!(reason_name(ReportReason::TIMER), "timer");
        assert_eq!(reason_name(ReportReason::QUERY_TRIGGER), "query-trigger");
        assert_eq!(
            reason_name(ReportReason::TIMER | ReportReason::CONTEXT_SWITCH),
            "timer|context-switch"
        );
    }
}

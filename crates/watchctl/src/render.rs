//! Output rendering for the watchctl CLI.
//!
//! Formats module, test-case and history information for terminal display.

use crate::client::{HealthResponse, HistoryResponse, ModuleSummary, TestCaseSummary, UpdateResponse};

/// Print the module list in tabular format.
pub fn print_modules(modules: &[ModuleSummary]) {
    if modules.is_empty() {
        println!("No modules configured.");
        return;
    }

    println!("{:<24}  {:<32}", "ID", "NAME");
    println!("{}", "-".repeat(58));
    for module in modules {
        println!("{:<24}  {:<32}", module.id, module.name);
    }
    println!();
    println!("{} module(s)", modules.len());
}

/// Print the test cases of a module with their most recent status.
pub fn print_test_cases(module: &str, cases: &[TestCaseSummary]) {
    if cases.is_empty() {
        println!("No test cases known for module '{module}'.");
        return;
    }

    println!("{:<64}  {:<10}", "TEST", "LAST");
    println!("{}", "-".repeat(76));
    for case in cases {
        println!(
            "{:<64}  {:<10}",
            truncate(&case.test_name, 64),
            case.last_status.as_str()
        );
    }
    println!();
    println!("{} test case(s)", cases.len());
}

/// Print the 7-day history for one test case.
pub fn print_history(test_name: &str, response: &HistoryResponse) {
    if let Some(warning) = &response.warning {
        eprintln!("warning: {warning}");
    }

    if response.history.is_empty() {
        println!("No runs recorded for '{test_name}' in the last 7 days.");
        return;
    }

    println!("{:<12}  {:<20}  {:<8}  {:<16}", "DATE", "DATETIME", "STATUS", "RUNTIME");
    println!("{}", "-".repeat(62));
    for record in &response.history {
        println!(
            "{:<12}  {:<20}  {:<8}  {:<16}",
            record.date.to_string(),
            record.datetime.format("%Y-%m-%d %H:%M:%S").to_string(),
            record.status.as_str(),
            record.running_time.as_deref().unwrap_or("-"),
        );
    }
    println!();
    println!("{} run(s)", response.history.len());
}

/// Print the result of an update call.
pub fn print_update(module: &str, response: &UpdateResponse) {
    println!("Updated module '{module}':");
    println!("  Added:       {}", response.added);
    println!("  Duplicates:  {}", response.duplicates);
    println!("  Pruned:      {}", response.pruned);
    println!("  Skipped:     {}", response.skipped_lines);
    if let Some(warning) = &response.warning {
        println!("  Warning:     {warning}");
    }
}

/// Print the daemon health summary.
pub fn print_health(health: &HealthResponse) {
    println!("Status:    {}", health.status);
    println!("Modules:   {}", health.modules.join(", "));
    println!("Timestamp: {}", health.timestamp);
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len - 3])
    }
}

//! Display utilities for CLI output formatting
//!
//! One status line per request, then a summary.

use std::time::Duration;

use chrono::Local;
use colored::Colorize;
use reqwest::StatusCode;

fn timestamp() -> String {
    Local::now().format("%H:%M:%S%.3f").to_string()
}

/// Display the response to one request
pub fn display_response(index: usize, status: StatusCode, url: &str, elapsed: Duration) {
    let status_str = status.to_string();
    let status_str = if status.is_success() {
        status_str.green()
    } else if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
        status_str.yellow()
    } else {
        status_str.red()
    };
    println!(
        "{} {} {status_str} {url} {}",
        timestamp().dimmed(),
        format!("#{index}").bold(),
        format!("({} ms)", elapsed.as_millis()).dimmed()
    );
}

/// Display a request that failed without a response
pub fn display_failure(index: usize, url: &str, error: &anyhow::Error) {
    println!(
        "{} {} {} {url}: {error:#}",
        timestamp().dimmed(),
        format!("#{index}").bold(),
        "failed".red().bold()
    );
}

/// Display the totals once every request has finished
pub fn display_summary(succeeded: usize, failed: usize, elapsed: Duration) {
    let total = succeeded + failed;
    let line = format!(
        "{succeeded}/{total} succeeded, {failed} failed in {:.2}s",
        elapsed.as_secs_f64()
    );
    if failed == 0 {
        println!("{}", line.green().bold());
    } else {
        println!("{}", line.red().bold());
    }
}

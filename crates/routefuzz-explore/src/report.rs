//! Human-readable run summaries.

use crate::exceptions::ExceptionRecord;
use crate::explorer::ExplorationReport;

const HEAVY_RULE: &str =
    "═══════════════════════════════════════════════════════════════════════\n";

/// Format the end-of-run summary.
pub fn format_report(report: &ExplorationReport) -> String {
    let stats = &report.stats;
    let mut output = String::new();

    output.push_str(HEAVY_RULE);
    output.push_str("  routefuzz Run Report\n");
    output.push_str(HEAVY_RULE);
    output.push('\n');

    output.push_str(&format!("Iterations:             {}\n", report.iterations));
    output.push_str(&format!("Final phase:            {}\n", report.final_phase));
    if report.interrupted {
        output.push_str("Stopped by:             interrupt\n");
    }
    output.push_str(&format!("Total requests:         {}\n", stats.total_requests()));
    match stats.final_coverage() {
        Some(pct) => output.push_str(&format!("Final coverage:         {:.2}%\n", pct)),
        None => output.push_str("Final coverage:         n/a\n"),
    }
    match stats.get_success_ratio() {
        Ok(ratio) => output.push_str(&format!("Success ratio:          {:.3}\n", ratio)),
        Err(_) => output.push_str("Success ratio:          n/a (no requests)\n"),
    }
    output.push_str(&format!("Harness errors:         {}\n", report.harness_errors));
    output.push('\n');

    output.push_str("─── Status Codes ──────────────────────────────────────────────────────\n");
    for (code, count) in stats.get_code_counts() {
        let code = code.map_or_else(|| "timeout".to_string(), |c| c.to_string());
        output.push_str(&format!("{:<8} {}\n", code, count));
    }
    for (class, bucket) in stats.buckets() {
        output.push_str(&format!(
            "{:<8} {} requests over {} routes\n",
            class.label(),
            bucket.count,
            bucket.routes.len()
        ));
    }
    output.push('\n');

    if !report.injections.is_empty() {
        output.push_str("─── SQL Injection Candidates ──────────────────────────────────────────\n");
        for finding in &report.injections {
            output.push_str(&format!(
                "{} {} via {}\n",
                finding.verb, finding.path, finding.param
            ));
        }
        output.push('\n');
    }

    if report.exceptions.is_empty() {
        output.push_str("─── No Exceptions ─────────────────────────────────────────────────────\n");
        output.push_str("The target raised no unexpected exceptions.\n\n");
    } else {
        output.push_str("─── Unique Exceptions ─────────────────────────────────────────────────\n");
        for (i, exn) in report.exceptions.iter().enumerate() {
            output.push_str(&format!("{}. {}\n", i + 1, format_exception(exn)));
        }
        output.push('\n');
    }

    output.push_str(HEAVY_RULE);
    output
}

pub fn format_exception(exn: &ExceptionRecord) -> String {
    let mut message = exn.message.lines().next().unwrap_or("").to_string();
    if message.len() > 120 {
        let mut cut = 117;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
        message.push_str("...");
    }
    format!("{} {}: {}: {}", exn.verb, exn.path, exn.class, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::injection::Finding;
    use crate::phase::Phase;
    use crate::stats::FuzzStats;
    use routefuzz_target::Predicate;
    use serde_json::json;

    fn exn(message: &str) -> ExceptionRecord {
        ExceptionRecord {
            verb: "POST".into(),
            path: "/posts".into(),
            class: "NoMethodError".into(),
            message: message.into(),
        }
    }

    fn report(stats: FuzzStats) -> ExplorationReport {
        ExplorationReport {
            iterations: 3,
            final_phase: Phase::Random,
            interrupted: false,
            stats,
            exceptions: Vec::new(),
            injections: Vec::new(),
            harness_errors: 0,
        }
    }

    #[test]
    fn test_format_empty_run() {
        let formatted = format_report(&report(FuzzStats::new()));
        assert!(formatted.contains("Total requests:         0"));
        assert!(formatted.contains("Final coverage:         n/a"));
        assert!(formatted.contains("Success ratio:          n/a"));
        assert!(formatted.contains("No Exceptions"));
    }

    #[test]
    fn test_format_with_results() {
        let mut stats = FuzzStats::new();
        stats.record_stats("GET", "/posts", Some(200), vec![], None);
        stats.record_stats("GET", "/slow", None, vec![], None);
        stats.record_coverage("GET", "/slow", 33.333);
        let mut r = report(stats);
        r.exceptions.push(exn("undefined method `title'\n  app/models/post.rb:3"));
        r.injections.push(Finding {
            path: "/users".into(),
            verb: "GET".into(),
            param: "name".into(),
            value: json!("BIP_X"),
            ast: Predicate::Literal {
                literal: "name = 'BIP_X'".into(),
            },
        });

        let formatted = format_report(&r);
        assert!(formatted.contains("Final phase:            RANDOM"));
        assert!(formatted.contains("Final coverage:         33.33%"));
        assert!(formatted.contains("Success ratio:          0.500"));
        assert!(formatted.contains("timeout  1"));
        assert!(formatted.contains("2xx      1 requests over 1 routes"));
        assert!(formatted.contains("GET /users via name"));
        assert!(formatted.contains("1. POST /posts: NoMethodError: undefined method `title'\n"));
    }

    #[test]
    fn test_format_exception_truncates() {
        let long = "x".repeat(300);
        let line = format_exception(&exn(&long));
        assert!(line.ends_with("..."));
        assert!(line.len() < 200);
    }
}

use std::path::Path;

use chrono::{DateTime, Utc};

use skyforge_common::{BootstrapRecord, StackTemplate};
use skyforge_deploy::{ChangeAction, DeployError, DeployReport, DestroyReport, StackDiff, StackState, StackStatus};
use skyforge_stacks::ValidationError;

use crate::verify::ProbeResult;

fn format_time(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .filter(|ms| *ms > 0)
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn state_label(state: StackState) -> &'static str {
    match state {
        StackState::NotDeployed => "not deployed",
        StackState::UpToDate => "up to date",
        StackState::Changed => "changed",
        StackState::Failed => "failed",
    }
}

pub fn print_stacks(stacks: &[StackStatus], provider: &str) {
    println!("\n=== Stacks ({provider}) ===\n");
    println!(
        "{:<26} {:<14} {:<8} {:<20} {}",
        "Name", "State", "Version", "Updated", "Depends on"
    );
    println!("{:-<95}", "");
    for s in stacks {
        let (version, updated) = s
            .record
            .as_ref()
            .map(|r| (r.version.to_string(), format_time(r.updated_at_ms)))
            .unwrap_or_else(|| ("-".to_string(), "-".to_string()));
        let deps = if s.depends_on.is_empty() {
            "-".to_string()
        } else {
            s.depends_on.join(", ")
        };
        println!(
            "{:<26} {:<14} {:<8} {:<20} {}",
            s.name,
            state_label(s.state),
            version,
            updated,
            deps
        );
        if let Some(record) = &s.record {
            for failure in &record.failures {
                println!("    ✗ {failure}");
            }
        }
    }
    println!();
}

pub fn print_diffs(diffs: &[StackDiff]) {
    for d in diffs {
        println!("\n=== {} ===\n", d.stack);
        if d.is_empty() {
            println!("  (no changes)");
            continue;
        }
        for r in &d.resources {
            let replace = if r.replacement { "  [replacement]" } else { "" };
            println!("  {} {:<32} {}{}", r.action, r.logical_id, r.kind, replace);
            if r.action == ChangeAction::Modify {
                for path in &r.changed {
                    println!("      {path}");
                }
            }
        }
        if !d.outputs.is_empty() {
            println!("\n  [Outputs]");
            for o in &d.outputs {
                println!("  {} {}", o.action, o.key);
            }
        }
        let (added, modified, removed) = d.counts();
        println!("\n  {added} to add, {modified} to change, {removed} to remove");
        let replaced = d.replacements().count();
        if replaced > 0 {
            println!("  {replaced} resource(s) will be replaced");
        }
    }
    println!();
}

pub fn print_deploy_report(report: &DeployReport) {
    println!("\n=== Deploy {} ===\n", report.run_id);
    for applied in &report.applied {
        let (added, modified, removed) = applied.diff.counts();
        println!(
            "  ✓ {:<26} +{added} ~{modified} -{removed}",
            applied.name
        );
        for (key, value) in &applied.outputs {
            println!("      {key:<28} {value}");
        }
    }
    for name in &report.unchanged {
        println!("  ✓ {name:<26} (no changes)");
    }
    println!();
}

pub fn print_destroy_report(report: &DestroyReport) {
    println!("\n=== Destroy {} ===\n", report.run_id);
    for name in &report.deleted {
        println!("  ✓ {name:<26} deleted");
    }
    for name in &report.absent {
        println!("  ✓ {name:<26} (not present)");
    }
    println!();
}

pub fn print_bootstrap(record: &BootstrapRecord) {
    println!("\n=== Bootstrap ===\n");
    println!("  Stack:    {}", record.stack_name);
    println!("  Bucket:   {}", record.bucket);
    println!("  Version:  {}", record.version);
    println!("  Updated:  {}", format_time(record.updated_at_ms));
    println!();
}

pub fn print_synth(stacks: &[StackTemplate], out: Option<&Path>) {
    match out {
        Some(dir) => {
            println!("\n=== Synthesized to {} ===\n", dir.display());
            for t in stacks {
                println!("  {:<26} {:>4} resources  {}", t.name, t.resources.len(), &t.content_hash()[..12]);
            }
            println!();
        }
        None => {
            let docs: serde_json::Map<String, serde_json::Value> = stacks
                .iter()
                .map(|t| (t.name.clone(), t.to_cloudformation()))
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&docs).unwrap_or_default()
            );
        }
    }
}

pub fn print_verify(results: &[ProbeResult]) {
    println!("\n=== Verify ===\n");
    for r in results {
        let mark = if r.ok { "✓" } else { "✗" };
        let observed = match &r.observed {
            Ok(status) => status.to_string(),
            Err(e) => format!("error: {e}"),
        };
        println!("  {mark} {:<38} expected {:<8} got {}", r.name, r.expected, observed);
        println!("      {}", r.url);
    }
    println!();
}

/// Prints the error and any per-resource detail it carries.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("error: {err:#}");
    if let Some(deploy) = err.downcast_ref::<DeployError>() {
        if let DeployError::DeployFailed { skipped, .. } = deploy {
            for f in deploy.resource_failures() {
                println!("  ✗ {f}");
            }
            if !skipped.is_empty() {
                println!("  not attempted: {}", skipped.join(", "));
            }
        } else if let DeployError::Validation(v) = deploy {
            print_violations(v);
        } else {
            for f in deploy.resource_failures() {
                println!("  ✗ {f}");
            }
        }
    } else if let Some(v) = err.downcast_ref::<ValidationError>() {
        print_violations(v);
    }
}

fn print_violations(err: &ValidationError) {
    for v in &err.0 {
        println!("  ✗ {v}");
    }
}

use colored::Colorize;
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, ContentArrangement, Table};

use strata_core::{
    AppliedChangelog, BaselineReport, ChangelogState, InfoReport, InstallReport, LedgerStatus,
    UninstallReport, UpgradeReport, ValidateReport,
};

/// Print ledger status and the changelog table.
pub fn print_info(report: &InfoReport) {
    if !report.ledger_exists {
        println!(
            "{}",
            format!("Ledger {} does not exist. Module not installed.", report.ledger).yellow()
        );
    } else {
        let module = report.module.as_deref().unwrap_or("(none)");
        let baseline = report
            .baseline
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "(none)".to_string());
        println!("{} {}", "Ledger:".bold(), report.ledger);
        println!("{} {}", "Module:".bold(), module);
        println!("{} {}", "Baseline:".bold(), baseline);
        if report.beta_testing {
            println!("{}", "Installed in beta testing mode.".yellow());
        }
        match report.status {
            Some(LedgerStatus::Current) => println!("{}", "Up to date.".green()),
            Some(LedgerStatus::Behind) => println!("{}", "Upgrade available.".yellow().bold()),
            None => {}
        }
        if let Some(ref err) = report.status_error {
            println!("{} {}", "WARNING:".yellow().bold(), err);
        }
    }

    if report.changelogs.is_empty() {
        println!("{}", "No changelogs found.".yellow());
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Version"),
            Cell::new("State"),
            Cell::new("Files"),
            Cell::new("Installed On"),
            Cell::new("Beta"),
        ]);

    for info in &report.changelogs {
        let installed_on = info
            .date_installed
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        let beta = match info.beta_testing {
            Some(true) => "yes",
            _ => "",
        };

        table.add_row(vec![
            Cell::new(info.version.as_str()),
            Cell::new(format_state(&info.state)),
            Cell::new(info.files),
            Cell::new(&installed_on),
            Cell::new(beta),
        ]);
    }

    println!("{table}");
}

fn format_state(state: &ChangelogState) -> String {
    match state {
        ChangelogState::Pending => "Pending".yellow().to_string(),
        ChangelogState::Applied => "Applied".green().to_string(),
        ChangelogState::Skipped => "Skipped".dimmed().to_string(),
        ChangelogState::Missing => "Missing".red().to_string(),
    }
}

fn print_applied(applied: &[AppliedChangelog]) {
    for changelog in applied {
        println!(
            "  {} {} ({} file(s))",
            "→".green(),
            changelog.version,
            changelog.files.len()
        );
    }
}

fn print_role_steps(roles_created: bool, permissions_granted: bool) {
    if roles_created {
        println!("{}", "Roles created.".dimmed());
    }
    if permissions_granted {
        println!("{}", "Permissions granted.".dimmed());
    }
}

pub fn print_install_summary(report: &InstallReport) {
    if report.hooks_executed > 0 {
        println!(
            "{}",
            format!("Executed {} hook(s)", report.hooks_executed).dimmed()
        );
    }
    print_role_steps(report.roles_created, report.permissions_granted);

    let baseline = report
        .baseline
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_default();
    println!(
        "{}",
        format!(
            "Installed module '{}' at version {} ({} changelog(s))",
            report.module,
            baseline,
            report.changelogs_applied.len()
        )
        .green()
        .bold()
    );
    print_applied(&report.changelogs_applied);

    if let Some(ref demo) = report.demo_data {
        println!("{}", format!("Loaded demo data '{}'", demo).green());
    }
}

pub fn print_upgrade_summary(report: &UpgradeReport) {
    if report.up_to_date {
        println!(
            "{}",
            format!(
                "Module '{}' is up to date at version {}. No upgrade necessary.",
                report.module, report.baseline
            )
            .green()
        );
        return;
    }

    if report.hooks_executed > 0 {
        println!(
            "{}",
            format!("Executed {} hook(s)", report.hooks_executed).dimmed()
        );
    }
    print_role_steps(report.roles_created, report.permissions_granted);

    println!(
        "{}",
        format!(
            "Upgraded module '{}' from {} to {} ({} changelog(s))",
            report.module,
            report.previous_baseline,
            report.baseline,
            report.changelogs_applied.len()
        )
        .green()
        .bold()
    );
    print_applied(&report.changelogs_applied);
}

pub fn print_uninstall_summary(report: &UninstallReport) {
    let message = format!("Executed {} uninstall hook(s)", report.hooks_executed);
    if report.committed {
        println!("{}", message.green().bold());
    } else {
        println!("{}", format!("{} (not committed)", message).yellow());
    }
}

pub fn print_baseline_summary(report: &BaselineReport) {
    match report.previous_baseline {
        Some(ref previous) => println!(
            "{}",
            format!("Successfully moved baseline from {} to {}.", previous, report.baseline)
                .green()
                .bold()
        ),
        None => println!(
            "{}",
            format!("Successfully baselined schema at {}.", report.baseline)
                .green()
                .bold()
        ),
    }
}

/// Print a validate report.
pub fn print_validate_result(report: &ValidateReport) {
    if report.valid {
        println!(
            "{}",
            format!(
                "Successfully validated {} changelog(s) and {} hook(s).",
                report.changelogs_checked, report.hooks_checked
            )
            .green()
            .bold()
        );
    }

    for warning in &report.warnings {
        println!("{} {}", "WARNING:".yellow().bold(), warning);
    }

    for issue in &report.issues {
        println!("{} {}", "ERROR:".red().bold(), issue);
    }
}

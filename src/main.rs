//! CLI entry point for the Leakhound scanner.

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use leakhound::{
    cli::{Cli, Commands},
    config::{generate_default_config, Config},
    report, OutputFormat, ScanConfig, Scanner, Severity,
};
use std::io;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| log_level.into()))
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let base_config = if let Some(ref config_path) = cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()
    };

    match cli.command {
        Commands::Scan {
            path,
            external_rules,
            force,
            min_severity,
            fail_on,
            output,
        } => {
            let min_severity: Severity = min_severity
                .parse()
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            let fail_on_severity = fail_on
                .as_deref()
                .map(|s| s.parse::<Severity>())
                .transpose()
                .map_err(|e| anyhow::anyhow!("{}", e))?;

            let mut filter_config = base_config;
            if external_rules.is_some() {
                filter_config.external_rule_dir = external_rules;
            }

            let scanner = Scanner::with_config(ScanConfig {
                force,
                min_severity,
                filter_config,
            })?;
            let scan_report = scanner.scan_path(&path)?;

            let format: OutputFormat = cli.format.parse().map_err(|e| anyhow::anyhow!("{}", e))?;

            if let Some(output_path) = output {
                let mut file = std::fs::File::create(&output_path)?;
                report(&scan_report, format, &mut file)?;
                eprintln!("Report written to: {}", output_path.display());
            } else {
                let mut stdout = io::stdout().lock();
                report(&scan_report, format, &mut stdout)?;
            }

            if scanner.cache_used() {
                eprintln!("\nCached rules used. Unexpected? Use --force to re-read the rules directory.");
            }

            if let Some(fail_severity) = fail_on_severity {
                if let Some(max) = scan_report.max_severity() {
                    if max >= fail_severity {
                        std::process::exit(1);
                    }
                }
            }
        }

        Commands::Rules { rule, json } => {
            let scanner = Scanner::with_config(ScanConfig {
                filter_config: base_config,
                ..Default::default()
            })?;
            let rules = scanner.engine().rules();

            if let Some(rule_id) = rule {
                let Some(r) = rules.get(&rule_id) else {
                    eprintln!("Rule not found: {}", rule_id);
                    std::process::exit(1);
                };
                if json {
                    println!("{}", serde_json::to_string_pretty(&rule_json(r))?);
                } else {
                    println!("{}", format!("Rule: {}", r.id).bold());
                    println!("Severity:    {}", r.severity);
                    println!("Languages:   {}", r.languages.join(", "));
                    println!("Auxiliary:   {}", r.auxiliary);
                    if !r.description.is_empty() {
                        println!("Description: {}", r.description);
                    }
                    if !r.remediation_message.is_empty() {
                        println!("Remediation: {}", r.remediation_message.trim_end());
                    }
                    if !r.cwe_ids.is_empty() {
                        println!("CWE:         {}", r.cwe_ids.join(", "));
                    }
                    if !r.documentation_url.is_empty() {
                        println!("Docs:        {}", r.documentation_url);
                    }
                }
            } else if json {
                let listing: Vec<serde_json::Value> =
                    rules.values().map(|r| rule_json(r)).collect();
                println!("{}", serde_json::to_string_pretty(&listing)?);
            } else {
                println!("{}", "Loaded Rules".bold().underline());
                println!();
                for r in rules.values() {
                    let severity_colored = match r.severity {
                        Severity::Critical => r.severity.to_string().bright_red(),
                        Severity::High => r.severity.to_string().red(),
                        Severity::Medium => r.severity.to_string().yellow(),
                        Severity::Low => r.severity.to_string().blue(),
                        Severity::Warning => r.severity.to_string().white(),
                    };
                    let aux_badge = if r.auxiliary {
                        " [auxiliary]".dimmed()
                    } else {
                        "".normal()
                    };
                    println!(
                        "  {} [{}] {}{}",
                        r.id.bright_cyan(),
                        severity_colored,
                        r.description,
                        aux_badge
                    );
                }
                println!();
                println!("Total: {} rules", rules.len());
            }
        }

        Commands::Init { output } => {
            if output.exists() {
                eprintln!(
                    "{}",
                    format!("Config file already exists: {}", output.display()).yellow()
                );
                std::process::exit(1);
            }
            std::fs::write(&output, generate_default_config())?;
            println!(
                "{}",
                format!("Created config file: {}", output.display()).green()
            );
        }
    }

    Ok(())
}

fn rule_json(rule: &leakhound::rules::Rule) -> serde_json::Value {
    serde_json::json!({
        "id": rule.id,
        "severity": rule.severity.to_string(),
        "languages": rule.languages,
        "auxiliary": rule.auxiliary,
        "description": rule.description,
        "cwe_ids": rule.cwe_ids,
        "documentation_url": rule.documentation_url,
    })
}

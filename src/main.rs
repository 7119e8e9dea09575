use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use ime_patcher::extract::Role;
use ime_patcher::{
    load_or_default, ArtifactFormat, ArtifactStatus, Inspection, PatchApplier, PatchError,
    PatchOutcome, PlannedFix, SearchPaths,
};
use serde_json::json;
use similar::{ChangeTag, TextDiff};
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ime-patcher")]
#[command(about = "Repairs IME delete-marker handling in cli.js bundles and binaries", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML file overriding the built-in target profiles
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter (e.g. warn, info, ime_patcher=debug)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Patch the artifact
    Apply {
        #[command(flatten)]
        target: TargetArgs,

        /// Show a diff of every replaced block
        #[arg(short, long)]
        diff: bool,
    },

    /// Report whether the artifact is fixed, without modifying it
    Status {
        #[command(flatten)]
        target: TargetArgs,

        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },

    /// Copy the latest backup back over the artifact
    Restore {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Show what a patch run would bind and emit for each block
    Doctor {
        #[command(flatten)]
        target: TargetArgs,
    },
}

#[derive(clap::Args)]
struct TargetArgs {
    /// Artifact path (auto-detected if not specified)
    #[arg(short, long)]
    path: Option<PathBuf>,

    /// Artifact form
    #[arg(short, long, value_enum, default_value_t = Target::Auto)]
    target: Target,
}

#[derive(Clone, Copy, ValueEnum)]
enum Target {
    Auto,
    Text,
    Binary,
}

impl Target {
    fn format(self) -> Option<ArtifactFormat> {
        match self {
            Target::Auto => None,
            Target::Text => Some(ArtifactFormat::Text),
            Target::Binary => Some(ArtifactFormat::Binary),
        }
    }
}

impl TargetArgs {
    /// Explicit path, or the first installed artifact of the requested form.
    fn resolve(&self) -> Result<PathBuf> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }
        let path = SearchPaths::platform_default()?.find(self.target.format())?;
        eprintln!("{}", format!("Auto-detected: {}", path.display()).dimmed());
        Ok(path)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let profiles = load_or_default(cli.config.as_deref())?;
    let applier = PatchApplier::new(profiles);

    match cli.command {
        Commands::Apply { target, diff } => cmd_apply(&applier, &target, diff),
        Commands::Status { target, json } => cmd_status(&applier, &target, json),
        Commands::Restore { target } => cmd_restore(&applier, &target),
        Commands::Doctor { target } => cmd_doctor(&applier, &target),
    }
}

fn cmd_apply(applier: &PatchApplier, target: &TargetArgs, show_diff: bool) -> Result<()> {
    let path = target.resolve()?;
    println!("File: {}", path.display());

    match applier.patch(&path, target.target.format()) {
        Ok(PatchOutcome::Patched {
            format,
            backup,
            fixes,
            ..
        }) => {
            println!("Backup: {}", backup.display());
            println!(
                "{} Patched {} block(s) ({})",
                "✓".green(),
                fixes.len(),
                format
            );
            if show_diff {
                for fix in &fixes {
                    display_diff(&path, fix);
                }
            }
            println!("Restart the application for the fix to take effect.");
            Ok(())
        }
        Ok(outcome @ PatchOutcome::AlreadyFixed { .. }) => {
            println!("{} {}", "⊙".yellow(), outcome);
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {}", "✗".red(), e);
            explain_failure(&e);
            std::process::exit(1);
        }
    }
}

/// Extra hints for failures a user can act on.
fn explain_failure(err: &PatchError) {
    match err {
        PatchError::NotFound { .. } => {
            eprintln!("  {}", "The defect signature is not in this file.".red());
            eprintln!("  Possible causes:");
            eprintln!("    - This release already ships a fix");
            eprintln!("    - The file is not the application bundle or binary");
        }
        PatchError::MalformedBlock { .. } | PatchError::ExtractionFailed { .. } => {
            eprintln!(
                "  {}",
                "The block around the signature has an unknown layout.".red()
            );
            eprintln!("  Run `ime-patcher doctor` for details. The file was not modified.");
        }
        PatchError::LengthOverflow {
            needed, available, ..
        } => {
            eprintln!(
                "  {}",
                format!("Fix needs {needed} bytes but only {available} are available.").red()
            );
            eprintln!("  The binary was not modified.");
        }
        PatchError::RollbackFailed { .. } => {
            eprintln!(
                "  {}",
                "Rollback failed; restore manually with `ime-patcher restore`.".red()
            );
        }
        _ => {}
    }
}

fn cmd_status(applier: &PatchApplier, target: &TargetArgs, as_json: bool) -> Result<()> {
    let path = target.resolve()?;
    let inspection = applier.inspect(&path, target.target.format())?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&inspection_json(&inspection))?);
        return Ok(());
    }

    println!("{}", "Patch Status Report".bold());
    println!("File: {}", inspection.path.display());
    println!("Format: {} ({} bytes)", inspection.format, inspection.size);

    let status = inspection.status.to_string();
    let line = match &inspection.status {
        ArtifactStatus::Fixed => format!("{} {}", "✓".green(), status.green().bold()),
        ArtifactStatus::Unpatched { .. } => format!("{} {}", "⊙".yellow(), status.yellow().bold()),
        ArtifactStatus::NotFound => format!("{} {}", "⊘".cyan(), status.cyan().bold()),
        ArtifactStatus::Broken { .. } => format!("{} {}", "✗".red(), status.red().bold()),
    };
    println!("Status: {line}");

    let backups = applier.backups().list(&path)?;
    match backups.last() {
        Some(record) => println!(
            "Latest backup: {} ({} kept)",
            record.path.display(),
            backups.len()
        ),
        None => println!("Latest backup: {}", "none".dimmed()),
    }
    Ok(())
}

fn inspection_json(inspection: &Inspection) -> serde_json::Value {
    let fixes: Vec<_> = inspection
        .fixes
        .iter()
        .map(|fix| {
            json!({
                "start": fix.block.start,
                "end": fix.block.end,
                "shape": fix.extraction.shape,
                "bindings": fix.extraction.bindings,
                "guard": fix.extraction.guard,
                "epilogue": fix.extraction.epilogue,
                "fragmentLen": fix.fragment.len(),
                "padding": fix.fragment.padding,
            })
        })
        .collect();

    json!({
        "path": inspection.path,
        "format": inspection.format,
        "size": inspection.size,
        "signatures": inspection.signatures,
        "status": inspection.status,
        "latestBackup": inspection.latest_backup.as_ref().map(|r| &r.path),
        "fixes": fixes,
    })
}

fn cmd_restore(applier: &PatchApplier, target: &TargetArgs) -> Result<()> {
    let path = target.resolve()?;
    match applier.restore(&path) {
        Ok(record) => {
            println!(
                "{} Restored {} from {}",
                "✓".green(),
                path.display(),
                record.path.display()
            );
            Ok(())
        }
        Err(e @ PatchError::NoBackup { .. }) => {
            eprintln!("{} {}", "✗".red(), e);
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

fn cmd_doctor(applier: &PatchApplier, target: &TargetArgs) -> Result<()> {
    let path = target.resolve()?;
    let inspection = applier.inspect(&path, target.target.format())?;
    let profile = applier.profiles().profile(inspection.format);

    println!("{}", "Doctor".bold());
    println!("File: {}", inspection.path.display());
    println!("Format: {} ({} bytes)", inspection.format, inspection.size);
    println!("Marker: {}", profile.fix_marker);
    println!(
        "Windows: lookback {} / lookahead {} bytes",
        profile.lookback, profile.lookahead
    );
    println!("Signatures: {}", inspection.signatures);
    println!("Status: {}", inspection.status);

    for (idx, fix) in inspection.fixes.iter().enumerate() {
        println!();
        print_fix(idx + 1, fix);
    }

    if let ArtifactStatus::Broken { .. } = inspection.status {
        std::process::exit(1);
    }
    Ok(())
}

fn print_fix(number: usize, fix: &PlannedFix) {
    let extraction = &fix.extraction;
    println!(
        "{} Block {} at [{}, {}) - {}",
        "→".cyan(),
        number,
        fix.block.start,
        fix.block.end,
        extraction.shape.to_string().bold()
    );
    for role in Role::ALL {
        println!("  {:<18} {}", role.name(), extraction.bindings.get(role));
    }
    if let Some(guard) = &extraction.guard {
        println!("  {:<18} {}", "guard", guard);
    }
    if !extraction.epilogue.calls.is_empty() || extraction.epilogue.returns {
        println!(
            "  {:<18} {}{}",
            "epilogue",
            extraction.epilogue.calls.join(", "),
            if extraction.epilogue.returns { " + return" } else { "" }
        );
    }
    println!(
        "  {:<18} {} -> {} bytes (padding {})",
        "length",
        fix.block.len(),
        fix.fragment.natural_len,
        fix.fragment.padding
    );
}

/// Show a diff between the replaced block and its fix.
fn display_diff(file: &Path, fix: &PlannedFix) {
    println!(
        "\n{}",
        format!("--- {} @{} (original)", file.display(), fix.block.start).dimmed()
    );
    println!(
        "{}",
        format!("+++ {} @{} (patched)", file.display(), fix.block.start).dimmed()
    );

    let original = format!("{}\n", fix.block.text());
    let modified = format!("{}\n", fix.fragment.text());
    let diff = TextDiff::from_lines(&original, &modified);

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => format!("-{}", change).red(),
            ChangeTag::Insert => format!("+{}", change).green(),
            ChangeTag::Equal => format!(" {}", change).normal(),
        };
        print!("{}", sign);
    }
}

//! ferry - Copy, move and delete files with conflict handling and progress.
//!
//! Usage:
//!   ferry copy SOURCE... DEST       Copy into a destination directory
//!   ferry move SOURCE... DEST       Move into a destination directory
//!   ferry delete PATH...            Send paths to the trash
//!   ferry delete --permanent PATH   Delete without the trash
//!   ferry plan copy SOURCE... DEST  Show the steps without touching anything
//!   ferry --help                    Show help

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Context, Result, bail};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use fileferry_core::{TransferConfig, TransferPlan, TransferRequest, TransferStep};
use fileferry_ops::{
    Conflict, ConflictAnswer, ConflictDecision, ConflictPolicy, SessionHandle, SessionManager,
    TransferEvent, TransferOutcome, TransferProgress,
};

#[derive(Parser)]
#[command(
    name = "ferry",
    version,
    about = "Copy, move and delete files with conflict handling",
    long_about = "ferry plans every transfer before touching the filesystem, asks what to do \
                  when a destination already exists, and reports progress as it goes.\n\n\
                  Press Ctrl-C to cancel a running transfer; finished steps are kept."
)]
struct Cli {
    #[command(flatten)]
    engine: EngineArgs,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Copy files and directories into a destination directory
    Copy(TransferArgs),

    /// Move files and directories into a destination directory
    Move(TransferArgs),

    /// Delete files and directories
    Delete(DeleteArgs),

    /// Print the plan for a request without executing it
    #[command(subcommand)]
    Plan(PlanCommand),
}

#[derive(Subcommand)]
enum PlanCommand {
    /// Plan a copy
    Copy(TransferArgs),
    /// Plan a move
    Move(TransferArgs),
    /// Plan a deletion
    Delete(DeleteArgs),
}

#[derive(Args)]
struct TransferArgs {
    /// Files and directories to transfer
    #[arg(required = true, num_args = 1..)]
    sources: Vec<PathBuf>,

    /// Destination directory (created if missing)
    destination: PathBuf,
}

#[derive(Args)]
struct DeleteArgs {
    /// Paths to delete
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Delete permanently instead of using the trash
    #[arg(long)]
    permanent: bool,
}

#[derive(Args)]
struct EngineArgs {
    /// What to do when a destination already exists
    #[arg(long, value_enum, default_value = "ask", global = true)]
    on_conflict: ConflictMode,

    /// Apply the first answer given at the prompt to every later conflict
    #[arg(long, global = true)]
    apply_all: bool,

    /// Copy chunk size (e.g., "64K", "1M")
    #[arg(long, default_value = "512K", global = true)]
    chunk_size: String,

    /// Stop at the first failed step
    #[arg(long, global = true)]
    stop_on_error: bool,

    /// Do not copy permissions and modification times
    #[arg(long, global = true)]
    no_preserve: bool,

    /// Always copy then delete for moves, even on the same volume
    #[arg(long, global = true)]
    force_copy: bool,

    /// Output format
    #[arg(short, long, default_value = "text", global = true)]
    format: OutputFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum ConflictMode {
    #[default]
    Ask,
    Overwrite,
    Rename,
    Skip,
    Cancel,
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Copy(args) => {
            let request = TransferRequest::copy(args.sources, args.destination);
            run_transfer(request, &cli.engine).await?;
        }
        Command::Move(args) => {
            let request = TransferRequest::move_to(args.sources, args.destination);
            run_transfer(request, &cli.engine).await?;
        }
        Command::Delete(args) => {
            let request = TransferRequest::delete(args.paths, args.permanent);
            run_transfer(request, &cli.engine).await?;
        }
        Command::Plan(plan) => {
            let request = match plan {
                PlanCommand::Copy(args) => TransferRequest::copy(args.sources, args.destination),
                PlanCommand::Move(args) => TransferRequest::move_to(args.sources, args.destination),
                PlanCommand::Delete(args) => TransferRequest::delete(args.paths, args.permanent),
            };
            run_plan(request, cli.engine.format).await?;
        }
    }

    Ok(())
}

/// Install the stderr log subscriber.
fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .compact()
        .init();
}

/// Build the engine configuration from command-line flags.
fn build_config(engine: &EngineArgs) -> Result<TransferConfig> {
    let chunk_size = parse_size(&engine.chunk_size)?;

    TransferConfig::builder()
        .chunk_size(usize::try_from(chunk_size).context("Chunk size too large")?)
        .preserve_metadata(!engine.no_preserve)
        .stop_on_error(engine.stop_on_error)
        .force_copy_on_move(engine.force_copy)
        .build()
        .context("Invalid configuration")
}

fn conflict_policy(engine: &EngineArgs) -> ConflictPolicy {
    let decision = match engine.on_conflict {
        ConflictMode::Ask => return ConflictPolicy::Prompt,
        ConflictMode::Overwrite => ConflictDecision::Overwrite,
        ConflictMode::Rename => ConflictDecision::Rename(None),
        ConflictMode::Skip => ConflictDecision::Skip,
        ConflictMode::Cancel => ConflictDecision::Cancel,
    };
    ConflictPolicy::Fixed(ConflictAnswer::for_all(decision))
}

/// Run one transfer to completion, rendering progress on stderr.
async fn run_transfer(request: TransferRequest, engine: &EngineArgs) -> Result<()> {
    let config = build_config(engine)?;
    let manager = SessionManager::new(config, conflict_policy(engine));
    let mut events = manager.subscribe();
    let id = manager
        .submit(request)
        .await
        .context("Cannot start transfer")?;

    let Some(handle) = manager.handle(id) else {
        bail!("Transfer {id} disappeared before it started");
    };

    let interrupt = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() && interrupt.cancel() {
            eprintln!("\nCancelling...");
        }
    });

    let show_progress = matches!(engine.format, OutputFormat::Text);
    loop {
        match events.recv().await {
            Ok(TransferEvent::Progress(progress)) if progress.session_id == id => {
                if show_progress {
                    render_progress(&progress);
                }
                continue;
            }
            Ok(TransferEvent::ConflictEncountered { session_id, .. }) if session_id == id => {}
            Ok(TransferEvent::Finished(outcome)) if outcome.session_id == id => break,
            Ok(_) => continue,
            // Missed events may include a conflict prompt.
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }

        // Events can be stale; only the handle knows which prompt is live.
        let Some((ticket, conflict)) = handle.pending_prompt() else {
            continue;
        };

        // Ctrl-C during the prompt ends the session; stop waiting for input then.
        let Some(answer) = unless_finished(&handle, ask_user(conflict)).await else {
            eprintln!();
            break;
        };
        let answer = match answer? {
            Some(answer) if engine.apply_all => ConflictAnswer::for_all(answer.decision),
            Some(answer) => answer,
            None => ConflictAnswer::once(ConflictDecision::Cancel),
        };
        if let Err(e) = handle.resolve_prompt(ticket, answer) {
            tracing::debug!(error = %e, "Conflict answer not delivered");
        }
    }

    let outcome = manager.await_outcome(id).await?;
    report_outcome(&outcome, engine.format)
}

/// Run `work` unless the session reaches a terminal state first.
async fn unless_finished<T>(handle: &SessionHandle, work: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        value = work => Some(value),
        _ = handle.wait() => None,
    }
}

/// Prompt on the terminal; `None` when stdin is closed.
///
/// The prompt runs on its own thread so a cancelled session does not wait
/// for a line that never comes.
async fn ask_user(conflict: Conflict) -> Result<Option<ConflictAnswer>> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    std::thread::spawn(move || {
        let _ = tx.send(prompt_conflict(&conflict));
    });
    rx.await
        .context("Prompt thread failed")?
        .context("Cannot read answer")
}

fn prompt_conflict(conflict: &Conflict) -> io::Result<Option<ConflictAnswer>> {
    let existing = &conflict.existing;
    let incoming = &conflict.incoming;

    eprintln!();
    eprintln!("{} already exists", existing.path.display());
    eprintln!(
        "  existing: {}{}",
        describe_size(existing.size, existing.is_dir),
        if existing.is_dir { " (directory)" } else { "" }
    );
    eprintln!(
        "  incoming: {} from {}",
        describe_size(incoming.size, incoming.is_dir),
        incoming.path.display()
    );

    let stdin = io::stdin();
    loop {
        eprint!("[o]verwrite, [r]ename, [s]kip, [c]ancel (capital letter applies to all): ");
        io::stderr().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(None);
        }

        let input = line.trim();
        let apply_to_all = input.starts_with(|c: char| c.is_ascii_uppercase());
        let decision = match input.to_ascii_lowercase().as_str() {
            "o" | "overwrite" => ConflictDecision::Overwrite,
            "r" | "rename" => ConflictDecision::Rename(None),
            "s" | "skip" => ConflictDecision::Skip,
            "c" | "cancel" => ConflictDecision::Cancel,
            _ => continue,
        };

        return Ok(Some(ConflictAnswer {
            decision,
            apply_to_all,
        }));
    }
}

fn render_progress(progress: &TransferProgress) {
    let current = progress
        .current_path
        .as_ref()
        .and_then(|path| path.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    eprint!(
        "\r\x1b[2K{:>5.1}% {} / {}  [{}/{}] {}",
        progress.percentage(),
        format_size(progress.bytes_done),
        format_size(progress.total_bytes),
        progress.steps_done,
        progress.steps_total,
        truncate(&current, 40)
    );
}

fn report_outcome(outcome: &TransferOutcome, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            eprintln!("\r\x1b[2K{}", outcome.summary());
            if outcome.bytes_done > 0 {
                eprintln!(
                    " {} of {} written",
                    format_size(outcome.bytes_done),
                    format_size(outcome.total_bytes)
                );
            }
            for failure in &outcome.failures {
                eprintln!("   {failure}");
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(outcome)?);
        }
    }

    if !outcome.is_success() {
        bail!("{}", outcome.summary());
    }
    Ok(())
}

/// Plan a request and print the steps.
async fn run_plan(request: TransferRequest, format: OutputFormat) -> Result<()> {
    let plan = tokio::task::spawn_blocking(move || fileferry_ops::plan(&request))
        .await
        .context("Planning task failed")?
        .context("Cannot plan transfer")?;

    match format {
        OutputFormat::Text => print_plan(&plan),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
    }
    Ok(())
}

fn print_plan(plan: &TransferPlan) {
    println!();
    println!("{}", "─".repeat(70));
    match &plan.destination {
        Some(destination) => println!(" {} into {}", plan.kind, destination.display()),
        None => println!(" {}", plan.kind),
    }
    println!(
        " {} steps, {}",
        plan.len(),
        format_size(plan.total_bytes)
    );
    println!("{}", "─".repeat(70));
    println!();

    for step in plan.iter() {
        match step {
            TransferStep::CreateDirectory { dst, .. } => println!("   mkdir    {}", dst.display()),
            TransferStep::CopyFile { src, dst, size } => println!(
                "   copy     {} -> {} ({})",
                src.display(),
                dst.display(),
                format_size(*size)
            ),
            TransferStep::CopySymlink { src, dst } => {
                println!("   link     {} -> {}", src.display(), dst.display())
            }
            TransferStep::MoveFile { src, dst, size } => println!(
                "   move     {} -> {} ({})",
                src.display(),
                dst.display(),
                format_size(*size)
            ),
            TransferStep::RemovePath { path, permanent } => println!(
                "   {}  {}",
                if *permanent { "remove " } else { "trash  " },
                path.display()
            ),
        }
    }
    println!();
}

fn describe_size(size: u64, is_dir: bool) -> String {
    if is_dir {
        "-".to_string()
    } else {
        format_size(size)
    }
}

/// Format size in human-readable form.
fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

/// Truncate a string to max length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 1).collect();
        format!("{head}…")
    }
}

/// Parse a size string (e.g., "64K", "512KB", "1M").
fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();
    let digits = s.trim_end_matches(|c: char| !c.is_ascii_digit() && c != '.');
    let unit = &s[digits.len()..];

    let multiplier: u64 = match unit {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        other => bail!("Unknown size unit: {other}"),
    };
    let num: f64 = digits
        .parse()
        .with_context(|| format!("Invalid size: {s}"))?;

    Ok((num * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn test_cancel_interrupts_pending_prompt() {
        let temp = tempfile::TempDir::new().unwrap();
        let src = temp.path().join("a.txt");
        let dst = temp.path().join("dst");
        std::fs::write(&src, "new").unwrap();
        std::fs::create_dir_all(&dst).unwrap();
        std::fs::write(dst.join("a.txt"), "old").unwrap();

        let manager = SessionManager::new(TransferConfig::default(), ConflictPolicy::Prompt);
        let id = manager.copy(vec![src], &dst).await.unwrap();
        let handle = manager.handle(id).unwrap();
        timeout(Duration::from_secs(30), async {
            while handle.pending_prompt().is_none() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let interrupt = handle.clone();
        tokio::spawn(async move { interrupt.cancel() });
        let answered = timeout(
            Duration::from_secs(30),
            unless_finished(&handle, std::future::pending::<()>()),
        )
        .await
        .unwrap();

        assert!(answered.is_none());
        assert_eq!(std::fs::read_to_string(dst.join("a.txt")).unwrap(), "old");
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512K").unwrap(), 512 * 1024);
        assert_eq!(parse_size("1mb").unwrap(), 1024 * 1024);
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert!(parse_size("12Q").is_err());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 5), "abcd…");
    }

    #[test]
    fn test_cli_parses_copy_with_destination_last() {
        let cli = Cli::try_parse_from(["ferry", "copy", "a.txt", "b.txt", "out", "--on-conflict", "skip"])
            .unwrap();
        match cli.command {
            Command::Copy(args) => {
                assert_eq!(args.sources, vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")]);
                assert_eq!(args.destination, PathBuf::from("out"));
            }
            _ => panic!("expected copy"),
        }
        assert!(matches!(cli.engine.on_conflict, ConflictMode::Skip));
    }
}

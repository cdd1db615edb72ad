//! qtcov - LLM-driven QtTest generation with coverage orchestration
//!
//! Command-line front end: loads configuration once, wires the real LLM
//! client and subprocess runner into the orchestrator and reports each
//! stage as it happens.

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use qtcov::config::PathsConfig;
use qtcov::coverage::{ensure_reports, CoverageCollector, CoverageOutputs};
use qtcov::cycle::{CycleObserver, CycleResult, CycleState, CycleStatus, StateTransition};
use qtcov::llm::client_for_selection;
use qtcov::prompt::{LoadMode, PromptStore};
use qtcov::{CycleOrchestrator, ProviderSelection, QtcovConfig, QtcovError, SystemCommandRunner};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "qtcov")]
#[command(version)]
#[command(about = "Generate Qt unit tests with an LLM, build them and collect coverage", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Allow LLM requests and toolchain runs for this invocation
    #[arg(long, global = true)]
    enable_automation: bool,

    /// Without a subcommand an interactive menu is shown
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and save a test file for a task
    Generate {
        /// Task name in the prompt document
        #[arg(short, long)]
        task: String,

        /// LLM provider: openai, claude, or auto
        #[arg(short, long, value_enum, default_value = "auto")]
        service: ProviderSelection,
    },

    /// Generate, build, run and collect coverage for a task
    FullCycle {
        /// Task name in the prompt document
        #[arg(short, long)]
        task: String,

        /// LLM provider: openai, claude, or auto
        #[arg(short, long, value_enum, default_value = "auto")]
        service: ProviderSelection,
    },

    /// Manage the prompt document
    Prompts {
        #[command(subcommand)]
        action: PromptsAction,
    },

    /// Collect coverage for the configured object directory
    Coverage,
}

#[derive(Subcommand)]
enum PromptsAction {
    /// List task names
    List,

    /// Merge the prompts of another JSON document, overriding existing tasks
    Merge {
        /// JSON object of task name to prompt
        file: PathBuf,
    },

    /// Add or replace one prompt
    Set {
        /// Task name
        task: String,

        /// Prompt text
        text: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // .env before the filter so RUST_LOG may come from it
    let dotenv = load_dotenv(&cli.project);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.verbose { "qtcov=debug" } else { "qtcov=info" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(e) = dotenv {
        eprintln!("{} {:#}", "Warning:".yellow().bold(), e);
    }

    if !cli.project.is_dir() {
        eprintln!(
            "{} Project directory does not exist: {}",
            "Error:".red().bold(),
            cli.project.display()
        );
        std::process::exit(1);
    }
    let project = cli.project.canonicalize().unwrap_or(cli.project.clone());

    let code = match run(cli.command, &project, cli.enable_automation).await {
        Ok(code) => code,
        Err(e) => report_error(&e),
    };
    std::process::exit(code);
}

fn load_dotenv(project: &Path) -> anyhow::Result<()> {
    let path = project.join(".env");
    if path.exists() {
        dotenvy::from_path(&path).with_context(|| format!("could not load {}", path.display()))?;
    }
    Ok(())
}

fn load_config(project: &Path, enable_automation: bool) -> qtcov::Result<QtcovConfig> {
    let mut config = QtcovConfig::load(project, |key| std::env::var(key).ok())?;
    if enable_automation {
        config.automation.enabled = true;
    }
    Ok(config)
}

async fn run(
    command: Option<Commands>,
    project: &Path,
    enable_automation: bool,
) -> qtcov::Result<i32> {
    let config = load_config(project, enable_automation)?;

    match command {
        Some(Commands::Generate { task, service }) => {
            generate(config, project, &task, service).await?;
            Ok(0)
        }
        Some(Commands::FullCycle { task, service }) => {
            let result = full_cycle(config, project, &task, service).await?;
            Ok(result.status.exit_code())
        }
        Some(Commands::Prompts { action }) => {
            prompts(&config, project, action)?;
            Ok(0)
        }
        Some(Commands::Coverage) => {
            coverage(&config, project).await?;
            Ok(0)
        }
        None => interactive(config, project).await,
    }
}

fn orchestrator(
    config: QtcovConfig,
    project: &Path,
    service: ProviderSelection,
) -> qtcov::Result<CycleOrchestrator> {
    config.ensure_automation_enabled()?;
    let llm = client_for_selection(service, &config.llm)?;
    Ok(CycleOrchestrator::new(
        config,
        project,
        Arc::from(llm),
        Arc::new(SystemCommandRunner),
    )?
    .with_observer(Arc::new(ConsoleObserver::default())))
}

async fn generate(
    config: QtcovConfig,
    project: &Path,
    task: &str,
    service: ProviderSelection,
) -> qtcov::Result<()> {
    let generation = orchestrator(config, project, service)?.generate(task).await?;
    let file = generation
        .file_path
        .as_deref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    println!(
        "{} Saved {} ({} test cases)",
        "✓".green().bold(),
        file.cyan(),
        generation.tests_generated
    );
    Ok(())
}

async fn full_cycle(
    config: QtcovConfig,
    project: &Path,
    task: &str,
    service: ProviderSelection,
) -> qtcov::Result<CycleResult> {
    let result = orchestrator(config, project, service)?.full_cycle(task).await;
    print_cycle_result(&result);
    Ok(result)
}

fn prompts(config: &QtcovConfig, project: &Path, action: PromptsAction) -> qtcov::Result<()> {
    let store = PromptStore::new(PathsConfig::resolve(project, &config.paths.prompts_file));
    match action {
        PromptsAction::List => {
            let prompts = store.load_with(LoadMode::CreateIfMissing)?;
            if prompts.is_empty() {
                println!("No prompts in {}", store.path().display());
            }
            for (task, prompt) in &prompts {
                let first_line = prompt.lines().next().unwrap_or_default();
                println!("{}  {}", task.cyan().bold(), first_line.dimmed());
            }
        }
        PromptsAction::Merge { file } => {
            let custom = PromptStore::new(file).load()?;
            let added = custom.len();
            let merged = store.merge(custom)?;
            println!(
                "{} Merged {} prompts ({} total)",
                "✓".green().bold(),
                added,
                merged.len()
            );
        }
        PromptsAction::Set { task, text } => {
            store.set(&task, &text)?;
            println!("{} Saved prompt '{}'", "✓".green().bold(), task);
        }
    }
    Ok(())
}

async fn coverage(config: &QtcovConfig, project: &Path) -> qtcov::Result<()> {
    config.ensure_automation_enabled()?;
    let collector = CoverageCollector::new(
        Arc::new(SystemCommandRunner),
        &config.coverage,
        PathsConfig::resolve(project, &config.paths.coverage_dir),
    );
    let report = collector
        .collect(
            project,
            &PathsConfig::resolve(project, &config.paths.object_dir),
            &config.coverage.exclude_dirs,
            CoverageOutputs::from(&config.coverage),
        )
        .await?;
    ensure_reports(&report)?;

    println!("{} {}", "Coverage:".bold(), report.summary);
    for copied in &report.copied {
        println!("  copied {} -> {}", copied.from.display(), copied.to.display());
    }
    for unresolved in &report.unresolved {
        println!(
            "  {} {} ({})",
            "unresolved".yellow(),
            unresolved.reference.referenced,
            unresolved.reason
        );
    }
    for path in report.reports.existing() {
        println!("  {}", path.display().to_string().cyan());
    }
    Ok(())
}

// ============================================================================
// Interactive menu
// ============================================================================

async fn interactive(config: QtcovConfig, project: &Path) -> qtcov::Result<i32> {
    let stdin = io::stdin();
    let mut last = 0;
    loop {
        println!();
        println!("{}", "qtcov".bold());
        println!("  1) Generate test for a task");
        println!("  2) Full cycle for a task");
        println!("  3) List prompts");
        println!("  4) Collect coverage");
        println!("  0) Quit");

        let Some(choice) = ask(&stdin, "Choice")? else {
            return Ok(last);
        };
        let outcome = match choice.as_str() {
            "1" | "2" => {
                let Some(task) = ask(&stdin, "Task")? else {
                    return Ok(last);
                };
                let service = ask(&stdin, "Service [auto]")?
                    .unwrap_or_default()
                    .parse::<ProviderSelection>()
                    .unwrap_or_else(|e| {
                        eprintln!("{} {}, using auto", "Warning:".yellow().bold(), e);
                        ProviderSelection::Auto
                    });
                if choice == "1" {
                    generate(config.clone(), project, &task, service).await.map(|_| 0)
                } else {
                    full_cycle(config.clone(), project, &task, service)
                        .await
                        .map(|r| r.status.exit_code())
                }
            }
            "3" => prompts(&config, project, PromptsAction::List).map(|_| 0),
            "4" => coverage(&config, project).await.map(|_| 0),
            "0" | "q" | "quit" => return Ok(last),
            other => {
                println!("Unknown choice '{}'", other);
                continue;
            }
        };
        last = match outcome {
            Ok(code) => code,
            Err(e) => report_error(&e),
        };
    }
}

/// Print `error` with a configuration hint where one applies; returns the
/// exit code.
fn report_error(error: &QtcovError) -> i32 {
    eprintln!("{} {}", "Error:".red().bold(), error);
    if error.requires_configuration() {
        eprintln!(
            "{} check {}, .env or the QTCOV_* environment variables",
            "Hint:".cyan().bold(),
            qtcov::config::CONFIG_FILE_NAME
        );
    }
    error.exit_code()
}

/// Prompt on stdout and read one trimmed line; `None` on end of input.
fn ask(stdin: &io::Stdin, label: &str) -> qtcov::Result<Option<String>> {
    print!("{}: ", label);
    io::stdout().flush()?;
    let mut line = String::new();
    if stdin.lock().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

// ============================================================================
// Console output
// ============================================================================

/// One status line per stage, plus a spinner while the LLM is working.
#[derive(Default)]
struct ConsoleObserver {
    spinner: Mutex<Option<ProgressBar>>,
}

impl ConsoleObserver {
    fn start_spinner(&self, message: &str) {
        let bar = ProgressBar::new_spinner();
        bar.enable_steady_tick(Duration::from_millis(100));
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(message.to_string());
        if let Ok(mut spinner) = self.spinner.lock() {
            *spinner = Some(bar);
        }
    }

    fn stop_spinner(&self) {
        if let Ok(mut spinner) = self.spinner.lock() {
            if let Some(bar) = spinner.take() {
                bar.finish_and_clear();
            }
        }
    }
}

impl CycleObserver for ConsoleObserver {
    fn on_transition(&self, transition: &StateTransition) {
        self.stop_spinner();
        match transition.to {
            CycleState::Failed(stage) => {
                println!("{} {} failed", "✗".red().bold(), stage);
            }
            CycleState::Remediating | CycleState::Retrying => {
                println!("{} {}", "↻".yellow().bold(), transition.to);
            }
            CycleState::Done => {}
            state => println!("{} {}", "✓".green().bold(), state),
        }
        if transition.to == CycleState::PromptLoaded {
            self.start_spinner("Waiting for the LLM...");
        }
    }

    fn on_warning(&self, message: &str) {
        if let Ok(spinner) = self.spinner.lock() {
            if let Some(bar) = spinner.as_ref() {
                bar.println(format!("{} {}", "!".yellow().bold(), message));
                return;
            }
        }
        println!("{} {}", "!".yellow().bold(), message);
    }
}

fn print_cycle_result(result: &CycleResult) {
    println!();
    let status = match result.status {
        CycleStatus::Success => "success".green().bold(),
        CycleStatus::Partial => "partial".yellow().bold(),
        CycleStatus::Failed => "failed".red().bold(),
    };
    println!("{} {} ({})", "Cycle:".bold(), result.task, status);

    if let Some(generation) = &result.generation {
        if let Some(path) = &generation.file_path {
            println!(
                "  test file   {} ({} test cases)",
                path.display(),
                generation.tests_generated
            );
        }
    }
    if let Some(tests) = &result.tests {
        println!(
            "  tests       {} passed, {} failed{}",
            tests.passed,
            tests.failed,
            if result.remediated { " (after runtime staging)" } else { "" }
        );
    }
    if let Some(coverage) = &result.coverage {
        println!("  coverage    {}", coverage.summary);
    }
    if let Some(target) = &result.target_coverage {
        println!("  target      {} {:.1}% lines", target.file, target.lines);
    }
    if let Some(dir) = &result.archive_dir {
        println!("  archive     {}", dir.display());
    }
    for error in &result.errors {
        eprintln!("{} {}", "Error:".red().bold(), error);
    }
    if let Some(tests) = result.tests.as_ref().filter(|t| !t.success) {
        let tail = qtcov::fsutil::tail_lines(&tests.stdout, 20);
        if !tail.trim().is_empty() {
            eprintln!("{}", tail.dimmed());
        }
    }
}

use anyhow::{anyhow, Context as _, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Cadence - a cooperative microthread scheduler with CPU budgets", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default search)
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a demo program under the scheduler
    Run {
        /// Demo program name (see `cadence list`)
        demo: String,

        /// Hard CPU limit in steps (0 = unlimited)
        #[arg(long)]
        hard_limit: Option<u64>,

        /// Soft CPU limit in steps (0 = unlimited)
        #[arg(long)]
        soft_limit: Option<u64>,

        /// Safe CPU limit in steps (0 = unlimited)
        #[arg(long)]
        safe_limit: Option<u64>,

        /// Heap arena size for the context, in bytes
        #[arg(long)]
        arena_bytes: Option<usize>,

        /// JSON value injected at every suspension point
        #[arg(long, default_value = "0")]
        send: String,

        /// Upper bound on resume calls before giving up
        #[arg(long, default_value = "16")]
        max_resumes: u32,
    },

    /// List available demo programs
    List,
}

/// Run the CLI by parsing process arguments
pub fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    run_cli_with_args(cli)
}

/// Run the CLI with provided arguments (for hosts that need to filter args)
pub fn run_cli_from_args(args: Vec<String>) -> Result<()> {
    let cli = Cli::parse_from(args);
    run_cli_with_args(cli)
}

/// Internal function that handles CLI commands
fn run_cli_with_args(cli: Cli) -> Result<()> {
    use crate::context::Context;
    use crate::init;
    use crate::interp::demos;
    use crate::interp::machine::ProgramState;
    use crate::microthread::Microthread;
    use crate::types::{ResumeOutcome, Value};
    use std::env;

    // Apply CLI overrides to environment before configuration loads
    if let Some(config_path) = &cli.config {
        env::set_var("CADENCE_CONFIG_PATH", config_path);
    }

    // Eagerly load configuration and logging so config errors are shown
    // immediately, not after command output
    init::InitBuilder::new().init()?;

    match cli.command {
        Commands::List => {
            println!("Available demos:\n");
            for demo in demos::all() {
                println!("  {:<10} {}", demo.name, demo.description);
            }
        }

        Commands::Run {
            demo,
            hard_limit,
            soft_limit,
            safe_limit,
            arena_bytes,
            send,
            max_resumes,
        } => {
            let demo_def = demos::by_name(&demo)
                .ok_or_else(|| anyhow!("Unknown demo: {demo}. Use `cadence list`"))?;

            let mut config = init::get_config().clone();
            if let Some(bytes) = arena_bytes {
                config.arena_bytes = bytes;
            }

            let ctx = Context::create(&config);
            ctx.load()?;

            let mut thread = Microthread::new(
                demo.clone(),
                Box::new(ProgramState::new(demo_def.program())),
            );
            thread.set_hard_limit(hard_limit.unwrap_or(config.default_hard_limit));
            thread.set_soft_limit(soft_limit.unwrap_or(config.default_soft_limit));
            thread.set_safe_limit(safe_limit.unwrap_or(config.default_safe_limit));

            let send_value: Value =
                serde_json::from_str(&send).context("--send must be valid JSON")?;

            for round in 1..=max_resumes {
                let (outcome, value) = thread.resume(send_value.clone())?;
                println!("[{round}] {outcome} -> {value}");

                match outcome {
                    ResumeOutcome::Yield => continue,
                    ResumeOutcome::SoftPause => {
                        println!("  soft budget window consumed; granting another");
                        thread.clear_soft();
                    }
                    ResumeOutcome::HardPause => {
                        println!(
                            "  hard budget limit reached after {} steps",
                            thread.usage()
                        );
                        break;
                    }
                    ResumeOutcome::Stop => {
                        println!("✓ Completed: {value}");
                        break;
                    }
                    ResumeOutcome::Exception => {
                        eprintln!(
                            "✗ Guest error: {}",
                            thread
                                .last_error()
                                .map(|e| e.message.as_str())
                                .unwrap_or("unknown")
                        );
                        break;
                    }
                }
            }

            if thread.status().is_resumable() {
                println!(
                    "Stopped after {max_resumes} resumes; thread still {}",
                    thread.status()
                );
            }

            ctx.store()?;
            ctx.free()?;
        }
    }

    Ok(())
}

//! runwarden CLI
//!
//! Runs one workflow to completion, or a suite of test cases against it.
//!
//! # Usage
//!
//! ```bash
//! # Run once and print the provisioned outputs
//! runwarden run --target target.yaml --workflow hello.yaml \
//!   --arguments args.json --metadata metadata.json
//!
//! # Run a test suite
//! runwarden test --target target.yaml --workflow hello.yaml --suite cases.yaml
//! ```
//!
//! Exit codes: 0 success, 1 run/case failed, 2 bad arguments or unreadable
//! files, 3 denied by a consumable resource, 4 internal fault.

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use runwarden::config::{load_document, load_workflow, TargetConfig};
use runwarden::suite::{run_suite, TestCase};
use runwarden::{run_once, RunFailure, RunRequest, SuiteError, Target, WorkflowDefinition};

const EXIT_BAD_ARGUMENTS: u8 = 2;
const EXIT_INTERNAL_FAULT: u8 = 4;

#[derive(Parser)]
#[command(name = "runwarden")]
#[command(version)]
#[command(about = "Drive workflow runs through provisioning, execution and cleanup")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow once and print its provisioned outputs
    Run {
        /// Target configuration (JSON or YAML)
        #[arg(long, short = 't')]
        target: PathBuf,

        /// Workflow definition (JSON or YAML)
        #[arg(long, short = 'w')]
        workflow: PathBuf,

        /// Arguments document, keyed by parameter name
        #[arg(long, short = 'a')]
        arguments: Option<PathBuf>,

        /// Output metadata document, keyed by output name
        #[arg(long, short = 'm')]
        metadata: Option<PathBuf>,

        /// Engine arguments document
        #[arg(long, short = 'e')]
        engine_arguments: Option<PathBuf>,

        #[arg(long, short = 'o', default_value = "pretty", value_enum)]
        output: OutputFormat,
    },

    /// Run every case of a test suite
    Test {
        #[arg(long, short = 't')]
        target: PathBuf,

        #[arg(long, short = 'w')]
        workflow: PathBuf,

        /// Suite file: a list of test cases
        #[arg(long, short = 's')]
        suite: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run {
            target,
            workflow,
            arguments,
            metadata,
            engine_arguments,
            output,
        } => {
            run_command(
                &target,
                &workflow,
                [arguments, metadata, engine_arguments],
                output,
            )
            .await
        }
        Commands::Test {
            target,
            workflow,
            suite,
        } => test_command(&target, &workflow, &suite).await,
    };
    ExitCode::from(code)
}

fn report_error(message: impl std::fmt::Display) {
    eprintln!("{} {}", "ERROR:".red().bold(), message);
}

async fn load_inputs(
    target: &Path,
    workflow: &Path,
) -> Result<(Arc<Target>, Arc<WorkflowDefinition>), u8> {
    let workflow = load_workflow(workflow).map_err(|e| {
        report_error(&e);
        EXIT_BAD_ARGUMENTS
    })?;
    let config: TargetConfig = load_document(target).map_err(|e| {
        report_error(&e);
        EXIT_BAD_ARGUMENTS
    })?;
    let target = config.build().await.map_err(|e| {
        report_error(format!("Failed to start target: {e:#}"));
        EXIT_INTERNAL_FAULT
    })?;
    Ok((Arc::new(target), Arc::new(workflow)))
}

fn load_optional(path: Option<PathBuf>) -> Result<Value, u8> {
    match path {
        None => Ok(Value::Null),
        Some(path) => load_document(&path).map_err(|e| {
            report_error(&e);
            EXIT_BAD_ARGUMENTS
        }),
    }
}

async fn run_command(
    target: &Path,
    workflow: &Path,
    documents: [Option<PathBuf>; 3],
    output: OutputFormat,
) -> u8 {
    let (target, workflow) = match load_inputs(target, workflow).await {
        Ok(loaded) => loaded,
        Err(code) => return code,
    };
    let [arguments, metadata, engine_arguments] = documents;
    let request = match (
        load_optional(arguments),
        load_optional(metadata),
        load_optional(engine_arguments),
    ) {
        (Ok(a), Ok(m), Ok(e)) => RunRequest::new(a, m, e),
        _ => return EXIT_BAD_ARGUMENTS,
    };

    let name = workflow.name.clone();
    match run_once(target, workflow, request).await {
        Ok(records) => {
            match output {
                OutputFormat::Json => match serde_json::to_string_pretty(&records) {
                    Ok(json) => println!("{json}"),
                    Err(e) => {
                        report_error(e);
                        return EXIT_INTERNAL_FAULT;
                    }
                },
                OutputFormat::Pretty => {
                    println!("{} {}", "SUCCEEDED".green().bold(), name.yellow());
                    for record in &records {
                        let location = match record {
                            runwarden::ProvisionedOutput::File { storage_path, .. } => storage_path,
                            runwarden::ProvisionedOutput::Url { url, .. } => url,
                        };
                        println!("  {} {}", record.kind().cyan(), location);
                    }
                }
            }
            0
        }
        Err(failure) => {
            let label = match &failure {
                RunFailure::Failed => "FAILED",
                RunFailure::BadArguments(_) => "BAD ARGUMENTS",
                RunFailure::Denied(_) => "DENIED",
                RunFailure::InternalFault(_) => "INTERNAL FAULT",
            };
            eprintln!("{} {}", label.red().bold(), name.yellow());
            match &failure {
                RunFailure::BadArguments(problems) | RunFailure::Denied(problems) => {
                    for problem in problems {
                        eprintln!("  {}", problem);
                    }
                }
                RunFailure::InternalFault(reason) => eprintln!("  {}", reason),
                RunFailure::Failed => {}
            }
            failure.exit_code()
        }
    }
}

async fn test_command(target: &Path, workflow: &Path, suite: &Path) -> u8 {
    let (target, workflow) = match load_inputs(target, workflow).await {
        Ok(loaded) => loaded,
        Err(code) => return code,
    };
    let cases: Vec<TestCase> = match load_document(suite) {
        Ok(cases) => cases,
        Err(e) => {
            report_error(e);
            return EXIT_BAD_ARGUMENTS;
        }
    };

    let report = match run_suite(target, workflow, cases).await {
        Ok(report) => report,
        Err(SuiteError::DuplicateIds(duplicates)) => {
            report_error("Duplicate test case ids");
            for (id, count) in duplicates {
                eprintln!("  {} appears {} times", id.yellow(), count);
            }
            return EXIT_BAD_ARGUMENTS;
        }
        Err(SuiteError::InvalidCases(invalid)) => {
            report_error("Invalid test cases");
            for (id, violations) in invalid {
                eprintln!("  {}", id.yellow());
                for violation in violations {
                    eprintln!("    {}", violation);
                }
            }
            return EXIT_BAD_ARGUMENTS;
        }
    };

    println!("\n{}", "═".repeat(60));
    for case in &report.cases {
        let status = if case.passed {
            "PASS".green()
        } else {
            "FAIL".red()
        };
        println!("{} {} {}", status, case.id.yellow(), case.description.dimmed());
        for problem in &case.problems {
            println!("  {}", problem);
        }
    }
    let passed = report.cases.iter().filter(|case| case.passed).count();
    println!("{}", "═".repeat(60));
    println!("Passed: {}/{}", passed, report.cases.len());
    report.exit_code()
}

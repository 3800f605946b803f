//! node-debug-gate: run allowlisted network-debugging tools on a node.
//!
//! Modes:
//!   - `run`: evaluate, audit, and execute a command
//!   - `check`: evaluate and audit only
//!   - `hook`: read a JSON submission on stdin, write a JSON response on stdout
//!   - `dump-config`: print the merged configuration

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Args, Parser, Subcommand};

use node_debug_gate::config::{CaptureProfile, Config, MirrorTarget};
use node_debug_gate::eval::{TargetRef, UNKNOWN_PRINCIPAL};
use node_debug_gate::exec::CancelFlag;
use node_debug_gate::gateway::{Gateway, Response, Submission};
use node_debug_gate::logging;
use node_debug_gate::parse::{display_command, split_command_line};

// ─── Arguments ───────────────────────────────────────

/// Policy gateway for privileged network-debugging tools on cluster nodes.
#[derive(Parser, Debug)]
#[command(name = "node-debug-gate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration overlay (default: ~/.config/node-debug-gate/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Packet-capture profile (bounded-count or timed-capture)
    #[arg(long, global = true)]
    profile: Option<CaptureProfile>,

    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate a command and run it if allowed
    Run(Target),
    /// Evaluate a command without running it
    Check(Target),
    /// Read a JSON submission on stdin and answer with JSON on stdout
    Hook,
    /// Print the merged configuration as TOML
    #[command(name = "dump-config")]
    DumpConfig,
}

#[derive(Args, Debug)]
struct Target {
    /// Node the command targets
    #[arg(long)]
    node: String,

    /// Pod namespace (run inside the pod's network namespace)
    #[arg(long, requires = "pod")]
    namespace: Option<String>,

    /// Pod name
    #[arg(long, requires = "namespace")]
    pod: Option<String>,

    /// Requesting user (default: $NODE_DEBUG_PRINCIPAL, then $USER)
    #[arg(long)]
    principal: Option<String>,

    /// Stop the tool after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Whole command as one shell-quoted line instead of after `--`
    #[arg(long, conflicts_with = "argv")]
    line: Option<String>,

    /// Program and arguments
    #[arg(last = true)]
    argv: Vec<String>,
}

impl Target {
    fn into_submission(self) -> Result<Submission, String> {
        let (command, arguments) = match self.line {
            Some(line) => split_command_line(&line)
                .ok_or_else(|| format!("cannot split command line: {line}"))?,
            None => {
                let mut argv = self.argv.into_iter();
                let program = argv.next().ok_or("no command given")?;
                (program, argv.collect())
            }
        };
        let target = match (self.namespace, self.pod) {
            (Some(namespace), Some(name)) => TargetRef::Pod { namespace, name },
            _ => TargetRef::Host,
        };
        let submission = Submission::new(
            resolve_principal(self.principal),
            self.node,
            &target,
            command,
            arguments,
        );
        Ok(match self.timeout {
            Some(secs) => submission.with_timeout(secs),
            None => submission,
        })
    }
}

/// `--principal`, then `$NODE_DEBUG_PRINCIPAL`, then `$USER`.
fn resolve_principal(explicit: Option<String>) -> String {
    explicit
        .or_else(|| std::env::var("NODE_DEBUG_PRINCIPAL").ok())
        .or_else(|| std::env::var("USER").ok())
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| UNKNOWN_PRINCIPAL.to_string())
}

/// Exit statuses outside 0..=255 report plain failure.
fn status_byte(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(status_byte(code))
}

// ─── Modes ───────────────────────────────────────────

fn cancel_on_interrupt() -> CancelFlag {
    let cancel = CancelFlag::new();
    let handle = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("node-debug-gate: interrupted, stopping tool...");
        handle.cancel();
    }) {
        log::warn!("cannot install interrupt handler: {e}");
    }
    cancel
}

fn report(response: &Response) {
    if let Some(reason) = &response.reason {
        eprintln!(
            "node-debug-gate: {} [{}]: {reason}",
            response.outcome.label(),
            response.correlation_id
        );
    }
    for artifact in &response.artifacts {
        eprintln!("node-debug-gate: artifact {artifact}");
    }
}

fn run(gateway: &Gateway, target: Target, execute: bool) -> ExitCode {
    let submission = match target.into_submission() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("node-debug-gate: {e}");
            return ExitCode::from(1);
        }
    };
    if let (Some(command), Some(args)) = (&submission.command, &submission.arguments) {
        log::debug!("submission: {}", display_command(command, args));
    }

    if !execute {
        let response = gateway.check(submission);
        report(&response);
        return exit_code(response.status_code());
    }

    let cancel = cancel_on_interrupt();
    let response = gateway.submit(submission, &cancel);
    print!("{}", response.stdout);
    eprint!("{}", response.stderr);
    report(&response);
    exit_code(response.status_code())
}

fn hook(gateway: &Gateway) -> ExitCode {
    let mut input = String::new();
    if std::io::stdin().read_to_string(&mut input).is_err() {
        eprintln!("failed to read stdin");
        return ExitCode::from(1);
    }
    let submission: Submission = match serde_json::from_str(&input) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("JSON parse error: {e}");
            return ExitCode::from(1);
        }
    };

    let cancel = cancel_on_interrupt();
    let response = gateway.submit(submission, &cancel);
    match serde_json::to_string(&response) {
        Ok(json) => {
            println!("{json}");
            exit_code(response.status_code())
        }
        Err(e) => {
            eprintln!("cannot serialize response: {e}");
            ExitCode::from(1)
        }
    }
}

// ─── Entry point ─────────────────────────────────────

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("node-debug-gate: {e}");
            return ExitCode::from(1);
        }
    };
    if let Some(profile) = cli.profile {
        config.capture.profile = profile;
    }
    logging::init(&config.settings.log_level, cli.verbose);

    match cli.command {
        Command::DumpConfig => match config.to_toml() {
            Ok(toml) => {
                print!("{toml}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("node-debug-gate: cannot render config: {e}");
                ExitCode::from(1)
            }
        },
        Command::Hook => {
            // stdout carries only the JSON response
            if config.settings.mirror == MirrorTarget::Stdout {
                config.settings.mirror = MirrorTarget::Stderr;
            }
            hook(&Gateway::from_config(&config))
        }
        Command::Run(target) => run(&Gateway::from_config(&config), target, true),
        Command::Check(target) => run(&Gateway::from_config(&config), target, false),
    }
}

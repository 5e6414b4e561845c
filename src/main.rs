//! Sandterm - interactive Linux sandbox sessions over HTTP.
//!
//! Usage:
//!   sandterm serve [--port 8080]    # Start HTTP server
//!   sandterm run program.py         # Run one program interactively in this terminal

#[cfg(not(target_os = "linux"))]
compile_error!("This program only works on Linux.");

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use sandterm::config::{SandboxArgs, SessionArgs};
use sandterm::http_server;
use sandterm::namespace::NamespaceBackend;
use sandterm::orchestrator::{
    InputRequest, PollRequest, RunRequest, RunResponse, COMPLETED_MESSAGE, STILL_RUNNING_MESSAGE,
    SUPPORTED_LANGUAGE,
};
use sandterm::{AppState, SessionError};

#[derive(Parser, Debug)]
#[command(name = "sandterm")]
#[command(about = "Interactive Linux sandbox sessions over HTTP")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, env = "SANDTERM_PORT", default_value = "8080")]
        port: u16,
        #[command(flatten)]
        session: SessionArgs,
        #[command(flatten)]
        sandbox: SandboxArgs,
    },
    /// Run one program, wiring its prompts to this terminal
    Run {
        /// Python source file
        file: PathBuf,
        #[command(flatten)]
        session: SessionArgs,
        #[command(flatten)]
        sandbox: SandboxArgs,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let default_level = match args.command {
        Commands::Serve { .. } => "info",
        Commands::Run { .. } => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Must be root
    if !nix::unistd::geteuid().is_root() {
        eprintln!("Error: Must run as root (need CAP_SYS_ADMIN for namespaces)");
        exit(1);
    }

    match args.command {
        Commands::Serve { port, session, sandbox } => {
            let state = app_state(&session, &sandbox);
            if let Err(e) = http_server::run_server(port, state).await {
                eprintln!("Error: {}", e);
                exit(1);
            }
        }
        Commands::Run { file, session, sandbox } => {
            let code = match tokio::fs::read_to_string(&file).await {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("Error: cannot read {}: {}", file.display(), e);
                    exit(1);
                }
            };
            let state = app_state(&session, &sandbox);
            let status = run_interactive(&state, code).await;
            state.registry().shutdown().await;
            exit(status);
        }
    }
}

fn app_state(session: &SessionArgs, sandbox: &SandboxArgs) -> AppState {
    let backend = Arc::new(NamespaceBackend::new(sandbox.namespace_config()));
    AppState::new(
        backend,
        session.registry_config(),
        session.wait_options(),
        session.request_timeout(),
    )
}

/// Drive one session from the terminal. Lines typed while the program looks
/// busy are still sent, in case it is reading without a recognizable prompt.
async fn run_interactive(state: &AppState, code: String) -> i32 {
    let orchestrator = &state.orchestrator;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut echo = Transcript::default();
    let mut session_id: Option<String> = None;

    let mut result = orchestrator
        .run(RunRequest { code, language: SUPPORTED_LANGUAGE.to_string() })
        .await;

    loop {
        let response: RunResponse = match result {
            Ok(response) => response,
            Err(SessionError::CallerTimeout { .. }) if session_id.is_some() => {
                let id = session_id.clone().unwrap_or_default();
                // The session is still alive; keep collecting
                result = orchestrator.poll(PollRequest { session_id: id }).await;
                continue;
            }
            Err(SessionError::Execution { exit_code, output }) => {
                echo.show(&output);
                return exit_code;
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        };

        echo.show_response(&response);
        let Some(id) = response.session_id else {
            return 0;
        };
        session_id = Some(id.clone());

        let line = if response.waiting_for_input {
            if stdin_open {
                stdin.next_line().await.ok().flatten()
            } else {
                None
            }
        } else {
            tokio::select! {
                line = stdin.next_line(), if stdin_open => match line {
                    Ok(Some(line)) => Some(line),
                    _ => {
                        stdin_open = false;
                        result = orchestrator.poll(PollRequest { session_id: id }).await;
                        continue;
                    }
                },
                polled = orchestrator.poll(PollRequest { session_id: id.clone() }) => {
                    result = polled;
                    continue;
                }
            }
        };

        match line {
            Some(line) => {
                echo.typed(&line);
                result = orchestrator.input(InputRequest { session_id: id, input: line }).await;
            }
            None => {
                eprintln!("Error: input closed while the program is waiting for it");
                let _ = orchestrator.cancel(&id).await;
                return 1;
            }
        }
    }
}

/// Tracks what the terminal already shows so each turn prints only what is
/// new in the session transcript.
#[derive(Default)]
struct Transcript {
    shown: String,
}

impl Transcript {
    /// Placeholder text stands in for an empty transcript and is not shown.
    fn show_response(&mut self, response: &RunResponse) {
        let placeholder = response.output == STILL_RUNNING_MESSAGE || response.output == COMPLETED_MESSAGE;
        if !(placeholder && self.shown.is_empty()) {
            self.show(&response.output);
        }
    }

    fn show(&mut self, transcript: &str) {
        use std::io::Write;

        let fresh = transcript.strip_prefix(self.shown.as_str()).unwrap_or(transcript);
        print!("{}", fresh);
        let _ = std::io::stdout().flush();
        self.shown = transcript.to_string();
    }

    /// The terminal echoed the line as it was typed.
    fn typed(&mut self, line: &str) {
        self.shown.push_str(line);
        self.shown.push('\n');
    }
}

//! Interactive REPL orchestration (§4.4): wires the runner subprocess
//! lifecycle (`session`), on-disk history (`history`), and the terminal UI
//! (`tui`) together behind a single entry point called from the `repl`
//! subcommand.

mod history;
mod session;
mod tui;

use std::path::PathBuf;

use crossterm::event::{DisableMouseCapture, EnableMouseCapture};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use dh_types::EngineVersion;
use dh_types::DhError;
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;

use crate::config::Paths;
pub use history::History;
pub use session::{ReplSession, ReplSessionConfig};

/// Builds the runner's argv: which backend to wrap is encoded as flags
/// rather than a different binary, mirroring `run_exec`'s three-way
/// embedded/remote/vm branch (§4.1.4, §4.4.1).
fn runner_args(paths: &Paths, version: &EngineVersion, remote: &Option<String>, vm: bool) -> Vec<String> {
    let mut args = vec!["--version".to_string(), version.to_string()];
    if vm {
        args.push("--vm".to_string());
    } else if let Some(addr) = remote {
        args.push("--remote".to_string());
        args.push(addr.clone());
    } else {
        args.push("--engine-runner".to_string());
        args.push(paths.root.join("bin").join("dh-engine-runner").display().to_string());
    }
    args
}

pub async fn run(
    paths: &Paths,
    version: &EngineVersion,
    remote: Option<String>,
    vm: bool,
) -> Result<(), DhError> {
    let runner_bin = paths.root.join("bin").join("dh-repl-runner");
    let runner_bin = if runner_bin.exists() {
        runner_bin
    } else {
        PathBuf::from("dh-repl-runner")
    };

    let args = runner_args(paths, version, &remote, vm);
    let session = ReplSession::start(ReplSessionConfig { runner_bin, args }).await?;
    let mut history = History::load(&paths.history_file())?;

    enable_raw_mode().map_err(|e| DhError::prereq_not_met(e.to_string()))?;
    let mut stdout = std::io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)
        .map_err(|e| DhError::prereq_not_met(e.to_string()))?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).map_err(|e| DhError::prereq_not_met(e.to_string()))?;

    let run_result = tui::run(&mut terminal, &session, &mut history).await;

    disable_raw_mode().ok();
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture).ok();
    terminal.show_cursor().ok();

    session.shutdown().await;

    run_result
}

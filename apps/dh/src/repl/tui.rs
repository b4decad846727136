//! REPL TUI (§4.4.3, §4.5): tab bar, table view, log view, input area, and
//! a server-info sidebar over a single screen, driven by `ReplSession`.
//! Generalizes the installer's `Screen`/`App`/poll-draw-drain loop
//! (`installer::app::App`, `installer::main::run_app`) to the REPL's
//! single-screen, push-driven shape: instead of draining an `install_rx`
//! of phase/log messages, this drains `ReplSession::table_updates` and
//! awaits command replies directly.

use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyModifiers};
use dh_types::repl_proto::{Command, Reply, ServerInfo, TableSummary, TableWindow};
use dh_types::vsock_proto::TablePreview;
use dh_types::DhError;
use ratatui::backend::Backend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, List, ListItem, Paragraph, Row, Table, Tabs};
use ratatui::Frame;
use ratatui::Terminal;
use uuid::Uuid;

use super::history::History;
use super::session::ReplSession;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const SUBSCRIBE_OFFSET: u64 = 0;
const SUBSCRIBE_LIMIT: u64 = 200;

#[derive(Clone)]
pub struct TableTab {
    pub name: String,
    pub window: Option<TableWindow>,
    pub row_count: u64,
    pub is_refreshing: bool,
    pub cursor: usize,
    pub subscribed: bool,
}

#[derive(PartialEq, Eq, Clone, Copy)]
pub enum Focus {
    Input,
    ReverseSearch,
}

pub struct App {
    pub tabs: Vec<TableTab>,
    /// 0 is the fixed log tab; 1.. index into `tabs`.
    pub active_tab: usize,
    pub log_lines: Vec<String>,
    pub log_scroll: usize,
    pub input: String,
    pub focus: Focus,
    pub search_query: String,
    pub search_results: Vec<String>,
    pub search_index: usize,
    pub should_quit: bool,
    pub server_info: Option<ServerInfo>,
    pub status_line: String,
}

impl App {
    pub fn new() -> Self {
        Self {
            tabs: Vec::new(),
            active_tab: 0,
            log_lines: Vec::new(),
            log_scroll: 0,
            input: String::new(),
            focus: Focus::Input,
            search_query: String::new(),
            search_results: Vec::new(),
            search_index: 0,
            should_quit: false,
            server_info: None,
            status_line: "connecting...".to_string(),
        }
    }

    fn log(&mut self, line: impl Into<String>) {
        self.log_lines.push(line.into());
        const MAX_LOG_LINES: usize = 2000;
        if self.log_lines.len() > MAX_LOG_LINES {
            let overflow = self.log_lines.len() - MAX_LOG_LINES;
            self.log_lines.drain(0..overflow);
        }
    }

    /// Applies a `table_update` push: finds the tab by name (creating one
    /// if this is the first update for a newly-subscribed table), preserves
    /// the cursor row across the new row count (§4.5's table-view
    /// invariant: "remember the previous cursor, install new rows, clamp
    /// the old cursor into the new row count").
    fn apply_table_update(&mut self, table: TablePreview, window: TableWindow) {
        let total_rows = window.total_rows;
        if let Some(tab) = self.tabs.iter_mut().find(|t| t.name == table.name) {
            tab.cursor = tab.cursor.min(total_rows.saturating_sub(1) as usize);
            tab.row_count = table.row_count;
            tab.is_refreshing = table.is_refreshing;
            tab.window = Some(window);
        } else {
            self.tabs.push(TableTab {
                name: table.name,
                row_count: table.row_count,
                is_refreshing: table.is_refreshing,
                window: Some(window),
                cursor: 0,
                subscribed: true,
            });
        }
    }

    fn active_table_tab(&self) -> Option<&TableTab> {
        if self.active_tab == 0 {
            None
        } else {
            self.tabs.get(self.active_tab - 1)
        }
    }
}

/// Runs the poll-draw-drain loop until the user quits or the runner exits.
/// Mirrors `installer::main::run_app`'s shape: poll crossterm for up to
/// `POLL_INTERVAL`, handle at most one event, then drain whatever pushed
/// messages arrived in the meantime, then redraw.
pub async fn run<B: Backend>(
    terminal: &mut Terminal<B>,
    session: &ReplSession,
    history: &mut History,
) -> Result<(), DhError> {
    let mut app = App::new();

    if let Ok(Reply::ServerInfoReply { info, .. }) = session
        .send_and_wait(Command::ServerInfo {
            id: Uuid::new_v4().to_string(),
        })
        .await
    {
        app.server_info = Some(info);
        app.status_line = "ready".to_string();
    }

    loop {
        drain_pushes(&mut app, session).await;

        if session.has_exited() {
            app.log("REPL runner exited");
            break;
        }

        if event::poll(POLL_INTERVAL).map_err(|e| DhError::prereq_not_met(e.to_string()))? {
            if let Event::Key(key) = event::read().map_err(|e| DhError::prereq_not_met(e.to_string()))? {
                handle_key(&mut app, key, session, history).await;
            }
        }

        terminal
            .draw(|f| render(f, &app))
            .map_err(|e| DhError::prereq_not_met(e.to_string()))?;

        if app.should_quit {
            break;
        }
    }

    Ok(())
}

async fn drain_pushes(app: &mut App, session: &ReplSession) {
    let mut rx = session.table_updates.lock().await;
    while let Ok(reply) = rx.try_recv() {
        if let Reply::TableUpdate { table, window } = reply {
            app.apply_table_update(table, window);
        }
    }
}

async fn handle_key(app: &mut App, key: KeyEvent, session: &ReplSession, history: &mut History) {
    if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
        let _ = session
            .send_and_wait(Command::Shutdown {
                id: Uuid::new_v4().to_string(),
            })
            .await;
        app.should_quit = true;
        return;
    }

    match app.focus {
        Focus::ReverseSearch => handle_reverse_search_key(app, key, history),
        Focus::Input => handle_input_key(app, key, session, history).await,
    }
}

fn handle_reverse_search_key(app: &mut App, key: KeyEvent, history: &History) {
    match key.code {
        KeyCode::Esc => {
            app.focus = Focus::Input;
            app.search_query.clear();
        }
        KeyCode::Enter => {
            if let Some(hit) = app.search_results.get(app.search_index) {
                app.input = hit.clone();
            }
            app.focus = Focus::Input;
            app.search_query.clear();
        }
        KeyCode::Backspace => {
            app.search_query.pop();
            app.search_results = history.search(&app.search_query).into_iter().map(String::from).collect();
            app.search_index = 0;
        }
        KeyCode::Char(c) => {
            app.search_query.push(c);
            app.search_results = history.search(&app.search_query).into_iter().map(String::from).collect();
            app.search_index = 0;
        }
        KeyCode::Up => {
            if app.search_index + 1 < app.search_results.len() {
                app.search_index += 1;
            }
        }
        KeyCode::Down => {
            app.search_index = app.search_index.saturating_sub(1);
        }
        _ => {}
    }
}

async fn handle_input_key(app: &mut App, key: KeyEvent, session: &ReplSession, history: &mut History) {
    match key.code {
        KeyCode::Char('r') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            app.focus = Focus::ReverseSearch;
            app.search_query.clear();
            app.search_results.clear();
        }
        KeyCode::Tab => switch_tab(app, session, next_tab_index(app)).await,
        KeyCode::BackTab => {
            let idx = if app.active_tab == 0 {
                app.tabs.len()
            } else {
                app.active_tab - 1
            };
            switch_tab(app, session, idx).await;
        }
        KeyCode::Enter if key.modifiers.contains(KeyModifiers::SHIFT) => {
            app.input.push('\n');
        }
        KeyCode::Enter => {
            if app.input.trim().is_empty() {
                return;
            }
            if is_incomplete(&app.input) {
                app.input.push('\n');
                return;
            }
            let code = std::mem::take(&mut app.input);
            let _ = history.add(&code);
            run_execute(app, session, code).await;
        }
        KeyCode::Backspace => {
            app.input.pop();
        }
        KeyCode::Up => {
            if let Some(prev) = history.up(&app.input) {
                app.input = prev.to_string();
            }
        }
        KeyCode::Down => {
            if let Some(next) = history.down() {
                app.input = next.to_string();
            }
        }
        KeyCode::Char(c) => {
            app.input.push(c);
        }
        _ => {}
    }
}

/// Detects a trailing `:` with nothing under it, unbalanced brackets, or an
/// open triple-quoted string (§4.5): gates Enter-to-submit on a complete
/// statement rather than sending a half-typed block to the runner.
fn is_incomplete(code: &str) -> bool {
    let mut depth: i64 = 0;
    let mut in_single = false;
    let mut in_double = false;
    let mut in_triple: Option<char> = None;
    let mut chars = code.chars().peekable();

    while let Some(c) = chars.next() {
        if let Some(q) = in_triple {
            if c == q {
                let mut lookahead = chars.clone();
                if lookahead.next() == Some(q) && lookahead.next() == Some(q) {
                    chars.next();
                    chars.next();
                    in_triple = None;
                }
            }
            continue;
        }
        if in_single {
            if c == '\\' {
                chars.next();
            } else if c == '\'' {
                in_single = false;
            }
            continue;
        }
        if in_double {
            if c == '\\' {
                chars.next();
            } else if c == '"' {
                in_double = false;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                let mut lookahead = chars.clone();
                if lookahead.next() == Some(c) && lookahead.next() == Some(c) {
                    chars.next();
                    chars.next();
                    in_triple = Some(c);
                } else if c == '\'' {
                    in_single = true;
                } else {
                    in_double = true;
                }
            }
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            _ => {}
        }
    }

    if in_triple.is_some() || in_single || in_double {
        return true;
    }
    if depth > 0 {
        return true;
    }

    code.trim_end()
        .lines()
        .last()
        .map(|last| last.trim_end().ends_with(':'))
        .unwrap_or(false)
}

fn next_tab_index(app: &App) -> usize {
    if app.active_tab + 1 > app.tabs.len() {
        0
    } else {
        app.active_tab + 1
    }
}

/// Ties subscription lifetime to tab focus (§4.4.3): leaving a table tab
/// unsubscribes it, entering one subscribes. The log tab (index 0) never
/// subscribes to anything.
async fn switch_tab(app: &mut App, session: &ReplSession, new_index: usize) {
    if new_index == app.active_tab {
        return;
    }
    if let Some(tab) = app.active_table_tab() {
        if tab.subscribed {
            let name = tab.name.clone();
            let _ = session
                .send_and_wait(Command::Unsubscribe {
                    id: Uuid::new_v4().to_string(),
                    name,
                })
                .await;
            if let Some(tab) = app.tabs.iter_mut().find(|t| t.name == tab.name) {
                tab.subscribed = false;
            }
        }
    }

    app.active_tab = new_index;

    let target = app
        .active_table_tab()
        .filter(|t| t.is_refreshing)
        .map(|t| t.name.clone());
    if let Some(name) = target {
        let reply = session
            .send_and_wait(Command::Subscribe {
                id: Uuid::new_v4().to_string(),
                name: name.clone(),
                offset: SUBSCRIBE_OFFSET,
                limit: SUBSCRIBE_LIMIT,
            })
            .await;
        if reply.is_ok() {
            if let Some(tab) = app.tabs.iter_mut().find(|t| t.name == name) {
                tab.subscribed = true;
            }
        }
    }
}

async fn run_execute(app: &mut App, session: &ReplSession, code: String) {
    app.log(format!("> {code}"));
    let reply = session
        .send_and_wait(Command::Execute {
            id: Uuid::new_v4().to_string(),
            code,
        })
        .await;

    match reply {
        Ok(Reply::Result { stdout, stderr, result_repr, new_tables, .. }) => {
            if !stdout.is_empty() {
                app.log(stdout.trim_end());
            }
            if !stderr.is_empty() {
                app.log(format!("stderr: {}", stderr.trim_end()));
            }
            if let Some(repr) = result_repr {
                app.log(repr);
            }
            for name in new_tables {
                if !app.tabs.iter().any(|t| t.name == name) {
                    app.tabs.push(TableTab {
                        name: name.clone(),
                        window: None,
                        row_count: 0,
                        is_refreshing: false,
                        cursor: 0,
                        subscribed: false,
                    });
                    let new_index = app.tabs.len();
                    switch_tab(app, session, new_index).await;
                }
            }
        }
        Ok(Reply::Error { message, .. }) => app.log(format!("error: {message}")),
        Ok(_) => {}
        Err(e) => app.log(format!("runner error: {}", e.message)),
    }
}

fn render(f: &mut Frame, app: &App) {
    let size = f.area();
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(3),
            Constraint::Length(if matches!(app.focus, Focus::ReverseSearch) { 3 } else { 4 }),
        ])
        .split(size);

    render_tab_bar(f, rows[0], app);

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Min(20), Constraint::Length(28)])
        .split(rows[1]);

    if app.active_tab == 0 {
        render_log(f, body[0], app);
    } else {
        render_table(f, body[0], app);
    }
    render_sidebar(f, body[1], app);

    if matches!(app.focus, Focus::ReverseSearch) {
        render_reverse_search(f, rows[2], app);
    } else {
        render_input(f, rows[2], app);
    }
}

fn render_tab_bar(f: &mut Frame, area: Rect, app: &App) {
    let mut titles = vec![Line::from("log")];
    for tab in &app.tabs {
        let badge = if tab.is_refreshing { " LIVE" } else { "" };
        titles.push(Line::from(format!("{} ({}{})", tab.name, tab.row_count, badge)));
    }
    let tabs = Tabs::new(titles)
        .select(app.active_tab)
        .highlight_style(Style::default().add_modifier(Modifier::BOLD).fg(Color::Cyan));
    f.render_widget(tabs, area);
}

fn render_log(f: &mut Frame, area: Rect, app: &App) {
    let items: Vec<ListItem> = app
        .log_lines
        .iter()
        .rev()
        .take(area.height as usize)
        .rev()
        .map(|l| ListItem::new(l.as_str()))
        .collect();
    let list = List::new(items).block(Block::default().borders(Borders::ALL).title("log"));
    f.render_widget(list, area);
}

fn render_table(f: &mut Frame, area: Rect, app: &App) {
    let Some(tab) = app.active_table_tab() else {
        return;
    };
    let Some(window) = &tab.window else {
        f.render_widget(
            Paragraph::new("waiting for data...").block(Block::default().borders(Borders::ALL).title(tab.name.as_str())),
            area,
        );
        return;
    };

    let header = Row::new(window.columns.iter().map(|c| c.name.clone()));
    let rows = window.rows.iter().map(|r| Row::new(r.clone()));
    let widths: Vec<Constraint> = window
        .columns
        .iter()
        .map(|_| Constraint::Ratio(1, window.columns.len().max(1) as u32))
        .collect();

    let table = Table::new(rows, widths)
        .header(header.style(Style::default().add_modifier(Modifier::BOLD)))
        .block(Block::default().borders(Borders::ALL).title(tab.name.as_str()));
    f.render_widget(table, area);
}

fn render_sidebar(f: &mut Frame, area: Rect, app: &App) {
    let mut lines = vec![Line::from(app.status_line.as_str())];
    if let Some(info) = &app.server_info {
        lines.push(Line::from(format!("engine {}", info.engine_version)));
        lines.push(Line::from(format!("mode {}", info.mode)));
        lines.push(Line::from(if info.connected { "connected" } else { "disconnected" }));
    }
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("server"));
    f.render_widget(p, area);
}

fn render_input(f: &mut Frame, area: Rect, app: &App) {
    let rows = app.input.matches('\n').count() + 1;
    let _ = rows;
    let p = Paragraph::new(app.input.as_str())
        .block(Block::default().borders(Borders::ALL).title("input"));
    f.render_widget(p, area);
}

fn render_reverse_search(f: &mut Frame, area: Rect, app: &App) {
    let hit = app.search_results.get(app.search_index).map(String::as_str).unwrap_or("");
    let text = format!("(reverse-i-search)`{}': {}", app.search_query, hit);
    let p = Paragraph::new(Span::raw(text)).block(Block::default().borders(Borders::ALL));
    f.render_widget(p, area);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_statement_is_not_incomplete() {
        assert!(!is_incomplete("print('hello')"));
        assert!(!is_incomplete("t = empty_table(5)"));
    }

    #[test]
    fn trailing_colon_is_incomplete() {
        assert!(is_incomplete("if x:"));
        assert!(is_incomplete("for i in range(10):"));
    }

    #[test]
    fn unbalanced_brackets_are_incomplete() {
        assert!(is_incomplete("t = empty_table(5"));
        assert!(is_incomplete("x = [1, 2,"));
        assert!(!is_incomplete("x = [1, 2]"));
    }

    #[test]
    fn open_triple_quoted_string_is_incomplete() {
        assert!(is_incomplete("s = \"\"\"still open"));
        assert!(!is_incomplete("s = \"\"\"closed\"\"\""));
    }

    #[test]
    fn colon_inside_string_does_not_count() {
        assert!(!is_incomplete("print('a:')"));
    }
}

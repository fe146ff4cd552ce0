use std::{
    io::{self, Stdout},
    path::Path,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use crossbeam_channel::{never, select, unbounded, Receiver, Sender};
use crossterm::{
    event::{
        self, DisableBracketedPaste, EnableBracketedPaste, Event, KeyCode, KeyEvent, KeyEventKind,
        KeyModifiers,
    },
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    layout::{Alignment, Constraint, Direction, Flex, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table, TableState, Wrap},
    Frame, Terminal,
};

use crate::{
    agent::AgentClient,
    config::AppConfig,
    model::{
        completion_message, display_name, format_bytes, format_progress, format_speed,
        TorrentStatus, COMPLETE_PERCENT,
    },
    reconcile::{Poller, ReconcileEvent, Reconciler},
    registry::{AddOutcome, Registry},
};

type Backend = ratatui::backend::CrosstermBackend<Stdout>;

const PROGRESS_BAR_WIDTH: usize = 20;

pub fn run(config: AppConfig) -> Result<()> {
    let client =
        AgentClient::new(config.agent.clone()).context("failed to construct agent client")?;
    let registry = Arc::new(Registry::new(config.duplicate_policy));
    let (reconcile_tx, reconcile_rx) = unbounded();
    let reconciler = Reconciler::new(Arc::new(client), Arc::clone(&registry), reconcile_tx);
    let mut poller = Poller::spawn(reconciler, config.poll_interval);

    let mut terminal = setup_terminal()?;
    let (event_tx, event_rx) = unbounded();
    let input_handle = spawn_input_thread(event_tx.clone());

    let mut app = App::new(&config, registry);
    app.set_status(Notice::new(
        Tone::Info,
        format!(
            "Polling every {:.1}s; press a to add a torrent",
            config.poll_interval.as_secs_f64()
        ),
    ));

    let loop_result = run_loop(&mut terminal, &mut app, event_rx, reconcile_rx, &poller);

    poller.stop();
    drop(event_tx);

    restore_terminal(&mut terminal)?;
    input_handle.join().ok();

    loop_result
}

fn run_loop(
    terminal: &mut Terminal<Backend>,
    app: &mut App,
    events: Receiver<AppEvent>,
    mut reconcile: Receiver<ReconcileEvent>,
    poller: &Poller,
) -> Result<()> {
    terminal.draw(|f| app.render(f))?;
    loop {
        let wake = select! {
            recv(events) -> event => Wake::App(event.ok()),
            recv(reconcile) -> event => Wake::Reconcile(event.ok()),
        };
        match wake {
            Wake::App(Some(event)) => {
                if app.process_event(event, poller)? {
                    break;
                }
            }
            Wake::App(None) => break,
            Wake::Reconcile(Some(event)) => app.apply_reconcile_event(event),
            Wake::Reconcile(None) => {
                reconcile = never();
                app.notify(Notice::new(Tone::Bad, "Progress polling stopped"));
            }
        }
        terminal.draw(|f| app.render(f))?;
    }
    Ok(())
}

fn setup_terminal() -> Result<Terminal<Backend>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableBracketedPaste)?;
    let backend = ratatui::backend::CrosstermBackend::new(stdout);
    Ok(Terminal::new(backend)?)
}

fn restore_terminal(terminal: &mut Terminal<Backend>) -> Result<()> {
    disable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, DisableBracketedPaste, LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

fn spawn_input_thread(tx: Sender<AppEvent>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let tick_rate = Duration::from_millis(250);
        loop {
            let event = match event::poll(tick_rate) {
                Ok(true) => match event::read() {
                    Ok(evt) => AppEvent::Input(evt),
                    Err(err) => AppEvent::InputError(err.to_string()),
                },
                Ok(false) | Err(_) => AppEvent::Tick,
            };
            if tx.send(event).is_err() {
                break;
            }
        }
    })
}

enum Wake {
    App(Option<AppEvent>),
    Reconcile(Option<ReconcileEvent>),
}

enum AppEvent {
    Input(Event),
    InputError(String),
    Tick,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tone {
    Info,
    Good,
    Warn,
    Bad,
}

impl Tone {
    fn style(self) -> Style {
        let style = Style::default();
        match self {
            Tone::Info => style.fg(Color::Blue),
            Tone::Good => style.fg(Color::Green),
            Tone::Warn => style.fg(Color::Yellow),
            Tone::Bad => style.fg(Color::Red).add_modifier(Modifier::BOLD),
        }
    }
}

/// A line of feedback for the header, optionally mirrored as a toast.
#[derive(Clone, Debug)]
struct Notice {
    text: String,
    tone: Tone,
    expires_at: Instant,
}

impl Notice {
    fn new(tone: Tone, text: impl Into<String>) -> Self {
        let ttl = match tone {
            Tone::Info | Tone::Good => Duration::from_secs(4),
            Tone::Warn | Tone::Bad => Duration::from_secs(8),
        };
        Self {
            text: text.into(),
            tone,
            expires_at: Instant::now() + ttl,
        }
    }

    fn line(&self) -> Line<'_> {
        Line::from(Span::styled(self.text.as_str(), self.tone.style()))
    }
}

struct App {
    connection_label: String,
    registry: Arc<Registry>,
    table_state: TableState,
    selected_name: Option<String>,
    status: Option<Notice>,
    toast: Option<Notice>,
    mode: InputMode,
}

impl App {
    fn new(config: &AppConfig, registry: Arc<Registry>) -> Self {
        Self {
            connection_label: config.agent.base_url(),
            registry,
            table_state: TableState::default(),
            selected_name: None,
            status: None,
            toast: None,
            mode: InputMode::Normal,
        }
    }

    fn render(&mut self, frame: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(4),
                Constraint::Min(0),
                Constraint::Length(1),
            ])
            .split(frame.size());
        self.render_header(frame, chunks[0]);
        self.render_table(frame, chunks[1]);
        self.render_footer(frame, chunks[2]);
        self.render_toast(frame);
        match &self.mode {
            InputMode::Prompt(buffer) => {
                let area = centered_rect(60, 30, frame.size());
                let block = Block::default()
                    .title(Span::raw(" Add torrent "))
                    .borders(Borders::ALL);
                let text = vec![
                    Line::from("Path to a .torrent file, Enter to submit (Esc to cancel)"),
                    Line::from(format!("> {buffer}")),
                ];
                let paragraph = Paragraph::new(text).block(block).wrap(Wrap { trim: true });
                frame.render_widget(Clear, area);
                frame.render_widget(paragraph, area);
            }
            InputMode::Help => {
                let area = centered_rect(60, 60, frame.size());
                let block = Block::default().title("Key Bindings").borders(Borders::ALL);
                let paragraph = Paragraph::new(help_lines())
                    .block(block)
                    .wrap(Wrap { trim: false });
                frame.render_widget(Clear, area);
                frame.render_widget(paragraph, area);
            }
            InputMode::Normal => {}
        }
    }

    fn render_header(&self, frame: &mut Frame, area: Rect) {
        let mut lines = vec![
            Line::from(vec![
                Span::styled(
                    "Flash Torrent",
                    Style::default().add_modifier(Modifier::BOLD),
                ),
                Span::raw("  |  "),
                Span::raw(&self.connection_label),
            ]),
            Line::from(format!("Tracking {} torrents", self.registry.len())),
        ];
        lines.extend(self.status.as_ref().map(Notice::line));
        let paragraph = Paragraph::new(lines).block(
            Block::default()
                .borders(Borders::ALL)
                .title(Span::raw(" Agent ")),
        );
        frame.render_widget(paragraph, area);
    }

    fn render_table(&mut self, frame: &mut Frame, area: Rect) {
        let snapshot = self.registry.snapshot();
        let block = Block::default()
            .borders(Borders::ALL)
            .title(Span::raw(" Torrents "));
        if snapshot.is_empty() {
            let paragraph = Paragraph::new("No torrents tracked; press a to add one")
                .block(block)
                .alignment(Alignment::Center);
            frame.render_widget(paragraph, area);
            return;
        }
        let header = Row::new(["Torrent", "Progress", "Down", "Size", "ETA"])
            .style(Style::default().add_modifier(Modifier::BOLD));
        let rows = snapshot.iter().map(|torrent| {
            let progress_color = if torrent.is_complete() {
                Color::Green
            } else {
                Color::Cyan
            };
            let [name, progress, speed, size, eta] = row_cells(torrent);
            Row::new([
                Cell::from(name),
                Cell::from(progress).style(Style::default().fg(progress_color)),
                Cell::from(speed),
                Cell::from(size),
                Cell::from(eta),
            ])
        });
        let widths = [
            Constraint::Percentage(35),
            Constraint::Percentage(35),
            Constraint::Percentage(10),
            Constraint::Percentage(10),
            Constraint::Percentage(10),
        ];
        let table = Table::new(rows, widths)
            .header(header)
            .block(block)
            .highlight_style(Style::default().fg(Color::Yellow))
            .highlight_symbol("> ");
        frame.render_stateful_widget(table, area, &mut self.table_state);
    }

    fn render_footer(&self, frame: &mut Frame, area: Rect) {
        let mode_label = match &self.mode {
            InputMode::Normal => "NORMAL",
            InputMode::Prompt(_) => "PROMPT",
            InputMode::Help => "HELP",
        };
        let sections = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Min(0), Constraint::Length(14)])
            .split(area);
        let left = Paragraph::new(Line::from(format!("Mode {mode_label}")));
        frame.render_widget(left, sections[0]);
        let help_label =
            Paragraph::new(Line::from(Span::raw("Help [?]"))).alignment(Alignment::Right);
        frame.render_widget(help_label, sections[1]);
    }

    fn render_toast(&self, frame: &mut Frame) {
        if !matches!(self.mode, InputMode::Normal) {
            return;
        }
        let (Some(toast), Some(area)) = (&self.toast, toast_area(frame.size())) else {
            return;
        };
        let paragraph = Paragraph::new(toast.line()).alignment(Alignment::Center).block(
            Block::default()
                .borders(Borders::ALL)
                .title(Span::raw(" Notice ")),
        );
        frame.render_widget(Clear, area);
        frame.render_widget(paragraph, area);
    }

    fn process_event(&mut self, event: AppEvent, poller: &Poller) -> Result<bool> {
        match event {
            AppEvent::Input(event) => self.handle_input(event, poller),
            AppEvent::InputError(err) => {
                self.set_status(Notice::new(Tone::Bad, format!("Input error: {err}")));
                Ok(false)
            }
            AppEvent::Tick => {
                self.expire_notices();
                Ok(false)
            }
        }
    }

    fn apply_reconcile_event(&mut self, event: ReconcileEvent) {
        match event {
            ReconcileEvent::Completed { name } => {
                self.notify(Notice::new(Tone::Good, completion_message(&name)));
            }
            ReconcileEvent::FetchFailed { name, error } => {
                let text = format!("No progress for {}: {error}", display_name(&name));
                self.set_status(Notice::new(Tone::Warn, text));
            }
            ReconcileEvent::Submitted { name } => {
                let text = format!("Agent accepted {}", display_name(&name));
                self.set_status(Notice::new(Tone::Good, text));
            }
            ReconcileEvent::SubmitFailed { name, error } => {
                let text = format!("Submitting {} failed: {error}", display_name(&name));
                self.notify(Notice::new(Tone::Bad, text));
            }
            ReconcileEvent::TickFinished => {}
        }
        self.sync_selection();
    }

    fn handle_input(&mut self, event: Event, poller: &Poller) -> Result<bool> {
        match event {
            Event::Key(key) if key.kind == KeyEventKind::Press => {
                if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
                    return Ok(true);
                }
                match self.mode {
                    InputMode::Normal => return self.handle_normal_key(key, poller),
                    InputMode::Prompt(_) => self.handle_prompt_key(key, poller),
                    InputMode::Help => {
                        let close = matches!(
                            key.code,
                            KeyCode::Char('?' | 'q') | KeyCode::Esc | KeyCode::Enter
                        );
                        if close {
                            self.mode = InputMode::Normal;
                        }
                    }
                }
            }
            // a pasted path opens the prompt pre-filled
            Event::Paste(data) => match &mut self.mode {
                InputMode::Prompt(buffer) => buffer.push_str(&data),
                _ => self.mode = InputMode::Prompt(data.trim().to_string()),
            },
            _ => {}
        }
        Ok(false)
    }

    fn handle_prompt_key(&mut self, key: KeyEvent, poller: &Poller) {
        let InputMode::Prompt(buffer) = &mut self.mode else {
            return;
        };
        match key.code {
            KeyCode::Char(c) => buffer.push(c),
            KeyCode::Backspace => {
                buffer.pop();
            }
            KeyCode::Esc => self.mode = InputMode::Normal,
            KeyCode::Enter => {
                let path = buffer.trim().to_string();
                self.mode = InputMode::Normal;
                if !path.is_empty() {
                    self.add_torrent(&path, poller);
                }
            }
            _ => {}
        }
    }

    fn handle_normal_key(&mut self, key: KeyEvent, poller: &Poller) -> Result<bool> {
        match key.code {
            KeyCode::Char('q') => Ok(true),
            KeyCode::Char('a') => {
                self.mode = InputMode::Prompt(String::new());
                Ok(false)
            }
            KeyCode::Char('r' | 'R') => {
                let notice = match poller.refresh() {
                    Ok(()) => Notice::new(Tone::Info, "Refreshing…"),
                    Err(err) => Notice::new(Tone::Bad, format!("Refresh failed: {err}")),
                };
                self.set_status(notice);
                Ok(false)
            }
            KeyCode::Char('j') | KeyCode::Down => {
                self.move_selection(1);
                Ok(false)
            }
            KeyCode::Char('k') | KeyCode::Up => {
                self.move_selection(-1);
                Ok(false)
            }
            KeyCode::Char('g') => {
                self.select_index(Some(0));
                Ok(false)
            }
            KeyCode::Char('G') => {
                let last = self.registry.len().checked_sub(1);
                self.select_index(last);
                Ok(false)
            }
            KeyCode::Char('?') => {
                self.mode = InputMode::Help;
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    fn add_torrent(&mut self, value: &str, poller: &Poller) {
        let path = Path::new(value);
        let label = path
            .file_name()
            .map(|name| display_name(&name.to_string_lossy()).to_string())
            .unwrap_or_else(|| value.to_string());
        match poller.add_torrent(path) {
            Ok(AddOutcome::Added) => {
                self.set_status(Notice::new(Tone::Info, format!("Submitting {label}…")));
            }
            Ok(AddOutcome::Replaced) => {
                let text = format!("{label} was already tracked; resubmitting");
                self.set_status(Notice::new(Tone::Warn, text));
            }
            Ok(AddOutcome::Rejected) => {
                self.set_status(Notice::new(Tone::Warn, format!("{label} is already tracked")));
            }
            Err(err) => self.notify(Notice::new(Tone::Bad, format!("Add failed: {err:#}"))),
        }
        self.sync_selection();
    }

    fn move_selection(&mut self, delta: isize) {
        if self.registry.is_empty() {
            return;
        }
        let len = self.registry.len();
        let max_index = len as isize - 1;
        let current = self.table_state.selected().unwrap_or(0) as isize;
        let next = (current + delta).clamp(0, max_index) as usize;
        self.select_index(Some(next));
    }

    fn select_index(&mut self, index: Option<usize>) {
        let snapshot = self.registry.snapshot();
        let index = index.filter(|&i| i < snapshot.len());
        self.table_state.select(index);
        self.selected_name = index.map(|i| snapshot[i].name.clone());
    }

    // Keeps the highlight on the same torrent while rows come and go.
    fn sync_selection(&mut self) {
        let snapshot = self.registry.snapshot();
        if snapshot.is_empty() {
            self.table_state.select(None);
            self.selected_name = None;
            return;
        }
        if let Some(name) = &self.selected_name {
            if let Some(pos) = snapshot.iter().position(|t| &t.name == name) {
                self.table_state.select(Some(pos));
                return;
            }
        }
        let index = self
            .table_state
            .selected()
            .unwrap_or(0)
            .min(snapshot.len() - 1);
        self.table_state.select(Some(index));
        self.selected_name = Some(snapshot[index].name.clone());
    }

    fn expire_notices(&mut self) {
        let now = Instant::now();
        for slot in [&mut self.status, &mut self.toast] {
            if slot.as_ref().is_some_and(|notice| now >= notice.expires_at) {
                *slot = None;
            }
        }
    }

    fn set_status(&mut self, notice: Notice) {
        self.status = Some(notice);
    }

    /// Status line plus a transient toast.
    fn notify(&mut self, notice: Notice) {
        self.toast = Some(notice.clone());
        self.status = Some(notice);
    }
}

enum InputMode {
    Normal,
    /// Path typed so far.
    Prompt(String),
    Help,
}

/// Torrent, progress, speed, size and ETA columns. Speed and size are blank
/// once the download is complete.
fn row_cells(torrent: &TorrentStatus) -> [String; 5] {
    let complete = torrent.is_complete();
    [
        torrent.display_name().to_string(),
        format!(
            "{} {:>4}",
            progress_bar(torrent.progress, PROGRESS_BAR_WIDTH),
            format_progress(torrent.progress)
        ),
        if complete {
            String::new()
        } else {
            format_speed(torrent.download_speed)
        },
        if complete {
            String::new()
        } else {
            format_bytes(torrent.size)
        },
        torrent.eta(),
    ]
}

fn progress_bar(progress: u8, width: usize) -> String {
    let progress = usize::from(progress.min(COMPLETE_PERCENT));
    let filled = progress * width / usize::from(COMPLETE_PERCENT);
    format!("{}{}", "█".repeat(filled), "░".repeat(width - filled))
}

fn centered_rect(width_pct: u16, height_pct: u16, area: Rect) -> Rect {
    let [row] = Layout::vertical([Constraint::Percentage(height_pct)])
        .flex(Flex::Center)
        .areas(area);
    let [popup] = Layout::horizontal([Constraint::Percentage(width_pct)])
        .flex(Flex::Center)
        .areas(row);
    popup
}

/// Three rows high in the bottom-right corner, two cells off the edges.
/// `None` when the terminal is too small to fit one.
fn toast_area(frame: Rect) -> Option<Rect> {
    const MARGIN: u16 = 2;
    const HEIGHT: u16 = 3;
    if frame.width < 20 || frame.height < HEIGHT + MARGIN {
        return None;
    }
    let width = frame.width.saturating_sub(MARGIN * 2).clamp(20, 60);
    Some(Rect::new(
        frame.right().saturating_sub(width + MARGIN),
        frame.bottom() - HEIGHT - MARGIN,
        width,
        HEIGHT,
    ))
}

fn help_lines() -> Vec<Line<'static>> {
    let heading = |text: &'static str| {
        Line::from(Span::styled(
            text,
            Style::default().add_modifier(Modifier::BOLD | Modifier::UNDERLINED),
        ))
    };
    vec![
        heading("Navigation"),
        Line::from("  j / k: move selection"),
        Line::from("  g / G: jump to first / last"),
        Line::from(""),
        heading("Actions"),
        Line::from("  a: add a .torrent file (or paste its path)"),
        Line::from("  r: poll the agent now"),
        Line::from("  ?: toggle this help"),
        Line::from("  q or Ctrl+c: quit"),
    ]
}

#[cfg(test)]
mod tests {
    use log::LevelFilter;

    use super::*;
    use crate::{config::AgentConfig, registry::DuplicatePolicy};

    fn app() -> App {
        let config = AppConfig {
            agent: AgentConfig::default(),
            poll_interval: Duration::from_secs(2),
            duplicate_policy: DuplicatePolicy::Reject,
            log_level: LevelFilter::Info,
        };
        App::new(&config, Arc::new(Registry::default()))
    }

    fn status(name: &str, progress: u8, download_speed: f64, size: u64) -> TorrentStatus {
        TorrentStatus {
            name: name.to_string(),
            progress,
            download_speed,
            size,
        }
    }

    #[test]
    fn progress_bar_fills_proportionally() {
        assert_eq!(progress_bar(0, 10), "░".repeat(10));
        assert_eq!(progress_bar(40, 10), format!("{}{}", "█".repeat(4), "░".repeat(6)));
        assert_eq!(progress_bar(100, 10), "█".repeat(10));
    }

    #[test]
    fn row_shows_rates_while_downloading() {
        let [name, progress, speed, size, eta] =
            row_cells(&status("x.torrent", 40, 1024.0, 10240));
        assert_eq!(name, "x");
        assert!(progress.ends_with(" 40%"));
        assert_eq!(speed, "1 KB/s");
        assert_eq!(size, "10 KB");
        assert_eq!(eta, "10s");
    }

    #[test]
    fn row_blanks_rates_when_complete() {
        let [_, _, speed, size, eta] = row_cells(&status("x.torrent", 100, 0.0, 0));
        assert!(speed.is_empty());
        assert!(size.is_empty());
        assert_eq!(eta, "∞");
    }

    #[test]
    fn completion_raises_a_toast() {
        let mut app = app();
        app.apply_reconcile_event(ReconcileEvent::Completed {
            name: "ubuntu.torrent".to_string(),
        });
        let toast = app.toast.as_ref().unwrap();
        assert_eq!(toast.text, "ubuntu downloaded!");
        assert_eq!(toast.tone, Tone::Good);
    }

    #[test]
    fn fetch_failures_only_touch_the_status_line() {
        let mut app = app();
        app.apply_reconcile_event(ReconcileEvent::FetchFailed {
            name: "x.torrent".to_string(),
            error: "unexpected http status 404 Not Found".to_string(),
        });
        assert!(app.toast.is_none());
        assert_eq!(app.status.as_ref().unwrap().tone, Tone::Warn);
    }

    #[test]
    fn toast_sits_bottom_right_and_skips_tiny_terminals() {
        assert_eq!(
            toast_area(Rect::new(0, 0, 100, 30)),
            Some(Rect::new(38, 25, 60, 3))
        );
        assert_eq!(
            toast_area(Rect::new(0, 0, 30, 10)),
            Some(Rect::new(2, 5, 26, 3))
        );
        assert_eq!(toast_area(Rect::new(0, 0, 19, 10)), None);
        assert_eq!(toast_area(Rect::new(0, 0, 80, 4)), None);
    }

    #[test]
    fn expired_notices_are_cleared() {
        let mut app = app();
        app.notify(Notice {
            text: "old".to_string(),
            tone: Tone::Bad,
            expires_at: Instant::now(),
        });
        app.expire_notices();
        assert!(app.status.is_none());
        assert!(app.toast.is_none());

        app.set_status(Notice::new(Tone::Info, "fresh"));
        app.expire_notices();
        assert_eq!(app.status.as_ref().unwrap().text, "fresh");
    }

    #[test]
    fn selection_follows_torrent_when_rows_disappear() {
        let mut app = app();
        for name in ["a.torrent", "b.torrent", "c.torrent"] {
            app.registry.add(TorrentStatus::optimistic(name));
        }
        app.select_index(Some(2));
        app.registry.remove_by_name("a.torrent");
        app.apply_reconcile_event(ReconcileEvent::TickFinished);
        assert_eq!(app.table_state.selected(), Some(1));
        assert_eq!(app.selected_name.as_deref(), Some("c.torrent"));

        app.registry.remove_by_name("c.torrent");
        app.apply_reconcile_event(ReconcileEvent::TickFinished);
        assert_eq!(app.table_state.selected(), Some(0));
        assert_eq!(app.selected_name.as_deref(), Some("b.torrent"));

        app.registry.remove_by_name("b.torrent");
        app.apply_reconcile_event(ReconcileEvent::TickFinished);
        assert_eq!(app.table_state.selected(), None);
    }
}

use std::collections::VecDeque;
use std::io::{self, Stdout};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use crossterm::ExecutableCommand;
use crossterm::event::{
    self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyEventKind,
    MouseButton, MouseEvent, MouseEventKind,
};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use miette::IntoDiagnostic;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, Gauge, Paragraph, Row, Table, Wrap};

use crate::app::TableSession;
use crate::batch::BatchEvent;
use crate::error::FetchError;
use crate::progress::{CancelFlag, ChannelSink, ProgressEvent, ProgressSink};
use crate::table::{ColumnFilter, FocusDirection, TableEvent};
use crate::task::TaskRunner;
use crate::transfer::{TransferProgress, TransferState};

const TICK: Duration = Duration::from_millis(120);
const LOGS_MAX: usize = 200;
const DOUBLE_CLICK: Duration = Duration::from_millis(400);
const WHEEL_STEP: isize = 3;
const BROWSE_HELP: &str = "arrows/wheel: move  1-9/click header: sort  /: filter (Tab column)  \
                           Enter: open  x: export  q: quit";

/// Raw mode plus alternate screen, restored on drop.
struct TerminalSession {
    terminal: Terminal<CrosstermBackend<Stdout>>,
    mouse: bool,
}

impl TerminalSession {
    fn enter(mouse: bool) -> miette::Result<Self> {
        enable_raw_mode().into_diagnostic()?;
        let mut stdout = io::stdout();
        stdout.execute(EnterAlternateScreen).into_diagnostic()?;
        if mouse {
            stdout.execute(EnableMouseCapture).into_diagnostic()?;
        }
        let mut terminal = Terminal::new(CrosstermBackend::new(stdout)).into_diagnostic()?;
        terminal.clear().into_diagnostic()?;
        Ok(Self { terminal, mouse })
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let mut stdout = io::stdout();
        if self.mouse {
            let _ = stdout.execute(DisableMouseCapture);
        }
        let _ = stdout.execute(LeaveAlternateScreen);
    }
}

#[derive(Debug)]
struct MonitorState {
    status: String,
    transfer: Option<TransferProgress>,
    batch: Option<(usize, usize)>,
    current: Option<String>,
    failed: usize,
    logs: VecDeque<String>,
    started: Instant,
    confirming: bool,
    cancelling: bool,
}

impl MonitorState {
    fn new() -> Self {
        Self {
            status: "starting".to_string(),
            transfer: None,
            batch: None,
            current: None,
            failed: 0,
            logs: VecDeque::new(),
            started: Instant::now(),
            confirming: false,
            cancelling: false,
        }
    }

    fn apply(&mut self, event: ProgressEvent) {
        match event {
            ProgressEvent::Message(message) => {
                self.push_log(message);
            }
            ProgressEvent::Transfer(progress) => {
                self.status = match progress.state {
                    TransferState::Idle | TransferState::Connecting => {
                        format!("connecting for {}", progress.remote)
                    }
                    TransferState::Transferring => progress.describe(),
                    TransferState::Cancelling => "cancelling".to_string(),
                    TransferState::Completed => format!("{} done", progress.remote),
                    TransferState::Failed => format!("{} failed", progress.remote),
                };
                self.transfer = Some(progress);
            }
            ProgressEvent::Batch(event) => self.apply_batch(event),
        }
    }

    fn apply_batch(&mut self, event: BatchEvent) {
        match event {
            BatchEvent::ItemStarted {
                item,
                kind,
                position,
                total,
                ..
            } => {
                let label = format!("[{position}/{total}] {} {kind} ({})", item.id, item.name);
                self.push_log(format!("started {label}"));
                self.current = Some(label);
                self.transfer = None;
                if self.batch.is_none() {
                    self.batch = Some((0, total));
                }
            }
            BatchEvent::Progress { completed, total } => self.batch = Some((completed, total)),
            BatchEvent::ItemCompleted { path, bytes, .. } => {
                self.push_log(format!("saved {path} ({bytes} bytes)"));
            }
            BatchEvent::ItemFailed { kind, message, .. } => {
                self.failed += 1;
                self.push_log(format!("{kind} failed: {message}"));
            }
            BatchEvent::BatchCancelled { completed, total } => {
                self.status = format!("cancelled after {completed}/{total}");
                self.push_log(self.status.clone());
            }
            BatchEvent::Finished {
                completed,
                failed,
                total,
            } => {
                self.batch = Some((completed, total));
                self.status = format!("finished: {completed}/{total} saved, {failed} failed");
                self.push_log(self.status.clone());
            }
        }
    }

    fn push_log(&mut self, line: String) {
        if self.logs.len() == LOGS_MAX {
            self.logs.pop_front();
        }
        self.logs.push_back(line);
    }
}

pub struct Tui {
    title: String,
}

impl Tui {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
        }
    }

    /// Runs `f` on a worker thread and renders its progress until it returns.
    /// `c`, `q` or Esc ask for confirmation before raising the cancel flag.
    pub fn run<F, R>(&mut self, f: F) -> miette::Result<R>
    where
        F: FnOnce(&CancelFlag, &dyn ProgressSink) -> Result<R, FetchError> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let cancel = CancelFlag::new();
        let worker_cancel = cancel.clone();
        let mut handle = TaskRunner::new()
            .submit(&self.title, move || {
                let sink = ChannelSink::new(tx);
                f(&worker_cancel, &sink)
            })
            .into_diagnostic()?;

        let mut session = TerminalSession::enter(false)?;
        let mut state = MonitorState::new();
        let mut tick = 0usize;
        loop {
            while let Ok(event) = rx.try_recv() {
                state.apply(event);
            }

            session
                .terminal
                .draw(|frame| draw_monitor(frame, &self.title, &state, tick))
                .into_diagnostic()?;

            if let Some(result) = handle.try_result() {
                return result.map_err(miette::Report::new);
            }

            if event::poll(TICK).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    handle_monitor_key(&mut state, &cancel, key);
                }
            }
            tick = tick.wrapping_add(1);
        }
    }

    /// Interactive table browser. `export` enables the `x` key.
    pub fn browse(
        &mut self,
        table: &mut TableSession,
        export: Option<&Utf8Path>,
    ) -> miette::Result<()> {
        let mut session = TerminalSession::enter(true)?;
        let mut browser = Browser::default();
        loop {
            session
                .terminal
                .draw(|frame| draw_browser(frame, &self.title, table, &mut browser))
                .into_diagnostic()?;

            if !event::poll(TICK).into_diagnostic()? {
                continue;
            }
            let keep_open = match event::read().into_diagnostic()? {
                Event::Key(key) => browser.handle_key(table, key, export),
                Event::Mouse(mouse) => {
                    browser.handle_mouse(table, mouse);
                    true
                }
                _ => true,
            };
            browser.collect_events(table);
            if !keep_open {
                return Ok(());
            }
        }
    }
}

fn handle_monitor_key(state: &mut MonitorState, cancel: &CancelFlag, key: KeyEvent) {
    if key.kind != KeyEventKind::Press {
        return;
    }
    if state.confirming {
        match key.code {
            KeyCode::Char('y') | KeyCode::Char('Y') => {
                cancel.cancel();
                state.confirming = false;
                state.cancelling = true;
                state.status = "cancelling".to_string();
            }
            KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => state.confirming = false,
            _ => {}
        }
        return;
    }
    if matches!(
        key.code,
        KeyCode::Char('c') | KeyCode::Char('q') | KeyCode::Esc
    ) && !state.cancelling
    {
        state.confirming = true;
    }
}

#[derive(Default)]
struct Browser {
    body: Rect,
    header: Rect,
    filter_input: Option<String>,
    filter_column: usize,
    status: String,
    last_click: Option<(Instant, usize)>,
}

impl Browser {
    fn handle_key(
        &mut self,
        table: &mut TableSession,
        key: KeyEvent,
        export: Option<&Utf8Path>,
    ) -> bool {
        if key.kind != KeyEventKind::Press {
            return true;
        }
        if let Some(input) = self.filter_input.as_mut() {
            match key.code {
                KeyCode::Enter => {
                    let needle = std::mem::take(input);
                    self.filter_input = None;
                    let filter = (!needle.is_empty())
                        .then(|| ColumnFilter::new(self.filter_column, &needle));
                    table.view.set_filter(filter);
                }
                KeyCode::Esc => self.filter_input = None,
                KeyCode::Tab => {
                    self.filter_column = (self.filter_column + 1) % table.columns.len().max(1);
                }
                KeyCode::Backspace => {
                    input.pop();
                }
                KeyCode::Char(ch) => input.push(ch),
                _ => {}
            }
            return true;
        }

        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => return false,
            KeyCode::Down => {
                self.ensure_focus(table);
                table.view.move_focus(FocusDirection::Down);
            }
            KeyCode::Up => {
                self.ensure_focus(table);
                table.view.move_focus(FocusDirection::Up);
            }
            KeyCode::PageDown => table.view.scroll(table.view.capacity() as isize),
            KeyCode::PageUp => table.view.scroll(-(table.view.capacity() as isize)),
            KeyCode::Tab => {
                if table.view.has_focus() {
                    table.view.focus_out();
                } else {
                    table.view.focus_in();
                }
            }
            KeyCode::Enter | KeyCode::Char(' ') => table.view.activate(),
            KeyCode::Char('/') => self.filter_input = Some(String::new()),
            KeyCode::Char('x') => {
                self.status = match export {
                    Some(path) => match table.export(path) {
                        Ok(result) => format!("exported {} rows to {}", result.rows, result.path),
                        Err(err) => err.to_string(),
                    },
                    None => "start with --export PATH to enable export".to_string(),
                };
            }
            KeyCode::Char(ch) if ch.is_ascii_digit() && ch != '0' => {
                let column = ch as usize - '1' as usize;
                table.view.sort_by_column(column);
            }
            _ => {}
        }
        true
    }

    fn ensure_focus(&self, table: &mut TableSession) {
        if !table.view.has_focus() {
            table.view.focus_in();
        }
    }

    fn handle_mouse(&mut self, table: &mut TableSession, mouse: MouseEvent) {
        match mouse.kind {
            MouseEventKind::ScrollDown => table.view.scroll(WHEEL_STEP),
            MouseEventKind::ScrollUp => table.view.scroll(-WHEEL_STEP),
            MouseEventKind::Down(MouseButton::Left) => {
                if contains(self.header, mouse.column, mouse.row) {
                    if let Some(column) = self.column_at(table, mouse.column) {
                        table.view.sort_by_column(column);
                    }
                    return;
                }
                if !contains(self.body, mouse.column, mouse.row) {
                    table.view.focus_out();
                    return;
                }
                let slot = usize::from(mouse.row - self.body.y);
                table.view.pointer_press(slot);
                if !table.view.has_focus() {
                    table.view.focus_in();
                }
                let now = Instant::now();
                if let Some((at, previous)) = self.last_click {
                    if previous == slot && now.duration_since(at) <= DOUBLE_CLICK {
                        table.view.activate();
                        self.last_click = None;
                        return;
                    }
                }
                self.last_click = Some((now, slot));
            }
            _ => {}
        }
    }

    fn column_at(&self, table: &TableSession, x: u16) -> Option<usize> {
        let areas = Layout::default()
            .direction(Direction::Horizontal)
            .constraints(column_constraints(table))
            .split(self.header);
        areas.iter().position(|area| x >= area.x && x < area.x + area.width)
    }

    fn collect_events(&mut self, table: &mut TableSession) {
        for event in table.view.take_events() {
            if let TableEvent::RowActivated { position, source } = event {
                let summary = table
                    .view
                    .selected_row()
                    .map(|row| {
                        row.cells()
                            .iter()
                            .take(3)
                            .map(|cell| cell.as_text())
                            .collect::<Vec<_>>()
                            .join(" | ")
                    })
                    .unwrap_or_default();
                self.status = format!("row {} (line {}): {summary}", position + 1, source + 2);
            }
        }
    }
}

fn contains(area: Rect, x: u16, y: u16) -> bool {
    x >= area.x && x < area.x + area.width && y >= area.y && y < area.y + area.height
}

fn column_constraints(table: &TableSession) -> Vec<Constraint> {
    let columns = table.view.columns();
    let total: u32 = columns.iter().map(|column| u32::from(column.width)).sum();
    columns
        .iter()
        .map(|column| Constraint::Ratio(u32::from(column.width), total.max(1)))
        .collect()
}

fn draw_monitor(frame: &mut ratatui::Frame, title: &str, state: &MonitorState, tick: usize) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Min(5),
            Constraint::Length(1),
        ])
        .split(frame.area());

    let spinner = ['|', '/', '-', '\\'][tick % 4];
    let header = Paragraph::new(Line::from(vec![
        Span::styled(
            format!("{spinner} {title}"),
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ),
        Span::raw(format!("  {}", state.status)),
        Span::styled(
            format!("  {}s", state.started.elapsed().as_secs()),
            Style::default().fg(Color::DarkGray),
        ),
    ]))
    .block(Block::default().borders(Borders::ALL).title("bvbrc-fetch"));
    frame.render_widget(header, chunks[0]);

    let (ratio, label) = match &state.transfer {
        Some(progress) => (progress.fraction().unwrap_or(0.0), progress.describe()),
        None => (0.0, "waiting".to_string()),
    };
    let file_title = state.current.clone().unwrap_or_else(|| "Transfer".to_string());
    let transfer = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(file_title))
        .gauge_style(Style::default().fg(Color::Green))
        .ratio(ratio.clamp(0.0, 1.0))
        .label(label);
    frame.render_widget(transfer, chunks[1]);

    let (ratio, label) = match state.batch {
        Some((_, 0)) | None => (0.0, "single file".to_string()),
        Some((completed, total)) => (
            completed as f64 / total as f64,
            format!("{completed}/{total} artifacts, {} failed", state.failed),
        ),
    };
    let batch = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Batch"))
        .gauge_style(Style::default().fg(Color::Yellow))
        .ratio(ratio.clamp(0.0, 1.0))
        .label(label);
    frame.render_widget(batch, chunks[2]);

    let visible = usize::from(chunks[3].height.saturating_sub(2));
    let lines: Vec<Line> = state
        .logs
        .iter()
        .skip(state.logs.len().saturating_sub(visible))
        .map(|line| Line::from(line.clone()))
        .collect();
    let logs = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .block(Block::default().borders(Borders::ALL).title("Log"));
    frame.render_widget(logs, chunks[3]);

    let footer = Paragraph::new("c / q / Esc: cancel").style(Style::default().fg(Color::DarkGray));
    frame.render_widget(footer, chunks[4]);

    if state.confirming {
        draw_confirm(frame, "Cancel the running operation?");
    }
}

fn draw_confirm(frame: &mut ratatui::Frame, question: &str) {
    let area = centered(frame.area(), 50, 5);
    let text = Paragraph::new(vec![
        Line::from(question.to_string()),
        Line::from("Press y to confirm, n to keep going."),
    ])
    .alignment(Alignment::Center)
    .block(Block::default().borders(Borders::ALL).title("Confirm"));
    frame.render_widget(Clear, area);
    frame.render_widget(text, area);
}

fn centered(area: Rect, width: u16, height: u16) -> Rect {
    let width = width.min(area.width);
    let height = height.min(area.height);
    Rect {
        x: area.x + (area.width - width) / 2,
        y: area.y + (area.height - height) / 2,
        width,
        height,
    }
}

fn draw_browser(
    frame: &mut ratatui::Frame,
    title: &str,
    table: &mut TableSession,
    browser: &mut Browser,
) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(4),
            Constraint::Length(1),
        ])
        .split(frame.area());

    // border plus header row
    let inner = chunks[1].inner(ratatui::layout::Margin {
        horizontal: 1,
        vertical: 1,
    });
    browser.header = Rect { height: 1, ..inner };
    browser.body = Rect {
        y: inner.y + 1,
        height: inner.height.saturating_sub(1),
        ..inner
    };
    table.view.set_viewport(usize::from(browser.body.height.max(1)));

    let sort = table
        .view
        .sort_spec()
        .keys()
        .iter()
        .map(|key| {
            let arrow = if key.ascending { "asc" } else { "desc" };
            let label = table.columns.get(key.column).map(String::as_str).unwrap_or("?");
            format!("{label} {arrow}")
        })
        .collect::<Vec<_>>()
        .join(", ");
    let filter = match (&browser.filter_input, table.view.filter()) {
        (Some(input), _) => format!(
            "filter {}: {input}_",
            table.columns.get(browser.filter_column).map(String::as_str).unwrap_or("?")
        ),
        (None, Some(active)) => format!(
            "filtered on {}",
            table.columns.get(active.column).map(String::as_str).unwrap_or("?")
        ),
        (None, None) => "no filter".to_string(),
    };
    let header = Paragraph::new(vec![Line::from(vec![
        Span::styled(
            title.to_string(),
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ),
        Span::raw(format!(
            "  rows {}-{} of {} ({} total)  sort: {}  {filter}",
            table.view.start() + 1,
            (table.view.start() + table.view.capacity()).min(table.view.len()),
            table.view.len(),
            table.view.total_rows(),
            if sort.is_empty() { "none" } else { sort.as_str() },
        )),
    ])])
    .block(Block::default().borders(Borders::ALL));
    frame.render_widget(header, chunks[0]);

    let header_row = Row::new(
        table
            .view
            .columns()
            .iter()
            .enumerate()
            .map(|(index, column)| match table.view.sort_spec().direction(index) {
                Some(true) => format!("{} ^", column.label),
                Some(false) => format!("{} v", column.label),
                None => column.label.clone(),
            })
            .collect::<Vec<_>>(),
    )
    .style(Style::default().add_modifier(Modifier::BOLD));
    let column_count = table.columns.len();
    let rows: Vec<Row> = table
        .view
        .render()
        .into_iter()
        .map(|visible| {
            let cells: Vec<String> = (0..column_count)
                .map(|column| visible.row.cell(column).as_text().to_string())
                .collect();
            let style = if visible.selected {
                Style::default().add_modifier(Modifier::REVERSED)
            } else {
                Style::default()
            };
            Row::new(cells).style(style)
        })
        .collect();
    let widget = Table::new(rows, column_constraints(table))
        .header(header_row)
        .column_spacing(0)
        .block(Block::default().borders(Borders::ALL));
    frame.render_widget(widget, chunks[1]);

    let footer_text = if browser.status.is_empty() {
        BROWSE_HELP.to_string()
    } else {
        browser.status.clone()
    };
    frame.render_widget(
        Paragraph::new(footer_text).style(Style::default().fg(Color::DarkGray)),
        chunks[2],
    );
}

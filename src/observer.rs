//! Terminal dashboard fed by the status bus.
//!
//! Runs a plain blocking loop on its own thread: poll the keyboard, pull
//! the latest snapshot if one arrived, redraw. Snapshots are coarse
//! refreshes; whatever is current gets drawn, missed ones are not mourned.

use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table},
    Frame, Terminal,
};
use std::io;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::status::{Phase, StatusSnapshot};

const INPUT_POLL: Duration = Duration::from_millis(100);
const ERROR_DISPLAY_WIDTH: usize = 30;

/// Blocking dashboard loop. Returns when the user quits, the cancellation
/// token fires, or the status bus closes.
pub fn run(
    mut rx: watch::Receiver<StatusSnapshot>,
    cancel: CancellationToken,
    refresh: Duration,
) -> Result<()> {
    let mut terminal = setup_terminal()?;
    let result = event_loop(&mut terminal, &mut rx, &cancel, refresh);
    restore_terminal(&mut terminal)?;
    result
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<io::Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.clear()?;
    Ok(terminal)
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    rx: &mut watch::Receiver<StatusSnapshot>,
    cancel: &CancellationToken,
    refresh: Duration,
) -> Result<()> {
    let mut snapshot = rx.borrow_and_update().clone();
    let mut last_draw: Option<Instant> = None;

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        match rx.has_changed() {
            Ok(true) => snapshot = rx.borrow_and_update().clone(),
            Ok(false) => {}
            // Bus closed: the coordinator is gone.
            Err(_) => return Ok(()),
        }

        if last_draw.is_none_or(|t| t.elapsed() >= refresh) {
            terminal.draw(|frame| render(frame, &snapshot))?;
            last_draw = Some(Instant::now());
        }

        if event::poll(INPUT_POLL)? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                let quit = matches!(key.code, KeyCode::Char('q') | KeyCode::Esc)
                    || (key.code == KeyCode::Char('c')
                        && key.modifiers.contains(KeyModifiers::CONTROL));
                if quit {
                    cancel.cancel();
                    return Ok(());
                }
            }
        }
    }
}

fn render(frame: &mut Frame, snapshot: &StatusSnapshot) {
    let [header_area, table_area, footer_area] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Min(3),
        Constraint::Length(1),
    ])
    .areas(frame.area());

    let header = Line::from(vec![
        Span::styled(
            "kportforward",
            Style::default().add_modifier(Modifier::BOLD),
        ),
        Span::raw(format!("  context: {}", snapshot.context)),
        Span::raw(format!(
            "  {}/{} running",
            snapshot.running(),
            snapshot.services.len()
        )),
    ]);
    frame.render_widget(Paragraph::new(header), header_area);

    let mut names: Vec<&String> = snapshot.services.keys().collect();
    names.sort();

    let rows: Vec<Row> = names
        .iter()
        .map(|name| {
            let status = &snapshot.services[*name];
            let uptime = status
                .uptime()
                .map(format_uptime)
                .unwrap_or_default();
            let error = status
                .last_error
                .as_deref()
                .map(|e| truncate_error(e, ERROR_DISPLAY_WIDTH))
                .unwrap_or_default();

            Row::new(vec![
                Cell::from(name.as_str()),
                Cell::from(status.phase.to_string()).style(phase_style(status.phase)),
                Cell::from(status.local_port.to_string()),
                Cell::from(status.pid.map(|p| p.to_string()).unwrap_or_default()),
                Cell::from(uptime),
                Cell::from(status.restart_count.to_string()),
                Cell::from(error),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Min(20),
            Constraint::Length(9),
            Constraint::Length(6),
            Constraint::Length(8),
            Constraint::Length(8),
            Constraint::Length(8),
            Constraint::Min(20),
        ],
    )
    .header(
        Row::new(vec![
            "Service", "Status", "Local", "PID", "Uptime", "Restarts", "Error",
        ])
        .style(Style::default().add_modifier(Modifier::BOLD)),
    )
    .block(Block::default().borders(Borders::TOP));
    frame.render_widget(table, table_area);

    let footer = Line::from(Span::styled(
        "q: quit",
        Style::default().fg(Color::DarkGray),
    ));
    frame.render_widget(Paragraph::new(footer), footer_area);
}

fn phase_style(phase: Phase) -> Style {
    let color = match phase {
        Phase::Running => Color::Green,
        Phase::Starting => Color::Cyan,
        Phase::Failed => Color::Red,
        Phase::Cooldown => Color::Yellow,
        Phase::Stopped => Color::DarkGray,
    };
    Style::default().fg(color)
}

fn format_uptime(uptime: Duration) -> String {
    let total = uptime.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h{:02}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m{:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

fn truncate_error(error: &str, width: usize) -> String {
    if error.len() <= width {
        return error.to_string();
    }
    let cut: String = error.chars().take(width.saturating_sub(3)).collect();
    format!("{}...", cut)
}

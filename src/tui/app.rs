use std::collections::BTreeMap;
use std::io::stdout;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Style};
use ratatui::widgets::Paragraph;
use ratatui::Terminal;
use tokio_util::sync::CancellationToken;

use crate::export::{export_json_file, MetricsReport};
use crate::monitor::{Monitor, TargetSnapshot};
use crate::tui::table::TargetTable;

/// Run the TUI application
pub async fn run_tui(monitor: Arc<Monitor>, cancel: CancellationToken) -> Result<()> {
    // Setup terminal
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout());
    let mut terminal = Terminal::new(backend)?;

    let result = run_app(&mut terminal, monitor, cancel).await;

    // Restore terminal
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    result
}

async fn run_app<B: ratatui::backend::Backend>(
    terminal: &mut Terminal<B>,
    monitor: Arc<Monitor>,
    cancel: CancellationToken,
) -> Result<()> {
    let tick_rate = Duration::from_millis(250);
    let mut status: Option<(String, Instant)> = None;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        // Clear old status messages
        if let Some((_, shown_at)) = &status {
            if shown_at.elapsed() > Duration::from_secs(3) {
                status = None;
            }
        }

        let snapshots = monitor.snapshots();
        terminal.draw(|f| {
            draw_ui(f, &snapshots, status.as_ref().map(|(msg, _)| msg.as_str()));
        })?;

        // Handle input with timeout
        if event::poll(tick_rate)? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }

                if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c')
                {
                    cancel.cancel();
                    break;
                }

                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => {
                        cancel.cancel();
                        break;
                    }
                    KeyCode::Char('c') => {
                        monitor.clear();
                        status = Some(("History cleared".to_string(), Instant::now()));
                    }
                    KeyCode::Char('e') => {
                        let report = MetricsReport::new(monitor.export());
                        match export_json_file(&report) {
                            Ok(filename) => {
                                status = Some((format!("Exported to {}", filename), Instant::now()));
                            }
                            Err(e) => {
                                status = Some((format!("Export failed: {}", e), Instant::now()));
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    Ok(())
}

fn draw_ui(
    f: &mut ratatui::Frame,
    snapshots: &BTreeMap<String, TargetSnapshot>,
    status: Option<&str>,
) {
    let area = f.area();

    // Layout: table + status bar
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)])
        .split(area);

    f.render_widget(TargetTable::new(snapshots), chunks[0]);

    let status_text = status
        .map(str::to_string)
        .unwrap_or_else(|| "q quit | c clear history | e export".to_string());
    let status_bar = Paragraph::new(status_text).style(Style::default().fg(Color::DarkGray));
    f.render_widget(status_bar, chunks[1]);
}

use std::collections::BTreeMap;
use std::time::Duration;

use ratatui::buffer::Buffer;
use ratatui::layout::{Constraint, Rect};
use ratatui::style::{Color, Style};
use ratatui::widgets::{Block, Borders, Cell, Row, Table, Widget};

use crate::monitor::TargetSnapshot;
use crate::tui::sparkline::sparkline_string;

const SPARKLINE_WIDTH: usize = 20;

/// Live table of monitored targets.
pub struct TargetTable<'a> {
    snapshots: &'a BTreeMap<String, TargetSnapshot>,
}

impl<'a> TargetTable<'a> {
    pub fn new(snapshots: &'a BTreeMap<String, TargetSnapshot>) -> Self {
        Self { snapshots }
    }
}

fn fmt_ms(duration: Duration) -> String {
    format!("{:.2}ms", duration.as_secs_f64() * 1000.0)
}

impl Widget for TargetTable<'_> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let header = Row::new(vec![
            "Host", "Address", "Sent", "Loss", "Best", "Worst", "Mean", "StdDev", "RTT",
        ])
        .style(Style::default().fg(Color::Cyan));

        let rows = self.snapshots.iter().map(|(host, snapshot)| {
            let mut cells = vec![
                Cell::from(host.clone()),
                Cell::from(snapshot.addr.to_string()),
            ];

            match &snapshot.metrics {
                Some(metrics) => {
                    let loss_style = if metrics.loss_pct() > 10.0 {
                        Style::default().fg(Color::Red)
                    } else {
                        Style::default().fg(Color::Green)
                    };
                    cells.push(Cell::from(metrics.packets_sent.to_string()));
                    cells.push(Cell::from(format!("{:.1}%", metrics.loss_pct())).style(loss_style));
                    cells.push(Cell::from(fmt_ms(metrics.best)));
                    cells.push(Cell::from(fmt_ms(metrics.worst)));
                    cells.push(Cell::from(fmt_ms(metrics.mean)));
                    cells.push(Cell::from(fmt_ms(metrics.std_dev)));
                }
                None => {
                    cells.push(Cell::from("0"));
                    for _ in 0..5 {
                        cells.push(Cell::from("-"));
                    }
                }
            }

            cells.push(
                Cell::from(sparkline_string(&snapshot.recent, SPARKLINE_WIDTH))
                    .style(Style::default().fg(Color::Green)),
            );

            Row::new(cells)
        });

        let widths = [
            Constraint::Min(16),
            Constraint::Min(16),
            Constraint::Length(6),
            Constraint::Length(7),
            Constraint::Length(9),
            Constraint::Length(9),
            Constraint::Length(9),
            Constraint::Length(9),
            Constraint::Length(SPARKLINE_WIDTH as u16 + 1),
        ];

        let table = Table::new(rows, widths).header(header).block(
            Block::default()
                .title(" multiping ")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::DarkGray)),
        );

        table.render(area, buf);
    }
}

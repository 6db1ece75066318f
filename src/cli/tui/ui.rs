//! UI rendering for the TUI.

use ratatui::{
    Frame,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph, Wrap},
};

use crate::config::Strategy;
use crate::core::engine::RunOutcome;
use crate::core::preflight::CheckStatus;

use super::app::{TuiApp, View};

const SPINNER: [&str; 8] = ["⣾", "⣽", "⣻", "⢿", "⡿", "⣟", "⣯", "⣷"];

/// Main render function - dispatches to view-specific renderers.
pub fn render(frame: &mut Frame, app: &TuiApp) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Min(0),    // Content
            Constraint::Length(3), // Footer/help
        ])
        .split(frame.area());

    render_header(frame, app, chunks[0]);

    match &app.view {
        View::Intro => render_intro(frame, chunks[1]),
        View::StrategySelect { selected } => render_strategy_select(frame, chunks[1], *selected),
        View::Configure => render_configure(frame, app, chunks[1]),
        View::Preflight => render_preflight(frame, app, chunks[1]),
        View::Run => render_run(frame, app, chunks[1]),
    }

    render_footer(frame, app, chunks[2]);
}

fn render_header(frame: &mut Frame, app: &TuiApp, area: Rect) {
    let remote = if app.config.remote_host.is_empty() {
        "(no remote host)".to_string()
    } else {
        app.config.remote().to_string()
    };
    let title = format!(
        "bkstream  v{}  {}  {}",
        env!("CARGO_PKG_VERSION"),
        app.config.strategy,
        remote
    );

    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    frame.render_widget(block, area);
}

fn render_intro(frame: &mut Frame, area: Rect) {
    let lines = vec![
        Line::from(""),
        Line::from(Span::styled(
            "  Stream a full machine backup to a remote host over SSH",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        )),
        Line::from(""),
        Line::from("  No local staging space is used: data flows straight into the SSH transport."),
        Line::from("  Raw device copies read from the device you configure; double check it."),
    ];

    let block = Block::default()
        .title("Welcome")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    frame.render_widget(Paragraph::new(lines).block(block), area);
}

fn render_strategy_select(frame: &mut Frame, area: Rect, selected: usize) {
    let items: Vec<ListItem> = Strategy::ALL
        .iter()
        .enumerate()
        .map(|(i, strategy)| {
            let is_selected = i == selected;
            let style = if is_selected {
                Style::default()
                    .bg(Color::DarkGray)
                    .add_modifier(Modifier::BOLD)
            } else {
                Style::default()
            };

            let line = Line::from(vec![
                Span::raw(if is_selected { "> " } else { "  " }),
                Span::styled(
                    format!("{:<16}", strategy.as_str()),
                    Style::default().fg(Color::Yellow),
                ),
                Span::raw(strategy.description()),
            ]);
            ListItem::new(line).style(style)
        })
        .collect();

    let block = Block::default()
        .title("Choose a backup strategy")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    frame.render_widget(List::new(items).block(block), area);
}

fn render_configure(frame: &mut Frame, app: &TuiApp, area: Rect) {
    let strategy = app.config.strategy;
    let lines: Vec<Line> = app
        .form
        .fields
        .iter()
        .enumerate()
        .map(|(i, (field, value))| {
            let focused = i == app.form.focus;
            let marker = if focused { "➤ " } else { "  " };
            let cursor = if focused { "█" } else { "" };
            Line::from(vec![
                Span::raw(marker),
                Span::styled(
                    format!("{:<32}", field.label(strategy)),
                    Style::default().fg(Color::Magenta),
                ),
                Span::styled(
                    format!("{}{}", value, cursor),
                    if focused {
                        Style::default().add_modifier(Modifier::BOLD)
                    } else {
                        Style::default()
                    },
                ),
            ])
        })
        .collect();

    let block = Block::default()
        .title(format!("Connection & Options ({})", strategy))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    frame.render_widget(Paragraph::new(lines).block(block), area);
}

fn render_preflight(frame: &mut Frame, app: &TuiApp, area: Rect) {
    let block = Block::default()
        .title("Preflight")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let outcome = match &app.preflight {
        Some(o) => o,
        None => {
            let spinner = SPINNER[app.tick % SPINNER.len()];
            let text = Paragraph::new(format!("  {} Running preflight checks…", spinner))
                .style(Style::default().fg(Color::DarkGray))
                .block(block);
            frame.render_widget(text, area);
            return;
        }
    };

    let mut lines: Vec<Line> = outcome
        .report
        .lines
        .iter()
        .map(|check| {
            let color = match check.status {
                CheckStatus::Pass => Color::Green,
                CheckStatus::Fail => Color::Red,
                CheckStatus::Warn => Color::Yellow,
                CheckStatus::Info => Color::DarkGray,
            };
            Line::from(Span::styled(
                format!("  {}", check),
                Style::default().fg(color),
            ))
        })
        .collect();

    if let Some(cause) = &outcome.report.error {
        lines.push(Line::from(Span::styled(
            format!("  ✗ {}", cause),
            Style::default().fg(Color::Red),
        )));
    }

    lines.push(Line::from(""));
    match &outcome.pipeline {
        Ok(spec) => {
            lines.push(Line::from(Span::styled(
                "  Pipeline",
                Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
            )));
            for row in spec.to_string().lines() {
                lines.push(Line::from(format!("  {}", row)));
            }
        }
        Err(e) => lines.push(Line::from(Span::styled(
            format!("  ✗ cannot build pipeline: {}", e),
            Style::default().fg(Color::Red),
        ))),
    }

    lines.push(Line::from(""));
    let verdict = if !app.can_start_run() {
        Span::styled(
            "  Run blocked until the failures above are fixed",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )
    } else if outcome.report.passed() {
        Span::styled(
            "  All checks passed",
            Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
        )
    } else {
        Span::styled(
            "  Some checks failed; Enter starts the run anyway",
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        )
    };
    lines.push(Line::from(verdict));

    let paragraph = Paragraph::new(lines)
        .block(block)
        .wrap(Wrap { trim: false });
    frame.render_widget(paragraph, area);
}

fn render_run(frame: &mut Frame, app: &TuiApp, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Status banner
            Constraint::Min(0),    // Log
        ])
        .split(area);

    let run = match &app.run {
        Some(r) => r,
        None => {
            frame.render_widget(
                Paragraph::new("  Starting…").block(Block::default().borders(Borders::ALL)),
                chunks[0],
            );
            return;
        }
    };

    let percentage = (run.progress() * 100.0).floor() as u8;
    let bar = progress_bar(percentage, 30);
    let elapsed = format_duration(run.elapsed_secs() as u64);

    let spinner = SPINNER[app.tick % SPINNER.len()];
    let (icon, status, color) = match &run.outcome {
        None if run.cancel_requested() => (spinner, "Cancelling…".to_string(), Color::Yellow),
        None => (spinner, "Streaming backup…".to_string(), Color::Green),
        Some(RunOutcome::Success) => ("✔", "Backup complete".to_string(), Color::Green),
        Some(RunOutcome::Cancelled) => ("■", "Cancelled".to_string(), Color::Yellow),
        Some(RunOutcome::Failed(cause)) => ("✗", format!("Failed: {}", cause), Color::Red),
    };

    let banner = Line::from(vec![
        Span::styled(format!("{} ", icon), Style::default().fg(color)),
        Span::raw(format!("{} {:>3}%  {}  ", bar, percentage, elapsed)),
        Span::styled(status, Style::default().fg(color).add_modifier(Modifier::BOLD)),
    ]);
    let banner_block = Block::default()
        .title("Run")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(color));
    frame.render_widget(Paragraph::new(banner).block(banner_block), chunks[0]);

    // Tail: show as many of the newest lines as fit.
    let visible = chunks[1].height.saturating_sub(2) as usize;
    let start = run.lines.len().saturating_sub(visible);
    let log: Vec<Line> = run.lines[start..]
        .iter()
        .map(|l| Line::from(l.as_str()))
        .collect();

    let log_block = Block::default()
        .title(format!("Output ({} lines)", run.lines.len() + run.dropped_lines))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));
    frame.render_widget(Paragraph::new(log).block(log_block), chunks[1]);
}

fn render_footer(frame: &mut Frame, app: &TuiApp, area: Rect) {
    let help_text = match &app.view {
        View::Intro => "[Enter] Choose strategy  [q] Quit",
        View::StrategySelect { .. } => "[↑↓] Navigate  [Enter] Select  [Esc] Back  [q] Quit",
        View::Configure => "[Tab/↑↓] Field  [Enter] Save & preflight  [Esc] Back  [Ctrl+C] Quit",
        View::Preflight => "[Enter] Start run  [Esc] Edit config  [q] Quit",
        View::Run if app.run_in_progress() => "[c/Esc] Cancel  [q] Cancel & quit",
        View::Run => "[Enter] New run  [q] Quit",
    };

    let mut spans = vec![Span::raw(format!("  {}", help_text))];

    if let Some(error) = &app.error {
        spans.push(Span::styled(
            format!("  Error: {}", error),
            Style::default().fg(Color::Red),
        ));
    } else if let Some(notice) = &app.notice {
        spans.push(Span::styled(
            format!("  {}", notice),
            Style::default().fg(Color::DarkGray),
        ));
    }

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));

    let paragraph = Paragraph::new(Line::from(spans)).block(block);
    frame.render_widget(paragraph, area);
}

fn progress_bar(percentage: u8, width: usize) -> String {
    let percentage = percentage.min(100) as usize;
    let filled = (percentage * width) / 100;
    let empty = width - filled;
    format!("[{}{}]", "█".repeat(filled), "░".repeat(empty))
}

fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;

    if hours > 0 {
        format!("{}h {}m", hours, mins)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

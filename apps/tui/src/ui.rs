//! Widget rendering.

use ratatui::{
    Frame,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span, Text},
    widgets::{Block, Borders, Gauge, List, ListItem, Padding, Paragraph, Tabs, Wrap},
};
use witness_core::events::LogLevel;
use witness_core::provision::ProvisionState;

use crate::app::{App, LogEntry, Outcome, START_ROW, Tab};

pub fn draw(frame: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(10), Constraint::Length(3)])
        .split(frame.area());

    draw_header(frame, chunks[0], app);

    match app.current_tab {
        Tab::Main => draw_main_view(frame, chunks[1], app),
        Tab::Logs => draw_logs_view(frame, chunks[1], app),
        Tab::Help => draw_help_view(frame, chunks[1]),
    }

    draw_footer(frame, chunks[2], app);
}

fn draw_header(frame: &mut Frame, area: Rect, app: &App) {
    let selected = match app.current_tab {
        Tab::Main => 0,
        Tab::Logs => 1,
        Tab::Help => 2,
    };

    let tabs = Tabs::new(vec!["Main", "Logs (F2)", "Help (F1)"])
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Cyan))
                .title(" Witness Provisioning ")
                .title_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
        )
        .select(selected)
        .style(Style::default().fg(Color::White))
        .highlight_style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD))
        .divider(symbols::DOT);

    frame.render_widget(tabs, area);
}

fn draw_footer(frame: &mut Frame, area: Rect, app: &App) {
    let device = match &app.device {
        Some((persona, path)) => Span::styled(format!(" ● {persona} {path} "), Style::default().fg(Color::Green)),
        None => Span::styled(" ○ No device ", Style::default().fg(Color::Red)),
    };
    let state = Span::styled(format!(" {} ", app.state), Style::default().fg(Color::Cyan));
    let help = Span::styled(
        " Ctrl+Q: Quit | Up/Down: Select | Enter: Toggle/Start | x: Cancel ",
        Style::default().fg(Color::DarkGray),
    );

    let footer = Paragraph::new(Line::from(vec![device, state, help]))
        .block(Block::default().borders(Borders::ALL).border_style(Style::default().fg(Color::DarkGray)));

    frame.render_widget(footer, area);
}

fn draw_main_view(frame: &mut Frame, area: Rect, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(35), Constraint::Percentage(65)])
        .split(area);

    draw_options_panel(frame, chunks[0], app);
    draw_status_panel(frame, chunks[1], app);
}

fn draw_options_panel(frame: &mut Frame, area: Rect, app: &App) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(if app.is_running { Color::DarkGray } else { Color::Yellow }))
        .title(" Options ")
        .padding(Padding::horizontal(1));

    let inner = block.inner(area);
    frame.render_widget(block, area);

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2),
            Constraint::Length(2),
            Constraint::Length(2),
            Constraint::Length(2),
            Constraint::Min(1),
        ])
        .split(inner);

    let options = [
        ("Fuse HAB (irreversible)", app.fuse),
        ("Wipe applet data", app.wipe_applet_data),
        ("Override safety checks", app.override_safety),
    ];

    for (i, (label, enabled)) in options.iter().enumerate() {
        let active = app.selected == i && !app.is_running;
        let mark = if *enabled { "[x]" } else { "[ ]" };
        let mark_color = match (i, *enabled) {
            (0, true) => Color::Red,
            (_, true) => Color::Green,
            _ => Color::DarkGray,
        };
        let label_style = if active {
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)
        } else {
            Style::default().fg(Color::White)
        };
        let line = Line::from(vec![
            Span::styled(format!("{mark} "), Style::default().fg(mark_color)),
            Span::styled(*label, label_style),
        ]);
        frame.render_widget(Paragraph::new(line), rows[i]);
    }

    let button_style = if app.is_running {
        Style::default().fg(Color::DarkGray)
    } else if app.selected == START_ROW {
        Style::default().fg(Color::Black).bg(Color::Yellow)
    } else {
        Style::default().fg(Color::Green)
    };
    let button_text = if app.is_running { "⟳ Running..." } else { "▶ Start" };
    frame.render_widget(
        Paragraph::new(button_text).style(button_style).alignment(Alignment::Center),
        rows[3],
    );

    let config = Paragraph::new(vec![
        Line::from(Span::styled("Config:", Style::default().fg(Color::Cyan))),
        Line::from(Span::styled(
            app.config_path.display().to_string(),
            Style::default().fg(Color::White),
        )),
    ])
    .wrap(Wrap { trim: true });
    frame.render_widget(config, rows[4]);
}

fn draw_status_panel(frame: &mut Frame, area: Rect, app: &App) {
    let milestone_rows = (app.milestones.len() as u16).clamp(1, 8) + 2;
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(5),
            Constraint::Length(milestone_rows),
            Constraint::Min(4),
        ])
        .split(area);

    draw_progress(frame, chunks[0], app);
    draw_operator_panel(frame, chunks[1], app);
    draw_milestones(frame, chunks[2], app);
    draw_recent_logs(frame, chunks[3], app);
}

fn draw_progress(frame: &mut Frame, area: Rect, app: &App) {
    let color = match app.state {
        ProvisionState::Done => Color::Green,
        ProvisionState::Failed => Color::Red,
        _ => Color::Cyan,
    };

    let label = if app.operation.is_empty() {
        format!("{}%", app.progress)
    } else {
        format!("{}: {}%", app.operation, app.progress)
    };

    let gauge = Gauge::default()
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::DarkGray))
                .title(" Progress "),
        )
        .gauge_style(Style::default().fg(color).bg(Color::Black))
        .percent(u16::from(app.progress.min(100)))
        .label(label);

    frame.render_widget(gauge, area);
}

fn draw_operator_panel(frame: &mut Frame, area: Rect, app: &App) {
    let mut lines = Vec::new();

    match &app.outcome {
        Some(Outcome::Provisioned { serial, identity, fused }) => {
            lines.push(Line::from(Span::styled(
                format!("✔ Device {serial} provisioned{}", if *fused { " and fused" } else { "" }),
                Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
            )));
            lines.push(Line::from(vec![
                Span::styled("Identity: ", Style::default().fg(Color::Cyan)),
                Span::styled(identity.clone(), Style::default().fg(Color::White)),
            ]));
        }
        Some(Outcome::Failed) => lines.push(Line::from(Span::styled(
            "✗ Provisioning failed, see logs (F2)",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        ))),
        Some(Outcome::Cancelled) => lines.push(Line::from(Span::styled(
            "Run cancelled",
            Style::default().fg(Color::Yellow),
        ))),
        None => match &app.prompt {
            Some(prompt) => lines.push(Line::from(Span::styled(
                prompt.clone(),
                Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
            ))),
            None => lines.push(Line::from(Span::styled(
                "Choose options and press Start",
                Style::default().fg(Color::DarkGray),
            ))),
        },
    }

    if let Some((action, secs)) = &app.countdown {
        lines.push(Line::from(Span::styled(
            format!("{action} in {secs}s, press x to cancel"),
            Style::default().fg(Color::Red),
        )));
    }
    if app.warnings > 0 {
        lines.push(Line::from(Span::styled(
            format!("⚠ {} warning(s)", app.warnings),
            Style::default().fg(Color::Yellow),
        )));
    }

    let panel = Paragraph::new(lines)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::DarkGray))
                .title(" Operator "),
        )
        .wrap(Wrap { trim: true });

    frame.render_widget(panel, area);
}

fn draw_milestones(frame: &mut Frame, area: Rect, app: &App) {
    let visible = area.height.saturating_sub(2) as usize;
    let skip = app.milestones.len().saturating_sub(visible);
    let items: Vec<ListItem> = app
        .milestones
        .iter()
        .skip(skip)
        .map(|m| {
            let (icon, color) = if m.passed { ("✔", Color::Green) } else { ("✗", Color::Red) };
            ListItem::new(Line::from(vec![
                Span::styled(format!("{icon} "), Style::default().fg(color)),
                Span::styled(m.name.clone(), Style::default().fg(Color::White)),
            ]))
        })
        .collect();

    let list = List::new(items).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::DarkGray))
            .title(" Milestones "),
    );

    frame.render_widget(list, area);
}

fn draw_recent_logs(frame: &mut Frame, area: Rect, app: &App) {
    let items: Vec<ListItem> = app
        .logs
        .iter()
        .rev()
        .take(area.height.saturating_sub(2) as usize)
        .map(|entry| log_to_list_item(entry, area.width))
        .collect();

    let list = List::new(items)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::DarkGray))
                .title(" Recent Logs "),
        )
        .style(Style::default().fg(Color::White));

    frame.render_widget(list, area);
}

fn draw_logs_view(frame: &mut Frame, area: Rect, app: &App) {
    let items: Vec<ListItem> = app
        .logs
        .iter()
        .skip(app.log_scroll)
        .take(area.height.saturating_sub(2) as usize)
        .map(|entry| log_to_list_item(entry, area.width))
        .collect();

    let list = List::new(items)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Cyan))
                .title(format!(" Logs ({}/{}) ", app.log_scroll + 1, app.logs.len().max(1))),
        )
        .style(Style::default().fg(Color::White));

    frame.render_widget(list, area);
}

fn draw_help_view(frame: &mut Frame, area: Rect) {
    let help_text = [
        "",
        "  Witness provisioning",
        "",
        "  KEYBOARD SHORTCUTS:",
        "",
        "  Ctrl+Q, Ctrl+C         Quit (cancels a running session)",
        "  Esc                    Back to main view, or quit",
        "  F1                     Show this help",
        "  F2                     View full logs",
        "  Up/Down                Select an option",
        "  Space/Enter            Toggle option or start",
        "  x                      Cancel the running session",
        "",
        "  IN LOGS VIEW:",
        "",
        "  j/k, Up/Down           Scroll logs",
        "  Page Up/Down           Scroll by page",
        "  Home/End               Go to start/end",
        "",
        "  USAGE:",
        "",
        "  1. Pick the options for this device",
        "  2. Select Start and follow the operator prompts",
        "  3. Fusing waits for a countdown before burning fuses",
        "",
        "  Press any key to return...",
    ];

    let text: Vec<Line> = help_text.iter().map(|s| Line::from(*s)).collect();

    let help = Paragraph::new(Text::from(text))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Cyan))
                .title(" Help "),
        )
        .style(Style::default().fg(Color::White))
        .wrap(Wrap { trim: false });

    frame.render_widget(help, area);
}

fn log_to_list_item(entry: &LogEntry, width: u16) -> ListItem<'static> {
    let (icon, color) = match entry.level {
        LogLevel::Error => ("✗", Color::Red),
        LogLevel::Warn => ("⚠", Color::Yellow),
        LogLevel::Info => ("●", Color::Green),
        LogLevel::Debug => ("○", Color::Blue),
        LogLevel::Trace => ("·", Color::DarkGray),
    };

    let time_len = entry.timestamp.len() + 1;
    let icon_len = 2;
    let msg_width = (width.saturating_sub((time_len + icon_len + 4) as u16) as usize).max(1);

    let chars: Vec<char> = entry.message.chars().collect();
    let mut chunks = chars.chunks(msg_width).map(|c| c.iter().collect::<String>());

    let mut lines = vec![Line::from(vec![
        Span::styled(format!("{} ", entry.timestamp), Style::default().fg(Color::DarkGray)),
        Span::styled(format!("{icon} "), Style::default().fg(color)),
        Span::styled(chunks.next().unwrap_or_default(), Style::default().fg(Color::White)),
    ])];

    for rest in chunks {
        lines.push(Line::from(vec![
            Span::raw(" ".repeat(time_len + icon_len)),
            Span::styled(rest, Style::default().fg(Color::White)),
        ]));
    }

    ListItem::new(Text::from(lines))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(message: &str) -> LogEntry {
        LogEntry {
            level: LogLevel::Info,
            message: message.into(),
            timestamp: "12:00:00".into(),
        }
    }

    #[test]
    fn test_long_log_lines_wrap() {
        assert_eq!(log_to_list_item(&entry("short"), 80).height(), 1);
        let long = "é".repeat(100);
        assert!(log_to_list_item(&entry(&long), 40).height() > 1);
    }

    #[test]
    fn test_draw_main_view() {
        use ratatui::{Terminal, backend::TestBackend};

        let mut app = App::new("witness.toml".into());
        app.prompt = Some("Plug in the device".into());
        let mut terminal = Terminal::new(TestBackend::new(100, 30)).unwrap();
        terminal.draw(|frame| draw(frame, &app)).unwrap();

        let buffer = terminal.backend().buffer();
        let text: String = buffer.content.iter().map(|c| c.symbol()).collect();
        assert!(text.contains("Witness Provisioning"));
        assert!(text.contains("Plug in the device"));
    }
}

/*!
 * Blueland TUI Interface
 * Device list, detail panel and status line
 */

use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph},
    Frame,
};

use crate::app::{App, StatusLine};
use crate::client::Device;

// Conservative color palette
const BLUE: Color = Color::Rgb(100, 149, 237);
const GRAY: Color = Color::Rgb(128, 128, 128);
const WHITE: Color = Color::Rgb(255, 255, 255);
const GREEN: Color = Color::Rgb(34, 139, 34);
const RED: Color = Color::Rgb(220, 20, 60);

pub fn render_ui(f: &mut Frame, app: &App) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(6), Constraint::Length(3)])
        .split(f.area());

    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(45), // Devices
            Constraint::Percentage(55), // Details
        ])
        .split(rows[0]);

    render_devices_panel(f, columns[0], app);
    render_details_panel(f, columns[1], app);
    render_status_line(f, rows[1], app);
}

fn state_indicator(device: &Device) -> (&'static str, Color) {
    if device.pending_authentication {
        ("◐", BLUE)
    } else if device.connected {
        ("●", GREEN)
    } else if device.paired {
        ("○", WHITE)
    } else {
        ("○", GRAY)
    }
}

fn devices_title(app: &App) -> String {
    match &app.daemon {
        Some(status) if status.discovering => "Devices (scanning)".to_string(),
        Some(status) if !status.agent_registered => "Devices (agent not registered)".to_string(),
        Some(_) => "Devices".to_string(),
        None => "Devices (daemon unreachable)".to_string(),
    }
}

fn render_devices_panel(f: &mut Frame, area: Rect, app: &App) {
    let items: Vec<ListItem> = app
        .devices
        .iter()
        .enumerate()
        .map(|(i, device)| {
            let prefix = if i == app.selected_device { "▶ " } else { "  " };
            let (indicator, color) = state_indicator(device);
            let content = Line::from(vec![
                Span::raw(prefix),
                Span::styled(indicator, Style::default().fg(color)),
                Span::raw(" "),
                Span::styled(device.display_name(), Style::default().fg(WHITE)),
            ]);

            if i == app.selected_device {
                ListItem::new(content).style(Style::default().bg(BLUE).fg(WHITE))
            } else {
                ListItem::new(content)
            }
        })
        .collect();

    let list = List::new(items).block(
        Block::default()
            .borders(Borders::ALL)
            .title(devices_title(app))
            .border_style(Style::default().fg(BLUE)),
    );

    f.render_widget(list, area);
}

fn flag(label: &str, value: bool) -> Line<'static> {
    Line::from(vec![
        Span::styled(format!("{label}: "), Style::default().fg(GRAY)),
        if value {
            Span::styled("yes", Style::default().fg(GREEN))
        } else {
            Span::styled("no", Style::default().fg(WHITE))
        },
    ])
}

fn render_device_details(device: &Device) -> Vec<Line<'_>> {
    let mut lines = vec![
        Line::from(vec![Span::styled(
            device.display_name(),
            Style::default().fg(WHITE).add_modifier(Modifier::BOLD),
        )]),
        Line::from(vec![
            Span::styled("Address: ", Style::default().fg(GRAY)),
            Span::styled(&device.address, Style::default().fg(WHITE)),
        ]),
        Line::from(vec![
            Span::styled("Type: ", Style::default().fg(GRAY)),
            Span::styled(device.icon.as_deref().unwrap_or("Unknown"), Style::default().fg(WHITE)),
        ]),
        Line::from(vec![
            Span::styled("RSSI: ", Style::default().fg(GRAY)),
            Span::styled(
                device
                    .rssi
                    .map(|rssi| format!("{rssi} dBm"))
                    .unwrap_or_else(|| "N/A".to_string()),
                Style::default().fg(WHITE),
            ),
        ]),
        Line::from(""),
        flag("Paired", device.paired),
        flag("Trusted", device.trusted),
        flag("Connected", device.connected),
    ];

    if device.pending_authentication {
        lines.push(Line::from(Span::styled(
            "Waiting for pairing confirmation",
            Style::default().fg(BLUE),
        )));
    }

    lines.push(Line::from(vec![
        Span::styled("Last change: ", Style::default().fg(GRAY)),
        Span::styled(
            device.last_seen.format("%H:%M:%S").to_string(),
            Style::default().fg(WHITE),
        ),
    ]));

    if !device.uuids.is_empty() {
        lines.push(Line::from(""));
        lines.push(Line::from(format!("Services ({})", device.uuids.len())));
        for uuid in &device.uuids {
            lines.push(Line::from(Span::styled(format!("  {uuid}"), Style::default().fg(GRAY))));
        }
    }

    lines.push(Line::from(""));
    lines.push(Line::from("[Enter] Pair & Connect  [d] Disconnect  [x] Remove"));
    lines
}

fn render_details_panel(f: &mut Frame, area: Rect, app: &App) {
    let block = Block::default()
        .borders(Borders::ALL)
        .title("Device")
        .border_style(Style::default().fg(GRAY));

    let paragraph = match app.get_selected_device() {
        Some(device) => Paragraph::new(render_device_details(device))
            .block(block)
            .alignment(Alignment::Left),
        None => Paragraph::new("No devices yet, press [s] to scan")
            .block(block)
            .alignment(Alignment::Center),
    };

    f.render_widget(paragraph, area);
}

fn render_status_line(f: &mut Frame, area: Rect, app: &App) {
    let (text, color) = match &app.status {
        StatusLine::Info(message) => (message.as_str(), WHITE),
        StatusLine::Error(message) => (message.as_str(), RED),
    };

    let mut spans = vec![Span::styled(text, Style::default().fg(color))];
    if app.pending > 0 {
        spans.push(Span::styled(
            format!("  ({} in progress)", app.pending),
            Style::default().fg(GRAY),
        ));
    }

    let paragraph = Paragraph::new(Line::from(spans)).block(
        Block::default()
            .borders(Borders::ALL)
            .title("[s] Scan  [↑/↓] Select  [q] Quit")
            .border_style(Style::default().fg(GRAY)),
    );

    f.render_widget(paragraph, area);
}

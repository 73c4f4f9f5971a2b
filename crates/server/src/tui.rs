use std::collections::VecDeque;

use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Gauge, Paragraph, Row, Table, TableState};

use log::Level;
use skein::net::ClientId;

use crate::server::{ClientInfo, ServerStats};

const MAX_LOG_LINES: usize = 500;

fn level_color(level: Level) -> Color {
    match level {
        Level::Error => Color::Red,
        Level::Warn => Color::Yellow,
        Level::Info => Color::White,
        Level::Debug | Level::Trace => Color::DarkGray,
    }
}

pub struct TuiState {
    logs: VecDeque<(Level, String)>,
    scroll: usize,
    selected: usize,
    pending_kick: Option<ClientId>,
}

impl TuiState {
    pub fn new() -> Self {
        Self {
            logs: VecDeque::new(),
            scroll: 0,
            selected: 0,
            pending_kick: None,
        }
    }

    pub fn log(&mut self, level: Level, message: impl Into<String>) {
        if self.logs.len() == MAX_LOG_LINES {
            self.logs.pop_front();
        }
        self.logs.push_back((level, message.into()));
    }

    pub fn log_info(&mut self, message: impl Into<String>) {
        self.log(Level::Info, message);
    }

    /// Lines scrolled back from the newest entry.
    pub fn scroll_up(&mut self) {
        self.scroll = (self.scroll + 5).min(self.logs.len().saturating_sub(1));
    }

    pub fn scroll_down(&mut self) {
        self.scroll = self.scroll.saturating_sub(5);
    }

    pub fn scroll_to_bottom(&mut self) {
        self.scroll = 0;
    }

    pub fn select_prev(&mut self, client_count: usize) {
        if client_count > 0 {
            self.selected = self.selected.checked_sub(1).unwrap_or(client_count - 1);
        }
    }

    pub fn select_next(&mut self, client_count: usize) {
        if client_count > 0 {
            self.selected = (self.selected + 1) % client_count;
        }
    }

    pub fn request_kick(&mut self, clients: &[ClientInfo]) {
        if let Some(client) = clients.get(self.selected) {
            self.pending_kick = Some(client.client_id);
        }
    }

    pub fn take_pending_kick(&mut self) -> Option<ClientId> {
        self.pending_kick.take()
    }
}

pub fn render(frame: &mut Frame, state: &TuiState, stats: &ServerStats, clients: &[ClientInfo]) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Length(8),
            Constraint::Length(6),
            Constraint::Min(5),
            Constraint::Length(1),
        ])
        .split(frame.area());

    render_header(frame, chunks[0], stats);
    render_capacity(frame, chunks[1], stats);
    render_clients(frame, chunks[2], state, clients);
    render_network(frame, chunks[3], stats);
    render_log(frame, chunks[4], state);
    render_help(frame, chunks[5]);
}

fn render_header(frame: &mut Frame, area: Rect, stats: &ServerStats) {
    let title = format!(" Skein Server - Uptime: {} ", format_duration(stats.uptime_secs));
    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let text = format!(
        "Tick: {}  |  Connections: {}  |  Entities: {}",
        stats.tick, stats.connected_count, stats.entity_count
    );
    let paragraph = Paragraph::new(text)
        .block(block)
        .style(Style::default().fg(Color::White));
    frame.render_widget(paragraph, area);
}

fn render_capacity(frame: &mut Frame, area: Rect, stats: &ServerStats) {
    let block = Block::default()
        .title(" Joined ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Green));

    let ratio = if stats.max_clients == 0 {
        0.0
    } else {
        stats.joined_count as f64 / stats.max_clients as f64
    };
    let gauge = Gauge::default()
        .block(block)
        .gauge_style(Style::default().fg(Color::Green))
        .ratio(ratio.min(1.0))
        .label(format!("{}/{} clients", stats.joined_count, stats.max_clients));
    frame.render_widget(gauge, area);
}

fn render_clients(frame: &mut Frame, area: Rect, state: &TuiState, clients: &[ClientInfo]) {
    let block = Block::default()
        .title(" Clients ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Magenta));

    let header = Row::new(["Id", "Name", "State", "Connection", "Avatar"])
        .style(Style::default().fg(Color::Gray).add_modifier(Modifier::BOLD));
    let rows = clients.iter().map(|client| {
        let state_color = match client.state {
            "joined" => Color::Green,
            "rejected" => Color::Red,
            _ => Color::Yellow,
        };
        Row::new(vec![
            Cell::from(client.client_id.to_string()),
            Cell::from(client.username.clone()),
            Cell::from(client.state).style(Style::default().fg(state_color)),
            Cell::from(client.connection.clone()),
            Cell::from(format!("{} entities", client.avatar_entities)),
        ])
    });

    let table = Table::new(
        rows,
        [
            Constraint::Length(4),
            Constraint::Min(12),
            Constraint::Length(10),
            Constraint::Length(12),
            Constraint::Length(12),
        ],
    )
    .header(header)
    .block(block)
    .row_highlight_style(Style::default().add_modifier(Modifier::REVERSED));

    let mut table_state = TableState::default();
    if !clients.is_empty() {
        table_state.select(Some(state.selected.min(clients.len() - 1)));
    }
    frame.render_stateful_widget(table, area, &mut table_state);
}

fn render_network(frame: &mut Frame, area: Rect, stats: &ServerStats) {
    let block = Block::default()
        .title(" Network ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow));

    let net = &stats.network_stats;
    let label = |text: &'static str| Span::styled(text, Style::default().fg(Color::Gray));
    let value = |text: String| Span::styled(text, Style::default().fg(Color::White));
    let lines = vec![
        Line::from(vec![
            label("Packets: "),
            value(format!("{} sent / {} recv", net.packets_sent, net.packets_received)),
        ]),
        Line::from(vec![
            label("Bytes: "),
            value(format!(
                "{} sent / {} recv",
                format_bytes(net.bytes_sent),
                format_bytes(net.bytes_received)
            )),
        ]),
        Line::from(vec![
            label("RTT: "),
            value(format!("{:.1}ms (+/- {:.1}ms)", net.rtt_ms, net.rtt_variance)),
        ]),
        Line::from(vec![
            label("Resent: "),
            Span::styled(
                format!("{:.1}%", net.resend_percent()),
                Style::default().fg(if net.resend_percent() > 5.0 {
                    Color::Red
                } else {
                    Color::White
                }),
            ),
        ]),
    ];
    frame.render_widget(Paragraph::new(lines).block(block), area);
}

fn render_log(frame: &mut Frame, area: Rect, state: &TuiState) {
    let block = Block::default()
        .title(" Log ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Blue));

    let visible = area.height.saturating_sub(2) as usize;
    let end = state.logs.len().saturating_sub(state.scroll);
    let start = end.saturating_sub(visible);
    let lines: Vec<Line> = state
        .logs
        .range(start..end)
        .map(|(level, message)| {
            Line::from(Span::styled(message.as_str(), Style::default().fg(level_color(*level))))
        })
        .collect();
    frame.render_widget(Paragraph::new(lines).block(block), area);
}

fn render_help(frame: &mut Frame, area: Rect) {
    let text = Paragraph::new("q/Esc quit  Up/Down select  k kick  PgUp/PgDn/End scroll log").style(
        Style::default()
            .fg(Color::DarkGray)
            .add_modifier(Modifier::ITALIC),
    );
    frame.render_widget(text, area);
}

fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;
    format!("{hours:02}:{mins:02}:{secs:02}")
}

fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let value = bytes as f64;
    if value < KB {
        format!("{bytes}B")
    } else if value < KB * KB {
        format!("{:.1}KB", value / KB)
    } else if value < KB * KB * KB {
        format!("{:.1}MB", value / (KB * KB))
    } else {
        format!("{:.1}GB", value / (KB * KB * KB))
    }
}

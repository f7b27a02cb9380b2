pub mod components;

use crate::app::{App, Mode, Screen};
use crate::market::Message;
use crate::sync::StreamPhase;
use ratatui::prelude::*;
use ratatui::widgets::{Paragraph, Wrap};

/// Main draw function
pub fn draw(frame: &mut Frame, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .constraints([
      Constraint::Length(1), // Header
      Constraint::Min(1),    // Messages
      Constraint::Length(1), // Status bar
    ])
    .split(frame.area());

  draw_header(frame, chunks[0], app);
  match app.screen() {
    Screen::Chat => draw_messages(frame, chunks[1], app),
    Screen::SessionExpired => draw_session_expired(frame, chunks[1]),
  }
  draw_status_bar(frame, chunks[2], app);
}

fn draw_header(frame: &mut Frame, area: Rect, app: &App) {
  let phase = match app.phase() {
    StreamPhase::Idle => "idle",
    StreamPhase::Loaded => "loaded",
    StreamPhase::Polling if app.is_following() => "live",
    StreamPhase::Polling => "paused",
  };
  let unread = app
    .unread()
    .map(|n| n.to_string())
    .unwrap_or_else(|| "-".to_string());

  let header = Line::from(vec![
    Span::styled(" drivelink ", Style::default().fg(Color::Cyan).bold()),
    Span::styled("│", Style::default().fg(Color::DarkGray)),
    Span::styled(
      format!(" chat {} ", app.conversation_id()),
      Style::default().fg(Color::White),
    ),
    Span::styled("│", Style::default().fg(Color::DarkGray)),
    Span::styled(format!(" {} ", phase), Style::default().fg(Color::Yellow)),
    Span::styled("│", Style::default().fg(Color::DarkGray)),
    Span::styled(" unread ", Style::default().fg(Color::DarkGray)),
    Span::styled(unread, Style::default().fg(Color::Magenta).bold()),
  ]);

  let paragraph = Paragraph::new(header).style(Style::default().bg(Color::Black));
  frame.render_widget(paragraph, area);
}

fn draw_messages(frame: &mut Frame, area: Rect, app: &App) {
  let top = app.scroll_top();
  let mut lines: Vec<Line> = app
    .messages()
    .iter()
    .skip(top)
    .take(area.height as usize)
    .map(message_line)
    .collect();

  if top == 0 && app.is_loading_older() {
    lines.insert(
      0,
      Line::styled("  loading older messages...", Style::default().fg(Color::DarkGray)),
    );
    lines.truncate(area.height as usize);
  } else if app.messages().is_empty() && app.phase() != StreamPhase::Idle {
    lines.push(Line::styled(
      "  No messages yet. Press i to write one.",
      Style::default().fg(Color::DarkGray),
    ));
  }

  frame.render_widget(Paragraph::new(lines), area);
}

fn message_line(message: &Message) -> Line<'_> {
  let sender = message
    .sender_name
    .as_deref()
    .unwrap_or(message.sender_id.as_str());
  Line::from(vec![
    Span::styled(
      format!(" {} ", message.created_at.format("%d %b %H:%M")),
      Style::default().fg(Color::DarkGray),
    ),
    Span::styled(format!("{}: ", sender), Style::default().fg(Color::Cyan)),
    Span::raw(message.body.as_str()),
  ])
}

fn draw_session_expired(frame: &mut Frame, area: Rect) {
  let text = vec![
    Line::from(""),
    Line::styled("  Your session has expired.", Style::default().fg(Color::Red).bold()),
    Line::from("  Run `drivelink login` and reopen this conversation. Press q to quit."),
  ];
  frame.render_widget(Paragraph::new(text).wrap(Wrap { trim: false }), area);
}

fn draw_status_bar(frame: &mut Frame, area: Rect, app: &App) {
  if app.mode() == Mode::Compose {
    let prompt = "> ";
    let paragraph =
      Paragraph::new(format!("{}{}", prompt, app.input().value())).style(Style::default().fg(Color::Yellow));
    frame.render_widget(paragraph, area);
    let column = (prompt.len() + app.input().cursor_position()) as u16;
    frame.set_cursor_position((area.x + column.min(area.width.saturating_sub(1)), area.y));
    return;
  }

  let (content, style) = match app.status() {
    Some(status) => (format!(" {}", status), Style::default().fg(Color::Red)),
    None => {
      let history = if app.has_more() { "  k/PgUp:older" } else { "" };
      let hint = format!(" i:write  j/k:scroll  G:newest{}  q:quit", history);
      (hint, Style::default().fg(Color::DarkGray))
    }
  };

  let paragraph = Paragraph::new(content).style(style);
  frame.render_widget(paragraph, area);
}

use ratatui::Frame;
use ratatui::layout::{Alignment, Constraint, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table, TableState, Wrap};

use crate::app::{App, InputMode};
use crate::model::ResourceKind;
use crate::render::{RowAction, RowEvent};
use crate::view::ViewKind;

const BG: Color = Color::Rgb(9, 15, 25);
const PANEL: Color = Color::Rgb(16, 27, 44);
const ACCENT: Color = Color::Rgb(52, 211, 153);
const MUTED: Color = Color::Rgb(140, 156, 178);
const WARN: Color = Color::Rgb(251, 191, 36);
const ADDED: Color = Color::Rgb(125, 211, 252);
const SELECTED: Color = Color::Rgb(24, 36, 58);
/// Header segment backgrounds, left to right.
const SEGMENTS: [Color; 4] = [
    Color::Rgb(17, 94, 89),
    Color::Rgb(30, 64, 175),
    Color::Rgb(55, 48, 163),
    Color::Rgb(82, 24, 124),
];

pub fn render(frame: &mut Frame, app: &mut App) {
    let [header, body, footer] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Min(6),
        Constraint::Length(1),
    ])
    .areas(frame.area());

    render_header(frame, header, app);
    app.set_page_size(body.height.saturating_sub(3).max(1) as usize);
    render_table(frame, body, app);
    render_footer(frame, footer, app);

    if app.show_help() {
        render_help(frame, app);
    }
}

/// Appends `text` on `bg` followed by a powerline separator into `next`.
fn segment(spans: &mut Vec<Span<'static>>, text: String, fg: Color, bg: Color, next: Color) {
    spans.push(Span::styled(
        text,
        Style::default().fg(fg).bg(bg).add_modifier(Modifier::BOLD),
    ));
    spans.push(Span::styled("", Style::default().fg(bg).bg(next)));
}

fn render_header(frame: &mut Frame, area: Rect, app: &App) {
    let cluster = app.cluster().trim_start_matches("https://");
    let scope = if app.labels().is_empty() {
        app.table().namespace.label()
    } else {
        format!("{} -l {}", app.table().namespace.label(), app.labels())
    };
    let values = [
        format!(" 󱃾 {} ", ellipsize(app.context(), 18)),
        format!(" 󰒋 {} ", ellipsize(cluster, 22)),
        format!(" 󰀄 {} ", ellipsize(app.user(), 14)),
        format!(" 󰉖 {} ", ellipsize(&scope, 24)),
    ];
    let mut spans = Vec::new();
    for (index, value) in values.into_iter().enumerate() {
        let next = SEGMENTS.get(index + 1).copied().unwrap_or(BG);
        segment(&mut spans, value, Color::White, SEGMENTS[index], next);
    }
    let left = Line::from(spans);

    let crumbs = app.crumbs();
    let mut trail = Vec::new();
    for (index, crumb) in crumbs.iter().enumerate() {
        if index > 0 {
            trail.push(Span::styled(" › ", Style::default().fg(MUTED)));
        }
        let style = if index + 1 == crumbs.len() {
            Style::default().fg(ACCENT).add_modifier(Modifier::BOLD)
        } else {
            Style::default().fg(MUTED)
        };
        trail.push(Span::styled(ellipsize(crumb, 28), style));
    }
    trail.push(Span::raw(" "));
    let right = Line::from(trail);

    let width = right.width() as u16;
    let [left_area, right_area] =
        Layout::horizontal([Constraint::Fill(1), Constraint::Length(width)]).areas(area);
    let style = Style::default().bg(BG);
    frame.render_widget(Paragraph::new(left).style(style), left_area);
    frame.render_widget(
        Paragraph::new(right).style(style).alignment(Alignment::Right),
        right_area,
    );
}

fn render_table(frame: &mut Frame, area: Rect, app: &App) {
    let table_data = app.table();
    let visible_rows = app.visible_rows();

    let header = Row::new(table_data.header.iter().cloned().map(Cell::from))
        .style(Style::default().fg(ACCENT).add_modifier(Modifier::BOLD));

    let rows = visible_rows.iter().map(|(_, event)| {
        let base = row_style(event);
        Row::new(event.fields.iter().enumerate().map(|(index, field)| {
            let style = if event.changed_at(index) {
                base.add_modifier(Modifier::BOLD | Modifier::UNDERLINED)
            } else {
                base
            };
            Cell::from(field.clone()).style(style)
        }))
    });

    let widths = vec![Constraint::Fill(1); table_data.header.len().max(1)];
    let block = Block::default()
        .title(format!(
            "{}[{}] ({})",
            app.view_kind(),
            table_data.namespace,
            visible_rows.len()
        ))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(ACCENT))
        .style(Style::default().bg(PANEL));

    let table = Table::new(rows, widths)
        .header(header)
        .block(block)
        .row_highlight_style(Style::default().bg(SELECTED).add_modifier(Modifier::BOLD))
        .highlight_symbol("󰜴 ");

    let mut state = TableState::default().with_selected(app.selected_index());
    frame.render_stateful_widget(table, area, &mut state);
}

fn row_style(event: &RowEvent) -> Style {
    let color = match event.action {
        RowAction::New | RowAction::Unchanged => Color::White,
        RowAction::Added => ADDED,
        RowAction::Modified => WARN,
    };
    Style::default().fg(color)
}

fn render_footer(frame: &mut Frame, area: Rect, app: &App) {
    let mut spans = Vec::new();
    match app.mode() {
        InputMode::Normal => {
            let (mode, mode_bg) = if app.read_only() {
                (" 󰌾 ro ", WARN)
            } else {
                (" 󰘳 nrm ", SEGMENTS[0])
            };
            let (status, status_bg) = match app.pending_confirmation_prompt() {
                Some(prompt) => (format!(" {prompt}? (y/n) "), WARN),
                None => (format!(" {} ", app.status()), SEGMENTS[1]),
            };
            let status_fg = if status_bg == WARN { Color::Black } else { Color::White };
            segment(&mut spans, mode.to_string(), Color::Black, mode_bg, status_bg);
            segment(&mut spans, status, status_fg, status_bg, BG);
            spans.extend(change_counters(app));
        }
        mode => {
            let (label, sigil, bg) = match mode {
                InputMode::Filter => (" 󰈲 flt ", '/', WARN),
                InputMode::PortForward => (" 󰌘 pf ", '>', ADDED),
                _ => (" 󰘳 cmd ", ':', ACCENT),
            };
            segment(&mut spans, label.to_string(), Color::Black, bg, SEGMENTS[1]);
            segment(
                &mut spans,
                format!(" {sigil}{} ", app.input()),
                Color::White,
                SEGMENTS[1],
                BG,
            );
        }
    }
    frame.render_widget(
        Paragraph::new(Line::from(spans)).style(Style::default().bg(BG)),
        area,
    );
}

/// `+new ~modified =unchanged` for the current table.
fn change_counters(app: &App) -> Vec<Span<'static>> {
    let table = app.table();
    let fresh = table.count(RowAction::New) + table.count(RowAction::Added);
    vec![
        Span::styled(format!(" +{fresh}"), Style::default().fg(ADDED)),
        Span::styled(
            format!(" ~{}", table.count(RowAction::Modified)),
            Style::default().fg(WARN),
        ),
        Span::styled(
            format!(" ={}", table.count(RowAction::Unchanged)),
            Style::default().fg(MUTED),
        ),
    ]
}

fn render_help(frame: &mut Frame, app: &App) {
    let area = frame
        .area()
        .centered(Constraint::Percentage(78), Constraint::Percentage(72));
    frame.render_widget(Clear, area);

    let mut lines = vec![
        Line::from(format!(
            "kview  namespace:{}  view:{}",
            app.namespace(),
            app.view_kind()
        )),
        Line::from(""),
    ];
    lines.extend(help_lines(app.view_kind()).into_iter().map(Line::from));

    let help = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .style(Style::default().fg(Color::White))
        .block(
            Block::default()
                .title("Help")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(ACCENT))
                .style(Style::default().bg(PANEL)),
        );
    frame.render_widget(help, area);
}

fn help_lines(kind: &ViewKind) -> Vec<String> {
    let mut lines = vec![
        "Move: j/k  PgUp/PgDn  g/G   Flow: Enter drill-down  Esc back".to_string(),
        "Input: : command  / filter (/-l app=web for labels)  r refresh  0 all namespaces  ? help  q quit".to_string(),
        format!(
            "Commands: {}  users groups sas  pf",
            ResourceKind::ALL.map(ResourceKind::short_token).join(" ")
        ),
        "          ns <name>  all  filter <text>  <view> <namespace>".to_string(),
        String::new(),
        "Colors: blue added  yellow modified  underlined cells changed".to_string(),
        String::new(),
    ];

    match kind {
        ViewKind::Resource(ResourceKind::Pods) => {
            lines.push("Pods: f port-forward  x stop pod forwards  p list forwards".to_string());
            lines.push("Forward form: <container::port,...> <local,...>".to_string());
        }
        ViewKind::PortForwards => {
            lines.push("PortForwards: x stop the selected tunnel".to_string());
        }
        ViewKind::Resource(_) => {
            lines.push("Enter on roles or cluster roles expands their rules".to_string());
        }
        ViewKind::Subjects(_) => {
            lines.push("Enter shows every rule granted to the subject".to_string());
        }
        ViewKind::Rules { .. } | ViewKind::Policy { .. } => {
            lines.push("✓ allowed  ✗ denied  n/a not applicable".to_string());
        }
    }
    lines
}

/// Cuts `value` to `max` characters, marking the cut with an ellipsis.
fn ellipsize(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        None => value.to_string(),
        Some(_) => {
            let kept = value.chars().take(max.saturating_sub(1));
            kept.chain(std::iter::once('…')).collect()
        }
    }
}

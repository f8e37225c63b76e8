use ratatui::{
    layout::Rect,
    style::Color,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

fn key_line(key: &'static str, desc: &'static str) -> Line<'static> {
    Line::from(vec![
        Span::raw("  "),
        Span::styled(format!("{key:<12}"), Style::default().fg(Color::Magenta)),
        Span::raw(desc),
    ])
}

pub fn draw_help(area: Rect, f: &mut Frame) {
    let p = Paragraph::new(vec![
        Line::from("Keybinds:"),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("q", Style::default().fg(Color::Magenta)),
            Span::raw(" / "),
            Span::styled("Ctrl-C", Style::default().fg(Color::Magenta)),
            Span::raw("  Quit (cancels a running chain)"),
        ]),
        key_line("1 / 2 / 3", "Blur level: a little, more, the most"),
        key_line("g", "Go: start blurring"),
        key_line("c", "Cancel work"),
        key_line("o", "Open result: copy the saved image path"),
        key_line("p", "Toggle power (save waits while on battery)"),
        key_line("s", "Toggle storage low (save waits while low)"),
        key_line("e", "Export chain report as JSON"),
        key_line("tab", "Switch tabs"),
        key_line("?", "Show this help"),
        Line::from(""),
        Line::from("History tab:"),
        key_line("↑/↓ or j/k", "Navigate"),
        key_line("e", "Export selected as JSON"),
        key_line("y", "Copy exported path to clipboard"),
    ])
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, area);
}

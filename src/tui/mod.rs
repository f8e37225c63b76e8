mod export;
mod help;
mod state;

use crate::cli::Cli;
use crate::orchestrator::{self, AppEvent, UiCommand};
use crate::presenter::ViewState;
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Gauge, List, ListItem, ListState, Paragraph, Row, Table, Tabs},
    Terminal,
};
use state::{status_color, UiState};
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub async fn run(args: Cli) -> Result<()> {
    let (event_tx, event_rx) = mpsc::unbounded_channel::<AppEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let ui_args = args.clone();
    let ui_handle = std::thread::spawn(move || run_threaded(ui_args, event_rx, cmd_tx));

    let res = orchestrator::run_controller(&args, args.go, event_tx, cmd_rx).await;

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    res
}

/// Run the TUI loop on a dedicated thread.
pub fn run_threaded(
    args: Cli,
    mut event_rx: UnboundedReceiver<AppEvent>,
    cmd_tx: UnboundedSender<UiCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    // UiState is owned by the UI thread only; no cross-thread mutation.
    let mut state = UiState {
        image: args.image.clone(),
        blur_level: args.blur_level,
        ..Default::default()
    };

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    let res = loop {
        // Drain events without blocking to keep UI responsive.
        while let Ok(ev) = event_rx.try_recv() {
            state::apply_event(&mut state, ev);
        }

        if last_tick.elapsed() >= tick_rate {
            terminal.draw(|f| draw(f.area(), f, &state)).ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                match (k.modifiers, k.code) {
                    (_, KeyCode::Char('q')) | (KeyModifiers::CONTROL, KeyCode::Char('c')) => {
                        let _ = cmd_tx.send(UiCommand::Quit);
                        break Ok(());
                    }
                    (_, KeyCode::Char(c @ '1'..='3')) => {
                        state.blur_level = c.to_digit(10).unwrap_or(1);
                        state.info = format!("Blur level {}", state.blur_level);
                    }
                    (_, KeyCode::Char('g')) => {
                        if state.view.visibility.go {
                            let _ = cmd_tx.send(UiCommand::Go(state.blur_level));
                        } else {
                            state.info = "Work in progress. Press 'c' to cancel.".into();
                        }
                    }
                    (_, KeyCode::Char('c')) => {
                        if state.view.visibility.cancel {
                            let _ = cmd_tx.send(UiCommand::Cancel);
                        } else {
                            state.info = "Nothing to cancel.".into();
                        }
                    }
                    (_, KeyCode::Char('o')) => {
                        if state.view.visibility.see_file {
                            export::copy_output_path(&mut state);
                        } else {
                            state.info = "No blurred image yet. Press 'g' to start.".into();
                        }
                    }
                    (_, KeyCode::Char('p')) => {
                        let _ = cmd_tx.send(UiCommand::SetCharging(!state.device.charging));
                    }
                    (_, KeyCode::Char('s')) => {
                        let _ = cmd_tx.send(UiCommand::SetStorageLow(!state.device.storage_low));
                    }
                    (_, KeyCode::Char('e')) => {
                        export::export_and_show_path(&mut state);
                    }
                    (_, KeyCode::Char('y')) => {
                        if let Some(path) = state.last_exported_path.clone() {
                            match export::copy_to_clipboard(&path) {
                                Ok(_) => state.info = format!("✓ Copied to clipboard: {path}"),
                                Err(e) => state.info = format!("Clipboard copy failed: {e:#}"),
                            }
                        } else {
                            state.info = "No exported file path to copy. Export a file first (e)".into();
                        }
                    }
                    (_, KeyCode::Tab) => {
                        state.tab = (state.tab + 1) % 3;
                        if state.tab == 1 {
                            state.history_selected = 0;
                        }
                    }
                    (_, KeyCode::Char('?')) => {
                        state.tab = 2;
                    }
                    (_, KeyCode::Up) | (_, KeyCode::Char('k')) => {
                        if state.tab == 1 && state.history_selected > 0 {
                            state.history_selected -= 1;
                        }
                    }
                    (_, KeyCode::Down) | (_, KeyCode::Char('j')) => {
                        if state.tab == 1
                            && state.history_selected < state.history.len().saturating_sub(1)
                        {
                            state.history_selected += 1;
                        }
                    }
                    _ => {}
                }
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)].as_ref())
        .split(area);

    let tabs = Tabs::new(vec![
        Line::from("Dashboard"),
        Line::from("History"),
        Line::from("Help"),
    ])
    .select(state.tab)
    .block(Block::default().borders(Borders::ALL).title("blurchain"))
    .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    match state.tab {
        0 => draw_dashboard(chunks[1], f, state),
        1 => draw_history(chunks[1], f, state),
        _ => help::draw_help(chunks[1], f),
    }
}

fn on_off(flag: bool, on: &'static str, off: &'static str, good: bool) -> Span<'static> {
    let text = if flag { on } else { off };
    let color = if flag == good { Color::Green } else { Color::Red };
    Span::styled(text, Style::default().fg(color))
}

fn draw_dashboard(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Length(6),
                Constraint::Length(3),
                Constraint::Min(5),
                Constraint::Length(3),
            ]
            .as_ref(),
        )
        .split(area);

    let view_label = match &state.view.state {
        ViewState::Idle => Span::styled("Idle", Style::default().fg(Color::Gray)),
        ViewState::InProgress => Span::styled("Working…", Style::default().fg(Color::Yellow)),
        ViewState::Finished { .. } => Span::styled("Finished", Style::default().fg(Color::Green)),
    };
    let mut summary = vec![
        Line::from(vec![
            Span::raw("Image: "),
            Span::styled(
                state.image.clone().unwrap_or_else(|| "(none selected)".into()),
                Style::default().fg(Color::Cyan),
            ),
        ]),
        Line::from(format!("Blur level: {}", state.blur_level)),
        Line::from(vec![
            Span::raw("Power: "),
            on_off(state.device.charging, "plugged in", "on battery", true),
            Span::raw("   Storage: "),
            on_off(state.device.storage_low, "low", "ok", false),
        ]),
        Line::from(vec![Span::raw("State: "), view_label]),
    ];
    if let Some(outcome) = state.view.outcome.as_ref() {
        summary.push(Line::from(format!("Last chain: {}", outcome.label())));
    }
    f.render_widget(
        Paragraph::new(summary).block(Block::default().borders(Borders::ALL).title("Blur")),
        chunks[0],
    );

    let gauge = if state.view.visibility.progress {
        Gauge::default()
            .gauge_style(Style::default().fg(Color::Yellow))
            .ratio(state.progress().clamp(0.0, 1.0))
    } else {
        Gauge::default().ratio(0.0).label("")
    };
    f.render_widget(
        gauge.block(Block::default().borders(Borders::ALL).title("Progress")),
        chunks[1],
    );

    let rows: Vec<Row> = state
        .stages
        .iter()
        .map(|s| {
            Row::new(vec![
                Cell::from(format!("{:?}", s.kind)),
                Cell::from(format!("{:?}", s.status))
                    .style(Style::default().fg(status_color(s.status))),
                Cell::from(
                    s.duration_ms
                        .map(|ms| format!("{ms} ms"))
                        .unwrap_or_else(|| "-".into()),
                ),
                Cell::from(s.error.clone().unwrap_or_default()),
            ])
        })
        .collect();
    let title = match state.newest_chain() {
        Some(id) => format!("Stages ({id})"),
        None => "Stages".into(),
    };
    let table = Table::new(
        rows,
        [
            Constraint::Length(10),
            Constraint::Length(11),
            Constraint::Length(10),
            Constraint::Min(10),
        ],
    )
    .header(
        Row::new(vec!["Stage", "Status", "Took", "Error"])
            .style(Style::default().add_modifier(Modifier::BOLD)),
    )
    .block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(table, chunks[2]);

    let vis = state.view.visibility;
    let mut keys = Vec::new();
    if vis.go {
        keys.push(Span::styled("g", Style::default().fg(Color::Magenta)));
        keys.push(Span::raw(" go  "));
    }
    if vis.cancel {
        keys.push(Span::styled("c", Style::default().fg(Color::Magenta)));
        keys.push(Span::raw(" cancel  "));
    }
    if vis.see_file {
        keys.push(Span::styled("o", Style::default().fg(Color::Magenta)));
        keys.push(Span::raw(" see file  "));
    }
    keys.push(Span::raw("| "));
    keys.push(Span::raw(state.info.clone()));
    f.render_widget(
        Paragraph::new(Line::from(keys)).block(Block::default().borders(Borders::ALL)),
        chunks[3],
    );
}

fn draw_history(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    if state.history.is_empty() {
        f.render_widget(
            Paragraph::new("No finished chains yet.")
                .block(Block::default().borders(Borders::ALL).title("History")),
            area,
        );
        return;
    }

    let items: Vec<ListItem> = state
        .history
        .iter()
        .map(|r| {
            let mut spans = vec![
                Span::raw(format!("{:<10} ", r.chain.to_string())),
                Span::styled(
                    format!("{:<10} ", format!("{:?}", r.status)),
                    Style::default().fg(status_color(r.status)),
                ),
                Span::raw(format!("{} ", r.finished_utc)),
            ];
            if let Some(out) = r.output.as_ref() {
                spans.push(Span::styled(out.to_string(), Style::default().fg(Color::Cyan)));
            } else if let Some(err) = r.error.as_deref() {
                spans.push(Span::styled(err.to_string(), Style::default().fg(Color::Red)));
            }
            ListItem::new(Line::from(spans))
        })
        .collect();

    let mut list_state = ListState::default();
    list_state.select(Some(state.history_selected));
    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title("History"))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED));
    f.render_stateful_widget(list, area, &mut list_state);
}

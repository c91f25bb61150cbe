/// cusim live visualizer: attach to any running simulation at any time.
///
/// Run in a separate terminal:
///   cargo run --bin viz [path]
///
/// Polls the metrics file (default /tmp/cusim_live.json) every 200ms and
/// renders a live TUI dashboard:
///
///     ┌ header: kernel / dispatch policy / status / cycle ─────────┐
///     │ CU grid (resident work-groups)  │ Dispatch: progress …     │
///     │ q/esc: quit  …footer…                                      │
///
/// Press q or Esc to quit. The simulation keeps running unaffected.
use crossterm::{
    event::{self, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use cusim::metrics::{read_metrics, LiveMetrics, DEFAULT_METRICS_PATH};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph},
    Frame, Terminal,
};
use std::{io, time::Duration};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_METRICS_PATH.to_string());

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run(&mut terminal, &path);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

fn run(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        let metrics = read_metrics(path);
        terminal.draw(|f| render(f, metrics.as_ref(), path))?;

        // Non-blocking: poll for 200ms, then redraw regardless
        if event::poll(Duration::from_millis(200))? {
            if let Event::Key(key) = event::read()? {
                if matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) {
                    break;
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Top-level layout
// ---------------------------------------------------------------------------

fn render(f: &mut Frame, metrics: Option<&LiveMetrics>, path: &str) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // header
            Constraint::Min(0),    // CU grid + stats
            Constraint::Length(1), // footer
        ])
        .split(f.area());

    render_header(f, rows[0], metrics);

    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(62), Constraint::Percentage(38)])
        .split(rows[1]);

    render_cu_grid(f, cols[0], metrics);
    render_stats(f, cols[1], metrics);
    render_footer(f, rows[2], path);
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

fn render_header(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default()
        .title(Span::styled(
            " cusim live monitor ",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ))
        .borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let (name, policy, status, cycle) = metrics
        .map(|m| {
            (
                m.kernel_name.as_str(),
                m.dispatch_policy.as_str(),
                m.status.as_str(),
                m.cycle.to_string(),
            )
        })
        .unwrap_or(("-", "-", "idle", "-".to_string()));

    let status_color = match status {
        "running" => Color::Green,
        "complete" => Color::Cyan,
        _ => Color::DarkGray,
    };

    let spans = vec![
        Span::styled("  kernel: ", Style::default().fg(Color::DarkGray)),
        Span::styled(name, Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
        Span::styled("   dispatch: ", Style::default().fg(Color::DarkGray)),
        Span::styled(policy, Style::default().fg(Color::Cyan)),
        Span::styled("   status: ", Style::default().fg(Color::DarkGray)),
        Span::styled(
            status.to_uppercase(),
            Style::default().fg(status_color).add_modifier(Modifier::BOLD),
        ),
        Span::styled("   cycle: ", Style::default().fg(Color::DarkGray)),
        Span::raw(cycle),
    ];

    f.render_widget(Paragraph::new(Line::from(spans)), inner);
}

// ---------------------------------------------------------------------------
// CU grid
// ---------------------------------------------------------------------------

fn render_cu_grid(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default().title(" Compute Units ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let Some(m) = metrics else {
        return;
    };

    let legend = Line::from(vec![
        Span::styled("██", Style::default().fg(Color::Green)),
        Span::raw(" busy   "),
        Span::styled("██", Style::default().fg(Color::Magenta)),
        Span::raw(" paused   "),
        Span::styled("░░", Style::default().fg(Color::DarkGray)),
        Span::raw(" empty"),
    ]);
    let mut lines: Vec<Line> = vec![legend, Line::raw("")];

    // Each CU cell: "CU12 ██ 3wg" = 12 chars
    let per_row = (inner.width as usize / 12).max(1);
    for row in m.cus.chunks(per_row) {
        let spans: Vec<Span> = row
            .iter()
            .flat_map(|cu| {
                let (symbol, color) = if cu.paused {
                    ("██", Color::Magenta)
                } else if cu.resident_wgs > 0 {
                    ("██", Color::Green)
                } else {
                    ("░░", Color::DarkGray)
                };
                vec![
                    Span::styled(format!("CU{:<2} ", cu.id), Style::default().fg(Color::DarkGray)),
                    Span::styled(symbol, Style::default().fg(color)),
                    Span::raw(format!(" {:>2}wg ", cu.resident_wgs)),
                ]
            })
            .collect();
        lines.push(Line::from(spans));
    }

    let busy = m.cus.iter().filter(|cu| cu.resident_wgs > 0).count();
    lines.push(Line::raw(""));
    lines.push(Line::from(vec![Span::styled(
        format!("  {}/{} CUs with resident work", busy, m.cus.len()),
        Style::default().fg(Color::DarkGray),
    )]));

    f.render_widget(Paragraph::new(lines), inner);
}

// ---------------------------------------------------------------------------
// Stats panel
// ---------------------------------------------------------------------------

fn render_stats(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default().title(" Dispatch ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2), // completion gauge
            Constraint::Length(1), // spacer
            Constraint::Min(0),    // text stats
        ])
        .split(inner);

    let Some(m) = metrics else {
        let msg = Paragraph::new(vec![
            Line::raw(""),
            Line::from(Span::styled(
                "  No simulation running.",
                Style::default().fg(Color::DarkGray),
            )),
            Line::from(Span::styled(
                "  Start cusim with live metrics enabled.",
                Style::default().fg(Color::DarkGray),
            )),
        ]);
        f.render_widget(msg, inner);
        return;
    };

    let pct = (m.progress() * 100.0).clamp(0.0, 100.0) as u16;
    let gauge = Gauge::default()
        .block(Block::default().title("Work-groups"))
        .gauge_style(Style::default().fg(Color::Blue))
        .percent(pct)
        .label(format!("{} / {}", m.wgs_completed, m.wgs_total));
    f.render_widget(gauge, rows[0]);

    let resident_wfs: usize = m.cus.iter().map(|cu| cu.resident_wfs).sum();
    let insts: u64 = m.cus.iter().map(|cu| cu.insts_issued).sum();
    let peak = m.cus.iter().map(|cu| cu.peak_resident_wgs).max().unwrap_or(0);
    let field = |label: &'static str, value: String| {
        Line::from(vec![
            Span::styled(label, Style::default().fg(Color::DarkGray)),
            Span::raw(value),
        ])
    };
    let text = vec![
        field("Dispatched:   ", m.wgs_dispatched.to_string()),
        field("In flight:    ", m.wgs_in_flight.to_string()),
        field("Wavefronts:   ", resident_wfs.to_string()),
        field("Issued insts: ", insts.to_string()),
        field("Peak WG/CU:   ", peak.to_string()),
        field("Mem served:   ", m.memory_served.to_string()),
        Line::raw(""),
        field("Grid:  ", format!("({},{},{})", m.grid[0], m.grid[1], m.grid[2])),
        field(
            "WG:    ",
            format!("({},{},{})", m.work_group[0], m.work_group[1], m.work_group[2]),
        ),
    ];
    f.render_widget(Paragraph::new(text), rows[2]);
}

// ---------------------------------------------------------------------------
// Footer
// ---------------------------------------------------------------------------

fn render_footer(f: &mut Frame, area: Rect, path: &str) {
    let text = Paragraph::new(Span::styled(
        format!("  q / esc: quit    auto-refreshes every 200ms    reads {path}"),
        Style::default().fg(Color::DarkGray),
    ));
    f.render_widget(text, area);
}

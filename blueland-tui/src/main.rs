/*!
 * Blueland TUI
 * Terminal frontend for bluelandd
 */

use anyhow::Result;
use clap::Parser;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};
use std::io;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

mod app;
mod client;
mod ui;

use app::App;
use client::BluelandClient;
use ui::render_ui;

// header refresh, in ticks
const STATUS_EVERY: u32 = 20;

#[derive(Parser)]
#[command(name = "blueland")]
#[command(about = "Blueland Bluetooth TUI")]
struct Cli {
    /// Daemon command socket path
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Daemon event socket path
    #[arg(short, long)]
    events: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime_dir = client::runtime_dir();
    let socket = cli.socket.unwrap_or_else(|| runtime_dir.join("command.sock"));
    let events = cli.events.unwrap_or_else(|| runtime_dir.join("blueland.sock"));

    // Initialize terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let (updates_tx, mut updates) = mpsc::unbounded_channel();
    tokio::spawn(client::follow_events(events, updates_tx.clone()));

    let mut app = App::new(BluelandClient::new(socket), updates_tx);
    app.refresh_status();
    app.discover();

    let mut ticker = interval(Duration::from_millis(100));
    let mut ticks: u32 = 0;

    let result = loop {
        if event::poll(Duration::from_millis(0))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') => break Ok(()),
                        KeyCode::Up => app.previous_device(),
                        KeyCode::Down => app.next_device(),
                        KeyCode::Char('s') => app.discover(),
                        KeyCode::Enter => app.pair_connect(),
                        KeyCode::Char('d') => app.disconnect(),
                        KeyCode::Char('x') => app.remove(),
                        _ => {}
                    }
                }
            }
        }

        while let Ok(update) = updates.try_recv() {
            app.apply(update);
        }

        ticker.tick().await;
        ticks = ticks.wrapping_add(1);
        if ticks % STATUS_EVERY == 0 {
            app.refresh_status();
        }

        if let Err(e) = terminal.draw(|f| render_ui(f, &app)) {
            break Err(e.into());
        }
    };

    // Restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    result
}

/// Terminal client: conversation list and open thread side by side
use std::path::Path;
use std::time::{Duration, Instant};

use chatline_core::feed::FeedState;
use chatline_core::runtime::ChatHandle;
use chatline_core::session::resolve_session;
use chatline_core::thread::ThreadSnapshot;
use chatline_core::types::{AttachmentKind, ConversationSummary, UserId, ViewEvent};
use chatline_core::{Backend, ChatRuntime, Config};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph},
    Frame, Terminal,
};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Pixel height reported per thread row
const ROW_HEIGHT_PX: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Focus {
    Rooms,
    Thread,
}

struct App {
    handle: ChatHandle,
    me: Option<UserId>,
    rooms: Vec<ConversationSummary>,
    selected: usize,
    thread: Option<ThreadSnapshot>,
    /// First visible thread row; row 0 is the oldest loaded message
    scroll_top: usize,
    /// Pin the view to the newest message
    follow: bool,
    /// Thread pane height in rows, updated on every draw
    viewport: usize,
    focus: Focus,
    rooms_feed: Option<FeedState>,
    thread_feed: Option<FeedState>,
    status: Option<String>,
}

impl App {
    fn new(handle: ChatHandle, me: Option<UserId>) -> Self {
        Self {
            handle,
            me,
            rooms: Vec::new(),
            selected: 0,
            thread: None,
            scroll_top: 0,
            follow: true,
            viewport: 0,
            focus: Focus::Rooms,
            rooms_feed: None,
            thread_feed: None,
            status: None,
        }
    }

    fn apply(&mut self, event: ViewEvent) {
        match event {
            ViewEvent::RoomsUpdated { rooms } => {
                // Keep the cursor on the same conversation while the list reorders
                let current = self.rooms.get(self.selected).map(|r| r.room_id);
                self.rooms = rooms;
                self.selected = current
                    .and_then(|id| self.rooms.iter().position(|r| r.room_id == id))
                    .unwrap_or(self.selected)
                    .min(self.rooms.len().saturating_sub(1));
            }
            ViewEvent::ThreadUpdated { thread } => {
                let same_view = self
                    .thread
                    .as_ref()
                    .is_some_and(|t| t.room_id == thread.room_id && t.generation == thread.generation);
                if same_view {
                    // Older rows landed above the viewport: keep what the user is reading in place
                    let previous_oldest = self
                        .thread
                        .as_ref()
                        .and_then(|t| t.messages.last())
                        .map(|m| m.id);
                    if let Some(oldest) = previous_oldest {
                        let prepended = thread.messages.iter().filter(|m| m.id < oldest).count();
                        self.scroll_top += prepended;
                    }
                } else {
                    self.scroll_top = 0;
                    self.follow = true;
                }
                self.thread = Some(thread);
                self.clamp_scroll();
            }
            ViewEvent::ThreadClosed { room_id } => {
                if self.thread.as_ref().is_some_and(|t| t.room_id == room_id) {
                    self.thread = None;
                    self.thread_feed = None;
                }
            }
            ViewEvent::FeedState { feed, state } => match feed {
                chatline_core::feed::FeedKind::Rooms => self.rooms_feed = Some(state),
                chatline_core::feed::FeedKind::Thread => self.thread_feed = Some(state),
            },
        }
    }

    fn rows(&self) -> usize {
        self.thread.as_ref().map(|t| t.messages.len()).unwrap_or(0)
    }

    fn max_scroll_top(&self) -> usize {
        self.rows().saturating_sub(self.viewport)
    }

    fn clamp_scroll(&mut self) {
        let max_top = self.max_scroll_top();
        if self.follow {
            self.scroll_top = max_top;
        } else {
            self.scroll_top = self.scroll_top.min(max_top);
        }
    }

    fn move_selection(&mut self, delta: isize) {
        if self.rooms.is_empty() {
            return;
        }
        let last = self.rooms.len() as isize - 1;
        self.selected = (self.selected as isize + delta).clamp(0, last) as usize;
    }

    fn open_selected(&mut self) {
        if let Some(room) = self.rooms.get(self.selected) {
            self.report(self.handle.select_room(room.room_id));
            self.focus = Focus::Thread;
        }
    }

    fn close_thread(&mut self) {
        self.report(self.handle.close_room());
        self.focus = Focus::Rooms;
    }

    fn scroll_by(&mut self, delta: isize) {
        if self.thread.is_none() {
            return;
        }
        let max_top = self.max_scroll_top();
        let top = (self.scroll_top as isize + delta).clamp(0, max_top as isize) as usize;
        self.scroll_top = top;
        self.follow = top >= max_top;
        self.report(self.handle.scroll(top as f64 * ROW_HEIGHT_PX));
    }

    fn report(&mut self, res: chatline_core::Result<()>) {
        if let Err(e) = res {
            error!("Runtime command failed: {}", e);
            self.status = Some(e.to_string());
        }
    }

    /// Returns false when the user quits
    fn on_key(&mut self, code: KeyCode) -> bool {
        let page = self.viewport.max(1) as isize;
        match code {
            KeyCode::Char('q') => return false,
            KeyCode::Tab => {
                self.focus = match self.focus {
                    Focus::Rooms if self.thread.is_some() => Focus::Thread,
                    _ => Focus::Rooms,
                };
            }
            KeyCode::Up => match self.focus {
                Focus::Rooms => self.move_selection(-1),
                Focus::Thread => self.scroll_by(-1),
            },
            KeyCode::Down => match self.focus {
                Focus::Rooms => self.move_selection(1),
                Focus::Thread => self.scroll_by(1),
            },
            KeyCode::Char('k') => self.scroll_by(-1),
            KeyCode::Char('j') => self.scroll_by(1),
            KeyCode::PageUp => self.scroll_by(-page),
            KeyCode::PageDown => self.scroll_by(page),
            KeyCode::Enter => self.open_selected(),
            KeyCode::Esc => self.close_thread(),
            _ => {}
        }
        true
    }
}

fn feed_label(state: Option<&FeedState>) -> (&'static str, Color) {
    match state {
        Some(FeedState::Open) => ("live", Color::Green),
        Some(FeedState::Connecting { .. }) => ("connecting", Color::Yellow),
        Some(FeedState::Failed { .. }) => ("failed", Color::Red),
        Some(FeedState::Closed) => ("closed", Color::DarkGray),
        None => ("-", Color::DarkGray),
    }
}

fn ui(f: &mut Frame, app: &mut App) {
    let vchunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(3), Constraint::Length(1)].as_ref())
        .split(f.size());
    let panes = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(35), Constraint::Percentage(65)].as_ref())
        .split(vchunks[0]);

    let focused = Style::default().fg(Color::Cyan);
    let unfocused = Style::default().fg(Color::DarkGray);

    // Conversation list
    let items: Vec<ListItem> = app
        .rooms
        .iter()
        .map(|room| {
            let marker = if room.is_unseen() {
                Span::styled("● ", Style::default().fg(Color::LightBlue))
            } else {
                Span::raw("  ")
            };
            let name = if room.name.is_empty() { "(unnamed)" } else { room.name.as_str() };
            ListItem::new(vec![
                Line::from(vec![
                    marker,
                    Span::styled(name.to_string(), Style::default().add_modifier(Modifier::BOLD)),
                ]),
                Line::from(Span::styled(
                    format!("  {}", room.last_message),
                    Style::default().fg(Color::Gray),
                )),
            ])
        })
        .collect();
    let rooms_block = Block::default()
        .title(format!(" Conversations ({}) ", app.rooms.len()))
        .borders(Borders::ALL)
        .border_style(if app.focus == Focus::Rooms { focused } else { unfocused });
    let list = List::new(items)
        .block(rooms_block)
        .highlight_style(Style::default().bg(Color::DarkGray).add_modifier(Modifier::BOLD));
    let mut list_state = ListState::default();
    if !app.rooms.is_empty() {
        list_state.select(Some(app.selected));
    }
    f.render_stateful_widget(list, panes[0], &mut list_state);

    // Open thread
    app.viewport = panes[1].height.saturating_sub(2) as usize;
    app.clamp_scroll();

    let thread_style = if app.focus == Focus::Thread { focused } else { unfocused };
    match &app.thread {
        Some(thread) => {
            let room_name = app
                .rooms
                .iter()
                .find(|r| r.room_id == thread.room_id)
                .map(|r| r.name.clone())
                .unwrap_or_else(|| format!("room {}", thread.room_id));
            let mut title = format!(" {} ", room_name);
            if thread.loading {
                title.push_str("· loading… ");
            } else if thread.reached_start {
                title.push_str("· start of conversation ");
            }

            let lines: Vec<Line> = thread
                .messages
                .iter()
                .rev()
                .map(|m| {
                    let mine = app.me == Some(m.sender_id);
                    let sender = if mine { "you" } else { thread.sender_name(m.sender_id) };
                    let sender_style = if mine {
                        Style::default().fg(Color::Green).add_modifier(Modifier::BOLD)
                    } else {
                        Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)
                    };
                    let mut spans = vec![
                        Span::styled(format!("{:>7} ", m.id), Style::default().fg(Color::DarkGray)),
                        Span::styled(format!("{}: ", sender), sender_style),
                        Span::raw(m.content.clone()),
                    ];
                    for a in m.attachments() {
                        let tag = match a.kind {
                            AttachmentKind::Image => "image",
                            AttachmentKind::File => "file",
                        };
                        spans.push(Span::styled(
                            format!(" [{}: {}]", tag, a.label()),
                            Style::default().fg(Color::Yellow),
                        ));
                    }
                    Line::from(spans)
                })
                .collect();

            let para = Paragraph::new(lines)
                .block(Block::default().title(title).borders(Borders::ALL).border_style(thread_style))
                .scroll((app.scroll_top.min(u16::MAX as usize) as u16, 0));
            f.render_widget(para, panes[1]);
        }
        None => {
            let para = Paragraph::new("Select a conversation and press Enter")
                .style(Style::default().fg(Color::DarkGray))
                .block(Block::default().title(" Thread ").borders(Borders::ALL).border_style(thread_style));
            f.render_widget(para, panes[1]);
        }
    }

    // Status line
    let (rooms_label, rooms_color) = feed_label(app.rooms_feed.as_ref());
    let (thread_label, thread_color) = feed_label(app.thread_feed.as_ref());
    let mut status = vec![
        Span::raw(" rooms: "),
        Span::styled(rooms_label, Style::default().fg(rooms_color)),
        Span::raw("  thread: "),
        Span::styled(thread_label, Style::default().fg(thread_color)),
        Span::styled(
            "   ↑/↓ select  Enter open  Esc close  PgUp/PgDn/k/j scroll  Tab focus  q quit",
            Style::default().fg(Color::DarkGray),
        ),
    ];
    if let Some(msg) = &app.status {
        status.push(Span::styled(format!("  {}", msg), Style::default().fg(Color::Red)));
    }
    f.render_widget(Paragraph::new(Line::from(status)), vchunks[1]);
}

fn init_logging(data_dir: &Path) -> anyhow::Result<()> {
    // Logs go to a file so they do not tear the screen
    std::fs::create_dir_all(data_dir)?;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(data_dir.join("tui.log"))?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        println!("{}", Config::usage("tui"));
        return Ok(());
    }
    let mut config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    init_logging(&config.data_dir)?;

    let Some(session) = resolve_session(&config)? else {
        anyhow::bail!("Not signed in: run `cli token <api_url> <access_token>` first");
    };
    config.api_url = session.api_url.clone();
    let backend = Backend::new(
        &config.api_url,
        config.ws_url.as_deref(),
        &session.access_token,
        config.request_timeout,
    )?;
    let me = match backend.validate().await {
        Ok(profile) => Some(profile.id),
        Err(e) => {
            warn!("Could not validate session: {}", e);
            session.user_id()
        }
    };

    let (runtime, handle) = ChatRuntime::new(&config, backend);
    let mut events = handle.subscribe();
    let runtime_task = tokio::spawn(runtime.run());
    info!("TUI started against {}", config.api_url);

    enable_raw_mode()?;
    let mut stdout = std::io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;
    let mut app = App::new(handle.clone(), me);
    let res = run_app(&mut terminal, &mut app, &mut events);
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    let _ = handle.shutdown();
    match runtime_task.await {
        Ok(Err(e)) => error!("Runtime error: {}", e),
        Err(e) => error!("Runtime task failed: {}", e),
        Ok(Ok(())) => {}
    }

    if let Err(e) = res {
        eprintln!("TUI error: {e}");
    }
    Ok(())
}

fn run_app<B: ratatui::backend::Backend>(
    terminal: &mut Terminal<B>,
    app: &mut App,
    events: &mut broadcast::Receiver<ViewEvent>,
) -> std::io::Result<()> {
    let mut last_redraw = Instant::now() - Duration::from_secs(1);
    let mut dirty = true;

    loop {
        loop {
            match events.try_recv() {
                Ok(event) => {
                    app.apply(event);
                    dirty = true;
                }
                Err(TryRecvError::Lagged(n)) => warn!("TUI lagged {} view events", n),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => return Ok(()),
            }
        }

        if event::poll(Duration::from_millis(10))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    if !app.on_key(key.code) {
                        return Ok(());
                    }
                    dirty = true;
                }
            }
        }

        if dirty && last_redraw.elapsed() >= Duration::from_millis(16) {
            terminal.draw(|f| ui(f, app))?;
            last_redraw = Instant::now();
            dirty = false;
        }
    }
}

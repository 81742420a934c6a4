use crate::backend::Backend;
use crate::config::Config;
use crate::feed::{spawn_feed, FeedEvent, FeedKind, FeedState};
use crate::room_list::RoomList;
use crate::session::{resolve_session, Session, SessionStore};
use crate::types::{ConversationSummary, MessageId, MessageRecord, RoomId, RoomKind};
use colored::*;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Minimum query length accepted by user search
pub const MIN_SEARCH_LEN: usize = 4;

/// Parsed CLI command
#[derive(Debug, Clone, PartialEq)]
pub enum CliCommand {
    Token { api_url: String, token: String },
    WhoAmI,
    Logout,
    Rooms { once: bool },
    History {
        room_id: RoomId,
        before_id: Option<MessageId>,
        limit: Option<u32>,
    },
    Send {
        room_id: RoomId,
        message: String,
        files: Vec<PathBuf>,
    },
    Search { query: String },
    NewRoom { kind: RoomKind, emails: Vec<String> },
    Profile,
    ProfileSet { field: ProfileField, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileField {
    Username,
    FirstName,
    LastName,
}

impl std::str::FromStr for ProfileField {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "username" => Ok(ProfileField::Username),
            "first_name" => Ok(ProfileField::FirstName),
            "last_name" => Ok(ProfileField::LastName),
            other => Err(format!("unknown profile field: {}", other)),
        }
    }
}

/// Parse `args[1..]` into a command. `Ok(None)` means "print usage".
pub fn parse_command(args: &[String]) -> std::result::Result<Option<CliCommand>, String> {
    let Some(command) = args.get(1) else {
        return Ok(None);
    };
    let rest = &args[2..];

    let cmd = match command.as_str() {
        "token" => match rest {
            [api_url, token] => CliCommand::Token {
                api_url: api_url.clone(),
                token: token.clone(),
            },
            _ => return Err("token <api_url> <access_token>".to_string()),
        },
        "whoami" => CliCommand::WhoAmI,
        "logout" => CliCommand::Logout,
        "rooms" => CliCommand::Rooms {
            once: rest.iter().any(|a| a == "--once"),
        },
        "history" => {
            let usage = "history <room_id> [before_id] [limit]";
            let room_id = rest
                .first()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| usage.to_string())?;
            let before_id = match rest.get(1) {
                Some(s) => Some(s.parse().map_err(|_| usage.to_string())?),
                None => None,
            };
            let limit = match rest.get(2) {
                Some(s) => Some(
                    s.parse::<u32>()
                        .ok()
                        .filter(|n| *n > 0)
                        .ok_or_else(|| usage.to_string())?,
                ),
                None => None,
            };
            CliCommand::History {
                room_id,
                before_id,
                limit,
            }
        }
        "send" => {
            let usage = "send <room_id> [--file <path>]... <message>";
            let room_id = rest
                .first()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| usage.to_string())?;
            let mut words = Vec::new();
            let mut files = Vec::new();
            let mut iter = rest[1..].iter();
            while let Some(arg) = iter.next() {
                if arg == "--file" {
                    let path = iter.next().ok_or_else(|| usage.to_string())?;
                    files.push(PathBuf::from(path));
                } else {
                    words.push(arg.as_str());
                }
            }
            let message = words.join(" ");
            // Text may be empty when something is attached
            if message.trim().is_empty() && files.is_empty() {
                return Err(usage.to_string());
            }
            CliCommand::Send {
                room_id,
                message,
                files,
            }
        }
        "search" => {
            let query = rest.join(" ").trim().to_string();
            if query.chars().count() < MIN_SEARCH_LEN {
                return Err(format!(
                    "search <query>  (at least {} characters)",
                    MIN_SEARCH_LEN
                ));
            }
            CliCommand::Search { query }
        }
        "new-room" => {
            let usage = "new-room <oneone|group|public> <email>...";
            let kind = rest
                .first()
                .and_then(|s| s.parse::<RoomKind>().ok())
                .ok_or_else(|| usage.to_string())?;
            let emails: Vec<String> = rest[1..].to_vec();
            if emails.is_empty() || (kind == RoomKind::Direct && emails.len() != 1) {
                return Err(usage.to_string());
            }
            CliCommand::NewRoom { kind, emails }
        }
        "profile" => match rest {
            [] => CliCommand::Profile,
            [set, field, value @ ..] if set == "set" && !value.is_empty() => {
                CliCommand::ProfileSet {
                    field: field.parse()?,
                    value: value.join(" "),
                }
            }
            _ => return Err("profile [set <username|first_name|last_name> <value>]".to_string()),
        },
        other => return Err(format!("Unknown command: {}", other)),
    };
    Ok(Some(cmd))
}

/// Shared CLI entry point for the `cli` binary.
pub fn run(args: Vec<String>) -> anyhow::Result<()> {
    let bin = args.first().map(|s| s.as_str()).unwrap_or("cli").to_string();

    let command = match parse_command(&args) {
        Ok(Some(command)) => command,
        Ok(None) => {
            print_usage(&bin);
            return Ok(());
        }
        Err(usage) => {
            eprintln!("{} {}", "Usage:".yellow(), format!("{} {}", bin, usage).yellow());
            std::process::exit(2);
        }
    };

    let mut config = Config::default();
    config
        .apply_env(|key| std::env::var(key).ok())
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(execute(command, &config))
}

async fn execute(command: CliCommand, config: &Config) -> anyhow::Result<()> {
    let store = SessionStore::new(&config.data_dir);

    match command {
        CliCommand::Token { api_url, token } => save_token(&store, config, &api_url, &token).await,
        CliCommand::Logout => logout(&store, config).await,
        CliCommand::WhoAmI => {
            let (session, backend) = signed_in(config)?;
            whoami(&backend, &store, session).await
        }
        CliCommand::Rooms { once } => {
            let (_, backend) = signed_in(config)?;
            watch_rooms(&backend, config, once).await
        }
        CliCommand::History {
            room_id,
            before_id,
            limit,
        } => {
            let (session, backend) = signed_in(config)?;
            let limit = limit.unwrap_or(config.page_size);
            history(&backend, &session, room_id, before_id, limit).await
        }
        CliCommand::Send {
            room_id,
            message,
            files,
        } => {
            let (_, backend) = signed_in(config)?;
            backend.send_message(room_id, &message, &files).await?;
            println!("{} Message sent to room {}", "✓".green(), room_id.to_string().cyan());
            Ok(())
        }
        CliCommand::Search { query } => {
            let (_, backend) = signed_in(config)?;
            search(&backend, &query).await
        }
        CliCommand::NewRoom { kind, emails } => {
            let (_, backend) = signed_in(config)?;
            let room_id = backend.create_room(kind, &emails).await?;
            println!(
                "{} Created {} room {}",
                "✓".green(),
                kind.as_str(),
                room_id.to_string().cyan()
            );
            Ok(())
        }
        CliCommand::Profile => {
            let (_, backend) = signed_in(config)?;
            show_profile(&backend).await
        }
        CliCommand::ProfileSet { field, value } => {
            let (_, backend) = signed_in(config)?;
            update_profile(&backend, field, value).await
        }
    }
}

fn print_usage(bin: &str) {
    println!("{}", "Chatline CLI".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!("  {} <command> [args]", bin.cyan());
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!("  {} <api_url> <access_token>      Store a session", "token".cyan());
    println!("  {}                              Validate the session", "whoami".cyan());
    println!("  {}                              Sign out and forget the session", "logout".cyan());
    println!("  {} [--once]                      Watch the conversation list", "rooms".cyan());
    println!("  {} <room_id> [before_id] [limit] Print a page of messages", "history".cyan());
    println!("  {} <room_id> [--file <path>]... <message> Send a message", "send".cyan());
    println!("  {} <query>                       Find users (4+ characters)", "search".cyan());
    println!("  {} <oneone|group|public> <email>... Create a conversation", "new-room".cyan());
    println!("  {} [set <field> <value>]        Show or edit profile settings", "profile".cyan());
    println!();
    println!(
        "{}",
        "Environment: CHATLINE_DATA_DIR, CHATLINE_API_URL, CHATLINE_TOKEN, CHATLINE_WS_URL".dimmed()
    );
}

fn signed_in(config: &Config) -> anyhow::Result<(Session, Backend)> {
    let session = load_session(config)?;
    let backend = backend_for(&session, config)?;
    Ok((session, backend))
}

fn load_session(config: &Config) -> anyhow::Result<Session> {
    match resolve_session(config)? {
        Some(session) => Ok(session),
        None => {
            eprintln!("{}", "✗ Error: not signed in".red().bold());
            eprintln!("  Store a token first:");
            eprintln!("  {} {}", "-".dimmed(), "cli token <api_url> <access_token>".yellow());
            std::process::exit(1);
        }
    }
}

fn backend_for(session: &Session, config: &Config) -> anyhow::Result<Backend> {
    Ok(Backend::new(
        &session.api_url,
        config.ws_url.as_deref(),
        &session.access_token,
        config.request_timeout,
    )?)
}

async fn save_token(
    store: &SessionStore,
    config: &Config,
    api_url: &str,
    token: &str,
) -> anyhow::Result<()> {
    let mut session = Session::new(api_url, token)?;
    let backend = backend_for(&session, config)?;
    let profile = backend.validate().await?;
    println!(
        "{} Signed in as {} (id {})",
        "✓".green(),
        profile.username.cyan(),
        profile.id
    );
    session.attach_profile(profile);
    store.save(&session)?;
    println!("  Session stored in {}", store.path().display().to_string().dimmed());
    Ok(())
}

async fn logout(store: &SessionStore, config: &Config) -> anyhow::Result<()> {
    if let Some(session) = store.load()? {
        let backend = backend_for(&session, config)?;
        if let Err(e) = backend.logout().await {
            eprintln!("{} Backend logout failed: {}", "!".yellow(), e);
        }
    }
    if store.clear()? {
        println!("{} Signed out", "✓".green());
    } else {
        println!("No stored session");
    }
    Ok(())
}

async fn whoami(backend: &Backend, store: &SessionStore, mut session: Session) -> anyhow::Result<()> {
    let profile = backend.validate().await?;
    println!("{}", "Session:".bright_white().bold());
    println!("{:-<60}", "");
    println!("  Backend:  {}", session.api_url.cyan());
    println!("  User ID:  {}", profile.id);
    println!("  Username: {}", profile.username);
    let name = format!("{} {}", profile.first_name, profile.last_name);
    if !name.trim().is_empty() {
        println!("  Name:     {}", name.trim());
    }
    if profile.verified {
        println!("  Verified: {}", "yes".green());
    }
    session.attach_profile(profile);
    // Only refresh the stored session; a token from flags or env is never persisted
    let stored = store.load()?;
    let same = |s: &Session| s.api_url == session.api_url && s.access_token == session.access_token;
    if stored.as_ref().is_some_and(same) {
        store.save(&session)?;
    }
    Ok(())
}

async fn watch_rooms(backend: &Backend, config: &Config, once: bool) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let feed = spawn_feed(
        FeedKind::Rooms,
        backend.rooms_feed_url(),
        config.reconnect.clone(),
        tx,
        |event| event,
    );

    let mut rooms = RoomList::new();
    while let Some(event) = rx.recv().await {
        match event {
            FeedEvent::Frame(text) => match rooms.apply_text(&text) {
                Ok(_) => {
                    print_rooms(rooms.rooms());
                    if once {
                        break;
                    }
                }
                Err(e) => eprintln!("{} {}", "!".yellow(), e),
            },
            FeedEvent::State(FeedState::Failed { reason }) => {
                eprintln!("{} Room feed failed: {}", "✗".red(), reason);
            }
            FeedEvent::State(FeedState::Open) => {
                eprintln!("{} Connected to room feed", "✓".green());
            }
            FeedEvent::State(_) => {}
        }
    }

    feed.close().await;
    Ok(())
}

fn print_rooms(rooms: &[ConversationSummary]) {
    println!();
    println!("{}", format!("Conversations ({}):", rooms.len()).bright_white().bold());
    println!("{:-<60}", "");
    for room in rooms {
        let marker = if room.is_unseen() { "●".bright_blue() } else { " ".normal() };
        let name = if room.name.is_empty() { "(unnamed)" } else { room.name.as_str() };
        println!(
            "{} {:>6}  {}  {}",
            marker,
            room.room_id.to_string().dimmed(),
            name.bold(),
            room.last_message.dimmed()
        );
    }
}

async fn history(
    backend: &Backend,
    session: &Session,
    room_id: RoomId,
    before_id: Option<MessageId>,
    limit: u32,
) -> anyhow::Result<()> {
    let mut page = backend.fetch_messages(room_id, limit, before_id).await?;
    if page.is_empty() {
        println!("No messages");
        return Ok(());
    }
    page.sort_by_key(|m| m.id);
    for msg in &page {
        print_message(session, msg);
    }
    if let Some(oldest) = page.first() {
        println!(
            "{}",
            format!("Older messages: cli history {} {}", room_id, oldest.id).dimmed()
        );
    }
    Ok(())
}

fn print_message(session: &Session, msg: &MessageRecord) {
    let who = if session.is_current_user(msg.sender_id) {
        "you".green().bold()
    } else {
        format!("user {}", msg.sender_id).cyan()
    };
    println!("{} {}: {}", format!("#{}", msg.id).dimmed(), who, msg.content);
    for attachment in msg.attachments() {
        println!("    {} {} <{}>", "📎".dimmed(), attachment.label(), attachment.link);
    }
}

async fn search(backend: &Backend, query: &str) -> anyhow::Result<()> {
    let users = backend.search_users(query).await?;
    if users.is_empty() {
        println!("No users found");
        return Ok(());
    }
    println!("{}", format!("Users ({}):", users.len()).bright_white().bold());
    println!("{:-<60}", "");
    for user in users {
        println!("  {:>6}  {}  {}", user.id.to_string().dimmed(), user.username.bold(), user.email);
    }
    Ok(())
}

async fn show_profile(backend: &Backend) -> anyhow::Result<()> {
    let settings = backend.profile_settings().await?;
    println!("{}", "Profile:".bright_white().bold());
    println!("{:-<60}", "");
    println!("  Username:   {}", settings.username);
    println!("  First name: {}", settings.first_name);
    println!("  Last name:  {}", settings.last_name);
    if let Some(avatar) = settings.avatar_url.as_deref().filter(|s| !s.is_empty()) {
        println!("  Avatar:     {}", avatar.dimmed());
    }
    Ok(())
}

async fn update_profile(backend: &Backend, field: ProfileField, value: String) -> anyhow::Result<()> {
    let mut settings = backend.profile_settings().await?;
    match field {
        ProfileField::Username => settings.username = value,
        ProfileField::FirstName => settings.first_name = value,
        ProfileField::LastName => settings.last_name = value,
    }
    backend.update_profile_settings(&settings).await?;
    println!("{} Profile updated", "✓".green());
    Ok(())
}

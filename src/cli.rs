//! Interactive terminal front end.
//!
//! Reads lines from stdin; plain text is sent as a question and the answer
//! is printed as it streams. Lines starting with `/` are commands, see
//! [`HELP`]. Ctrl+C stops the answer in progress; at the prompt it exits.

use std::future::Future;
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use crate::chat::{
    ChatId, ChatSession, HttpBackend, Source, Transcript, TranscriptFollower, TurnOutcome,
    TurnSettings, TurnSlot, Viewport,
};
use crate::config::{ClientConfig, TOKEN_ENV};

/// Environment variable with the login e-mail, used when no token is set.
pub const EMAIL_ENV: &str = "MATERNAL_CHAT_EMAIL";
/// Environment variable with the login password.
pub const PASSWORD_ENV: &str = "MATERNAL_CHAT_PASSWORD";

/// Command reference printed by `/help`.
pub const HELP: &str = "\
/new [title]     start a conversation
/list            list conversations
/open <id>       open a conversation
/rename <title>  rename the open conversation
/delete          delete the open conversation
/regen           ask the last question again
/help            show this help
/quit            exit";

type Session = ChatSession<HttpBackend>;

/// Run the terminal client.
///
/// # Returns
/// `ExitCode::SUCCESS` when the user quits, `1` on a startup failure.
#[must_use]
pub fn run() -> ExitCode {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(log_filter(&directives))
        .init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create runtime: {e}");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = rt.block_on(repl()) {
        tracing::error!("{e:#}");
        eprintln!("error: {e:#}");
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}

/// `RUST_LOG`-style directives, `warn` when none are given.
fn log_filter(directives: &str) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .parse_lossy(directives)
}

async fn connect() -> anyhow::Result<HttpBackend> {
    let config = ClientConfig::from_env();
    tracing::info!(base_url = %config.base_url, "connecting");
    let mut backend = HttpBackend::new(config).context("invalid client configuration")?;

    if backend.config().token.is_none() {
        let (Ok(email), Ok(password)) = (std::env::var(EMAIL_ENV), std::env::var(PASSWORD_ENV))
        else {
            bail!("set {TOKEN_ENV}, or {EMAIL_ENV} and {PASSWORD_ENV}");
        };
        let token = backend
            .login(&email, &password)
            .await
            .context("login failed")?;
        backend.set_token(token);
    }
    Ok(backend)
}

async fn repl() -> anyhow::Result<()> {
    let backend = connect().await?;
    let settings = TurnSettings::from(backend.config());
    let mut session = ChatSession::new(Arc::new(backend), settings);

    if let Some(chat_id) = std::env::args().nth(1) {
        session
            .open_chat(ChatId::new(chat_id))
            .await
            .context("failed to open conversation")?;
        print_history(&session.transcript().snapshot());
    }

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = next_input(&mut lines, tokio::signal::ctrl_c()).await? else {
            println!();
            break;
        };
        let command = Command::parse(&line);
        if command == Command::Quit {
            break;
        }
        if let Err(e) = execute(&mut session, command).await {
            eprintln!("error: {e:#}");
        }
    }
    Ok(())
}

/// Next input line, or `None` at end of input or when `interrupt` fires first.
async fn next_input<R, I>(lines: &mut Lines<R>, interrupt: I) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
    I: Future,
{
    tokio::select! {
        line = lines.next_line() => line,
        _ = interrupt => Ok(None),
    }
}

async fn execute(session: &mut Session, command: Command<'_>) -> anyhow::Result<()> {
    match command {
        Command::Empty | Command::Quit => {}
        Command::Help => println!("{HELP}"),
        Command::New(title) => {
            let chat = session.new_chat(title).await?;
            println!("opened \"{}\" ({})", chat.title, chat.id);
        }
        Command::List => {
            for chat in session.list_chats().await? {
                println!("{}  {}", chat.id, chat.title);
            }
        }
        Command::Open(id) => {
            session.open_chat(ChatId::new(id)).await?;
            print_history(&session.transcript().snapshot());
        }
        Command::Rename(title) => {
            let chat_id = session.chat_id().context("no conversation open")?;
            session.rename_chat(&chat_id, title).await?;
        }
        Command::Delete => {
            let chat_id = session.chat_id().context("no conversation open")?;
            session.delete_chat(&chat_id).await?;
            println!("deleted {chat_id}");
        }
        Command::Regenerate => {
            if let Some(slot) = session.regenerate().await? {
                follow_turn(session, &slot).await?;
            }
        }
        Command::Send(text) => {
            if let Some(slot) = session.send(text).await? {
                follow_turn(session, &slot).await?;
            }
        }
        Command::Unknown(name) => println!("unknown command /{name}, try /help"),
    }
    Ok(())
}

/// Print the answer of a turn as it grows, until the turn resolves.
async fn follow_turn(session: &mut Session, slot: &TurnSlot) -> anyhow::Result<()> {
    // A terminal always shows its last line, so the view never scrolls away.
    let mut follower = TranscriptFollower::new(session.transcript(), Viewport::default());
    let mut busy = session.subscribe_busy();
    let mut printed = String::new();

    loop {
        tokio::select! {
            changed = follower.changed() => {
                let Some(follow) = changed else {
                    break;
                };
                let content = follower
                    .read(|t| t.get(&slot.assistant_id).map(|m| m.content.clone()))
                    .filter(|_| follow);
                if let Some(content) = content {
                    print_delta(&mut printed, &content)?;
                }
            }
            _ = busy.wait_for(Option::is_none) => break,
            _ = tokio::signal::ctrl_c() => session.stop(),
        }
    }

    let outcome = session.wait().await;
    let message = session.transcript().read(|t| t.get(&slot.assistant_id).cloned());
    if let Some(message) = message {
        print_delta(&mut printed, &message.content)?;
        println!();
        if let Some(line) = message.sources.as_deref().and_then(format_sources) {
            println!("{line}");
        }
    }
    match outcome {
        Some(TurnOutcome::Cancelled { .. }) => println!("[stopped]"),
        Some(TurnOutcome::Interrupted { error, .. }) => println!("[connection lost: {error}]"),
        _ => {}
    }
    Ok(())
}

fn print_delta(printed: &mut String, content: &str) -> std::io::Result<()> {
    let mut stdout = std::io::stdout();
    match render_delta(printed, content) {
        Delta::Unchanged => return Ok(()),
        Delta::Append(suffix) => write!(stdout, "{suffix}")?,
        Delta::Replace(text) => write!(stdout, "\n{text}")?,
    }
    printed.clear();
    printed.push_str(content);
    stdout.flush()
}

/// How to bring the terminal from `printed` to `content`.
#[derive(Debug, PartialEq, Eq)]
enum Delta<'a> {
    Unchanged,
    Append(&'a str),
    /// Content was replaced wholesale (a fallback answer or an error).
    Replace(&'a str),
}

fn render_delta<'a>(printed: &str, content: &'a str) -> Delta<'a> {
    if content == printed {
        Delta::Unchanged
    } else if let Some(suffix) = content.strip_prefix(printed) {
        Delta::Append(suffix)
    } else {
        Delta::Replace(content)
    }
}

/// One-line citation summary, `None` when there is nothing to cite.
fn format_sources(sources: &[Source]) -> Option<String> {
    if sources.is_empty() {
        return None;
    }
    let items: Vec<String> = sources
        .iter()
        .map(|s| match s.percent() {
            Some(p) => format!("{} ({p}%)", s.label),
            None => s.label.clone(),
        })
        .collect();
    Some(format!("Sources: {}", items.join(", ")))
}

fn print_history(transcript: &Transcript) {
    for line in history_lines(transcript) {
        println!("{line}");
    }
}

fn history_lines(transcript: &Transcript) -> Vec<String> {
    transcript
        .messages()
        .iter()
        .map(|message| format!("[{}] {}", message.role, message.content))
        .collect()
}

/// A parsed input line.
#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Empty,
    Help,
    Quit,
    New(Option<&'a str>),
    List,
    Open(&'a str),
    Rename(&'a str),
    Delete,
    Regenerate,
    Send(&'a str),
    Unknown(&'a str),
}

impl<'a> Command<'a> {
    fn parse(line: &'a str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Self::Send(line);
        };
        let (name, arg) = command
            .split_once(char::is_whitespace)
            .map_or((command, ""), |(n, a)| (n, a.trim()));
        match (name, arg) {
            ("help", _) => Self::Help,
            ("quit" | "exit", _) => Self::Quit,
            ("new", "") => Self::New(None),
            ("new", title) => Self::New(Some(title)),
            ("list", _) => Self::List,
            ("open", id) if !id.is_empty() => Self::Open(id),
            ("rename", title) if !title.is_empty() => Self::Rename(title),
            ("delete", _) => Self::Delete,
            ("regen", _) => Self::Regenerate,
            (name, _) => Self::Unknown(name),
        }
    }
}

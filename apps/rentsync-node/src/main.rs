use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use libp2p::{identity::Keypair, Multiaddr};
use rentsync_chat::{ChatConfig, ChatEvent, ChatSession, FetchOutcome};
use rentsync_realtime::GossipTransport;
use rentsync_store::{SqliteStore, SqliteUnreadHints, StoreConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Rentsync node - conversations and presence over a local P2P mesh
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// User id to log in as
    #[arg(short, long)]
    user: String,

    /// SQLite database file; nodes on one host can share it
    #[arg(short, long, default_value = "rentsync.db")]
    db: PathBuf,

    /// Address to listen on (repeatable)
    #[arg(short, long)]
    listen: Vec<Multiaddr>,

    /// Presence heartbeat period
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    heartbeat: Duration,

    /// Typing indicator silence window
    #[arg(long, default_value = "3s", value_parser = humantime::parse_duration)]
    typing_window: Duration,

    /// Remote presences expire after this long without a heartbeat
    #[arg(long, default_value = "90s", value_parser = humantime::parse_duration)]
    presence_ttl: Duration,
}

fn show_help() {
    println!("Commands:");
    println!("  /list                    List conversations");
    println!("  /new <user> [booking]    Open or create a conversation with <user>");
    println!("  /open <conversation>     Open a conversation");
    println!("  /online                  List online users");
    println!("  /hide, /show             Toggle visibility");
    println!("  /quit                    Log out and exit");
    println!("  <text>                   Send to the open conversation");
}

fn print_event(session: &ChatSession, event: ChatEvent) {
    match event {
        ChatEvent::ConversationsUpdated => {
            let unread = session
                .conversations()
                .conversations
                .iter()
                .filter(|c| c.is_unread)
                .count();
            if unread > 0 {
                println!("* {} unread conversation(s)", unread);
            }
        }
        ChatEvent::MessagesUpdated { conversation_id } => {
            if session.active_conversation().as_deref() != Some(conversation_id.as_str()) {
                return;
            }
            if let Some(message) = session.messages().messages.last() {
                println!("[{}] {}: {}", conversation_id, message.sender_id, message.content);
            }
        }
        ChatEvent::TypingChanged { users, .. } => {
            if !users.is_empty() {
                println!("... {} typing", users.join(", "));
            }
        }
        ChatEvent::PresenceChanged { online } => {
            println!("* online: {}", online.join(", "));
        }
        ChatEvent::ChannelError { topic, reason } => {
            eprintln!("! realtime channel {} failed: {}", topic, reason);
        }
    }
}

fn print_conversations(session: &ChatSession) {
    let state = session.conversations();
    if let Some(error) = &state.error {
        eprintln!("! {}", error);
    }
    for conversation in &state.conversations {
        let others: Vec<&str> = conversation
            .others(session.user_id())
            .map(|p| p.display_name.as_deref().unwrap_or(&p.id))
            .collect();
        let preview = conversation
            .last_message
            .as_ref()
            .map(|m| m.content.as_str())
            .unwrap_or("");
        println!(
            "{} {} [{}] {}",
            if conversation.is_unread { "*" } else { " " },
            conversation.id,
            others.join(", "),
            preview
        );
    }
}

async fn open(session: &ChatSession, conversation_id: &str) {
    match session.fetch_messages(conversation_id).await {
        Ok(FetchOutcome::Failed) => {
            let reason = session.messages().error.unwrap_or_default();
            eprintln!("! failed to load {}: {}", conversation_id, reason);
        }
        Ok(_) => {
            for message in session.messages().messages {
                println!("{}: {}", message.sender_id, message.content);
            }
        }
        Err(e) => eprintln!("! failed to open {}: {}", conversation_id, e),
    }
}

async fn handle_line(session: &ChatSession, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("/help") | Some("/?") => show_help(),
        Some("/quit") | Some("/exit") => return false,
        Some("/list") => print_conversations(session),
        Some("/online") => {
            let mut online: Vec<String> = session.online_users().into_iter().collect();
            online.sort();
            println!("online: {}", online.join(", "));
        }
        Some("/hide") => session.set_visibility(false).await,
        Some("/show") => session.set_visibility(true).await,
        Some("/open") => match parts.next() {
            Some(id) => open(session, id).await,
            None => eprintln!("usage: /open <conversation>"),
        },
        Some("/new") => match parts.next() {
            Some(user) => {
                let booking = parts.next();
                match session
                    .get_or_create_conversation(&[user.to_string()], booking)
                    .await
                {
                    Ok(id) => open(session, &id).await,
                    Err(e) => eprintln!("! {}", e),
                }
            }
            None => eprintln!("usage: /new <user> [booking]"),
        },
        Some(command) if command.starts_with('/') => {
            eprintln!("unknown command {}, try /help", command)
        }
        _ => match session.active_conversation() {
            Some(id) => {
                if let Err(e) = session.send_message(&id, line).await {
                    eprintln!("! failed to send: {}", e);
                }
            }
            None => eprintln!("no open conversation, use /open or /new"),
        },
    }
    true
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let args = Args::parse();

    let config = ChatConfig {
        heartbeat_interval: args.heartbeat,
        typing_silence_window: args.typing_window,
        presence_ttl: args.presence_ttl,
        ..ChatConfig::default()
    };

    let store = SqliteStore::with_config(&StoreConfig {
        db_path: args.db.clone(),
    })
    .await
    .with_context(|| format!("failed to open {}", args.db.display()))?;
    let hints = SqliteUnreadHints::new(store.connection());

    let mut gossip_config = config.gossip_config();
    if !args.listen.is_empty() {
        gossip_config.listen_addrs = args.listen.clone();
    }
    let (transport, swarm_task) =
        GossipTransport::spawn(Keypair::generate_ed25519(), gossip_config)?;
    info!("Local peer id: {}", transport.peer_id());

    let (session, mut events) = ChatSession::start(
        &args.user,
        Arc::new(store),
        Arc::new(hints),
        Arc::new(transport),
        config,
    )
    .await?;

    println!("Logged in as {}", args.user);
    show_help();

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(event) = events.next() => print_event(&session, event),
            line = stdin.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to read stdin: {}", e);
                        break;
                    }
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if !handle_line(&session, line).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.logout().await;
    swarm_task.abort();
    println!("Goodbye!");
    Ok(())
}

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{load_settings, ChatEvent, ClientEvent, NotifyClient, SessionEvent};
use shared::domain::ChatId;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    username: Option<String>,
    #[arg(long, env = "NOTIFY_PASSWORD")]
    password: Option<String>,
    #[arg(long)]
    chat: Option<i64>,
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(api_url) = args.api_url {
        settings = settings.with_api_base_url(api_url);
    }
    let client = NotifyClient::open(settings).await?;
    let mut events = client.subscribe_events();

    let credential = match (args.username, args.password) {
        (Some(username), Some(password)) => client
            .login(&username, &password)
            .await
            .context("login failed")?,
        _ => client
            .resume()
            .await
            .context("failed to resume session")?
            .context("no stored session; pass --username and --password")?,
    };
    println!("Signed in as {} (user_id={})", credential.user_name, credential.user_id);

    if args.list {
        for row in client.refresh_conversations().await? {
            println!(
                "chat {:>6}  unread {:>3}  {:?}  {}",
                row.chat_id,
                row.unread_count,
                row.block_status,
                row.latest_message
                    .map(|message| message.content)
                    .unwrap_or_default()
            );
        }
    }

    client.subscribe_notifications().await?;
    if let Some(chat_id) = args.chat {
        let dispatcher = client.open_chat(ChatId(chat_id)).await?;
        for message in dispatcher.messages().await.iter().rev() {
            println!("[{}] {}: {}", message.sent_at, message.sender.id, message.content);
        }
        client.send_read_receipt(ChatId(chat_id)).await?;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    if !print_event(&event) {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.shutdown().await;
    Ok(())
}

fn print_event(event: &ClientEvent) -> bool {
    match event {
        ClientEvent::Connection(state) => println!("connection: {state:?}"),
        ClientEvent::Notification { body } => println!("notification: {body}"),
        ClientEvent::Chat(ChatEvent::PeerTyping { chat_id, typing }) => {
            println!("chat {chat_id}: peer {}", if *typing { "is typing" } else { "stopped typing" })
        }
        ClientEvent::Chat(event) => println!("{event:?}"),
        ClientEvent::Session(SessionEvent::SessionExpired { reason }) => {
            println!("session expired: {reason}; sign in again");
            return false;
        }
        ClientEvent::Session(SessionEvent::SignedOut) => return false,
        ClientEvent::Session(event) => println!("session: {event:?}"),
    }
    true
}

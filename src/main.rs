use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use charla::auth::{mint_token, Claims, DEFAULT_SHARED_SECRET};
use charla::bus::LocalBus;
use charla::client::{
    choose_transport, ChatClient, ClientConfig, TransportKind, TransportPreference,
};
use charla::clog;
use charla::envelope::{Envelope, DEFAULT_CONVERSATION_ID};
use charla::logging::{self, conv_id};
use charla::relay_transport::{fetch_messages, post_message};
use charla::storage::HistoryStore;

#[derive(Parser)]
#[command(
    name = "charla",
    version,
    about = "Minimal real-time chat over a local bus or a relay server"
)]
struct Cli {
    /// Transport preference: local, relay or auto.
    #[arg(long, global = true, default_value = "auto")]
    transport: TransportPreference,

    /// Relay base url, e.g. http://localhost:3000.
    #[arg(long, global = true)]
    server_url: Option<String>,

    /// Bearer token presented to the relay.
    #[arg(long, global = true)]
    token: Option<String>,

    /// Author id stamped on sent messages.
    #[arg(long, global = true)]
    author: Option<String>,

    /// Conversation to send to or follow.
    #[arg(long, global = true, default_value = DEFAULT_CONVERSATION_ID)]
    conversation: String,

    /// Directory holding local history files.
    #[arg(long, global = true, default_value = "charla-data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send one message and exit.
    Send { text: String },
    /// Print the conversation history.
    History,
    /// Follow the conversation live until interrupted.
    Watch,
    /// Mint a bearer token for an author.
    Token {
        /// Author id the token authenticates.
        subject: String,
        /// Secret the relay was started with.
        #[arg(long, default_value = DEFAULT_SHARED_SECRET)]
        secret: String,
    },
}

#[tokio::main]
async fn main() {
    logging::init();
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    match &cli.command {
        Command::Send { text } => send(&cli, text).await,
        Command::History => history(&cli).await,
        Command::Watch => watch(&cli).await,
        Command::Token { subject, secret } => token(subject, secret),
    }
}

/// Relay sends go over plain HTTP so the message is durably accepted before
/// the process exits; the WebSocket transport is for watching.
async fn send(cli: &Cli, text: &str) -> Result<(), Box<dyn Error>> {
    if relay_selected(cli) {
        let server_url = require_server_url(cli)?.to_string();
        let conversation = cli.conversation.clone();
        let token = cli.token.clone();
        let text = text.to_string();
        let envelope = tokio::task::spawn_blocking(move || {
            post_message(&server_url, &conversation, token.as_deref(), &text)
        })
        .await??;
        println!("sent {} to {}", envelope.id, envelope.conversation_id);
        return Ok(());
    }

    let store = HistoryStore::open(&cli.data_dir)?;
    let mut client = ChatClient::new(store, LocalBus::new());
    client.init(client_config(cli));
    let envelope = client.send_message(text, None)?;
    println!("sent {} to {}", envelope.id, envelope.conversation_id);
    Ok(())
}

async fn history(cli: &Cli) -> Result<(), Box<dyn Error>> {
    let messages = if relay_selected(cli) {
        let server_url = require_server_url(cli)?.to_string();
        let conversation = cli.conversation.clone();
        tokio::task::spawn_blocking(move || fetch_messages(&server_url, &conversation)).await??
    } else {
        HistoryStore::open(&cli.data_dir)?.load(&cli.conversation)
    };
    for message in &messages {
        println!("{}", format_message(message));
    }
    Ok(())
}

async fn watch(cli: &Cli) -> Result<(), Box<dyn Error>> {
    let store = HistoryStore::open(&cli.data_dir)?;
    let mut client = ChatClient::new(store, LocalBus::new());
    client.init(client_config(cli));
    client.on_message(|message: &Envelope| {
        println!("{}", format_message(message));
    });
    client.connect().await?;
    clog!("watching {}, ctrl-c to stop", conv_id(&cli.conversation));
    tokio::signal::ctrl_c().await?;
    client.disconnect();
    Ok(())
}

fn token(subject: &str, secret: &str) -> Result<(), Box<dyn Error>> {
    let token = mint_token(secret, &Claims::for_subject(subject))?;
    println!("{token}");
    Ok(())
}

fn client_config(cli: &Cli) -> ClientConfig {
    ClientConfig {
        transport: cli.transport,
        conversation_id: cli.conversation.clone(),
        author_id: cli.author.clone(),
        server_url: cli.server_url.clone(),
        token: cli.token.clone(),
    }
}

fn relay_selected(cli: &Cli) -> bool {
    choose_transport(cli.transport, cli.server_url.as_deref()) == TransportKind::Relay
}

fn require_server_url(cli: &Cli) -> Result<&str, Box<dyn Error>> {
    cli.server_url
        .as_deref()
        .ok_or_else(|| "relay transport requires --server-url".into())
}

fn format_message(message: &Envelope) -> String {
    format!(
        "[{}] {}: {}",
        message.timestamp, message.author_id, message.text
    )
}

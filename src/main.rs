use anyhow::{Result, bail};
use clap::Parser;
use mini_chat::config::{ConfigStore, Field, Overrides};
use mini_chat::conversation::{Conversation, Role};
use mini_chat::llm::{ChatClient, ChatRequest};
use mini_chat::render::TerminalOutput;
use mini_chat::session::{Flow, Session};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "mini-chat",
    version,
    about = "Terminal chat client for OpenAI-compatible APIs"
)]
struct Cli {
    /// Switch the active profile before running
    #[arg(short, long, global = true)]
    profile: Option<String>,

    /// Override a setting for this run only, e.g. --set model=gpt-4o (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", global = true)]
    set: Vec<String>,

    /// Wait for complete replies instead of streaming them
    #[arg(long, global = true)]
    no_stream: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Interactive chat (default)
    Chat,

    /// Send a single message and print the reply
    Ask {
        /// Message text
        #[arg(required = true)]
        message: Vec<String>,
    },

    /// List configuration profiles
    Profiles,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Before the subscriber, so RUST_LOG from .env applies.
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mini_chat=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let store = ConfigStore::from_env();
    if let Some(profile) = &cli.profile {
        store.set_active(profile)?;
    }
    let mut overrides = Overrides::from_assignments(&cli.set)?;
    if cli.no_stream {
        overrides.set(Field::Stream, "false")?;
    }

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => run_chat(store, overrides).await,
        Command::Ask { message } => ask(&store, &overrides, &message.join(" ")).await,
        Command::Profiles => {
            let active = store.active_profile();
            for name in store.list_profiles()? {
                let marker = if name == active { "*" } else { " " };
                println!("{marker} {name}");
            }
            Ok(())
        }
        Command::Config => {
            let settings = store.resolve_with(&store.active_profile(), &overrides)?;
            println!("profile = {}", store.active_profile());
            for (key, value) in settings.rows() {
                println!("{key} = {value}");
            }
            let key_state = if settings.api_key.is_empty() { "not set" } else { "set" };
            println!("api_key = <{key_state}>");
            Ok(())
        }
    }
}

async fn interrupted() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn run_chat(store: ConfigStore, overrides: Overrides) -> Result<()> {
    let mut session = Session::new(store, ChatClient::new()?, overrides, TerminalOutput::new())?;
    if session.settings().api_key.is_empty() {
        bail!(
            "No API key found in environment variables. \
             Set OPENAI_API_KEY (or API_KEY) and try again."
        );
    }

    println!("mini-chat | profile: {}", session.active_profile());
    println!("Type /help for available commands or just start chatting!");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\nYou: ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            () = interrupted() => {
                println!("\nmini-chat terminated by user.");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };

        if session.handle_input(&line, interrupted()).await == Flow::Exit {
            break;
        }
    }
    Ok(())
}

async fn ask(store: &ConfigStore, overrides: &Overrides, message: &str) -> Result<()> {
    let settings = store.resolve_with(&store.active_profile(), overrides)?;
    let mut conversation = Conversation::with_system_prompt(settings.system_prompt.clone());
    conversation.append(Role::User, message);

    let client = ChatClient::new()?;
    let request = ChatRequest::new(&conversation, &settings, settings.stream);
    let mut stdout = std::io::stdout();
    let mut on_delta = |d: &str| {
        let _ = stdout.write_all(d.as_bytes());
        let _ = stdout.flush();
    };
    client
        .execute_until(request, Some(&mut on_delta), interrupted())
        .await?;
    println!();
    Ok(())
}

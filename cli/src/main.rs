use assistant_client::{
    ChatSession, ChatState, ClientConfig, ClientTimeouts, ConfigError, ConnectionManager, ConnectionState,
    ConversationError, ConversationService, DispatchError, MessageDispatcher, Role,
};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Conversation(#[from] ConversationError),
    #[error("channel did not connect: {0}")]
    NotConnected(String),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("chat session ended unexpectedly")]
    SessionClosed,
    #[error("stdin read failed: {0}")]
    Stdin(#[from] std::io::Error),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "assistant-cli", about = "Realtime assistant client CLI")]
struct Cli {
    #[arg(long, env = "ASSISTANT_BASE_URL", default_value = "http://127.0.0.1:3000")]
    base_url: String,

    #[arg(long, env = "ASSISTANT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[arg(long, env = "ASSISTANT_WS_URL")]
    ws_url: Option<String>,

    #[arg(long, env = "ASSISTANT_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    connect_timeout_secs: u64,

    #[arg(long, env = "ASSISTANT_RESPONSE_TIMEOUT_SECS", default_value_t = 120, help = "0 waits forever")]
    response_timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Conversation(ConversationCommand),
    Chat(ChatArgs),
}

#[derive(Args, Debug)]
struct ConversationCommand {
    #[command(subcommand)]
    command: ConversationSubcommand,
}

#[derive(Subcommand, Debug)]
enum ConversationSubcommand {
    Create {
        #[arg(long)]
        title: String,
        #[arg(long, env = "ASSISTANT_MODEL")]
        model: Option<String>,
    },
}

#[derive(Args, Debug)]
struct ChatArgs {
    #[arg(long, default_value = "CLI chat")]
    title: String,

    #[arg(long, env = "ASSISTANT_MODEL")]
    model: Option<String>,

    #[arg(long)]
    course_id: Option<String>,

    #[arg(long)]
    lesson_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let config = client_config(&cli)?;

    match cli.command {
        Command::Conversation(conversation) => match conversation.command {
            ConversationSubcommand::Create { title, model } => {
                run_conversation_create(&config, &title, model.as_deref()).await
            }
        },
        Command::Chat(args) => run_chat(&config, args).await,
    }
}

fn client_config(cli: &Cli) -> Result<ClientConfig, CliError> {
    let token = cli.token.clone().filter(|t| !t.is_empty()).ok_or(ConfigError::MissingToken)?;
    let mut config = ClientConfig::new(&cli.base_url, token)?.with_timeouts(ClientTimeouts {
        connect_secs: cli.connect_timeout_secs,
        response_secs: cli.response_timeout_secs,
    });
    if let Some(ws_url) = cli.ws_url.clone().filter(|u| !u.is_empty()) {
        config.ws_url = ws_url;
    }
    Ok(config)
}

async fn run_conversation_create(config: &ClientConfig, title: &str, model: Option<&str>) -> Result<(), CliError> {
    let service = ConversationService::new(config)?;
    let conversation = service.create_conversation(title, model).await?;
    print_json(&serde_json::to_value(&conversation)?)
}

async fn run_chat(config: &ClientConfig, args: ChatArgs) -> Result<(), CliError> {
    let service = ConversationService::new(config)?;
    let conversation = service.create_conversation(&args.title, args.model.as_deref()).await?;
    eprintln!("conversation: {} ({})", conversation.id, conversation.ai_model);

    let connection = ConnectionManager::open(config).await;
    match connection.state() {
        ConnectionState::Connected => {}
        ConnectionState::Failed { reason } => return Err(CliError::NotConnected(reason)),
        other => return Err(CliError::NotConnected(format!("{other:?}"))),
    }

    let dispatcher = MessageDispatcher::from_config(connection.clone(), config);
    let session = ChatSession::new(dispatcher, conversation).with_scope(args.course_id, args.lesson_id);
    let mut state = session.subscribe();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match session.submit(&line) {
            Ok(_) => {}
            Err(DispatchError::EmptyMessage) => continue,
            Err(error) => return Err(error.into()),
        }
        let settled = await_reply(&mut state).await?;
        print_outcome(&settled);
    }

    connection.close();
    Ok(())
}

/// Block until the outstanding message resolves, echoing typing changes.
async fn await_reply(state: &mut watch::Receiver<ChatState>) -> Result<ChatState, CliError> {
    let mut typing = false;
    loop {
        {
            let current = state.borrow_and_update();
            if current.typing != typing {
                typing = current.typing;
                if typing {
                    eprintln!("assistant is typing...");
                }
            }
            if !current.awaiting_response {
                return Ok(current.clone());
            }
        }
        state.changed().await.map_err(|_| CliError::SessionClosed)?;
    }
}

fn print_outcome(state: &ChatState) {
    if let Some(error) = &state.last_error {
        eprintln!("error: {error}");
        return;
    }
    if let Some(reply) = state.messages.last().filter(|m| m.role == Role::Assistant) {
        println!("{}", reply.content);
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

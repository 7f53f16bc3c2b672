use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use dialoguer::{Input, Password, Select};
use log::{debug, info};
use tokio::sync::mpsc;

use roomchat::auth::{AuthClient, AuthError, AuthStore, Session};
use roomchat::capture::desktop::{
    CommandCamera, CommandPlayer, CommandRecorder, FfmpegThumbnailer, FixedLocation, PathPicker, ToolGate,
};
use roomchat::capture::{Capability, format_clock};
use roomchat::config::Config;
use roomchat::model::{ChatMessage, Coordinates, LocalAttachment, ThreadView};
use roomchat::notify::TerminalNotifier;
use roomchat::output::{self, JsonFormat, MessageListOutput, ThreadListOutput};
use roomchat::room::{ActionOutcome, Devices, Room};
use roomchat::send::{SendPipeline, ThreadRef};
use roomchat::store::DocumentStore;
use roomchat::store::firestore::FirestoreStore;
use roomchat::store::storage::CloudStorage;
use roomchat::sync::{MessageListSync, ThreadListSync};

const FIRST_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(
    name = "roomchat",
    version,
    about = "Roomchat CLI",
    after_help = "Examples:\n  roomchat auth login --email you@example.com\n  roomchat threads list\n  roomchat threads watch --json\n  roomchat messages list --thread 8Hq2fJ0cVx\n  roomchat messages send --thread 8Hq2fJ0cVx --text \"hello\"\n  roomchat messages send --thread 8Hq2fJ0cVx --image ./photo.jpg\n  roomchat messages send --thread 8Hq2fJ0cVx --location 37.78,-122.43\n  roomchat messages record --thread 8Hq2fJ0cVx\n  roomchat messages play --thread 8Hq2fJ0cVx --message Qm3p0yT1nZ"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, global = true, help = "Output JSON instead of a table")]
    json: bool,

    #[arg(long, global = true, help = "Print JSON on a single line")]
    compact: bool,

    #[arg(long, global = true, help = "Do not print alerts and notices")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Sign in or out")]
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },
    #[command(about = "List and watch threads")]
    Threads {
        #[command(subcommand)]
        command: ThreadsCommand,
    },
    #[command(about = "Read, watch and send messages")]
    Messages {
        #[command(subcommand)]
        command: MessagesCommand,
    },
    #[command(about = "Show the resolved configuration")]
    Config,
}

#[derive(Subcommand)]
enum AuthCommand {
    #[command(about = "Sign in with email and password")]
    Login(AuthLoginArgs),
    #[command(about = "Forget the saved session")]
    Logout,
}

#[derive(Args)]
struct AuthLoginArgs {
    #[arg(long, help = "Email address to sign in with")]
    email: Option<String>,
}

#[derive(Subcommand)]
enum ThreadsCommand {
    #[command(about = "List threads, most recently active first")]
    List(ListArgs),
    #[command(about = "Print the thread list every time it changes")]
    Watch,
}

#[derive(Args)]
struct ListArgs {
    #[arg(long, help = "Maximum number of rows to print")]
    limit: Option<usize>,
}

#[derive(Subcommand)]
enum MessagesCommand {
    #[command(about = "List messages of a thread, newest first")]
    List(MessagesListArgs),
    #[command(about = "Print a thread's messages every time they change")]
    Watch(ThreadArgs),
    #[command(about = "Send text, media or a location")]
    Send(MessagesSendArgs),
    #[command(about = "Record a voice message and send it")]
    Record(ThreadArgs),
    #[command(about = "Play the audio of a message")]
    Play(MessagesPlayArgs),
}

#[derive(Args)]
struct ThreadArgs {
    #[arg(long, help = "Thread id")]
    thread: String,
}

#[derive(Args)]
struct MessagesListArgs {
    #[arg(long, help = "Thread id")]
    thread: String,

    #[arg(long, help = "Maximum number of rows to print")]
    limit: Option<usize>,
}

#[derive(Args)]
struct MessagesPlayArgs {
    #[arg(long, help = "Thread id")]
    thread: String,

    #[arg(long, help = "Message id")]
    message: String,
}

#[derive(Args)]
struct MessagesSendArgs {
    #[arg(long, help = "Thread id")]
    thread: String,

    #[command(flatten)]
    content: SendContent,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct SendContent {
    #[arg(long, help = "Message text")]
    text: Option<String>,

    #[arg(long, help = "Read message text from stdin")]
    stdin: bool,

    #[arg(long, value_name = "PATH", num_args = 0..=1, help = "Send a photo (prompts when no path is given)")]
    image: Option<Option<PathBuf>>,

    #[arg(long, help = "Take a photo with ROOMCHAT_CAMERA_COMMAND and send it")]
    photo: bool,

    #[arg(long, value_name = "PATH", num_args = 0..=1, help = "Send a video (prompts when no path is given)")]
    video: Option<Option<PathBuf>>,

    #[arg(long, value_name = "PATH", help = "Send an audio file")]
    audio: Option<PathBuf>,

    #[arg(
        long,
        value_name = "LAT,LNG",
        num_args = 0..=1,
        help = "Send a location (defaults to ROOMCHAT_LOCATION)"
    )]
    location: Option<Option<String>>,
}

struct Context {
    config: Config,
    session: Session,
    store: Arc<FirestoreStore>,
    storage: Arc<CloudStorage>,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("ROOMCHAT_LOG", "warn"))
        .format_timestamp_millis()
        .init();
    if let Err(error) = run().await {
        eprintln!("{error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = Config::load()?;
    let auth_store = AuthStore::new(config.secrets_path.clone(), config.project_id.clone());
    let json_format = output::resolve_json_format(cli.compact);
    let quiet = cli.quiet || cli.json;

    match cli.command {
        Command::Auth { command } => match command {
            AuthCommand::Login(args) => handle_login(args, &config, &auth_store).await?,
            AuthCommand::Logout => {
                auth_store.clear_session()?;
                println!("Logged out.");
            }
        },
        Command::Config => print_config(&config, cli.json, json_format)?,
        Command::Threads { command } => {
            let ctx = connect(config, &auth_store).await?;
            match command {
                ThreadsCommand::List(args) => {
                    let docs = ctx.store.query_threads().await?;
                    let mut threads: Vec<ThreadView> = docs.iter().map(ThreadView::from_doc).collect();
                    if let Some(limit) = args.limit {
                        threads.truncate(limit);
                    }
                    let output = ThreadListOutput::new(&threads, now_millis());
                    output::print_threads(&output, cli.json, json_format)?;
                }
                ThreadsCommand::Watch => watch_threads(&ctx, cli.json, json_format).await?,
            }
        }
        Command::Messages { command } => {
            let ctx = connect(config, &auth_store).await?;
            match command {
                MessagesCommand::List(args) => {
                    let thread = resolve_thread(&ctx, &args.thread).await?;
                    let now = now_millis();
                    let docs = ctx.store.query_messages(&thread.id).await?;
                    let mut messages: Vec<ChatMessage> =
                        docs.iter().map(|doc| ChatMessage::from_doc(doc, now)).collect();
                    if let Some(limit) = args.limit {
                        messages.truncate(limit);
                    }
                    let output = MessageListOutput::new(thread, &messages, now);
                    output::print_messages(&output, cli.json, json_format)?;
                }
                MessagesCommand::Watch(args) => watch_messages(&ctx, &args.thread, cli.json, json_format).await?,
                MessagesCommand::Send(args) => {
                    let outcome = handle_send(&ctx, args, quiet).await?;
                    report(outcome, cli.json, json_format)?;
                }
                MessagesCommand::Record(args) => {
                    let outcome = handle_record(&ctx, &args.thread, quiet).await?;
                    report(outcome, cli.json, json_format)?;
                }
                MessagesCommand::Play(args) => {
                    let outcome = handle_play(&ctx, args, quiet).await?;
                    report(outcome, cli.json, json_format)?;
                }
            }
        }
    }

    Ok(())
}

async fn handle_login(args: AuthLoginArgs, config: &Config, auth_store: &AuthStore) -> Result<(), Box<dyn Error>> {
    let client = AuthClient::new(config.auth_url.clone(), config.token_url.clone(), config.api_key.clone());
    let mut email = args.email.map(|email| email.trim().to_string());

    loop {
        let current = match email.take() {
            Some(value) => value,
            None => {
                let value: String = Input::new().with_prompt("Email").interact_text()?;
                value.trim().to_string()
            }
        };
        let password = Password::new().with_prompt("Password").interact()?;

        match client.sign_in(&current, &password).await {
            Ok(session) => {
                auth_store.store_session(&session)?;
                println!("Signed in as {}.", session.email);
                return Ok(());
            }
            Err(error @ AuthError::MissingApiKey) => return Err(error.into()),
            Err(error) => {
                eprintln!("Sign in failed: {error}");
                let retry = Select::new()
                    .items(&["Try password again", "Edit email"])
                    .default(0)
                    .interact()?;
                if retry == 0 {
                    email = Some(current);
                }
            }
        }
    }
}

async fn require_session(config: &Config, auth_store: &AuthStore) -> Result<Session, Box<dyn Error>> {
    let Some(session) = auth_store.load_session()? else {
        return Err("Not signed in. Run `roomchat auth login` first.".into());
    };
    if !session.needs_refresh(chrono::Utc::now().timestamp()) {
        return Ok(session);
    }

    let client = AuthClient::new(config.auth_url.clone(), config.token_url.clone(), config.api_key.clone());
    match client.refresh(&session).await {
        Ok(fresh) => {
            auth_store.store_session(&fresh)?;
            info!("session refreshed");
            Ok(fresh)
        }
        Err(error) => Err(format!("Session expired ({error}). Run `roomchat auth login` again.").into()),
    }
}

async fn connect(config: Config, auth_store: &AuthStore) -> Result<Context, Box<dyn Error>> {
    let session = require_session(&config, auth_store).await?;
    let token = session.id_token.clone();
    let store = FirestoreStore::new(&config.firestore_url, &config.project_id, token.clone(), config.poll_interval);
    let storage = CloudStorage::new(&config.storage_url, &config.storage_bucket, token);
    debug!("connected to {} as {}", config.project_id, session.email);
    Ok(Context {
        config,
        session,
        store: Arc::new(store),
        storage: Arc::new(storage),
    })
}

async fn resolve_thread(ctx: &Context, thread_id: &str) -> Result<ThreadRef, Box<dyn Error>> {
    let thread = ctx
        .store
        .thread(thread_id)
        .await?
        .ok_or_else(|| format!("Thread {thread_id} not found."))?;
    let name = thread
        .record
        .name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| thread.id.clone());
    Ok(ThreadRef { id: thread.id, name })
}

fn devices(config: &Config, preset: Option<PathBuf>, position: Option<Coordinates>) -> Devices {
    let tools = [
        (Capability::Camera, config.camera_command.is_some()),
        (Capability::Microphone, config.record_command.is_some()),
        (Capability::Location, position.is_some()),
    ];
    let granted = tools
        .into_iter()
        .filter_map(|(capability, configured)| configured.then_some(capability));
    Devices {
        permissions: Arc::new(ToolGate::new(granted)),
        picker: Arc::new(PathPicker::new(preset)),
        camera: Arc::new(CommandCamera::new(config.camera_command.clone(), config.cache_dir.clone())),
        geolocator: Arc::new(FixedLocation::new(position)),
        recorder: Box::new(CommandRecorder::new(config.record_command.clone())),
        player: Box::new(CommandPlayer::new(config.player_command.clone())),
    }
}

async fn enter_room(
    ctx: &Context,
    thread_id: &str,
    devices: Devices,
    quiet: bool,
    on_messages: impl Fn(&[ChatMessage]) + Send + Sync + 'static,
) -> Result<Room, Box<dyn Error>> {
    let thread = resolve_thread(ctx, thread_id).await?;
    let pipeline = SendPipeline::new(
        ctx.store.clone(),
        ctx.storage.clone(),
        Arc::new(FfmpegThumbnailer::new(ctx.config.cache_dir.clone())),
        thread,
        ctx.session.author(),
        ctx.config.platform,
    );
    Ok(Room::enter(
        pipeline,
        devices,
        Arc::new(TerminalNotifier::new(quiet)),
        ctx.config.cache_dir.clone(),
        on_messages,
    ))
}

async fn handle_send(ctx: &Context, args: MessagesSendArgs, quiet: bool) -> Result<ActionOutcome, Box<dyn Error>> {
    let content = args.content;
    let configured_location = ctx
        .config
        .location
        .as_deref()
        .map(str::parse::<Coordinates>)
        .transpose()?;
    let position = match &content.location {
        Some(Some(value)) => Some(value.parse::<Coordinates>()?),
        _ => configured_location,
    };
    let preset = match (&content.image, &content.video) {
        (Some(path), _) | (_, Some(path)) => path.clone(),
        _ => None,
    };

    let room = enter_room(ctx, &args.thread, devices(&ctx.config, preset, position), quiet, |_| {}).await?;
    let outcome = if let Some(text) = content.text {
        room.send_text(&text).await
    } else if content.stdin {
        room.send_text(&read_stdin()?).await
    } else if content.image.is_some() {
        room.pick_image().await
    } else if content.photo {
        room.take_photo().await
    } else if content.video.is_some() {
        room.pick_video().await
    } else if let Some(path) = content.audio {
        if !path.is_file() {
            room.leave().await;
            return Err(format!("{} is not a file", path.display()).into());
        }
        room.send_audio(LocalAttachment::new(path.to_string_lossy().into_owned()))
            .await
    } else {
        room.send_location().await
    };
    room.leave().await;
    Ok(outcome)
}

async fn handle_record(ctx: &Context, thread_id: &str, quiet: bool) -> Result<ActionOutcome, Box<dyn Error>> {
    let room = enter_room(ctx, thread_id, devices(&ctx.config, None, None), quiet, |_| {}).await?;

    eprintln!("Recording into {}. Press Enter to start.", room.thread().name);
    wait_for_enter().await?;
    let pressed = room.press_record().await;
    if !matches!(pressed, ActionOutcome::Recording) {
        room.leave().await;
        return Ok(pressed);
    }

    eprintln!("Recording. Press Enter to stop and send.");
    let started = Instant::now();
    let ticker = (!quiet).then(|| {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                eprint!("\r{}", format_clock(started.elapsed()));
            }
        })
    });
    let entered = wait_for_enter().await;
    if let Some(ticker) = ticker {
        ticker.abort();
        eprintln!();
    }
    if let Err(error) = entered {
        room.leave().await;
        return Err(error);
    }

    let outcome = room.release_record().await;
    room.leave().await;
    Ok(outcome)
}

async fn handle_play(ctx: &Context, args: MessagesPlayArgs, quiet: bool) -> Result<ActionOutcome, Box<dyn Error>> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let room = enter_room(ctx, &args.thread, devices(&ctx.config, None, None), quiet, move |messages| {
        let _ = tx.send(messages.len());
    })
    .await?;

    let loaded = tokio::time::timeout(FIRST_SNAPSHOT_TIMEOUT, rx.recv()).await;
    let message = room.messages().into_iter().find(|message| message.id == args.message);
    let outcome = match (loaded, message) {
        (_, Some(message)) => room.play_audio(&message).await,
        (Err(_), None) => ActionOutcome::Failed("Timed out loading messages.".to_string()),
        (Ok(_), None) => ActionOutcome::Failed(format!("Message {} not found.", args.message)),
    };
    room.leave().await;
    Ok(outcome)
}

async fn watch_threads(ctx: &Context, json: bool, json_format: JsonFormat) -> Result<(), Box<dyn Error>> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut sync = ThreadListSync::activate(ctx.store.as_ref(), move |threads| {
        let _ = tx.send(threads.to_vec());
    });

    loop {
        tokio::select! {
            batch = rx.recv() => match batch {
                Some(threads) => {
                    let output = ThreadListOutput::new(&threads, now_millis());
                    output::print_threads(&output, json, json_format)?;
                    if !json {
                        println!();
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    sync.deactivate();
    Ok(())
}

async fn watch_messages(ctx: &Context, thread_id: &str, json: bool, json_format: JsonFormat) -> Result<(), Box<dyn Error>> {
    let thread = resolve_thread(ctx, thread_id).await?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut sync = MessageListSync::activate(ctx.store.as_ref(), &thread.id, move |messages| {
        let _ = tx.send(messages.to_vec());
    });

    loop {
        tokio::select! {
            batch = rx.recv() => match batch {
                Some(messages) => {
                    let output = MessageListOutput::new(thread.clone(), &messages, now_millis());
                    output::print_messages(&output, json, json_format)?;
                    if !json {
                        println!();
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    sync.deactivate();
    Ok(())
}

fn report(outcome: ActionOutcome, json: bool, json_format: JsonFormat) -> Result<(), Box<dyn Error>> {
    match outcome {
        ActionOutcome::Sent(sent) => output::print_sent(&sent, json, json_format)?,
        ActionOutcome::Cancelled => eprintln!("Cancelled."),
        ActionOutcome::Played => eprintln!("Done."),
        ActionOutcome::Recording => eprintln!("Still recording."),
        ActionOutcome::Idle => return Err("Nothing to send.".into()),
        ActionOutcome::PermissionDenied(capability) => {
            return Err(format!("{capability} permission denied: no {capability} tool configured.").into());
        }
        ActionOutcome::Failed(message) => return Err(message.into()),
    }
    Ok(())
}

fn print_config(config: &Config, json: bool, json_format: JsonFormat) -> Result<(), Box<dyn Error>> {
    if json {
        output::print_json(config, json_format)?;
        return Ok(());
    }
    let value = serde_json::to_value(config)?;
    if let Some(fields) = value.as_object() {
        for (key, value) in fields {
            let rendered = match value {
                serde_json::Value::String(text) => text.clone(),
                serde_json::Value::Null => "-".to_string(),
                other => other.to_string(),
            };
            println!("{key}: {rendered}");
        }
    }
    Ok(())
}

fn read_stdin() -> Result<String, Box<dyn Error>> {
    use std::io::Read;
    let mut buffer = String::new();
    std::io::stdin().read_to_string(&mut buffer)?;
    let trimmed = buffer.trim();
    if trimmed.is_empty() {
        return Err("stdin was empty".into());
    }
    Ok(trimmed.to_string())
}

async fn wait_for_enter() -> Result<(), Box<dyn Error>> {
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| ())
    })
    .await??;
    Ok(())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

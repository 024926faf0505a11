use anyhow::{bail, Context};
use clap::Parser;
use futures::StreamExt;
use stream2cast::{
    self as lib,
    async_client::{Config, StatusMessage},
    media::{LoadArgs, MediaStatus, PlaybackState},
    payload,
    Client,
};
use tokio::{io::AsyncReadExt, pin};

type Result<T> = anyhow::Result<T>;

#[derive(clap::Parser, Clone, Debug)]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[clap(flatten)]
    target: lib::args::TargetArgs,

    /// Log as bunyan JSON on stdout instead of pretty text on stderr.
    #[arg(long)]
    log_json: bool,
}

#[derive(clap::Subcommand, Clone, Debug)]
enum Command {
    /// List devices on the local network.
    Discover(DiscoverArgs),
    Status(StatusArgs),
    /// Cast a URL the device can fetch.
    Load(LoadCmdArgs),
    /// Adopt playback started elsewhere and print its status.
    Attach,
    Pause,
    Play,
    Stop,
    SetVolume(SetVolumeArgs),
    Mute(MuteArgs),
    /// Keep the session open with heartbeats until enter is pressed.
    Heartbeat,
}

#[derive(clap::Args, Clone, Debug)]
struct DiscoverArgs {
    /// Stop after this many devices.
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(clap::Args, Clone, Debug)]
struct StatusArgs {
    /// Print status pushes until enter is pressed.
    #[arg(long)]
    follow: bool,
}

#[derive(clap::Args, Clone, Debug)]
struct LoadCmdArgs {
    url: String,

    #[arg(long, default_value = "video/mp4")]
    content_type: String,

    /// WebVTT subtitles URL.
    #[arg(long)]
    subtitles: Option<String>,

    #[arg(long, requires = "subtitles")]
    subtitles_language: Option<String>,

    #[arg(long)]
    title: Option<String>,

    /// Return once playback starts instead of waiting for it to end.
    #[arg(long)]
    no_wait: bool,

    /// Seconds between status polls while waiting without pushes.
    #[arg(long, default_value_t = 5)]
    poll_interval: u64,
}

#[derive(clap::Args, Clone, Debug)]
#[group(id = "volume", multiple = false, required = true)]
struct SetVolumeArgs {
    /// Level between 0.0 and 1.0.
    #[arg(long)]
    level: Option<f32>,

    #[arg(long)]
    up: bool,

    #[arg(long)]
    down: bool,
}

#[derive(clap::Args, Clone, Debug)]
struct MuteArgs {
    /// Unmute instead.
    #[arg(long)]
    off: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.log_json)?;

    tracing::debug!(?args, "args");

    if let Command::Discover(ref sub_args) = args.command {
        return discover_main(&args.target, sub_args).await;
    }

    let device = args.target.resolve().await?;
    println!("Using {name} at {addr}", name = device.display_name(), addr = device.addr);

    let client = Config::new(device.addr).connect().await
        .with_context(|| format!("connecting to {addr}", addr = device.addr))?;

    let res = match args.command.clone() {
        Command::Discover(_) => unreachable!("handled before connecting"),
        Command::Status(sub_args) => status_main(&client, sub_args).await,
        Command::Load(sub_args) => load_main(&client, sub_args).await,
        Command::Attach => attach_main(&client).await,
        Command::Pause | Command::Play | Command::Stop =>
            control_main(&client, &args.command).await,
        Command::SetVolume(sub_args) => set_volume_main(&client, sub_args).await,
        Command::Mute(sub_args) => {
            let volume = client.set_muted(!sub_args.off).await?;
            println!("volume = {volume:?}");
            Ok(())
        },
        Command::Heartbeat => pause().await,
    };

    client.close().await?;

    res
}

async fn discover_main(target: &lib::args::TargetArgs, sub_args: &DiscoverArgs) -> Result<()> {
    let devices = lib::mdns::find(target.device.as_deref(), target.discover_timeout(),
                                  sub_args.limit).await?;

    if devices.is_empty() {
        bail!("No cast devices found");
    }

    for device in devices {
        println!("{addr}\t{name}\t{app}",
                 addr = device.addr,
                 name = device.name.as_deref().unwrap_or("-"),
                 app = device.app_name.as_deref().unwrap_or("-"));
    }

    Ok(())
}

async fn status_main(client: &Client, sub_args: StatusArgs) -> Result<()> {
    let status = client.get_status().await?;
    println!("receiver status = {status:#?}",
             status = payload::receiver::small_debug::ReceiverStatus(&status));

    if let Some(addr) = client.local_addr() {
        println!("local address = {ip}", ip = addr.ip());
    }

    if !sub_args.follow {
        return Ok(());
    }

    enum Event {
        Update(lib::async_client::StatusUpdate),
        UserExit,
    }

    pin! {
        let updates = client.listen_status();
        let cancel_stream = futures::stream::once(pause());
    };

    let merged = futures_concurrency::stream::Merge::merge((
        updates.map(Event::Update),
        cancel_stream.map(|_| Event::UserExit),
    ));
    pin!(merged);

    while let Some(event) = merged.next().await {
        match event {
            Event::Update(update) => match update.msg {
                StatusMessage::Receiver(status) =>
                    println!("{time} receiver = {status:#?}",
                             time = update.time,
                             status = payload::receiver::small_debug::ReceiverStatus(&status)),
                StatusMessage::Media(status) =>
                    println!("{time} media = {status:#?}",
                             time = update.time,
                             status = payload::media::small_debug::MediaStatus(&status)),
                StatusMessage::ConnectionClosed { source } =>
                    println!("{time} connection closed by {source}", time = update.time),
            },
            Event::UserExit => break,
        }
    }

    Ok(())
}

async fn load_main(client: &Client, sub_args: LoadCmdArgs) -> Result<()> {
    let mut load_args = LoadArgs::new(sub_args.url, sub_args.content_type);
    if let Some(subtitles) = sub_args.subtitles {
        load_args = load_args.with_subtitles(subtitles, sub_args.subtitles_language);
    }
    if let Some(title) = sub_args.title {
        load_args = load_args.with_title(title);
    }

    let status = client.load(load_args).await?;
    print_media_status(&status);

    if sub_args.no_wait {
        return Ok(());
    }

    let status = client.wait_until_idle(
        std::time::Duration::from_secs(sub_args.poll_interval)).await?;
    print_media_status(&status);

    Ok(())
}

async fn attach_main(client: &Client) -> Result<()> {
    let status = client.attach().await?;
    print_media_status(&status);
    println!("playback state = {state:?}", state = client.playback_state());
    Ok(())
}

/// Attach to running playback, then pause, play or stop it.
async fn control_main(client: &Client, command: &Command) -> Result<()> {
    client.attach().await.context("no playback to control")?;

    let status = match command {
        Command::Pause => client.pause().await?,
        Command::Play => client.play().await?,
        Command::Stop => client.stop().await?,
        _ => bail!("not a playback command: {command:?}"),
    };
    print_media_status(&status);

    Ok(())
}

async fn set_volume_main(client: &Client, sub_args: SetVolumeArgs) -> Result<()> {
    let volume = match (sub_args.level, sub_args.up, sub_args.down) {
        (Some(level), _, _) => client.set_volume(level).await?,
        (None, true, _) => client.volume_up().await?,
        (None, false, true) => client.volume_down().await?,
        (None, false, false) => bail!("One of --level, --up or --down is required"),
    };
    println!("volume = {volume:?}");
    Ok(())
}

fn print_media_status(status: &MediaStatus) {
    let state = PlaybackState::from(status.player_state);
    println!("media session {id} {state:?} at {time}s{reason}",
             id = status.media_session_id.map_or("-".to_string(), |id| id.to_string()),
             time = status.current_time.unwrap_or(0.0),
             reason = status.idle_reason.map_or(String::new(), |r| format!(" ({r:?})")));
}

/// Wait for the user to press enter.
async fn pause() -> Result<()> {
    println!(">> Press enter to exit.");
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 1];
    let _ = stdin.read(&mut buf).await?;
    Ok(())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum LogMode {
    PrettyAnsi,
    Pretty,
    Json,
}

fn init_logging(log_json: bool) -> Result<()> {
    use std::io::IsTerminal;
    use tracing_bunyan_formatter::{
        BunyanFormattingLayer,
        JsonStorageLayer,
    };
    use tracing_subscriber::{
        EnvFilter,
        filter::LevelFilter,
        fmt,
        prelude::*,
    };

    let log_mode = match (log_json, std::io::stderr().is_terminal()) {
        (true, _) => LogMode::Json,
        (false, true) => LogMode::PrettyAnsi,
        (false, false) => LogMode::Pretty,
    };

    tracing_subscriber::Registry::default()
        .with((log_mode != LogMode::Json).then(|| {
            fmt::Layer::new()
                .event_format(fmt::format()
                                  .pretty()
                                  .with_ansi(log_mode == LogMode::PrettyAnsi)
                                  .with_timer(fmt::time::UtcTime::rfc_3339())
                                  .with_target(true)
                                  .with_source_location(false))
                .with_ansi(log_mode == LogMode::PrettyAnsi)
                .with_writer(std::io::stderr)
        }))
        .with((log_mode == LogMode::Json).then(|| {
            JsonStorageLayer
                .and_then(BunyanFormattingLayer::new(env!("CARGO_CRATE_NAME").to_string(),
                                                     std::io::stdout))
        }))
        .with(EnvFilter::builder()
                  .with_default_directive(LevelFilter::INFO.into())
                  .parse(std::env::var("RUST_LOG")
                             .unwrap_or_else(|_| "warn,stream2cast=info".to_string()))?)
        .try_init()?;

    Ok(())
}

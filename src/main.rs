use anyhow::{anyhow, Context, Result};
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use moodplay::auth::{code_from_redirect, new_state, SpotifyAuth};
use moodplay::bus::{EventBus, WidgetEvent};
use moodplay::commands::{shared_token, WebApiClient};
use moodplay::config::Config;
use moodplay::handle::PlayerOptions;
use moodplay::recommend::{Mood, MoodRequest, Recommender, Rhythm, Style};
use moodplay::sidecar::BridgeHandle;
use moodplay::synchronizer::PlayerSynchronizer;
use moodplay::view::WidgetView;

const USAGE: &str = "usage:
  moodplay login
  moodplay recommend <happy|sad> [intensity] [light|dark] [intensity] [fast|slow] [intensity]
  moodplay play [track-uri]";

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("Starting moodplay");

    if let Err(e) = run().await {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env().context("Invalid configuration")?;
    let mut args = std::env::args().skip(1);

    match args.next().as_deref() {
        Some("login") => login(&config).await,
        Some("recommend") => recommend(&config, args.collect()).await,
        Some("play") => play(&config, args.next()).await,
        _ => {
            println!("{}", USAGE);
            Ok(())
        }
    }
}

async fn read_line() -> Result<String> {
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| line)
    })
    .await?
    .context("Failed to read stdin")
}

async fn login(config: &Config) -> Result<()> {
    let (client_id, client_secret) = config.require_credentials()?;
    let auth = SpotifyAuth::new(
        &config.accounts_base,
        client_id,
        client_secret,
        &config.redirect_uri,
    )?;

    let state = new_state();
    let url = auth.authorize_url(&state)?;
    println!("Open this URL and log in:\n{}\n", url);
    println!("Enter redirected url:");

    let callback = code_from_redirect(&read_line().await?)?;
    callback.verify(&state)?;

    let tokens = auth.exchange_code(&callback.code).await?;
    log::info!("Logged in, token expires in {:?}s", tokens.expires_in);
    println!("{}", serde_json::to_string_pretty(&tokens)?);
    Ok(())
}

fn intensity_arg(args: &[String], index: usize, default: u8) -> Result<u8> {
    match args.get(index) {
        Some(raw) => raw
            .parse::<u8>()
            .map_err(|_| anyhow!("intensity must be 0-100, got {:?}", raw)),
        None => Ok(default),
    }
}

async fn recommend(config: &Config, args: Vec<String>) -> Result<()> {
    let mood: Mood = args
        .first()
        .ok_or_else(|| anyhow!(USAGE))?
        .parse()
        .map_err(|e: String| anyhow!(e))?;
    let style: Style = match args.get(2) {
        Some(raw) => raw.parse().map_err(|e: String| anyhow!(e))?,
        None => Style::Light,
    };
    let rhythm: Rhythm = match args.get(4) {
        Some(raw) => raw.parse().map_err(|e: String| anyhow!(e))?,
        None => Rhythm::Fast,
    };

    let request = MoodRequest::new(mood)
        .with_mood_intensity(intensity_arg(&args, 1, 100)?)
        .with_style(style, intensity_arg(&args, 3, 50)?)
        .with_rhythm(rhythm, intensity_arg(&args, 5, 50)?);

    let token = shared_token(config.require_access_token()?);
    let recommender = Recommender::new(
        &config.openai_base,
        config.openai_api_key.clone(),
        &config.openai_model,
        &config.api_base,
        token,
        config.command_timeout * 6,
    )?;

    match recommender.recommend(&request).await {
        Ok(tracks) => {
            println!(
                "{} mood, {} intensity ({}%): {} tracks",
                request.mood,
                request.mood_band(),
                request.mood_intensity,
                tracks.len()
            );
            for track in tracks {
                println!(
                    "{}  {} - {}",
                    track.uri,
                    track.metadata.name,
                    track.metadata.artists_joined()
                );
            }
            Ok(())
        }
        Err(e) => Err(anyhow!("{} (status {})", e, e.status())),
    }
}

async fn play(config: &Config, track_uri: Option<String>) -> Result<()> {
    let token = shared_token(config.require_access_token()?);
    let api = Arc::new(WebApiClient::new(
        &config.api_base,
        token.clone(),
        config.command_timeout,
    )?);
    let bus = EventBus::new();
    let sync = PlayerSynchronizer::new(api, bus.clone(), config.command_timeout);

    let options = PlayerOptions {
        name: config.player_name.clone(),
        volume: config.volume,
        token: Arc::new(move || token.read().clone()),
    };
    let bridge = Arc::new(BridgeHandle::new(&config.bridge_program, Vec::new(), options));
    bridge.spawn()?;

    // Setup signal handler for Ctrl+C (SIGINT)
    let bridge_for_signal = bridge.clone();
    ctrlc::set_handler(move || {
        log::info!("Received interrupt signal (Ctrl+C), stopping bridge...");
        if let Err(e) = bridge_for_signal.stop() {
            log::error!("Error stopping bridge on interrupt: {}", e);
        }
        std::process::exit(0);
    })
    .expect("Failed to set Ctrl+C handler");

    // Stand-in for sibling components reacting to the player.
    let mut sibling = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = sibling.recv().await {
            if let WidgetEvent::PlayStateChanged { is_playing } = event {
                log::info!("Play state changed: playing={}", is_playing);
            }
        }
    });

    if let Err(e) = sync.attach(bridge.clone()).await {
        // Keep running; the widget simply stays hidden.
        log::error!("Failed to connect playback handle: {}", e);
    }
    if let Some(uri) = track_uri {
        sync.request_track(&uri).await;
    }

    let (tx, mut controls) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    println!("controls: toggle | pause | play <uri> | expand | collapse | handle | up | down | status | quit");

    let mut refresh = tokio::time::interval(Duration::from_millis(500));
    let mut last_line = String::new();
    loop {
        tokio::select! {
            line = controls.recv() => {
                let Some(line) = line else { break };
                if !control(&sync, &bus, line.trim()).await {
                    break;
                }
            }
            _ = refresh.tick() => {}
        }

        let line = WidgetView::from_state(&sync.snapshot()).render_line();
        if line != last_line {
            println!("{}", line);
            last_line = line;
        }
    }

    sync.unmount();
    bridge.stop()
}

/// Apply one stdin control. Returns false to quit.
async fn control(sync: &PlayerSynchronizer, bus: &EventBus, line: &str) -> bool {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "toggle" => sync.toggle_play().await,
        "pause" => sync.pause().await,
        "play" if !rest.trim().is_empty() => sync.request_track(rest.trim()).await,
        "expand" => bus.publish(WidgetEvent::ExpandPlayer),
        "collapse" => sync.collapse(),
        "handle" => sync.toggle_expanded(),
        "up" => sync.on_scroll(-1.0),
        "down" => sync.on_scroll(1.0),
        "status" => match serde_json::to_string_pretty(&sync.snapshot()) {
            Ok(json) => println!("{}", json),
            Err(e) => log::error!("Failed to encode state: {}", e),
        },
        "quit" | "exit" => return false,
        "" => {}
        other => println!("unknown control: {}", other),
    }
    true
}

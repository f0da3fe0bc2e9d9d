use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use clarion::voice::{AudioOutput, AudioStreamPlayer, CpalOutput, PlayerEvent, decode_wav};
use clarion::{Config, Speaker};

/// Clarion - Read text aloud with Deepgram Aura voices
#[derive(Parser)]
#[command(name = "clarion", version, about)]
struct Cli {
    /// Deepgram API key
    #[arg(long, env = "DEEPGRAM_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Voice to use (e.g., "aura-2-thalia-en")
    #[arg(long)]
    voice: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Speak text and wait until playback finishes
    Speak {
        /// Text to speak; read from stdin when omitted
        text: Option<String>,
    },
    /// Speak each line typed on stdin (`/stop`, `/voice <id>`, `/quit`)
    Interactive,
    /// Check that the API key is accepted
    TestConnection,
    /// Fetch a voice sample
    Sample {
        /// Voice to preview (defaults to the selected voice)
        #[arg(long)]
        voice: Option<String>,
        /// Write the WAV file here instead of playing it
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,clarion=info",
        1 => "info,clarion=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load();
    if let Some(key) = cli.api_key.filter(|k| !k.trim().is_empty()) {
        config.api_key = Some(key);
    }
    if let Some(voice) = cli.voice {
        config.voice.model = voice;
    }
    tracing::debug!(
        voice = %config.voice.model,
        rest_url = %config.provider.rest_url,
        stream_url = %config.provider.stream_url,
        has_key = config.api_key.is_some(),
        "loaded configuration"
    );

    match cli.command {
        Command::Speak { text } => speak(&config, text).await,
        Command::Interactive => interactive(&config).await,
        Command::TestConnection => test_connection(&config).await,
        Command::Sample { voice, output } => sample(&config, voice.as_deref(), output).await,
    }
}

fn require_key(config: &Config) -> anyhow::Result<()> {
    if config.api_key.is_none() {
        anyhow::bail!("no API key configured (set DEEPGRAM_API_KEY or api_keys.deepgram)");
    }
    Ok(())
}

async fn speak(config: &Config, text: Option<String>) -> anyhow::Result<()> {
    require_key(config)?;

    let text = if let Some(text) = text {
        text
    } else {
        let mut buf = String::new();
        tokio::io::stdin().read_to_string(&mut buf).await?;
        buf
    };

    let speaker = Speaker::spawn(config, Arc::new(CpalOutput));
    speaker.speak(text).await;

    tokio::select! {
        () = speaker.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            speaker.stop().await;
        }
    }

    speaker.shutdown().await;
    Ok(())
}

async fn interactive(config: &Config) -> anyhow::Result<()> {
    require_key(config)?;

    let speaker = Speaker::spawn(config, Arc::new(CpalOutput));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("Type text to speak. /stop interrupts, /voice <id> switches voice, /quit exits.");

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();

        match line {
            "" => {}
            "/quit" => break,
            "/stop" => speaker.stop().await,
            _ => {
                if let Some(voice) = line.strip_prefix("/voice ") {
                    speaker.set_voice(voice.trim()).await;
                } else {
                    speaker.speak(line).await;
                }
            }
        }
    }

    speaker.shutdown().await;
    Ok(())
}

async fn test_connection(config: &Config) -> anyhow::Result<()> {
    require_key(config)?;
    let key = config.api_key.as_deref().unwrap_or_default();

    let speaker = Speaker::spawn(config, Arc::new(CpalOutput));
    let ok = speaker.test_connection(key).await;
    speaker.shutdown().await;

    if ok {
        println!("API key accepted");
        Ok(())
    } else {
        anyhow::bail!("API key rejected or provider unreachable")
    }
}

async fn sample(config: &Config, voice: Option<&str>, output: Option<PathBuf>) -> anyhow::Result<()> {
    require_key(config)?;

    let speaker = Speaker::spawn(config, Arc::new(CpalOutput));
    let audio = speaker.fetch_sample(None, voice).await;
    speaker.shutdown().await;

    let Some(audio) = audio else {
        anyhow::bail!("failed to fetch voice sample");
    };

    if let Some(path) = output {
        tokio::fs::write(&path, &audio).await?;
        println!("Wrote {} bytes to {}", audio.len(), path.display());
        return Ok(());
    }

    play_wav(&audio).await
}

/// Play a WAV file on the default output and wait for it to finish
async fn play_wav(wav: &[u8]) -> anyhow::Result<()> {
    let samples = decode_wav(wav)?;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut player = AudioStreamPlayer::new(CpalOutput.open_sink()?, tx);
    player.start()?;
    player.enqueue_samples(&samples);
    player.finish_input();

    tokio::select! {
        event = rx.recv() => {
            if event == Some(PlayerEvent::Drained) {
                tracing::debug!(samples = samples.len(), "sample finished");
            }
        }
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
    }

    player.stop();
    Ok(())
}

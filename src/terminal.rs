//! Interactive terminal front end
//!
//! Reads commands from stdin and renders the conversation from the store's
//! change events. Turns run as spawned tasks so the prompt stays responsive
//! and `/reset` can interrupt a stream.

use crate::agent::{TurnOutcome, VideoInfo, VisionAgent};
use crate::conversation::{ConversationEvent, UiStatus};
use crate::credentials::access_token_from;
use crate::error::{AppError, ChatError};
use crate::transcribe::{transcript_path_for, Transcriber};
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const HELP: &str = "\
Commands:
  /file <path>   analyze a local video file
  /url <url>     analyze a video from a direct link
  /transcribe <path> [output]
                 transcribe the speech in a local video to a text file
  /reset         start over
  /status        show the current video and state
  /history       print the transcript as JSON
  /help          show this help
  /quit          exit
Anything else is sent as a follow-up question about the video.";

/// A parsed input line
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    File(PathBuf),
    Url(String),
    Transcribe {
        video: PathBuf,
        output: Option<PathBuf>,
    },
    Reset,
    Status,
    History,
    Help,
    Quit,
    Message(String),
    Empty,
    Invalid(String),
}

pub(crate) fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    if !line.starts_with('/') {
        return Command::Message(line.to_string());
    }

    let (name, arg) = match line.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (line, ""),
    };
    match name {
        "/file" if arg.is_empty() => Command::Invalid("Usage: /file <path>".to_string()),
        "/file" => Command::File(PathBuf::from(arg)),
        "/url" => Command::Url(arg.to_string()),
        "/transcribe" if arg.is_empty() => {
            Command::Invalid("Usage: /transcribe <path> [output]".to_string())
        }
        "/transcribe" => {
            let mut paths = arg.split_whitespace();
            Command::Transcribe {
                video: PathBuf::from(paths.next().unwrap_or_default()),
                output: paths.next().map(PathBuf::from),
            }
        }
        "/reset" => Command::Reset,
        "/status" => Command::Status,
        "/history" => Command::History,
        "/help" => Command::Help,
        "/quit" | "/exit" => Command::Quit,
        other => Command::Invalid(format!("Unknown command {}. Type /help.", other)),
    }
}

fn format_size(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

pub(crate) fn describe_status(status: &UiStatus, video: Option<&VideoInfo>, ready: bool) -> String {
    let mut lines = Vec::new();
    match video {
        Some(video) => lines.push(format!(
            "Video: {} ({}, {})",
            video.name,
            video.mime_type,
            format_size(video.size)
        )),
        None => lines.push("Video: none".to_string()),
    }

    let state = if status.is_attaching {
        "analyzing video"
    } else if status.is_busy {
        "answering"
    } else if ready {
        "ready for questions"
    } else {
        "idle"
    };
    lines.push(format!("State: {}", state));

    if let Some(error) = &status.last_error {
        lines.push(error.clone());
    }
    lines.join("\n")
}

/// Run the REPL until `/quit` or end of input
pub(crate) async fn run(agent: VisionAgent, transcriber: Arc<Transcriber>) -> Result<(), AppError> {
    let renderer = tokio::spawn(render_events(agent.subscribe()));

    println!("Vision Agent. Load a video with /file or /url, /help for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        match parse_command(&line) {
            Command::Empty => {}
            Command::Quit => break,
            Command::Help => println!("{}", HELP),
            Command::Invalid(message) => println!("{}", message),
            Command::Reset => agent.reset(),
            Command::Status => println!(
                "{}",
                describe_status(&agent.status(), agent.current_video().as_ref(), agent.is_ready())
            ),
            Command::History => {
                let json = serde_json::to_string_pretty(&agent.transcript())?;
                println!("{}", json);
            }
            Command::File(path) => {
                let agent = agent.clone();
                spawn_turn(async move { agent.submit_video_file(&path).await });
            }
            Command::Url(url) => {
                let agent = agent.clone();
                spawn_turn(async move { agent.submit_video_url(&url).await });
            }
            Command::Message(text) => {
                let agent = agent.clone();
                spawn_turn(async move { agent.submit_follow_up(&text).await });
            }
            Command::Transcribe { video, output } => {
                tokio::spawn(transcribe(transcriber.clone(), video, output));
            }
        }
    }

    info!("Exiting");
    agent.reset();
    renderer.abort();
    Ok(())
}

fn spawn_turn<F>(turn: F)
where
    F: Future<Output = Result<TurnOutcome, ChatError>> + Send + 'static,
{
    tokio::spawn(async move {
        match turn.await {
            Ok(outcome) => debug!(?outcome, "Turn finished"),
            Err(e) if e.is_rejection() => println!("{}", e),
            Err(e) => warn!(error = %e, "Turn could not be started"),
        }
    });
}

async fn transcribe(transcriber: Arc<Transcriber>, video: PathBuf, output: Option<PathBuf>) {
    let token = match access_token_from(|key| std::env::var(key).ok()) {
        Ok(token) => token,
        Err(e) => {
            println!("{}", e);
            return;
        }
    };

    let output = output.unwrap_or_else(|| transcript_path_for(&video));
    println!("Transcribing {}... (this may take a few minutes)", video.display());
    match transcriber.transcribe_file(&video, &output, &token).await {
        Ok(summary) => println!(
            "Transcript saved to {} ({} words).",
            summary.output.display(),
            summary.words
        ),
        Err(e) => {
            warn!(error = %e, "Transcription failed");
            println!("{}", e);
        }
    }
}

async fn render_events(mut events: broadcast::Receiver<ConversationEvent>) {
    let mut stdout = std::io::stdout();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Renderer fell behind, some fragments were not shown");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let written = match event {
            ConversationEvent::TurnStarted {
                has_attachment: true,
                ..
            } => write!(stdout, "Analyzing video...\nAgent: "),
            ConversationEvent::TurnStarted { .. } => write!(stdout, "Agent: "),
            ConversationEvent::Fragment { text, .. } => write!(stdout, "{}", text),
            ConversationEvent::TurnCompleted { .. } => writeln!(stdout),
            ConversationEvent::TurnFailed { notice, .. } => writeln!(stdout, "\n{}", notice),
            ConversationEvent::Reset => writeln!(stdout, "\n[conversation reset]"),
        };
        if let Err(e) = written.and_then(|_| stdout.flush()) {
            warn!(error = %e, "Failed to write to stdout");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("   "), Command::Empty);
        assert_eq!(
            parse_command("/file  clips/crash.mp4 "),
            Command::File(PathBuf::from("clips/crash.mp4"))
        );
        assert!(matches!(parse_command("/file"), Command::Invalid(_)));
        assert_eq!(
            parse_command("/url https://example.com/a.mp4"),
            Command::Url("https://example.com/a.mp4".to_string())
        );
        assert_eq!(parse_command("/url"), Command::Url(String::new()));
        assert_eq!(
            parse_command("/transcribe talk.mp4"),
            Command::Transcribe {
                video: PathBuf::from("talk.mp4"),
                output: None
            }
        );
        assert_eq!(
            parse_command("/transcribe talk.mp4 notes.txt"),
            Command::Transcribe {
                video: PathBuf::from("talk.mp4"),
                output: Some(PathBuf::from("notes.txt"))
            }
        );
        assert!(matches!(parse_command("/transcribe"), Command::Invalid(_)));
        assert_eq!(parse_command("/reset"), Command::Reset);
        assert_eq!(parse_command("/exit"), Command::Quit);
        assert!(matches!(parse_command("/rewind"), Command::Invalid(_)));
        assert_eq!(
            parse_command(" who had right of way? "),
            Command::Message("who had right of way?".to_string())
        );
    }

    #[test]
    fn test_describe_status() {
        let video = VideoInfo {
            name: "crossing.mp4".to_string(),
            mime_type: "video/mp4".to_string(),
            size: 3 * 1_048_576,
        };
        let status = UiStatus {
            is_busy: true,
            is_attaching: true,
            last_error: None,
        };
        let text = describe_status(&status, Some(&video), false);
        assert!(text.contains("crossing.mp4 (video/mp4, 3.0 MB)"));
        assert!(text.contains("analyzing video"));

        let status = UiStatus {
            last_error: Some("Error: boom. Please check your API key and network connection.".to_string()),
            ..UiStatus::default()
        };
        let text = describe_status(&status, None, false);
        assert!(text.starts_with("Video: none"));
        assert!(text.ends_with("network connection."));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
    }
}

//! Line-oriented console: parses stdin commands and renders node events.

use crate::core::connection::PeerId;
use crate::core::connection::webrtc::SignalEnvelope;
use crate::core::library::{Direction, FileKey};
use crate::core::node::UiEvent;
use anyhow::{Context, Result, anyhow, bail};
use std::path::PathBuf;

pub const HELP: &str = "\
commands:
  connect <peer>            dial a peer (prints an offer to relay)
  disconnect <peer>         say goodbye and drop a peer
  send <path> [peer ...]    share a file with the given peers, or all
  download <file-id>        fetch a file's bytes into the download dir
  evict <file-id>           forget a file's cached bytes, keep its entry
  signal <json>             apply an offer/answer received out of band
  foreground | background   report an app visibility change
  help
  quit";

#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Connect(PeerId),
    Disconnect(PeerId),
    Send { path: PathBuf, targets: Option<Vec<PeerId>> },
    Download(FileKey),
    Evict(FileKey),
    Signal(SignalEnvelope),
    Visibility { foreground: bool },
    Help,
    Quit,
}

impl Input {
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (cmd, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        let input = match cmd {
            "connect" => Self::Connect(peer_arg(rest)?),
            "disconnect" => Self::Disconnect(peer_arg(rest)?),
            "send" => {
                let mut words = rest.split_whitespace();
                let path = words.next().ok_or_else(|| anyhow!("usage: send <path> [peer ...]"))?;
                let targets: Vec<PeerId> = words.map(PeerId::from).collect();
                Self::Send {
                    path: PathBuf::from(path),
                    targets: (!targets.is_empty()).then_some(targets),
                }
            }
            "download" if !rest.is_empty() => Self::Download(FileKey::from(rest)),
            "download" => bail!("usage: download <file-id>"),
            "evict" if !rest.is_empty() => Self::Evict(FileKey::from(rest)),
            "evict" => bail!("usage: evict <file-id>"),
            "signal" => Self::Signal(serde_json::from_str(rest).context("malformed signal")?),
            "foreground" => Self::Visibility { foreground: true },
            "background" => Self::Visibility { foreground: false },
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => bail!("unknown command `{other}` (try `help`)"),
        };
        Ok(Some(input))
    }
}

fn peer_arg(rest: &str) -> Result<PeerId> {
    match rest.split_whitespace().collect::<Vec<_>>()[..] {
        [peer] => Ok(PeerId::from(peer)),
        _ => bail!("expected exactly one peer id"),
    }
}

/// MIME type announced for a shared file, by extension.
pub fn mime_for(path: &std::path::Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("txt" | "md" | "log") => "text/plain",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("mp4") => "video/mp4",
        Some("mp3") => "audio/mpeg",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

/// One-line rendering of a UI event.
pub fn render(event: &UiEvent) -> String {
    match event {
        UiEvent::PeerConnected(p) => format!("+ {p} connected"),
        UiEvent::PeerDegraded(p) => format!("~ {p} degraded, retrying"),
        UiEvent::PeerReconnected(p) => format!("+ {p} reconnected"),
        UiEvent::PeerDisconnected(p) => format!("- {p} disconnected"),
        UiEvent::FileListUpdated(f) => format!(
            "* {} ({} bytes, {}) from {} [id {}]",
            f.name,
            f.size,
            f.mime,
            f.holder,
            f.key
        ),
        UiEvent::Progress {
            file,
            percent,
            direction,
        } => {
            let arrow = match direction {
                Direction::Sent => "->",
                Direction::Received => "<-",
            };
            format!("  {arrow} {file} {percent}%")
        }
        UiEvent::FileReceived { file, from } => format!("= {file} received from {from}"),
        UiEvent::DownloadReady { file, content, .. } => {
            format!("= {file} ready ({} bytes)", content.len())
        }
        UiEvent::SendComplete { file, delivered } => {
            format!("= {file} sent to {delivered} peer(s)")
        }
        UiEvent::Error(e) => format!("! {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(Input::parse("  ").unwrap(), None);
        assert_eq!(
            Input::parse("connect bob").unwrap(),
            Some(Input::Connect(PeerId::from("bob")))
        );
        assert_eq!(
            Input::parse("send ./a.txt").unwrap(),
            Some(Input::Send {
                path: PathBuf::from("./a.txt"),
                targets: None
            })
        );
        assert_eq!(
            Input::parse("send a.txt bob carol").unwrap(),
            Some(Input::Send {
                path: PathBuf::from("a.txt"),
                targets: Some(vec![PeerId::from("bob"), PeerId::from("carol")]),
            })
        );
        assert_eq!(
            Input::parse("download report.pdf:1024").unwrap(),
            Some(Input::Download(FileKey::from("report.pdf:1024")))
        );
        assert_eq!(Input::parse("background").unwrap(), Some(Input::Visibility { foreground: false }));
    }

    #[test]
    fn mime_by_extension() {
        assert_eq!(mime_for(std::path::Path::new("a/B.PNG")), "image/png");
        assert_eq!(mime_for(std::path::Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn rejects_bad_input() {
        assert!(Input::parse("connect").is_err());
        assert!(Input::parse("connect a b").is_err());
        assert!(Input::parse("download").is_err());
        assert!(Input::parse("signal {nope").is_err());
        assert!(Input::parse("dance").is_err());
    }

    #[test]
    fn signal_round_trips_through_the_console() {
        let line = r#"signal {"from":"a","to":"b","session":"00000000-0000-0000-0000-000000000000","signal":{"kind":"offer","sdp":"x"}}"#;
        let Some(Input::Signal(env)) = Input::parse(line).unwrap() else {
            panic!("not a signal");
        };
        assert_eq!(env.from, PeerId::from("a"));
    }
}

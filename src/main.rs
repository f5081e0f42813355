mod app;
mod console;
mod core;
mod utils;

use crate::app::Args;
use crate::console::Input;
use crate::core::connection::PeerId;
use crate::core::connection::webrtc::{SignalEnvelope, WebRtcTransport};
use crate::core::node::{MeshNode, NodeCommand, UiEvent, UiSink};
use crate::utils::sos::SignalOfStop;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load()?;

    // webrtc_ice logs every late STUN response as a warning; keep it quiet.
    let filter = match args.verbose {
        0 => "warn,meshdrop=info,webrtc_ice::agent=error",
        1 => "info,webrtc_ice::agent=error",
        2 => "debug,webrtc_ice::agent=error",
        _ => "trace",
    };
    // stdout belongs to the console; logs go to stderr.
    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let local = args
        .peer_id
        .clone()
        .map(PeerId::new)
        .unwrap_or_else(PeerId::generate);
    let download_dir = args.download_dir.clone().unwrap_or_else(|| PathBuf::from("."));

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (transport, signals) = WebRtcTransport::new(local.clone(), &args.ice_servers, events_tx)?;
    let transport = Arc::new(transport);
    let (ui, ui_rx) = UiSink::channel();
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let node = MeshNode::new(transport.clone(), args.mesh.clone(), ui);

    let sos = SignalOfStop::new();
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    info!(event = "startup", peer = %local, ice_servers = args.ice_servers.len());
    println!("meshdrop peer id: {local}");
    println!("{}", console::HELP);

    let node_task = tokio::spawn(node.run(events_rx, commands_rx, sos.clone()));
    tokio::spawn(print_outputs(signals, ui_rx, download_dir));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = sos.wait() => break,
            line = lines.next_line() => line.context("reading stdin")?,
        };
        let Some(line) = line else {
            break;
        };
        let input = match Input::parse(&line) {
            Ok(Some(input)) => input,
            Ok(None) => continue,
            Err(e) => {
                println!("! {e:#}");
                continue;
            }
        };
        let command = match input {
            Input::Connect(peer) => NodeCommand::Connect(peer),
            Input::Disconnect(peer) => NodeCommand::Disconnect(peer),
            Input::Download(key) => NodeCommand::Download(key),
            Input::Evict(key) => NodeCommand::Evict(key),
            Input::Visibility { foreground } => NodeCommand::Visibility { foreground },
            Input::Send { path, targets } => match read_share(&path, targets).await {
                Ok(cmd) => cmd,
                Err(e) => {
                    println!("! {e:#}");
                    continue;
                }
            },
            Input::Signal(envelope) => {
                if let Err(e) = transport.handle_signal(envelope).await {
                    warn!(event = "signal_rejected", %e);
                    println!("! {e:#}");
                }
                continue;
            }
            Input::Help => {
                println!("{}", console::HELP);
                continue;
            }
            Input::Quit => break,
        };
        if commands.send(command).is_err() {
            break;
        }
    }

    let _ = commands.send(NodeCommand::Shutdown);
    sos.cancel();
    node_task.await.context("node task")?;
    Ok(())
}

async fn read_share(path: &Path, targets: Option<Vec<PeerId>>) -> anyhow::Result<NodeCommand> {
    let content = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))?;
    Ok(NodeCommand::SendFile {
        name: name.to_string(),
        mime: console::mime_for(path).to_string(),
        content: content.into(),
        targets,
    })
}

/// Print outbound signals for the user to relay, render node events, and
/// write downloads to disk.
async fn print_outputs(
    mut signals: mpsc::UnboundedReceiver<SignalEnvelope>,
    mut ui: mpsc::UnboundedReceiver<UiEvent>,
    download_dir: PathBuf,
) {
    loop {
        tokio::select! {
            Some(envelope) = signals.recv() => match serde_json::to_string(&envelope) {
                Ok(json) => println!("relay to {}: signal {json}", envelope.to),
                Err(e) => error!(event = "signal_encode_failed", %e),
            },
            Some(event) = ui.recv() => {
                // Names come from remote peers; never let one escape the directory.
                if let UiEvent::DownloadReady { name, content, .. } = &event
                    && let Some(file_name) = Path::new(name).file_name()
                {
                    let target = download_dir.join(file_name);
                    match tokio::fs::write(&target, content).await {
                        Ok(()) => println!("= saved {}", target.display()),
                        Err(e) => println!("! writing {}: {e}", target.display()),
                    }
                }
                println!("{}", console::render(&event));
            }
            else => break,
        }
    }
}

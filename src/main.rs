//! Peer-to-peer UDP Chat - Entry Point
//!
//! `hole_chat server [ADDR | CONFIG.json]` runs the rendezvous server.
//! `hole_chat client RENDEZVOUS ROOM [NAME]` joins a room, sends each stdin
//! line as chat and prints what arrives.

use std::env;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hole_chat::config::load_from_file;
use hole_chat::{ClientConfig, ClientEvent, MeshClient, RendezvousServer, ServerConfig};

const USAGE: &str = "usage: hole_chat server [ADDR|CONFIG.json]\n       hole_chat client RENDEZVOUS ROOM [NAME]";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=hole_chat=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hole_chat=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("server") => run_server(args.get(1)).await,
        Some("client") if args.len() >= 3 => {
            run_client(&args[1], &args[2], args.get(3).cloned().unwrap_or_default()).await
        }
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }
}

async fn run_server(arg: Option<&String>) -> Result<(), Box<dyn std::error::Error>> {
    let config = match arg {
        Some(path) if path.ends_with(".json") => load_from_file::<ServerConfig>(path)?,
        Some(addr) => ServerConfig {
            listen: addr.clone(),
            ..ServerConfig::default()
        },
        None => ServerConfig::default(),
    };

    let server = RendezvousServer::bind(config).await?;
    info!("Rendezvous server listening on {}", server.local_addr()?);

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

async fn run_client(
    rendezvous: &str,
    room: &str,
    display_name: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = ClientConfig {
        rendezvous: rendezvous.to_string(),
        display_name,
        ..ClientConfig::default()
    };
    let (client, mut events) = MeshClient::connect(config).await?;
    info!("Listening on {}", client.local_addr()?);
    client.join_room(room).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(text) if text.is_empty() => {}
                Some(text) => {
                    let report = client.send_chat(room, &text).await?;
                    if !report.is_complete() {
                        error!("Message reached {} of {} peer(s)",
                            report.delivered.len(),
                            report.delivered.len() + report.failed.len());
                    }
                }
                None => break,
            },
            event = events.recv() => match event {
                Some(ClientEvent::Chat(chat)) => {
                    println!("[{}] {}: {}", chat.room, chat.sender, chat.text);
                }
                Some(ClientEvent::Roster { room, members }) => {
                    println!("[{}] {} member(s) online", room, members.len());
                }
                Some(ClientEvent::Disconnected) | None => {
                    println!("disconnected");
                    break;
                }
            },
        }
    }

    client.shutdown().await;
    Ok(())
}

//! WebSocket echo server.
//!
//! Every text message a client sends is logged and sent back to it. Type
//! `q` and press enter to stop.
//!
//! Run with: `cargo run --example echo_server`

use ironws::{ServerHandle, Session};
use parking_lot::Mutex;
use std::io::BufRead;
use std::sync::Arc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Keeps every accepted session reachable from the main thread.
    let sessions: Arc<Mutex<Vec<Session>>> = Arc::new(Mutex::new(Vec::new()));
    let accepted = Arc::clone(&sessions);

    let server = ServerHandle::new("0.0.0.0", 4321, move |session| {
        let echo = session.clone();
        session.on_message(move |text| {
            eprintln!("Received: {text}");
            if let Err(e) = echo.send(text) {
                eprintln!("Failed to echo to session {}: {e}", echo.id());
            }
        });

        let mut sessions = accepted.lock();
        sessions.retain(Session::is_open);
        sessions.push(session);
    })?;

    server.run()?;
    println!("Echo server listening on {}", server.local_addr());
    println!("Type q to quit");

    for line in std::io::stdin().lock().lines() {
        let command = line?;
        let command = command.trim();
        if command == "q" {
            break;
        }
        println!(
            "You typed: {command} ({} open sessions)",
            sessions.lock().len()
        );
    }

    server.shutdown()?;
    Ok(())
}

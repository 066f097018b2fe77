/**
 * Switch Example
 *
 * Usage: cargo run --example switch -- <HOST> [STATUS|ON|OFF]
 *
 * This example opens a session with one plug, then reports or changes its
 * power state.
 */
use orvibo::{Client, Config};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    println!("--- Orvibo - Switch ---");

    let mut args = std::env::args().skip(1);
    let Some(host) = args.next() else {
        eprintln!("usage: switch <HOST> [STATUS|ON|OFF]");
        return;
    };
    let command = args.next().unwrap_or_else(|| "STATUS".to_string());

    // 1. Bind the protocol port and open the session (discovers the MAC address)
    let client = match Client::bind(Config::default()) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("[ERROR] {}", e);
            return;
        }
    };
    let plug = match client.open_session(&host).await {
        Ok(plug) => plug,
        Err(e) => {
            eprintln!("[ERROR] {}", e);
            return;
        }
    };

    // 2. Run the command
    let result = match command.to_uppercase().as_str() {
        "STATUS" => plug
            .get_state()
            .await
            .map(|on| println!("{}", if on { "ON" } else { "OFF" })),
        "ON" => plug.turn_on().await.map(|_| println!("ON")),
        "OFF" => plug.turn_off().await.map(|_| println!("OFF")),
        _ => {
            eprintln!("unrecognised command");
            return;
        }
    };

    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
    }
}

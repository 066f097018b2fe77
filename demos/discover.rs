/**
 * Discovery Example
 *
 * This example broadcasts discovery requests and prints every S20 plug that
 * answers, together with its MAC address and current power state.
 */
use futures_util::StreamExt;
use orvibo::{Client, Config};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    println!("--- Orvibo - Discovery ---");

    // 1. Bind the protocol port (10000)
    let client = match Client::bind(Config::default()) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("[ERROR] {}", e);
            return;
        }
    };

    // 2. Print plugs as they answer
    let stream = client.discover_stream();
    tokio::pin!(stream);
    let mut hosts = Vec::new();
    while let Some(host) = stream.next().await {
        println!("[{}] Found plug at {}", hosts.len() + 1, host);
        hosts.push(host);
    }

    // 3. Open a session with each plug and query its state
    for host in hosts {
        match client.open_session(&host.to_string()).await {
            Ok(plug) => match plug.get_state().await {
                Ok(on) => println!(
                    "[SUCCESS] {} (MAC {}) is {}",
                    host,
                    plug.mac(),
                    if on { "ON" } else { "OFF" }
                ),
                Err(e) => eprintln!("[ERROR] {}", e),
            },
            Err(e) => eprintln!("[ERROR] {}", e),
        }
    }

    println!("[INFO] Example finished.");
}

//! Connect to the realtime broker and print every event.
//!
//! ```sh
//! REALTIME_USER_ID=25025320 \
//! REALTIME_DEVICE_ID=2f4b0c1e-9a77-4d0e-8f1a-3c5d7e9f1b2a \
//! REALTIME_SESSION='sessionid=...' \
//!     cargo run -p realtime-mqtt --example listen -- [HOST]
//! ```
//!
//! Thread items and other payloads are printed to stdout (pipe to `jq` for
//! formatting); lifecycle events go to stderr.

use realtime_mqtt::{AuthInfo, DeviceInfo, Event, RealtimeClient, RealtimeConfig};

fn required(name: &str) -> Result<String, String> {
    std::env::var(name).map_err(|_| format!("{name} must be set"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let auth = AuthInfo {
        user_id: required("REALTIME_USER_ID")?,
        device_id: required("REALTIME_DEVICE_ID")?,
        password: required("REALTIME_SESSION")?,
        ..Default::default()
    };
    let mut config = RealtimeConfig::new(auth, DeviceInfo::default());
    if let Some(host) = std::env::args().nth(1) {
        config.host = host;
    }

    eprintln!("connecting to {} ...", config.host);
    let mut client = RealtimeClient::new(config);
    client.start()?;

    loop {
        let event = tokio::select! {
            event = client.next_event() => event,
            _ = tokio::signal::ctrl_c() => {
                client.stop()?;
                break;
            }
        };
        let Some(event) = event else { break };
        match &event {
            Event::Connected => eprintln!("[connected]"),
            Event::Disconnected { reason } => {
                eprintln!("[disconnected] {}", reason.as_deref().unwrap_or("-"));
            }
            Event::Warning(message) => eprintln!("[warning] {message}"),
            Event::Error { message } => eprintln!("[error] {message}"),
            Event::ThreadItemCreated {
                thread_id,
                item_id,
                item,
            } => {
                eprintln!("[item] thread={thread_id} id={item_id}");
                println!("{item}");
            }
            Event::ClientContextAck(ack) => {
                eprintln!(
                    "[ack] status={} context={}",
                    ack.status,
                    ack.client_context.as_deref().unwrap_or("-")
                );
            }
            other => eprintln!("[{}] {other:?}", other.name()),
        }
    }

    Ok(())
}

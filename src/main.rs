use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use std::sync::Arc;
use whatsapp_console::types::events::{Event, GatewayEvent};
use whatsapp_console::{ChatConsole, ClientConfig, InstanceCredentials};
use whatsapp_console_ureq_http_client::{UreqEventStreamFactory, UreqHttpClient};

// Headless console: follows one instance's chats and logs what changes.
//
// Usage:
//   cargo run -- --url http://localhost:8080 --instance main --token SECRET
//   cargo run -- ... --send-to 5511999999999 --text "hello"

#[derive(Parser, Debug)]
#[command(about = "Real-time WhatsApp gateway chat console")]
struct Args {
    /// Gateway base URL
    #[arg(long, env = "WA_GATEWAY_URL")]
    url: String,
    /// Instance to follow
    #[arg(long, env = "WA_INSTANCE")]
    instance: String,
    /// Instance token
    #[arg(long, env = "WA_TOKEN")]
    token: String,
    /// Chat to send a text message to once connected
    #[arg(long, requires = "text")]
    send_to: Option<String>,
    #[arg(long)]
    text: Option<String>,
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    rt.block_on(async {
        let console = Arc::new(ChatConsole::new(
            ClientConfig::new(args.url),
            Arc::new(UreqHttpClient::new()),
            Arc::new(UreqEventStreamFactory::new()),
        ));

        console.on_event(Arc::new(|event: &Event| match event {
            Event::Connection(state) => info!("Connection: {state:?}"),
            Event::ReconnectExhausted { attempts } => {
                error!("Gave up reconnecting after {attempts} attempts")
            }
            Event::ReauthRequired { instance_id } => {
                warn!("Instance {instance_id} needs to be paired again")
            }
            Event::Gateway(gateway_event) => {
                if let GatewayEvent::MessageReceived(message) = gateway_event.as_ref() {
                    info!(
                        "[{}] {}: {}",
                        message.chat_id,
                        message.sender_name.as_deref().unwrap_or("?"),
                        message.content.preview_text()
                    );
                }
            }
            Event::MessageStatusChanged {
                local_id, status, ..
            } => info!("Message {local_id} is now {status}"),
            Event::MessageFailed {
                local_id, error, ..
            } => warn!("Message {local_id} failed: {error}"),
            _ => {}
        }));

        console
            .select_instance(InstanceCredentials::new(args.instance, args.token))
            .await;

        match console.load_snapshot().await {
            Ok(changed) => info!("Loaded {changed} chats"),
            Err(e) => error!("Failed to load chats: {e}"),
        }
        for chat in console.roster().iter().take(10) {
            info!("  {} ({} unread)", chat.title(), chat.unread_count);
        }

        if let (Some(chat_id), Some(text)) = (args.send_to, args.text) {
            match console.send_text(&chat_id, text).await {
                Ok(local_id) => info!("Queued message {local_id} to {chat_id}"),
                Err(e) => error!("Failed to send: {e}"),
            }
        }

        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {e}");
        }
        info!("Shutting down");
        console.close().await;
    });
}

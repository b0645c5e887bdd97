//! Publish/subscribe and request/reply demo
//!
//! Point it at a running server (defaults to localhost:4222):
//!     cargo run --example pubsub [nats://host:port]

use bytes::Bytes;
use courier::ConnectOptions;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("courier=debug".parse()?),
        )
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "nats://127.0.0.1:4222".to_string());

    println!("connecting to {}", url);
    let client =
        courier::connect_with_options(ConnectOptions::new().server(url).name("pubsub-demo"))
            .await?;

    let mut sub = client.subscribe("demo.greetings").await?;

    // Echo service answering requests
    let mut service = client.subscribe("demo.echo").await?;
    let responder = client.clone();
    tokio::spawn(async move {
        while let Some(msg) = service.next().await {
            if let Some(reply) = msg.reply {
                let _ = responder.publish(reply, msg.payload).await;
            }
        }
    });

    client
        .publish("demo.greetings", Bytes::from_static(b"hello"))
        .await?;
    client.flush().await?;
    if let Some(msg) = sub.next().await {
        println!("received on {}: {:?}", msg.subject, msg.payload);
    }

    let reply = client
        .request("demo.echo", Bytes::from_static(b"ping"))
        .await?;
    println!("echo answered: {:?}", reply.payload);

    client.drain().await?;
    Ok(())
}

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

/// Frames per message; the wearable batches its samples the same way.
const BATCH: usize = 25;
const WALKING_FRAMES: usize = 150;
const STILL_FRAMES: usize = 100;

fn tuple(acc: [f64; 3], gyro: [f64; 3]) -> String {
    format!(
        "{:.3},{:.3},{:.3},{:.3},{:.3},{:.3}",
        acc[0], acc[1], acc[2], gyro[0], gyro[1], gyro[2]
    )
}

/// Upright gait: vertical axis oscillating around 1 g.
fn walking(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| {
            let phase = i as f64 * 0.4;
            tuple(
                [0.1 * phase.cos(), 1.0 + 0.25 * phase.sin(), 0.2],
                [5.0 * phase.sin(), 3.0, 2.0 * phase.cos()],
            )
        })
        .collect()
}

/// Short free fall, a hard impact, then a tumble.
fn fall() -> Vec<String> {
    let mut frames = Vec::new();
    for _ in 0..5 {
        frames.push(tuple([0.05, 0.3, 0.05], [40.0, 10.0, 5.0]));
    }
    frames.push(tuple([2.1, 1.2, 0.9], [220.0, 80.0, 40.0]));
    frames.push(tuple([1.0, 0.6, 0.4], [120.0, 30.0, 10.0]));
    frames
}

/// Lying flat: gravity on the horizontal axis, no rotation.
fn still(n: usize) -> Vec<String> {
    (0..n).map(|_| tuple([0.98, 0.05, 0.1], [0.2, 0.1, 0.0])).collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let server = std::env::var("SIM_SERVER").unwrap_or_else(|_| "ws://127.0.0.1:8080".into());
    let person = std::env::var("SIM_PERSON").unwrap_or_else(|_| "guest".into());
    let mut url = Url::parse(&server)?.join("/ws")?;
    url.query_pairs_mut().append_pair("person", &person);
    if let Ok(sensitivity) = std::env::var("SIM_SENSITIVITY") {
        url.query_pairs_mut().append_pair("sensitivity", &sensitivity);
    }

    println!("🔌 Connecting to {url} ...");
    let (ws_stream, _) = connect_async(url.to_string())
        .await
        .context("failed to connect")?;
    let (mut write, mut read) = ws_stream.split();

    // Print every event the server pushes back.
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = read.next().await {
            if let Message::Text(text) = msg {
                println!("📨 {text}");
            }
        }
    });

    let phases = [
        ("🚶 Walking", walking(WALKING_FRAMES)),
        ("⚠️ Falling", fall()),
        ("🛌 Lying still", still(STILL_FRAMES)),
    ];

    for (label, frames) in phases {
        println!("{label} ({} frames)", frames.len());
        for chunk in frames.chunks(BATCH) {
            write.send(Message::Text(chunk.join("\n").into())).await?;
            sleep(Duration::from_millis(250)).await;
        }
    }

    // Long enough for the response window and cooldown to elapse.
    println!("⏳ Waiting for verification to resolve...");
    let _ = timeout(Duration::from_secs(10), reader).await;
    write.send(Message::Close(None)).await.ok();
    println!("🛑 Simulation Finished.");
    Ok(())
}

//! Streaming upload example
//!
//! Uploads a generated stream of unknown length. Once it outgrows the part
//! size the client switches to multipart upload and sends parts
//! concurrently; Ctrl-C cancels the upload and aborts it on the server.
//!
//! Run with: cargo run --example streaming_upload

use bytes::Bytes;
use futures::{stream, StreamExt};
use ostore_client::{Body, Config, OstoreClient, PutOptions, MIN_PART_SIZE};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const CHUNK_SIZE: usize = 256 * 1024;
const TOTAL_SIZE: usize = 3 * MIN_PART_SIZE + MIN_PART_SIZE / 2;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ostore_client=info")),
        )
        .init();

    println!("📦 ostore - Streaming Upload Example\n");

    let token = CancellationToken::new();
    let config = Config::from_env()?
        .with_max_concurrent_parts(4)
        .with_cancellation(token.clone());
    let client = OstoreClient::new(config)?;

    tokio::spawn({
        let token = token.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("\n   ⛔ Cancelling...");
                token.cancel();
            }
        }
    });

    // Chunks are generated lazily; the client never sees the total size
    let chunks = stream::iter(0..TOTAL_SIZE.div_ceil(CHUNK_SIZE)).map(|i| {
        let len = CHUNK_SIZE.min(TOTAL_SIZE - i * CHUNK_SIZE);
        Ok(Bytes::from(vec![(i % 256) as u8; len]))
    });

    println!(
        "📤 Streaming {:.1} MiB in {} KiB chunks...",
        TOTAL_SIZE as f64 / (1024.0 * 1024.0),
        CHUNK_SIZE / 1024
    );
    let start = Instant::now();
    let result = client
        .put(
            "demo/stream.bin",
            Body::stream(chunks),
            PutOptions::new().with_content_type("application/octet-stream"),
        )
        .await;

    match result {
        Ok(etag) => {
            println!("   ✅ Uploaded in {:?}", start.elapsed());
            println!("   ETag: {}", etag);
            client.del("demo/stream.bin", Some(&etag)).await?;
            println!("   🗑️  Deleted");
        }
        Err(e) if e.is_aborted() => println!("   ⚠️  Upload cancelled and aborted"),
        Err(e) => {
            if let Some(code) = e.error_code() {
                println!("   ❌ Service error code: {}", code);
            }
            return Err(e.into());
        }
    }

    Ok(())
}

//! Basic usage example for the ostore client
//!
//! This example demonstrates:
//! - Create-only and guarded uploads
//! - Conditional downloads
//! - Listing with folded prefixes
//! - Server-side copy and delete
//!
//! Configure with OSTORE_ENDPOINT, OSTORE_BUCKET, OSTORE_ACCESS_KEY and
//! OSTORE_SECRET_KEY (a `.env` file works too).
//!
//! Run with: cargo run --example basic_usage

use futures::TryStreamExt;
use ostore_client::{ListEntry, ListOptions, OstoreClient, PutOptions};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ostore_client=info")),
        )
        .init();

    println!("🚀 ostore - Basic Usage Example\n");

    let client = OstoreClient::from_env()?;
    println!("   Bucket: {}", client.config().bucket);

    // ==================== Uploads ====================

    println!("\n📤 Uploading 'demo/hello.txt'...");
    let etag = match client
        .put("demo/hello.txt", "Hello, World!", PutOptions::new())
        .await
    {
        Ok(etag) => {
            println!("   ✅ Created with ETag: {}", etag);
            etag
        }
        Err(e) if e.is_precondition_failed() => {
            println!("   ⚠️  Already exists, fetching current ETag");
            client.head("demo/hello.txt").await?.etag
        }
        Err(e) => return Err(e.into()),
    };

    println!("\n📤 Replacing it only if nobody else has...");
    let etag = client
        .put(
            "demo/hello.txt",
            "Hello again!",
            PutOptions::new().with_expected_etag(&etag),
        )
        .await?;
    println!("   ✅ New ETag: {}", etag);

    println!("\n📤 Uploading 'demo/config.json'...");
    let config_etag = client
        .put(
            "demo/config.json",
            serde_json::json!({ "app": "ostore-demo", "version": 1 }),
            PutOptions::new(),
        )
        .await;
    match config_etag {
        Ok(etag) => println!("   ✅ Uploaded with ETag: {}", etag),
        Err(e) => println!("   ⚠️  {}", e),
    }

    // ==================== Downloads ====================

    println!("\n📥 Downloading 'demo/hello.txt'...");
    if let Some(data) = client.get("demo/hello.txt", None).await? {
        println!("   Content: {}", String::from_utf8_lossy(&data));
    }

    println!("\n📥 Downloading again with If-None-Match...");
    match client.get("demo/hello.txt", Some(&etag)).await? {
        Some(_) => println!("   Object changed"),
        None => println!("   ✅ Not modified"),
    }

    // ==================== Listing ====================

    println!("\n📋 Listing 'demo/'...");
    let entries: Vec<ListEntry> = client
        .list(Some("demo"), ListOptions::default())
        .try_collect()
        .await?;
    for entry in &entries {
        match entry {
            ListEntry::Object(object) => println!("   - {} ({} bytes)", object.name, object.size),
            ListEntry::Prefix(prefix) => println!("   📁 {}", prefix),
        }
    }

    // ==================== Copy & Delete ====================

    println!("\n📋 Copying to 'demo/hello-copy.txt'...");
    let copy_etag = client.copy("demo/hello-copy.txt", "demo/hello.txt", None).await?;
    println!("   ✅ Copy ETag: {}", copy_etag);

    println!("\n🗑️  Cleaning up...");
    client.del("demo/hello-copy.txt", Some(&copy_etag)).await?;
    client.del("demo/hello.txt", Some(&etag)).await?;
    println!("   ✅ Deleted");

    println!("\n✨ Done!");
    Ok(())
}

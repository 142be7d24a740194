//! Long-polling consumer and producer sharing an in-memory channel store.
//!
//! The consumer keeps asking for "everything after the last sequence I saw",
//! the way an HTTP client would re-issue a long-poll after each response.

use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use firehose_channel_store_memory::{MemoryChannelStore, MemoryChannelStoreOptions};
use firehose_server::{
    Channel, NextMessagesOptions, Publisher, Resolution, Subscriber, SubscriberOptions,
    parse_since,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Long-polling demo on an in-memory channel", long_about = None)]
struct Args {
    /// Channel key to publish to and poll
    #[arg(short, long, env = "FIREHOSE_CHANNEL", default_value = "/bears/are/mean")]
    channel: String,

    /// Number of messages the producer publishes
    #[arg(short = 'n', long, default_value_t = 10)]
    messages: u64,

    /// Delay between published messages, in milliseconds
    #[arg(long, default_value_t = 300)]
    interval_ms: u64,

    /// Long-poll timeout, in milliseconds
    #[arg(long, env = "FIREHOSE_TIMEOUT_MS", default_value_t = 1000)]
    timeout_ms: u64,

    /// Sequence the consumer starts after (blank for "latest")
    #[arg(long)]
    since: Option<String>,

    /// Messages retained per channel
    #[arg(long, env = "FIREHOSE_MAX_HISTORY", default_value_t = 100)]
    max_history: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let store = MemoryChannelStore::new(MemoryChannelStoreOptions {
        max_history: args.max_history,
        ..Default::default()
    });
    let subscriber = Subscriber::new(store.clone(), SubscriberOptions::default());
    let publisher = Publisher::new(store.clone());
    let channel = Channel::new(args.channel.clone(), store, subscriber)?;

    let shutdown = CancellationToken::new();

    let producer = {
        let key = args.channel.clone();
        let interval = Duration::from_millis(args.interval_ms);
        let total = args.messages;
        tokio::spawn(async move {
            for index in 1..=total {
                tokio::time::sleep(interval).await;
                let sequence = publisher
                    .publish(&key, Bytes::from(format!("message {index}")))
                    .await?;
                info!(sequence, "produced");
            }
            Ok::<_, firehose_server::Error<firehose_channel_store_memory::Error>>(())
        })
    };

    let mut since = parse_since(args.since.as_deref())?;
    let mut received = 0;
    while received < args.messages {
        let options = NextMessagesOptions::with_timeout(Duration::from_millis(args.timeout_ms))
            .cancelled_by(shutdown.clone());

        tokio::select! {
            result = channel.next_messages(since, options) => match result? {
                Resolution::History(messages) | Resolution::Notified(messages) => {
                    for message in &messages {
                        info!(
                            sequence = message.sequence,
                            payload = %String::from_utf8_lossy(&message.payload),
                            "consumed"
                        );
                    }
                    received += messages.len() as u64;
                    since = messages.last().map(|message| message.sequence);
                }
                Resolution::TimedOut => info!(?since, "long-poll timed out, polling again"),
                Resolution::Cancelled => break,
            },
            _ = tokio::signal::ctrl_c() => {
                shutdown.cancel();
                producer.abort();
                info!(received, "interrupted");
                return Ok(());
            }
        }
    }

    producer.await??;
    info!(received, "done");

    Ok(())
}

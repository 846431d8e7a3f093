use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use event_signer::{Credentials, FileKeyStore, SignerConfig, SigningOutcome, SigningPipeline};
use nostr_events::{Filter, SignedEvent, UnsignedEvent, KIND_REACTION, KIND_TEXT_NOTE};
use relay_pool::{build_service, parse_relays, PoolConfig, RelayService, SubscriptionCallbacks};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_KEY_PATH: &str = "./data/nostr.ncryptsec";

#[derive(Debug, Parser)]
#[command(name = "nostr-relay")]
#[command(about = "Connect to Nostr relays, fetch events, and sign-and-publish")]
struct Args {
    /// Relay URL(s). Overrides NOSTR_RELAYS.
    #[arg(long, global = true)]
    relay: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect and print the connection state.
    Status,

    /// Fetch stored events and print them as JSON lines.
    Fetch {
        #[arg(long, default_value_t = KIND_TEXT_NOTE)]
        kind: u16,
        /// Author pubkey(s), hex.
        #[arg(long)]
        author: Vec<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        since: Option<u64>,
    },

    /// Print matching events as they arrive until interrupted.
    Watch {
        #[arg(long, default_value_t = KIND_TEXT_NOTE)]
        kind: u16,
        #[arg(long)]
        author: Vec<String>,
    },

    /// Sign and publish a text note.
    Post {
        content: String,
        #[arg(long, default_value_t = KIND_TEXT_NOTE)]
        kind: u16,
        #[command(flatten)]
        signer: SignerArgs,
    },

    /// Sign and publish a reaction to an event.
    React {
        /// Id of the event being reacted to.
        event_id: String,
        /// Pubkey of that event's author.
        #[arg(long)]
        author: Option<String>,
        #[arg(long, default_value = "+")]
        content: String,
        #[command(flatten)]
        signer: SignerArgs,
    },

    /// Encrypt a secret key with a password and save it for later signing.
    StoreKey {
        #[command(flatten)]
        signer: SignerArgs,
    },
}

#[derive(Debug, clap::Args)]
struct SignerArgs {
    /// Secret key (hex or nsec). Falls back to NOSTR_SECRET_KEY.
    #[arg(long)]
    key: Option<String>,

    /// Password for the stored key. Falls back to NOSTR_KEY_PASSWORD.
    #[arg(long)]
    password: Option<String>,

    /// Encrypted key file. Falls back to NOSTR_ENCRYPTED_KEY_PATH.
    #[arg(long)]
    key_path: Option<PathBuf>,
}

impl SignerArgs {
    fn credentials(&self) -> Credentials {
        let mut credentials = Credentials::from_env();
        if let Some(key) = &self.key {
            credentials.raw_key = Some(key.clone());
        }
        if let Some(password) = &self.password {
            credentials.password = Some(password.clone());
        }
        credentials
    }

    fn pipeline(&self) -> Result<SigningPipeline, Box<dyn std::error::Error>> {
        let path = self
            .key_path
            .clone()
            .or_else(|| env::var("NOSTR_ENCRYPTED_KEY_PATH").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_KEY_PATH));
        Ok(SigningPipeline::new(
            SignerConfig::from_env()?,
            Arc::new(FileKeyStore::new(path)),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    let mut config = PoolConfig::from_env()?;
    if !args.relay.is_empty() {
        config.relays = args.relay.iter().flat_map(|r| parse_relays(r)).collect();
    }

    match args.command {
        Command::Status => {
            let service = build_service(config)?;
            if let Err(e) = service.connect().await {
                warn!(error = %e, "Connect failed");
            }
            let state = service.state();
            println!("{}", state.summary());
            println!("{}", serde_json::to_string_pretty(&state)?);
            service.disconnect();
        }
        Command::Fetch {
            kind,
            author,
            limit,
            since,
        } => {
            let service = connected(config).await?;
            let filter = build_filter(kind, author, Some(limit), since);
            let events = service.get_events(vec![filter]).await?;
            info!(count = events.len(), "Fetched events");
            for event in events {
                println!("{}", event.to_json()?);
            }
            service.disconnect();
        }
        Command::Watch { kind, author } => {
            let service = connected(config).await?;
            let filter = build_filter(kind, author, None, None);
            service.subscribe(
                "watch",
                vec![filter],
                SubscriptionCallbacks::new(|event: SignedEvent| match event.to_json() {
                    Ok(json) => println!("{}", json),
                    Err(e) => warn!(error = %e, "Failed to encode event"),
                })
                .on_eose(|| info!("Caught up; waiting for new events")),
            )?;
            tokio::signal::ctrl_c().await?;
            service.unsubscribe("watch");
            service.disconnect();
        }
        Command::Post {
            content,
            kind,
            signer,
        } => {
            let event = sign(&signer, UnsignedEvent::new("", kind, content)).await?;
            publish(config, &event).await?;
        }
        Command::React {
            event_id,
            author,
            content,
            signer,
        } => {
            let mut tags = vec![vec!["e".to_string(), event_id]];
            if let Some(author) = author {
                tags.push(vec!["p".to_string(), author]);
            }
            let request = UnsignedEvent::new("", KIND_REACTION, content).with_tags(tags);
            let event = sign(&signer, request).await?;
            publish(config, &event).await?;
        }
        Command::StoreKey { signer } => {
            let credentials = signer.credentials();
            let key = credentials
                .raw_key
                .ok_or("Missing secret key (--key or NOSTR_SECRET_KEY)")?;
            let password = credentials
                .password
                .ok_or("Missing password (--password or NOSTR_KEY_PASSWORD)")?;
            signer.pipeline()?.store_secret_key(&key, &password).await?;
            println!("Stored encrypted key");
        }
    }

    Ok(())
}

async fn connected(
    config: PoolConfig,
) -> Result<Arc<dyn RelayService>, Box<dyn std::error::Error>> {
    let service = build_service(config)?;
    service.connect().await?;
    info!(state = %service.state().summary(), "Connected");
    Ok(service)
}

fn build_filter(
    kind: u16,
    authors: Vec<String>,
    limit: Option<usize>,
    since: Option<u64>,
) -> Filter {
    let mut filter = Filter::new().kind(kind);
    if !authors.is_empty() {
        filter = filter.authors(authors);
    }
    if let Some(limit) = limit {
        filter = filter.limit(limit);
    }
    if let Some(since) = since {
        filter = filter.since(since);
    }
    filter
}

async fn sign(
    signer: &SignerArgs,
    request: UnsignedEvent,
) -> Result<SignedEvent, Box<dyn std::error::Error>> {
    let outcome = signer
        .pipeline()?
        .sign_event(&signer.credentials(), request)
        .await?;
    match outcome {
        SigningOutcome::Signed { event, source } => {
            info!(event_id = %event.id, source = ?source, "Signed event");
            Ok(event)
        }
        SigningOutcome::NeedsCredential => Err("No signing credential \
             (--key / NOSTR_SECRET_KEY or --password / NOSTR_KEY_PASSWORD)"
            .into()),
    }
}

async fn publish(
    config: PoolConfig,
    event: &SignedEvent,
) -> Result<(), Box<dyn std::error::Error>> {
    let service = connected(config).await?;
    let outcome = service.publish(event).await;
    service.disconnect();

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if !outcome.is_accepted() {
        return Err(format!(
            "No relay accepted {}: {}",
            outcome.event_id,
            outcome.rejection_summary()
        )
        .into());
    }
    Ok(())
}

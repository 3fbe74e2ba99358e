//! # Dispatch CLI
//!
//! Harness for the call layer. `dispatch demo` wires two participants
//! (a customer and a provider) through a loopback signaling relay and a
//! simulated media stack, then plays one call end to end.

mod relay;
mod sim;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use dispatch_call::{CallClient, CallConfig, CallContext, CallEvent, CallState, MediaKind};
use relay::LoopbackRelay;
use sim::SimulatedNegotiator;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const CUSTOMER: &str = "customer-1";
const PROVIDER: &str = "driver-9";

#[derive(Parser, Debug)]
#[command(
    name = "dispatch",
    author,
    version,
    about = "Dispatch call layer tools",
    long_about = None
)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true, env = "DISPATCH_LOG_JSON")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Place a call between two simulated participants
    Demo(DemoArgs),
}

#[derive(Args, Debug)]
struct DemoArgs {
    /// Video call instead of audio-only
    #[arg(long)]
    video: bool,

    /// Seconds to stay connected before hanging up
    #[arg(long, default_value_t = 2)]
    talk_secs: u64,

    /// The provider declines instead of answering
    #[arg(long)]
    decline: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = dispatch_common::config::init()?;

    // Initialize tracing (structured logging)
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log.filter.as_str().into());
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    tracing::info!("Starting Dispatch call harness v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Demo(args) => demo(CallConfig::from(&config.call), args).await,
    }
}

/// One participant wired to the relay.
struct Participant {
    client: CallClient,
    tasks: Vec<JoinHandle<()>>,
}

impl Participant {
    fn new(
        name: &'static str,
        config: CallConfig,
        outbound: mpsc::UnboundedSender<dispatch_common::SignalEnvelope>,
        inbound: mpsc::UnboundedReceiver<dispatch_common::SignalEnvelope>,
    ) -> Self {
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let client = CallClient::new(
            config,
            CallContext::new(name).with_room("request-1001"),
            Arc::new(outbound),
            Arc::new(SimulatedNegotiator::new(name, media_tx)),
        );

        let tasks = vec![
            client.spawn_signaling(inbound),
            client.spawn_negotiator_events(media_rx),
            watch_client(name, &client),
        ];
        Self { client, tasks }
    }

    fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

async fn demo(config: CallConfig, args: DemoArgs) -> anyhow::Result<()> {
    let kind = if args.video {
        MediaKind::Video
    } else {
        MediaKind::Audio
    };

    // === Loopback signaling ===
    let (customer_out_tx, customer_out_rx) = mpsc::unbounded_channel();
    let (customer_in_tx, customer_in_rx) = mpsc::unbounded_channel();
    let (provider_out_tx, provider_out_rx) = mpsc::unbounded_channel();
    let (provider_in_tx, provider_in_rx) = mpsc::unbounded_channel();

    let customer = Participant::new(CUSTOMER, config.clone(), customer_out_tx, customer_in_rx);
    let provider = Participant::new(PROVIDER, config.clone(), provider_out_tx, provider_in_rx);

    let relay = tokio::spawn(LoopbackRelay::new().run(
        (CUSTOMER, customer_out_rx, customer_in_tx),
        (PROVIDER, provider_out_rx, provider_in_tx),
    ));

    // === Provider answers (or declines) when it rings ===
    let answering = {
        let client = provider.client.clone();
        let mut events = client.subscribe_events();
        let decline = args.decline;
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(CallEvent::Incoming { .. }) => {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        let result = if decline {
                            client.reject_call().await
                        } else {
                            client.accept_call().await
                        };
                        if let Err(e) = result {
                            tracing::warn!(side = PROVIDER, error = %e, "Could not answer");
                        }
                        return;
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    };

    // === Customer places the call ===
    let mut ended = customer.client.subscribe_events();
    let session_id = customer
        .client
        .start_call_with(PROVIDER, Some("Sam (driver)".into()), kind)
        .await
        .context("placing call")?;
    tracing::info!(session = %session_id, kind = kind.as_str(), "Call placed");

    let mut state = customer.client.subscribe_state();
    let reached = state
        .wait_for(|s| matches!(s.state, CallState::Active | CallState::Idle))
        .await?
        .state;

    if reached == CallState::Active {
        if args.video {
            customer.client.toggle_video().await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            customer.client.toggle_video().await;
        }
        provider.client.toggle_audio().await;

        tokio::time::sleep(Duration::from_secs(args.talk_secs)).await;
        customer.client.end_call().await?;
    }

    let outcome = tokio::time::timeout(config.ring_timeout, async {
        loop {
            match ended.recv().await {
                Ok(CallEvent::Ended {
                    reason, duration, ..
                }) => return Some((reason, duration)),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .context("waiting for the call to end")?;

    // Let the provider side settle before reporting.
    let mut provider_state = provider.client.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(2),
        provider_state.wait_for(|s| s.state == CallState::Idle),
    )
    .await
    .context("provider did not return to idle")??;

    match outcome {
        Some((reason, duration)) => tracing::info!(
            session = %session_id,
            reason = %reason,
            failure = reason.is_failure(),
            talk_secs = duration.map(|d| d.as_secs()).unwrap_or_default(),
            "Call finished"
        ),
        None => tracing::warn!(session = %session_id, "Event stream closed before the call ended"),
    }

    answering.abort();
    relay.abort();
    customer.shutdown();
    provider.shutdown();
    Ok(())
}

/// Log every state change and notification of one participant.
fn watch_client(side: &'static str, client: &CallClient) -> JoinHandle<()> {
    let mut state = client.subscribe_state();
    let mut events = client.subscribe_events();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = state.borrow_and_update().clone();
                    tracing::info!(
                        side,
                        state = %snapshot.state,
                        session = ?snapshot.session_id.as_ref().map(|s| s.as_str()),
                        audio = snapshot.local_media.audio,
                        video = snapshot.local_media.video,
                        "State"
                    );
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        tracing::info!(side, session = %event.session_id(), ?event, "Event")
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(side, missed, "Event log lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use mqplay::{
    channel::LapinBroker,
    client::{ClientMode, MqClient},
    configs::Configs,
    console,
    dispatcher::Dispatcher,
    errors::AmqpError,
    events::{default_handlers, ALARM_EXCHANGE, STATE_EXCHANGE},
    exchange::ExchangeKind,
};
use std::process::ExitCode;
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    info!(version = env!("CARGO_PKG_VERSION"), "starting");

    match run(Configs::from_env()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "unable to run");
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: Configs) -> Result<(), AmqpError> {
    let broker = LapinBroker::new(&cfg.app.name);

    let consumer = MqClient::connect(broker.clone(), &cfg, ClientMode::Consumer).await?;
    consumer.ready().await;
    Dispatcher::from_client(&consumer, default_handlers(), cfg.dispatcher.clone())?
        .run()
        .await?;

    let publisher = MqClient::connect(broker, &cfg, ClientMode::Publisher).await?;
    publisher.ready().await;
    publisher
        .connect_to_exchange(STATE_EXCHANGE, ExchangeKind::Fanout)
        .await?;
    publisher
        .connect_to_exchange(ALARM_EXCHANGE, ExchangeKind::Fanout)
        .await?;

    let result = console::prompt(
        &publisher,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await;

    publisher.shutdown().await;
    consumer.shutdown().await;
    result
}

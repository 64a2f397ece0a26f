// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Console Prompt
//!
//! Line-oriented prompt driving a publisher: `alarm` and `state` publish an
//! event, `quit` or `q` leave. A failed publish is logged and the prompt keeps
//! going, since the supervisors may bring the channel back at any moment.

use crate::{
    client::MqClient,
    errors::AmqpError,
    events::{AlarmEvent, StateEvent, ALARM_EXCHANGE, STATE_EXCHANGE},
};
use chrono::Utc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error};

/// Routing key used for every published event.
const ROUTING_KEY: &str = "*";

/// One line of input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Alarm,
    State,
    Quit,
    Unknown,
}

impl Command {
    pub fn parse(line: &str) -> Command {
        match line.trim() {
            "alarm" => Command::Alarm,
            "state" => Command::State,
            "quit" | "q" => Command::Quit,
            _ => Command::Unknown,
        }
    }
}

/// Reads commands from `input` until `quit`, end of input or ctrl-c.
///
/// # Parameters
/// * `publisher` - Client the events are published with
/// * `input` - Source of command lines, usually stdin
/// * `output` - Where the prompt is written, usually stdout
///
/// # Returns
/// Ok(()) when the prompt ends, or `InternalError` when `input` fails.
/// Publish failures never end the prompt.
pub async fn prompt<R, W>(publisher: &MqClient, input: R, mut output: W) -> Result<(), AmqpError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();

    loop {
        let _ = output.write_all(b"type message: ").await;
        let _ = output.flush().await;

        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(()),
            Err(err) => return Err(AmqpError::InternalError(err.to_string())),
        };

        let sent = match Command::parse(&line) {
            Command::Alarm => {
                let event = AlarmEvent {
                    name: "oh well".to_owned(),
                    when: Utc::now(),
                };
                publisher.send_json(ALARM_EXCHANGE, &event, ROUTING_KEY).await
            }
            Command::State => {
                let event = StateEvent {
                    state: "sleeping".to_owned(),
                    created_at: Utc::now(),
                };
                publisher.send_json(STATE_EXCHANGE, &event, ROUTING_KEY).await
            }
            Command::Quit => return Ok(()),
            Command::Unknown => {
                debug!(line = %line, "unknown command");
                continue;
            }
        };

        if let Err(err) = sent {
            error!(error = %err, "unable to send");
        }
    }
}

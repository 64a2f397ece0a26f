// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Sink
//!
//! Every supervision failure is reported here and logged by one drain task.
//! Reporting never blocks and never fails the reporter.

use crate::errors::AmqpError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Cloneable handle used to report errors to the drain task.
#[derive(Debug, Clone)]
pub struct ErrorSink {
    tx: mpsc::UnboundedSender<AmqpError>,
}

impl ErrorSink {
    /// Creates a sink and the receiving end to hand to [`watch_errors`].
    pub fn channel() -> (ErrorSink, mpsc::UnboundedReceiver<AmqpError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ErrorSink { tx }, rx)
    }

    pub fn report(&self, err: AmqpError) {
        if let Err(mpsc::error::SendError(err)) = self.tx.send(err) {
            // drain is gone, keep the error visible anyway
            error!(error = %err, "caught an error");
        }
    }
}

/// Logs every reported error until cancelled or until all sinks are dropped.
pub async fn watch_errors(mut rx: mpsc::UnboundedReceiver<AmqpError>, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            received = rx.recv() => match received {
                Some(err) => error!(error = %err, "caught an error"),
                None => break,
            },
        }
    }

    while let Ok(err) = rx.try_recv() {
        error!(error = %err, "caught an error");
    }

    debug!("error watcher stopped");
}

//! Process shutdown
//!
//! A termination signal flips a watch channel. The three controllers stop
//! taking new objects and drain their in-flight reconciles, leader election
//! stops renewing the lease, and `main` exits once the controllers are done.

use std::future::Future;
use tokio::sync::watch;
use tracing::info;

/// Receiving side, cloned into every component that has to stop
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolves once shutdown is triggered or the trigger is dropped
    pub async fn wait(&mut self) {
        while !*self.receiver.borrow() {
            if self.receiver.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Owned future for `Controller::graceful_shutdown_on`
    ///
    /// The controller needs a `Sync` future, so the wait runs on its own task
    /// and only the join handle is held here. Must be called inside a tokio
    /// runtime.
    pub fn triggered(&self) -> impl Future<Output = ()> + Send + Sync + 'static {
        let mut signal = self.clone();
        let waiter = tokio::spawn(async move { signal.wait().await });
        async move {
            let _ = waiter.await;
        }
    }
}

pub struct ShutdownTrigger {
    sender: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.sender.send(true);
        info!("Shutdown triggered");
    }
}

pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownTrigger { sender }, ShutdownSignal { receiver })
}

/// Wait for SIGTERM or SIGINT and return its name
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    info!(signal = name, "Received termination signal");
    Ok(name)
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    info!(signal = "CTRL_C", "Received termination signal");
    Ok("CTRL_C")
}

use crate::interface::{AgentService, DBUS_NAME, DBUS_PATH};
use berth_core::{shutdown_requested, Agent, CoreError, ProcessEvent};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use zbus::connection::Builder;
use zbus::object_server::SignalEmitter;

/// How often the loop checks for a termination signal.
const SIGNAL_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("DBus error: {0}")]
    Dbus(#[from] zbus::Error),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("agent stopped after fatal error: {0}")]
    Fatal(String),
}

/// Serve the agent on the bus until a termination signal or a fatal error,
/// then shut the agent down.
pub async fn run_service(agent: Arc<Agent>) -> Result<(), ServiceError> {
    let (event_tx, mut events) = mpsc::unbounded_channel::<ProcessEvent>();
    agent.set_process_listener(Arc::new(move |event| {
        let _ = event_tx.send(event);
    }))?;
    let (fatal_tx, mut fatal) = mpsc::unbounded_channel();

    let builder = if agent.config().use_session_bus {
        Builder::session()?
    } else {
        Builder::system()?
    };
    let conn = builder
        .name(DBUS_NAME)?
        .serve_at(DBUS_PATH, AgentService::new(Arc::clone(&agent), fatal_tx))?
        .build()
        .await?;
    let emitter = SignalEmitter::new(&conn, DBUS_PATH)?;
    info!(
        "berth agent serving {DBUS_NAME} on the {} bus",
        if agent.config().use_session_bus {
            "session"
        } else {
            "system"
        }
    );

    let mut poll = tokio::time::interval(SIGNAL_POLL);
    let outcome = loop {
        tokio::select! {
            Some(event) = events.recv() => {
                if let Err(e) = AgentService::process_state_changed(
                    &emitter,
                    &event.container.to_string(),
                    event.pid,
                    event.running,
                    event.exit_code,
                )
                .await
                {
                    warn!("could not emit ProcessStateChanged: {e}");
                }
            }
            Some(reason) = fatal.recv() => {
                error!("fatal error, stopping agent: {reason}");
                break Err(ServiceError::Fatal(reason));
            }
            _ = poll.tick() => {
                if shutdown_requested() {
                    info!("termination requested");
                    break Ok(());
                }
            }
        }
    };

    drop(conn);
    let result = tokio::task::spawn_blocking(move || agent.shutdown()).await;
    match result {
        Ok(Ok(())) => info!("agent stopped"),
        Ok(Err(e)) => error!("agent shutdown incomplete: {e}"),
        Err(e) => error!("agent shutdown task failed: {e}"),
    }
    outcome
}

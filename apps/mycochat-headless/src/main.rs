mod config;
mod logging;

use std::{process::ExitCode, sync::Arc};

use backend_core::{BackendError, MessageRecord, ProtocolClientFactory, SessionEvent};
use backend_gateway::GatewayClient;
use backend_matrix::{MatrixClientFactory, MatrixFactoryConfig};
use backend_overlay::{ConnectionModeSelector, OverlayMonitor};
use backend_platform::{FileSessionStore, SessionStore};
use backend_session::{
    LiveListeners, MessageCallback, RoomService, SessionDeps, SessionManager, TimelineSelection,
};
use config::{HeadlessConfig, SessionStoreKind};
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    info!("starting mycochat-headless");

    let config = match HeadlessConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(code = %err.code, error = %err.message, "mycochat-headless stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: HeadlessConfig) -> Result<(), BackendError> {
    debug!(?config, "configuration loaded");

    let gateway = GatewayClient::new(config.gateway())?;
    if gateway.health_check().await {
        info!(gateway = %gateway.base_url(), "gateway reachable");
    } else {
        warn!(gateway = %gateway.base_url(), "gateway health check failed");
    }

    let monitor = Arc::new(OverlayMonitor::new(config.overlay()));
    let polling = monitor.spawn_polling();
    let overlay_log = spawn_overlay_logger(&monitor);

    let factory = MatrixClientFactory::new(MatrixFactoryConfig {
        call_timeout: config.protocol_timeout,
        ..MatrixFactoryConfig::new(&config.data_dir)
    });
    let manager = Arc::new(SessionManager::new(
        SessionDeps {
            gateway,
            selector: ConnectionModeSelector::new(Arc::clone(&monitor)),
            factory: Arc::new(factory) as Arc<dyn ProtocolClientFactory>,
            store: session_store(&config)?,
            endpoints: config.endpoints(),
        },
        config.session(),
    ));
    let session_log = spawn_session_logger(&manager);

    let listeners = LiveListeners::new();
    let mut selection = TimelineSelection::new(listeners.clone(), config.timeline());
    let result = attach(&config, &manager, &mut selection).await;

    if result.is_ok() {
        info!("running; press ctrl-c to exit");
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to wait for ctrl-c");
        }
    }

    info!("shutting down");
    selection.deselect().await;
    listeners.clear().await;
    polling.stop().await;
    if let Some(protocol) = manager.protocol_client().await
        && let Err(err) = protocol.stop_sync().await
    {
        warn!(code = %err.code, "failed to stop live sync");
    }
    overlay_log.abort();
    session_log.abort();
    result
}

#[cfg(feature = "os-keyring")]
const KEYRING_SERVICE: &str = "mycochat";
#[cfg(feature = "os-keyring")]
const KEYRING_ACCOUNT: &str = "session";

fn session_store(config: &HeadlessConfig) -> Result<Arc<dyn SessionStore>, BackendError> {
    match config.session_store {
        SessionStoreKind::File => {
            let path = config.session_record_path();
            info!(path = %path.display(), "using file session store");
            Ok(Arc::new(FileSessionStore::new(path)))
        }
        #[cfg(feature = "os-keyring")]
        SessionStoreKind::Keyring => {
            info!(service = KEYRING_SERVICE, "using os keyring session store");
            let store =
                backend_platform::KeyringSessionStore::new(KEYRING_SERVICE, KEYRING_ACCOUNT)?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "os-keyring"))]
        SessionStoreKind::Keyring => Err(BackendError::new(
            backend_core::BackendErrorCategory::Config,
            "keyring_unavailable",
            "MYCOCHAT_SESSION_STORE=keyring needs a build with the os-keyring feature",
        )),
    }
}

/// Restore or log in, list rooms, and tail the configured room.
async fn attach(
    config: &HeadlessConfig,
    manager: &Arc<SessionManager>,
    selection: &mut TimelineSelection,
) -> Result<(), BackendError> {
    let restored = match manager.restore().await {
        Ok(restored) => restored,
        Err(err) => {
            warn!(code = %err.code, error = %err.message, "session restore failed");
            None
        }
    };

    let session = match (restored, &config.credentials) {
        (Some(session), _) => session,
        (None, Some(credentials)) => {
            manager
                .login(
                    &credentials.username,
                    &credentials.password,
                    &config.server_name,
                )
                .await?
        }
        (None, None) => {
            info!("no stored session; set MYCOCHAT_USER and MYCOCHAT_PASSWORD to log in");
            return Ok(());
        }
    };
    info!(
        user_id = %session.user_id,
        mode = session.connection_mode.as_str(),
        degraded = manager.is_degraded().await,
        "session ready"
    );

    let rooms = RoomService::new(Arc::clone(manager));
    match rooms.refresh().await {
        Ok(list) => {
            for room in &list {
                println!(
                    "{} {} ({} members){}",
                    room.room_id,
                    room.display_name,
                    room.member_count,
                    if room.source.from_protocol { "" } else { " [gateway only]" }
                );
            }
        }
        Err(err) => warn!(code = %err.code, error = %err.message, "room list refresh failed"),
    }

    let Some(room_id) = config.room.as_deref() else {
        return Ok(());
    };
    let (_, protocol) = manager.authenticated("select room").await?;
    let on_message: MessageCallback = Arc::new(print_message);
    let initial = selection.select(protocol, room_id, on_message).await?;
    info!(room_id, messages = initial.len(), "tailing room");
    for message in initial {
        print_message(message);
    }
    Ok(())
}

fn print_message(message: MessageRecord) {
    println!("[{}] {}: {}", message.timestamp_ms, message.sender, message.body);
}

fn spawn_overlay_logger(monitor: &Arc<OverlayMonitor>) -> JoinHandle<()> {
    let mut status = monitor.watch();
    tokio::spawn(async move {
        let mut last_health = None;
        while status.changed().await.is_ok() {
            let health = status.borrow_and_update().health();
            if last_health != Some(health) {
                info!(health = health.as_str(), "overlay health changed");
                last_health = Some(health);
            }
        }
    })
}

fn spawn_session_logger(manager: &Arc<SessionManager>) -> JoinHandle<()> {
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Warning { code, message }) => {
                    warn!(code = %code, message = %message, "session warning");
                }
                Ok(SessionEvent::RoomListUpdated { rooms }) => {
                    debug!(rooms = rooms.len(), "room list updated");
                }
                Ok(event) => debug!(?event, "session event"),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "session event log lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

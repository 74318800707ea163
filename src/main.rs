use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{error, info, warn};
use redis::aio::ConnectionManager;
use sqlx::postgres::PgPoolOptions;
use std::future::Future;
use std::pin::Pin;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use gps_telematics_gateway::admin::{self, AppState};
use gps_telematics_gateway::listener::Protocol;
use gps_telematics_gateway::presence::command_queue::CommandQueue;
use gps_telematics_gateway::presence::PresenceStore;
use gps_telematics_gateway::session::{self, ConnectionDeps};
use gps_telematics_gateway::utils::config::Config;
use gps_telematics_gateway::webhook::WebhookSink;

const LISTENED_PROTOCOLS: [Protocol; 2] = [Protocol::Gt06, Protocol::Teltonika];

/// How often the background sync task refreshes the allow-list, command queues, and
/// flushes hot status to SQL (spec §4.4, "every 5 min").
const BACKGROUND_SYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Applies `TCP_NODELAY` and a keepalive interval to a freshly accepted socket (spec §6).
fn configure_socket(socket: &TcpStream, keep_alive: Duration) {
    if let Err(err) = socket.set_nodelay(true) {
        warn!("failed to set TCP_NODELAY: {}", err);
    }
    let sock_ref = socket2::SockRef::from(socket);
    let keepalive = socket2::TcpKeepalive::new().with_time(keep_alive);
    if let Err(err) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!("failed to configure TCP keepalive: {}", err);
    }
}

/// Accepts connections on one protocol's port and spawns a supervisor task per connection,
/// mirroring the teacher's `start_listener`. Concurrent connections on this port are capped
/// at `max_connections_per_port` (spec §4.3/§5); further accepts block until a slot frees up.
async fn start_listener(protocol: Protocol, port: u16, deps: Arc<ConnectionDeps>) {
    let address = format!("0.0.0.0:{}", port);
    let tcp_listener = match TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(err) => {
            panic!("Failed to bind to address {}: {}", address, err);
        }
    };

    info!("Listening for {:?} on: {}", protocol, address);

    let keep_alive = deps.config.keep_alive_timeout;
    let permits = Arc::new(Semaphore::new(deps.config.max_connections_per_port));

    loop {
        let socket = match tcp_listener.accept().await {
            Ok((socket, _)) => socket,
            Err(err) => {
                error!("Failed to accept connection on {}: {}", address, err);
                continue;
            }
        };
        configure_socket(&socket, keep_alive);

        let permit = permits.clone().acquire_owned().await.expect("semaphore never closed");
        let deps = deps.clone();
        tokio::spawn(async move {
            session::handle_connection(socket, protocol, deps).await;
            drop(permit);
        });
    }
}

/// Refreshes the allow-list, rebuilds command queues, and flushes hot status to SQL on a
/// fixed interval, single-flight on this instance (spec §4.4).
async fn run_background_sync(presence: PresenceStore, commands: CommandQueue) {
    let mut ticker = tokio::time::interval(BACKGROUND_SYNC_INTERVAL);
    ticker.tick().await; // first tick fires immediately; startup already did the initial sync.
    loop {
        ticker.tick().await;
        info!("Running periodic background sync...");
        if let Err(err) = presence.sync_allowlist().await {
            warn!("background sync: failed to refresh allow-list: {:?}", err);
        }
        if let Err(err) = commands.rebuild().await {
            warn!("background sync: failed to rebuild command queues: {:?}", err);
        }
        if let Err(err) = presence.flush_status_to_sql().await {
            warn!("background sync: failed to flush device status to SQL: {:?}", err);
        }
    }
}

/// GPS Telematics Ingestion Gateway
///
/// Accepts GT06/Concox and Teltonika FMB device connections, authorizes them against the
/// device allow-list, decodes location/status records, and forwards them to the
/// configured webhook while draining any queued downlink commands.
#[tokio::main]
async fn main() {
    let config = Config::from_env();
    config.apply_log_level();
    env_logger::init();

    info!("Starting GPS telematics gateway... (env={})", config.app_env);

    let db_pool = PgPoolOptions::new()
        .max_connections(config.db_pool_size)
        .connect(&config.primary_database_url)
        .await
        .expect("Failed to connect to primary database");

    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .expect("Failed to run database migrations");

    let redis_client = redis::Client::open(config.redis_url()).expect("Failed to build Redis client");
    let redis_conn = ConnectionManager::new(redis_client)
        .await
        .expect("Failed to connect to Redis");

    let presence = PresenceStore::new(redis_conn.clone(), db_pool.clone());
    let commands = CommandQueue::new(redis_conn.clone(), db_pool.clone());

    info!("Syncing allow-list and command queue from primary database...");
    presence.sync_allowlist().await.expect("Failed to sync device allow-list");
    commands.rebuild().await.expect("Failed to rebuild command queue");

    tokio::spawn(run_background_sync(presence.clone(), commands.clone()));

    let webhook = WebhookSink::new(config.data_forward_url.clone(), config.secret_key.clone());

    let deps = Arc::new(ConnectionDeps {
        presence: presence.clone(),
        commands: commands.clone(),
        webhook,
        config: config.clone(),
    });

    let admin_state = Arc::new(AppState {
        presence,
        commands,
        secret_key: config.secret_key.clone(),
        started_at: chrono::Utc::now(),
    });

    let mut futures: Vec<Pin<Box<dyn Future<Output = ()> + Send>>> = Vec::new();
    for protocol in LISTENED_PROTOCOLS {
        let port = match protocol {
            Protocol::Gt06 => config.gt06_port,
            Protocol::Teltonika => config.teltonika_port,
        };
        futures.push(Box::pin(start_listener(protocol, port, deps.clone())));
    }

    let api_address = format!("0.0.0.0:{}", config.api_port);
    futures.push(Box::pin(async move {
        let listener = TcpListener::bind(&api_address).await.expect("Failed to bind admin API address");
        info!("Admin API listening on: {}", api_address);
        axum::serve(listener, admin::router(admin_state))
            .await
            .expect("Admin API server failed");
    }));

    join_all(futures).await;
}

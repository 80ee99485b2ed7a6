//! Connection supervision: configuration, listener lifecycle, shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::connection::{EventSocket, SessionState, SocketMode};
use crate::constants::{DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_DIAL_IN_PORT, DEFAULT_DIAL_OUT_PORT};
use crate::error::{Error, Result};
use crate::router::EventRouter;

/// Connection parameters, constructed explicitly and passed to the
/// [`Supervisor`] at startup; there is no ambient global configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Connection role.
    pub mode: SocketMode,
    /// Switch host (dial-out) or bind address (dial-in).
    pub host: String,
    /// Switch port (dial-out) or listening port (dial-in).
    pub port: u16,
    /// Credentials for the dial-out auth handshake.
    pub password: Option<String>,
    /// Event subscription established during the handshake: `event plain
    /// <value>` after dial-out auth, `myevents plain` after the dial-in
    /// `connect`. `None` disables the subscription.
    pub subscribe: Option<String>,
    /// TCP connect and handshake-read timeout.
    pub connect_timeout: Duration,
}

impl Config {
    /// Dial-out configuration with the well-known switch port and an
    /// `ALL` event subscription.
    pub fn dial_out(host: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            mode: SocketMode::DialOut,
            host: host.into(),
            port: DEFAULT_DIAL_OUT_PORT,
            password: Some(password.into()),
            subscribe: Some("ALL".to_string()),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }

    /// Dial-in configuration listening on the conventional port, with a
    /// `myevents` subscription per session.
    pub fn dial_in(host: impl Into<String>) -> Self {
        Self {
            mode: SocketMode::DialIn,
            host: host.into(),
            port: DEFAULT_DIAL_IN_PORT,
            password: None,
            subscribe: Some("ALL".to_string()),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }
}

/// Owns the event router, the set of live sessions, and the shutdown
/// signal. One supervisor per listener: a dial-out connection to a
/// switch, or a dial-in accept loop.
pub struct Supervisor {
    config: Config,
    router: Arc<EventRouter>,
    sessions: Arc<Mutex<Vec<EventSocket>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Supervisor {
    /// Create a supervisor for the given configuration.
    pub fn new(config: Config) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            router: Arc::new(EventRouter::new()),
            sessions: Arc::new(Mutex::new(Vec::new())),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// The router that observers are registered on. Registrations made
    /// before [`connect`](Self::connect) or [`serve`](Self::serve) see
    /// every event from the first frame on.
    pub fn router(&self) -> Arc<EventRouter> {
        Arc::clone(&self.router)
    }

    /// The configuration this supervisor was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Open the dial-out session described by the configuration.
    pub async fn connect(&self) -> Result<EventSocket> {
        if self.config.mode != SocketMode::DialOut {
            return Err(Error::configuration("connect requires a dial-out config"));
        }
        let socket = EventSocket::dial_out(&self.config, self.router()).await?;
        self.track(socket.clone()).await;
        Ok(socket)
    }

    /// Accept dial-in connections until shutdown, binding the configured
    /// address. Each accepted socket is handshaken (`connect`) and then
    /// handed to `handler` on its own task.
    pub async fn serve<H, Fut>(&self, handler: H) -> Result<()>
    where
        H: Fn(EventSocket) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .map_err(Error::Io)?;
        self.serve_with(listener, handler).await
    }

    /// [`serve`](Self::serve) on a pre-bound listener.
    pub async fn serve_with<H, Fut>(&self, listener: TcpListener, handler: H) -> Result<()>
    where
        H: Fn(EventSocket) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.config.mode != SocketMode::DialIn {
            return Err(Error::configuration("serve requires a dial-in config"));
        }
        info!(address = ?listener.local_addr(), "listening for dial-in connections");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted.map_err(Error::Io)?;
                    info!(%addr, "accepted dial-in connection");
                    match EventSocket::dial_in(stream, &self.config, self.router()).await {
                        Ok(socket) => {
                            self.track(socket.clone()).await;
                            tokio::spawn(handler(socket));
                        }
                        Err(e) => warn!(error = %e, "dial-in handshake failed"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("shutdown requested, closing listener");
                        break;
                    }
                }
            }
        }
        self.close_all().await;
        Ok(())
    }

    /// Spawn a task translating process termination signals
    /// (SIGTERM/SIGINT on Unix, ctrl-c elsewhere) into a supervisor
    /// shutdown: the accept loop stops and every live session is torn
    /// down, failing its pending command waiters.
    pub fn install_signal_handlers(&self) {
        let shutdown_tx = self.shutdown_tx.clone();
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            wait_for_termination().await;
            info!("termination signal received, shutting down");
            let _ = shutdown_tx.send(true);
            close_sessions(&sessions).await;
        });
    }

    /// Trigger orderly shutdown: stop the accept loop and tear down every
    /// live session, failing their pending command waiters.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        close_sessions(&self.sessions).await;
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Wait until shutdown is requested (by a signal or by
    /// [`shutdown`](Self::shutdown)).
    pub async fn wait_shutdown(&self) {
        let mut rx = self.shutdown_rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn track(&self, socket: EventSocket) {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|s| !matches!(s.state(), SessionState::Closed(_)));
        sessions.push(socket);
    }

    async fn close_all(&self) {
        close_sessions(&self.sessions).await;
    }
}

async fn close_sessions(sessions: &Mutex<Vec<EventSocket>>) {
    let drained: Vec<EventSocket> = sessions.lock().await.drain(..).collect();
    for socket in drained {
        socket.close().await;
    }
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGINT handler");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => debug!("received SIGTERM"),
        _ = sigint.recv() => debug!("received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dial_out_defaults() {
        let config = Config::dial_out("switch.example.com", "ClueCon");
        assert_eq!(config.mode, SocketMode::DialOut);
        assert_eq!(config.port, DEFAULT_DIAL_OUT_PORT);
        assert_eq!(config.password.as_deref(), Some("ClueCon"));
        assert_eq!(config.subscribe.as_deref(), Some("ALL"));
    }

    #[test]
    fn test_dial_in_defaults() {
        let config = Config::dial_in("0.0.0.0");
        assert_eq!(config.mode, SocketMode::DialIn);
        assert_eq!(config.port, DEFAULT_DIAL_IN_PORT);
        assert_eq!(config.password, None);
    }

    #[tokio::test]
    async fn test_shutdown_flag() {
        let supervisor = Supervisor::new(Config::dial_out("localhost", "pw"));
        assert!(!supervisor.is_shutdown());
        supervisor.shutdown().await;
        assert!(supervisor.is_shutdown());
    }

    #[tokio::test]
    async fn test_connect_rejects_dial_in_config() {
        let supervisor = Supervisor::new(Config::dial_in("127.0.0.1"));
        let err = supervisor.connect().await.unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_serve_rejects_dial_out_config() {
        let supervisor = Supervisor::new(Config::dial_out("127.0.0.1", "pw"));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let err = supervisor
            .serve_with(listener, |_socket| async {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}

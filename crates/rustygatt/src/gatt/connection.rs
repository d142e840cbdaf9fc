//! Connection lifecycle
//!
//! Tracks Idle/Connecting/Connected/Closed and the client id handed out by the peripheral
//! service. The machine only decides; the session performs the submissions it asks for.

use crate::error::GattError;
use log::{debug, info};

/// Identifier assigned by the peripheral service on registration
pub type ClientId = u32;

/// Client id of a session that holds no registration
pub const UNREGISTERED: ClientId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    /// Terminal; every state-changing call is rejected
    Closed,
}

/// Submission the session must make after `begin_connect`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAction {
    /// No registration yet: register a client first
    Register,
    /// Already registered: connect straight away
    Connect { client_id: ClientId, direct: bool },
}

/// Result of a registration acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Registered while connecting: submit the connect
    Connect { client_id: ClientId, direct: bool },
    /// Registration failed; the machine is back at Idle
    Failed,
    /// Nobody is waiting for this registration; hand the id back
    Stale { client_id: ClientId },
    /// Registered outside of a connect attempt; id kept
    Kept,
}

/// A processed connection state event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    /// Registration to release after a disconnect without auto-connect
    pub unregister: Option<ClientId>,
}

impl ConnectionChange {
    /// Whether the change enters or leaves `Connected`.
    pub fn crosses_connected(&self) -> bool {
        (self.previous == ConnectionState::Connected) != (self.current == ConnectionState::Connected)
    }
}

#[derive(Debug, Default)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    client_id: ClientId,
    auto_connect: bool,
    /// A local disconnect whose confirmation from the service is still outstanding
    disconnect_pending: bool,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Fails fast unless the session is open and registered.
    pub fn require_registered(&self) -> Result<ClientId, GattError> {
        if self.state == ConnectionState::Closed {
            return Err(GattError::Closed);
        }
        if self.client_id == UNREGISTERED {
            return Err(GattError::NotRegistered);
        }
        Ok(self.client_id)
    }

    /// Idle -> Connecting.
    pub fn begin_connect(&mut self, auto_connect: bool) -> Result<ConnectAction, GattError> {
        match self.state {
            ConnectionState::Closed => return Err(GattError::Closed),
            ConnectionState::Idle => {}
            _ => return Err(GattError::AlreadyConnecting),
        }

        self.state = ConnectionState::Connecting;
        self.auto_connect = auto_connect;

        if self.client_id == UNREGISTERED {
            debug!("Connecting: registering client (auto_connect={})", auto_connect);
            Ok(ConnectAction::Register)
        } else {
            debug!("Connecting: reusing client {}", self.client_id);
            Ok(ConnectAction::Connect {
                client_id: self.client_id,
                direct: true,
            })
        }
    }

    /// Connecting -> Idle after a submission could not be made.
    pub fn abort_connect(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Idle;
        }
    }

    pub fn on_registered(&mut self, success: bool, client_id: ClientId) -> Registration {
        match self.state {
            ConnectionState::Closed if success => Registration::Stale { client_id },
            ConnectionState::Closed => Registration::Failed,
            ConnectionState::Connecting if !success => {
                info!("Client registration failed");
                self.state = ConnectionState::Idle;
                Registration::Failed
            }
            ConnectionState::Connecting => {
                self.client_id = client_id;
                Registration::Connect {
                    client_id,
                    direct: !self.auto_connect,
                }
            }
            _ if success && self.client_id == UNREGISTERED => {
                self.client_id = client_id;
                Registration::Kept
            }
            _ if success => Registration::Stale { client_id },
            _ => Registration::Failed,
        }
    }

    /// Applies a connection state event from the peripheral service.
    ///
    /// Returns `None` for events that do not apply to the current state. The confirmation
    /// of a local disconnect never touches a connect attempt started after it.
    pub fn on_connection_changed(&mut self, connected: bool) -> Option<ConnectionChange> {
        let previous = self.state;
        if previous == ConnectionState::Closed {
            return None;
        }

        if connected {
            self.disconnect_pending = false;
        } else if std::mem::take(&mut self.disconnect_pending)
            && previous != ConnectionState::Idle
        {
            debug!("Disconnect of the previous link confirmed while {:?}", previous);
            return None;
        }

        let current = match (previous, connected) {
            (ConnectionState::Idle, true) => return None,
            (_, true) => ConnectionState::Connected,
            (_, false) => ConnectionState::Idle,
        };
        self.state = current;

        let unregister = if !connected && !self.auto_connect && self.client_id != UNREGISTERED {
            Some(std::mem::replace(&mut self.client_id, UNREGISTERED))
        } else {
            None
        };

        info!("Connection state {:?} -> {:?}", previous, current);
        Some(ConnectionChange {
            previous,
            current,
            unregister,
        })
    }

    /// Connecting/Connected -> Idle on a local disconnect request.
    ///
    /// The service's own disconnect event for this link is expected later and is consumed
    /// without disturbing a reconnect issued in between.
    pub fn on_disconnect_requested(&mut self) -> Result<ConnectionChange, GattError> {
        self.require_registered()?;
        let previous = self.state;
        self.state = ConnectionState::Idle;
        self.disconnect_pending = true;
        Ok(ConnectionChange {
            previous,
            current: ConnectionState::Idle,
            unregister: None,
        })
    }

    /// Any -> Closed. Returns `None` when already closed, otherwise the registration to
    /// release (if any).
    pub fn close(&mut self) -> Option<Option<ClientId>> {
        if self.state == ConnectionState::Closed {
            return None;
        }
        self.state = ConnectionState::Closed;
        self.disconnect_pending = false;
        let client_id = std::mem::replace(&mut self.client_id, UNREGISTERED);
        Some((client_id != UNREGISTERED).then_some(client_id))
    }
}

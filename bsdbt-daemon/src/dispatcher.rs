/*!
 * Command Dispatcher
 * Maps requests onto hccontrol / hcsecd and owns the daemon state
 */

use std::fmt;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::bluetooth::hcsecd::{HcsecdError, PairingEntry, UpsertOutcome};
use crate::bluetooth::{
    BdAddr, BluetoothManager, Device, DeviceName, PairError, Pin, ValidationError,
};
use crate::process::{CommandRunner, InvokeError};
use crate::protocol::{PairParams, ProtocolError, Request, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Idle,
    Scanning,
    Pairing,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DaemonState::Idle => "idle",
            DaemonState::Scanning => "scan",
            DaemonState::Pairing => "pair",
        })
    }
}

/// Everything that can go wrong while serving one request. Each variant is
/// turned into an error response; none of them ends the session.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Daemon busy: {0} in progress")]
    Busy(DaemonState),

    #[error("{program} not found")]
    ToolNotFound { program: String },

    #[error("Scan timeout")]
    ScanTimeout,

    #[error("Failed to scan devices: {0}")]
    Scan(#[source] InvokeError),

    #[error("Failed to update configuration: {0}")]
    ConfigIo(#[from] HcsecdError),

    #[error("Configuration for {address} saved, but hcsecd reload failed ({source}); restart hcsecd manually")]
    PartialFailure {
        address: BdAddr,
        #[source]
        source: InvokeError,
    },
}

impl DispatchError {
    fn from_scan(err: InvokeError) -> Self {
        match err {
            InvokeError::NotFound { program } => DispatchError::ToolNotFound { program },
            InvokeError::TimedOut { .. } => DispatchError::ScanTimeout,
            other => DispatchError::Scan(other),
        }
    }
}

/// Result of one dispatched request.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Reply(Response),
    /// Reply, then stop the daemon.
    Shutdown(Response),
}

impl Outcome {
    pub fn into_parts(self) -> (Response, bool) {
        match self {
            Outcome::Reply(response) => (response, false),
            Outcome::Shutdown(response) => (response, true),
        }
    }
}

pub struct Dispatcher<R> {
    manager: BluetoothManager<R>,
    state: DaemonState,
    /// Result of the most recent successful scan in this process.
    devices: Vec<Device>,
}

impl<R: CommandRunner> Dispatcher<R> {
    pub fn new(manager: BluetoothManager<R>) -> Self {
        Self {
            manager,
            state: DaemonState::Idle,
            devices: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> DaemonState {
        self.state
    }

    /// Serves one request to completion. The state is back to `Idle` when
    /// this returns, whatever the outcome.
    pub async fn dispatch(&mut self, request: Request) -> Outcome {
        info!(action = request.action(), "Handling request");

        if self.state != DaemonState::Idle {
            return Outcome::Reply(Self::error_response(DispatchError::Busy(self.state)));
        }

        let result = match request {
            Request::Scan => {
                self.state = DaemonState::Scanning;
                let result = self.scan().await;
                self.state = DaemonState::Idle;
                result
            }
            Request::Pair(params) => self.pair(params).await,
            Request::List => Ok(Response::devices(self.devices.clone())),
            Request::Shutdown => {
                info!("Shutdown requested by client");
                return Outcome::Shutdown(Response::success().with_message("Shutting down"));
            }
        };

        Outcome::Reply(result.unwrap_or_else(Self::error_response))
    }

    /// Response for a line that never made it to a `Request`.
    pub fn reject(err: ProtocolError) -> Response {
        Self::error_response(DispatchError::Protocol(err))
    }

    fn error_response(err: DispatchError) -> Response {
        match &err {
            DispatchError::Protocol(_) | DispatchError::Validation(_) | DispatchError::Busy(_) => {
                warn!(error = %err, "Rejected request")
            }
            _ => error!(error = %err, "Request failed"),
        }
        Response::error(err.to_string())
    }

    /// A successful scan whose paired flags could not be determined still
    /// succeeds, with a message saying so.
    async fn scan(&mut self) -> Result<Response, DispatchError> {
        let mut devices = self
            .manager
            .scan_devices()
            .await
            .map_err(DispatchError::from_scan)?;

        let note = match self.manager.paired_addresses() {
            Ok(paired) => {
                for device in &mut devices {
                    device.paired = paired.contains(&device.address);
                }
                None
            }
            Err(e) => {
                warn!(error = %e, "Could not read pairing config, reporting devices as unpaired");
                Some(format!("Paired flags unavailable: {e}"))
            }
        };

        info!(count = devices.len(), "Scan completed");
        self.devices = devices.clone();
        let response = Response::devices(devices);
        Ok(match note {
            Some(note) => response.with_message(note),
            None => response,
        })
    }

    async fn pair(&mut self, params: PairParams) -> Result<Response, DispatchError> {
        // Validation happens before the state changes or any file is read.
        let entry = validate_pair(params)?;

        self.state = DaemonState::Pairing;
        let result = self.manager.pair_device(&entry).await;
        self.state = DaemonState::Idle;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(PairError::Config(e)) => return Err(DispatchError::ConfigIo(e)),
            Err(PairError::Reload(source)) => {
                self.mark_paired(entry.address);
                return Err(DispatchError::PartialFailure {
                    address: entry.address,
                    source,
                });
            }
        };

        self.mark_paired(entry.address);
        let verb = match outcome {
            UpsertOutcome::Added => "Paired with",
            UpsertOutcome::Replaced => "Updated pairing for",
        };
        Ok(Response::success().with_message(format!("{verb} {}", entry.address)))
    }

    /// Only called once the config write is confirmed.
    fn mark_paired(&mut self, address: BdAddr) {
        for device in self.devices.iter_mut().filter(|d| d.address == address) {
            device.paired = true;
        }
    }
}

fn validate_pair(params: PairParams) -> Result<PairingEntry, ValidationError> {
    let address: BdAddr = params
        .address
        .as_deref()
        .ok_or(ValidationError::Missing("address"))?
        .parse()?;
    let pin = Pin::new(params.pin.as_deref().ok_or(ValidationError::Missing("PIN"))?)?;

    let entry = PairingEntry::new(address, pin);
    match params.name.as_deref() {
        Some(name) => Ok(entry.with_name(DeviceName::new(name)?)),
        None => Ok(entry),
    }
}

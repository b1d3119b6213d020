//! Device bridge
//!
//! Device-specific payloads are opaque to the engine and go to the provider
//! untouched. The raw data channel of a call is only handed out as a
//! [`CommStream`], which gives the port back to the provider when dropped.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, info};

use crate::errors::{CallControlError, Result};
use crate::operations::{OperationHandle, OperationKind, OperationManager, OperationParams, OperationRequest};
use crate::provider::{CommPort, ProviderBoundary};
use crate::registry::CallRegistry;
use crate::types::CallId;

/// Media device class used for device id lookups
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    WaveIn,
    WaveOut,
    MidiIn,
    MidiOut,
    Other(String),
}

impl DeviceClass {
    pub fn as_str(&self) -> &str {
        match self {
            DeviceClass::WaveIn => "wave/in",
            DeviceClass::WaveOut => "wave/out",
            DeviceClass::MidiIn => "midi/in",
            DeviceClass::MidiOut => "midi/out",
            DeviceClass::Other(name) => name,
        }
    }
}

impl From<&str> for DeviceClass {
    fn from(name: &str) -> Self {
        match name {
            "wave/in" => DeviceClass::WaveIn,
            "wave/out" => DeviceClass::WaveOut,
            "midi/in" => DeviceClass::MidiIn,
            "midi/out" => DeviceClass::MidiOut,
            other => DeviceClass::Other(other.to_string()),
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pass-through to device-specific provider features
#[derive(Clone)]
pub struct DeviceBridge {
    manager: Arc<OperationManager>,
    registry: Arc<CallRegistry>,
    provider: Arc<dyn ProviderBoundary>,
}

impl DeviceBridge {
    pub(crate) fn new(
        manager: Arc<OperationManager>,
        registry: Arc<CallRegistry>,
        provider: Arc<dyn ProviderBoundary>,
    ) -> Self {
        Self {
            manager,
            registry,
            provider,
        }
    }

    /// Send an opaque payload to the device; the reply is equally opaque
    pub async fn device_specific(&self, call: CallId, payload: Bytes) -> Result<OperationHandle<Bytes>> {
        self.manager
            .submit(OperationRequest::new(
                call,
                OperationKind::DeviceSpecific,
                OperationParams::DeviceSpecific(payload),
            ))
            .await
    }

    pub async fn device_id(&self, call: CallId, class: &DeviceClass) -> Result<u32> {
        self.ensure_live(call)?;
        self.provider
            .device_id(call, class)
            .await
            .map_err(|e| CallControlError::device_unavailable(format!("{} on {}: {}", class, call, e)))
    }

    pub async fn comm_device_name(&self, call: CallId) -> Result<String> {
        self.ensure_live(call)?;
        self.provider
            .comm_device_name(call)
            .await
            .map_err(|e| CallControlError::device_unavailable(format!("comm device of {}: {}", call, e)))
    }

    /// Open the call's data channel.
    ///
    /// Only data-modem calls expose one, and only one stream per call may be
    /// open at a time.
    pub async fn open_comm_stream(&self, call: CallId) -> Result<CommStream> {
        self.registry.with_record_mut(call, |record| {
            if record.state().is_terminal() {
                return Err(CallControlError::device_unavailable(format!("{} is disconnected", call)));
            }
            if !record.info.media_mode.is_stream_capable() {
                return Err(CallControlError::device_unavailable(format!(
                    "{} has media mode {:?}, not a data call",
                    call, record.info.media_mode
                )));
            }
            if record.comm_port_open {
                return Err(CallControlError::device_unavailable(format!(
                    "comm stream of {} is already open",
                    call
                )));
            }
            record.comm_port_open = true;
            Ok(())
        })??;

        match self.provider.open_comm_port(call).await {
            Ok(port) => {
                info!(call = %call, "comm stream opened");
                Ok(CommStream {
                    call,
                    port,
                    provider: Arc::clone(&self.provider),
                    registry: Arc::clone(&self.registry),
                })
            }
            Err(e) => {
                let _ = self.registry.with_record_mut(call, |record| record.comm_port_open = false);
                Err(CallControlError::device_unavailable(format!("comm port of {}: {}", call, e)))
            }
        }
    }

    fn ensure_live(&self, call: CallId) -> Result<()> {
        let state = self.registry.current_state(call)?;
        if state.is_terminal() {
            return Err(CallControlError::device_unavailable(format!("{} is disconnected", call)));
        }
        Ok(())
    }
}

/// The raw data channel of a call.
///
/// The port is released back to the provider when the stream is dropped.
pub struct CommStream {
    call: CallId,
    port: Box<dyn CommPort>,
    provider: Arc<dyn ProviderBoundary>,
    registry: Arc<CallRegistry>,
}

impl CommStream {
    pub fn call(&self) -> CallId {
        self.call
    }
}

impl AsyncRead for CommStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.port).poll_read(cx, buf)
    }
}

impl AsyncWrite for CommStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.port).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.port).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.port).poll_shutdown(cx)
    }
}

impl Drop for CommStream {
    fn drop(&mut self) {
        self.provider.release_comm_port(self.call);
        let _ = self.registry.with_record_mut(self.call, |record| record.comm_port_open = false);
        debug!(call = %self.call, "comm stream released");
    }
}

impl fmt::Debug for CommStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommStream").field("call", &self.call).finish()
    }
}

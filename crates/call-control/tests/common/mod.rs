//! Shared test fixtures: a scriptable provider and call setup helpers

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use rvoip_call_control::{
    AddressId, Call, CallControl, CallControlConfig, CallId, CallOrigin, CallParamsUpdate, CallReason, CallState,
    CommPort, DeviceClass, MediaMode, MonitoringSet, OperationId, OperationKind, OperationParams, ParkTarget,
    Privilege, ProviderBoundary, ProviderCallId, ProviderEvent, ProviderFailure, ProviderOutput,
    ProviderRequest,
};

/// Provider double that records everything it is asked to do
#[derive(Default)]
pub struct FakeProvider {
    requests: Mutex<Vec<ProviderRequest>>,
    aborts: Mutex<Vec<OperationId>>,
    params: Mutex<Vec<(CallId, CallParamsUpdate)>>,
    monitoring: Mutex<Vec<(CallId, MonitoringSet)>>,
    monitoring_delay: Mutex<Option<Duration>>,
    released_ports: Mutex<Vec<CallId>>,
    port_peers: Mutex<Vec<DuplexStream>>,
    reject_next: Mutex<Option<ProviderFailure>>,
    reject_params: AtomicBool,
    auto_complete: AtomicBool,
    feed: Mutex<Option<mpsc::Sender<ProviderEvent>>>,
}

impl FakeProvider {
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn last_request(&self) -> ProviderRequest {
        self.requests.lock().last().cloned().expect("no request issued")
    }

    pub fn aborts(&self) -> Vec<OperationId> {
        self.aborts.lock().clone()
    }

    pub fn params(&self) -> Vec<(CallId, CallParamsUpdate)> {
        self.params.lock().clone()
    }

    pub fn last_monitoring(&self) -> Option<(CallId, MonitoringSet)> {
        self.monitoring.lock().last().cloned()
    }

    /// Every monitoring set pushed, in the order the pushes returned
    pub fn monitoring_history(&self) -> Vec<MonitoringSet> {
        self.monitoring.lock().iter().map(|(_, set)| set.clone()).collect()
    }

    /// Stall the next `set_monitoring` call before recording it
    pub fn delay_next_monitoring(&self, delay: Duration) {
        *self.monitoring_delay.lock() = Some(delay);
    }

    pub fn released_ports(&self) -> Vec<CallId> {
        self.released_ports.lock().clone()
    }

    pub fn take_port_peer(&self) -> DuplexStream {
        self.port_peers.lock().pop().expect("no port opened")
    }

    /// Reject the next `issue` call synchronously
    pub fn reject_next(&self, failure: ProviderFailure) {
        *self.reject_next.lock() = Some(failure);
    }

    pub fn reject_params(&self, reject: bool) {
        self.reject_params.store(reject, Ordering::SeqCst);
    }

    fn auto_output(request: &ProviderRequest) -> ProviderOutput {
        match (&request.kind, &request.params) {
            (OperationKind::DeviceSpecific, OperationParams::DeviceSpecific(payload)) => {
                let mut echoed = payload.to_vec();
                echoed.reverse();
                ProviderOutput::Bytes(Bytes::from(echoed))
            }
            (OperationKind::Park, OperationParams::Park(ParkTarget::NonDirected)) => {
                ProviderOutput::Address("7001".to_string())
            }
            (OperationKind::CompleteCall, _) => ProviderOutput::CompletionId(42),
            (OperationKind::GenerateDigits | OperationKind::GenerateTone, _) => ProviderOutput::Flag(true),
            _ => ProviderOutput::None,
        }
    }
}

#[async_trait]
impl ProviderBoundary for FakeProvider {
    async fn issue(&self, request: ProviderRequest) -> Result<(), ProviderFailure> {
        self.requests.lock().push(request.clone());
        if let Some(failure) = self.reject_next.lock().take() {
            return Err(failure);
        }
        if self.auto_complete.load(Ordering::SeqCst) && request.kind != OperationKind::GatherDigits {
            let feed = self.feed.lock().clone();
            if let Some(feed) = feed {
                let result = Ok(Self::auto_output(&request));
                let _ = feed
                    .send(ProviderEvent::OperationCompleted {
                        correlation: request.correlation,
                        result,
                    })
                    .await;
            }
        }
        Ok(())
    }

    async fn abort(&self, correlation: OperationId, _call: CallId) {
        self.aborts.lock().push(correlation);
    }

    async fn set_call_params(&self, call: CallId, update: &CallParamsUpdate) -> Result<(), ProviderFailure> {
        if self.reject_params.load(Ordering::SeqCst) {
            return Err(ProviderFailure::Denied);
        }
        self.params.lock().push((call, update.clone()));
        Ok(())
    }

    async fn set_monitoring(&self, call: CallId, set: &MonitoringSet) -> Result<(), ProviderFailure> {
        let delay = self.monitoring_delay.lock().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.monitoring.lock().push((call, set.clone()));
        Ok(())
    }

    async fn send_user_user_info(&self, _call: CallId, info: Bytes) -> Result<(), ProviderFailure> {
        if info.len() > 128 {
            return Err(ProviderFailure::InvalidParameter("user-user info too long".into()));
        }
        Ok(())
    }

    async fn device_id(&self, _call: CallId, class: &DeviceClass) -> Result<u32, ProviderFailure> {
        match class {
            DeviceClass::WaveIn => Ok(1),
            DeviceClass::WaveOut => Ok(2),
            DeviceClass::MidiIn => Ok(3),
            DeviceClass::MidiOut => Ok(4),
            DeviceClass::Other(_) => Err(ProviderFailure::Unsupported),
        }
    }

    async fn comm_device_name(&self, call: CallId) -> Result<String, ProviderFailure> {
        Ok(format!("COM{}", call.as_u64()))
    }

    async fn open_comm_port(&self, _call: CallId) -> Result<Box<dyn CommPort>, ProviderFailure> {
        let (ours, theirs) = tokio::io::duplex(1024);
        self.port_peers.lock().push(theirs);
        Ok(Box::new(ours))
    }

    fn release_comm_port(&self, call: CallId) {
        self.released_ports.lock().push(call);
    }
}

pub struct Harness {
    pub control: Arc<CallControl>,
    pub provider: Arc<FakeProvider>,
    next_provider_id: AtomicU32,
}

/// Completions are delivered by hand through `complete` / `fail`
pub fn harness() -> Harness {
    harness_with(CallControlConfig::default())
}

pub fn harness_with(config: CallControlConfig) -> Harness {
    let provider = Arc::new(FakeProvider::default());
    let control = CallControl::new(config, provider.clone()).expect("valid config");
    Harness {
        control,
        provider,
        next_provider_id: AtomicU32::new(100),
    }
}

/// Every accepted request completes successfully through the event feed
pub fn auto_harness() -> Harness {
    let h = harness();
    h.provider.auto_complete.store(true, Ordering::SeqCst);
    *h.provider.feed.lock() = Some(h.control.event_feed());
    h
}

impl Harness {
    /// Report a new call from the provider and return it
    pub fn new_call(&self, state: CallState) -> Call {
        self.new_call_with_media(state, MediaMode::InteractiveVoice)
    }

    pub fn new_call_with_media(&self, state: CallState, media_mode: MediaMode) -> Call {
        let provider_id = ProviderCallId(self.next_provider_id.fetch_add(1, Ordering::SeqCst));
        self.control.handle_event(ProviderEvent::NewCall {
            provider_id: Some(provider_id),
            address: AddressId::new(0, 0),
            state,
            origin: CallOrigin::Inbound,
            reason: CallReason::Direct,
            privilege: Privilege::Owner,
            media_mode,
        });
        self.control
            .call_by_provider_id(provider_id)
            .expect("call registered")
    }

    pub fn complete(&self, op: OperationId) {
        self.complete_with(op, ProviderOutput::None);
    }

    pub fn complete_with(&self, op: OperationId, output: ProviderOutput) {
        self.control.handle_event(ProviderEvent::OperationCompleted {
            correlation: op,
            result: Ok(output),
        });
    }

    pub fn fail(&self, op: OperationId, failure: ProviderFailure) {
        self.control.handle_event(ProviderEvent::OperationCompleted {
            correlation: op,
            result: Err(failure),
        });
    }

    /// Provider-reported state change
    pub fn report_state(&self, call: &Call, state: CallState) {
        self.control.handle_event(ProviderEvent::StateChanged {
            call: call.id().into(),
            state,
        });
    }

    pub fn state(&self, call: &Call) -> CallState {
        call.state().expect("call is live")
    }
}

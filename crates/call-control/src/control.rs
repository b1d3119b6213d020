//! Engine root
//!
//! [`CallControl`] wires the registry, the operation manager and the
//! coordinators to one provider, and is where provider events enter.
//!
//! ```text
//!  provider ──ProviderEvent──► handle_event ──► registry / operations / monitors
//!      ▲                                               │
//!      └──────────── ProviderBoundary ◄── Call ◄───────┘──► CallEvent (broadcast)
//! ```

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::call::Call;
use crate::conference::ConferenceCoordinator;
use crate::config::CallControlConfig;
use crate::device::DeviceBridge;
use crate::errors::Result;
use crate::events::CallEvent;
use crate::monitor::{DigitDetected, ToneDetected};
use crate::operations::{OperationManager, OperationOutput, OperationStats};
use crate::provider::{CallKey, ProviderBoundary, ProviderEvent};
use crate::registry::{CallRegistry, NewCall};
use crate::state::{CallState, TransitionCause};
use crate::transfer::TransferCoordinator;
use crate::types::{CallId, ProviderCallId};

/// The call control engine
pub struct CallControl {
    config: CallControlConfig,
    registry: Arc<CallRegistry>,
    operations: Arc<OperationManager>,
    transfers: TransferCoordinator,
    conferences: ConferenceCoordinator,
    devices: DeviceBridge,
    provider: Arc<dyn ProviderBoundary>,
    events: broadcast::Sender<CallEvent>,
}

impl CallControl {
    pub fn new(config: CallControlConfig, provider: Arc<dyn ProviderBoundary>) -> Result<Arc<Self>> {
        config.validate()?;

        let (events, _) = broadcast::channel(config.event_buffer);
        let registry = Arc::new(CallRegistry::new(events.clone()));
        let operations = Arc::new(OperationManager::new(
            Arc::clone(&registry),
            Arc::clone(&provider),
            config.conference.max_parties,
        ));
        let transfers = TransferCoordinator::new(Arc::clone(&operations));
        let conferences = ConferenceCoordinator::new(
            Arc::clone(&operations),
            Arc::clone(&registry),
            Arc::clone(&provider),
            config.conference.related_call_privilege,
        );
        let devices = DeviceBridge::new(Arc::clone(&operations), Arc::clone(&registry), Arc::clone(&provider));

        info!(
            event_buffer = config.event_buffer,
            max_conference_parties = config.conference.max_parties,
            "call control started"
        );
        Ok(Arc::new(Self {
            config,
            registry,
            operations,
            transfers,
            conferences,
            devices,
            provider,
            events,
        }))
    }

    pub fn config(&self) -> &CallControlConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<CallRegistry> {
        &self.registry
    }

    pub fn operations(&self) -> &Arc<OperationManager> {
        &self.operations
    }

    pub fn transfers(&self) -> &TransferCoordinator {
        &self.transfers
    }

    pub fn conferences(&self) -> &ConferenceCoordinator {
        &self.conferences
    }

    pub fn devices(&self) -> &DeviceBridge {
        &self.devices
    }

    pub(crate) fn provider(&self) -> &Arc<dyn ProviderBoundary> {
        &self.provider
    }

    pub fn stats(&self) -> OperationStats {
        self.operations.stats()
    }

    /// Look up a live call
    pub fn call(self: &Arc<Self>, id: CallId) -> Result<Call> {
        self.registry.entry(id)?;
        Ok(Call::new(id, Arc::clone(self)))
    }

    pub fn calls(self: &Arc<Self>) -> Vec<Call> {
        self.registry
            .call_ids()
            .into_iter()
            .map(|id| Call::new(id, Arc::clone(self)))
            .collect()
    }

    pub fn call_by_provider_id(self: &Arc<Self>, provider_id: ProviderCallId) -> Option<Call> {
        self.registry
            .resolve(CallKey::Provider(provider_id))
            .map(|id| Call::new(id, Arc::clone(self)))
    }

    /// Spawn a task feeding `rx` into [`handle_event`](Self::handle_event)
    pub fn attach_event_feed(self: &Arc<Self>, mut rx: mpsc::Receiver<ProviderEvent>) -> JoinHandle<()> {
        let control = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                control.handle_event(event);
            }
            debug!("provider event feed closed");
        })
    }

    /// Create a provider event channel and attach its receiver
    pub fn event_feed(self: &Arc<Self>) -> mpsc::Sender<ProviderEvent> {
        let (tx, rx) = mpsc::channel(self.config.provider_event_queue);
        self.attach_event_feed(rx);
        tx
    }

    /// Process one provider event.
    ///
    /// Never blocks: events only update state, resolve operations and
    /// enqueue monitoring events. Events naming unknown calls or operations
    /// are dropped with a diagnostic.
    pub fn handle_event(&self, event: ProviderEvent) {
        trace!(?event, "provider event");
        match event {
            ProviderEvent::NewCall {
                provider_id,
                address,
                state,
                origin,
                reason,
                privilege,
                media_mode,
            } => {
                if let Some(existing) = provider_id.and_then(|id| self.registry.resolve(CallKey::Provider(id))) {
                    self.operations.record_unmatched();
                    warn!(call = %existing, ?provider_id, "provider reported a call it already reported");
                    return;
                }
                self.registry.create_call(NewCall {
                    address,
                    provider_id,
                    state,
                    origin,
                    reason,
                    privilege,
                    media_mode,
                });
            }

            ProviderEvent::StateChanged { call, state } => {
                let Some(id) = self.resolve(call) else { return };
                if self.registry.current_state(id).ok() == Some(state) {
                    trace!(call = %id, %state, "state re-reported");
                    return;
                }
                match self.registry.try_transition(id, state, TransitionCause::Provider) {
                    Ok(_) if state == CallState::Disconnected => {
                        self.operations.on_disconnected(id);
                        self.registry.dispose_if_finished(id);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.operations.record_unmatched();
                        warn!(call = %id, error = %e, "provider reported an illegal transition");
                    }
                }
            }

            ProviderEvent::InfoChanged { call, update } => {
                let Some(id) = self.resolve(call) else { return };
                if let Some(provider_id) = update.provider_id {
                    self.registry.index_provider_id(id, provider_id);
                }
                if self.registry.with_record_mut(id, |r| r.apply_info(update)).is_ok() {
                    self.registry.publish(CallEvent::InfoChanged { call: id });
                }
            }

            ProviderEvent::OperationCompleted { correlation, result } => {
                self.operations.on_provider_completion(correlation, result);
            }

            ProviderEvent::DigitDetected { call, digit, mode } => {
                let Some(id) = self.resolve(call) else { return };
                let detected = DigitDetected {
                    call: id,
                    digit,
                    mode,
                    detected_at: Utc::now(),
                };
                let gather = self.registry.with_record(id, |r| {
                    for registration in r.digit_monitors.iter().filter(|reg| reg.filter.contains(&mode)) {
                        registration.deliver(detected.clone());
                    }
                    r.gather.clone()
                });
                if let Ok(Some(session)) = gather {
                    if let Some(result) = session.on_digit(digit, mode) {
                        self.operations.finish(session.op, Ok(OperationOutput::Digits(result)));
                    }
                }
            }

            ProviderEvent::ToneDetected { call, tone_id } => {
                let Some(id) = self.resolve(call) else { return };
                let delivered = self.registry.with_record(id, |r| {
                    let mut delivered = 0;
                    for registration in &r.tone_monitors {
                        if let Some(tone) = registration.filter.iter().find(|t| t.id == tone_id) {
                            registration.deliver(ToneDetected {
                                call: id,
                                tone: tone.clone(),
                                detected_at: Utc::now(),
                            });
                            delivered += 1;
                        }
                    }
                    delivered
                });
                if matches!(delivered, Ok(0)) {
                    debug!(call = %id, tone_id, "tone detected with no matching monitor");
                }
            }

            ProviderEvent::CallClosed { call } => {
                let Some(id) = self.resolve(call) else { return };
                let state = self.registry.with_record_mut(id, |r| {
                    r.closed = true;
                    r.state()
                });
                if matches!(state, Ok(s) if !s.is_terminal())
                    && self
                        .registry
                        .try_transition(id, CallState::Disconnected, TransitionCause::Provider)
                        .is_ok()
                {
                    self.operations.on_disconnected(id);
                }
                self.registry.dispose_if_finished(id);
            }
        }
    }

    fn resolve(&self, key: CallKey) -> Option<CallId> {
        let resolved = self.registry.resolve(key);
        if resolved.is_none() {
            self.operations.record_unmatched();
            warn!(?key, "provider event for an unknown call");
        }
        resolved
    }
}

impl std::fmt::Debug for CallControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallControl")
            .field("registry", &self.registry)
            .field("operations", &self.operations)
            .finish()
    }
}

//! Application-facing call object
//!
//! Every long-running action comes in two forms. `begin_*` submits the
//! operation and returns its [`OperationHandle`]; the plain form awaits that
//! same handle, so both go through one code path.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use crate::control::CallControl;
use crate::device::{CommStream, DeviceClass};
use crate::errors::{CallControlError, Result};
use crate::events::CallEvent;
use crate::gather::{DigitGatherParams, DigitGatherResult};
use crate::monitor::{self, DigitMonitor, MonitorKind, ToneMonitor};
use crate::operations::{
    CancelOutcome, ConferenceSetup, OperationHandle, OperationKind, OperationOutput, OperationParams,
    OperationRequest, MEDIA_STATES,
};
use crate::registry::CallInfo;
use crate::state::CallState;
use crate::tone::{self, MonitorTone, ToneSpec};
use crate::types::{
    AddressId, BearerMode, CallCompletionMode, CallId, CallParamsUpdate, CallTreatment, DialParams, DigitMode,
    DigitModes, MakeCallParams, MediaMode, ParkTarget, Privilege, TransferMode,
};

/// A call under application control
#[derive(Clone)]
pub struct Call {
    id: CallId,
    control: Arc<CallControl>,
}

impl Call {
    pub(crate) fn new(id: CallId, control: Arc<CallControl>) -> Self {
        Self { id, control }
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    fn sibling(&self, id: CallId) -> Call {
        Call::new(id, Arc::clone(&self.control))
    }

    // ===== Attributes =====

    /// Snapshot of every attribute
    pub fn info(&self) -> Result<CallInfo> {
        self.control.registry().info(self.id)
    }

    pub fn state(&self) -> Result<CallState> {
        self.control.registry().current_state(self.id)
    }

    pub fn address(&self) -> Result<AddressId> {
        self.control.registry().with_record(self.id, |r| r.info.address)
    }

    pub fn privilege(&self) -> Result<Privilege> {
        self.control.registry().with_record(self.id, |r| r.info.privilege)
    }

    pub fn last_event_time(&self) -> Result<DateTime<Utc>> {
        self.control.registry().with_record(self.id, |r| r.info.last_event_time)
    }

    /// Operations that are legal right now
    pub fn features(&self) -> Result<BTreeSet<OperationKind>> {
        self.control.registry().with_record(self.id, |r| r.features())
    }

    pub fn consultation_call(&self) -> Result<Option<Call>> {
        let linked = self.control.registry().with_record(self.id, |r| r.links.consultation)?;
        Ok(linked
            .filter(|id| self.control.registry().contains(*id))
            .map(|id| self.sibling(id)))
    }

    /// The conference this call is a member of
    pub fn conference_call(&self) -> Result<Option<Call>> {
        let hub = self.control.registry().with_record(self.id, |r| r.links.hub())?;
        Ok(hub
            .filter(|id| self.control.registry().contains(*id))
            .map(|id| self.sibling(id)))
    }

    pub fn tag(&self) -> Result<serde_json::Value> {
        self.control.registry().with_record(self.id, |r| r.info.tag.clone())
    }

    /// Attach application data; it never leaves the process
    pub fn set_tag(&self, tag: serde_json::Value) -> Result<()> {
        self.update_local(|info| info.tag = tag)
    }

    pub fn app_specific(&self) -> Result<u32> {
        self.control.registry().with_record(self.id, |r| r.info.app_specific)
    }

    pub fn set_app_specific(&self, value: u32) -> Result<()> {
        self.update_local(|info| info.app_specific = value)
    }

    pub fn user_user_info(&self) -> Result<Option<Bytes>> {
        self.control.registry().with_record(self.id, |r| r.info.user_user_info.clone())
    }

    /// Discard the received user-user information
    pub fn release_user_user_info(&self) -> Result<()> {
        self.update_local(|info| info.user_user_info = None)
    }

    pub async fn send_user_user_info(&self, info: Bytes) -> Result<()> {
        let state = self.state()?;
        if state.is_terminal() {
            return Err(CallControlError::CallDisposed(self.id));
        }
        self.control.provider().send_user_user_info(self.id, info).await?;
        Ok(())
    }

    fn update_local(&self, f: impl FnOnce(&mut CallInfo)) -> Result<()> {
        self.control.registry().with_record_mut(self.id, |r| f(&mut r.info))?;
        self.control.registry().publish(CallEvent::InfoChanged { call: self.id });
        Ok(())
    }

    /// Change a provider-held parameter; applied locally once the provider accepts it
    pub async fn set_params(&self, update: CallParamsUpdate) -> Result<()> {
        let registry = self.control.registry();
        if registry.current_state(self.id)?.is_terminal() {
            return Err(CallControlError::invalid_parameter(format!(
                "{} is disconnected; its parameters are final",
                self.id
            )));
        }
        self.control.provider().set_call_params(self.id, &update).await?;
        registry.with_record_mut(self.id, |r| r.apply_params(&update))?;
        debug!(call = %self.id, ?update, "call parameters updated");
        registry.publish(CallEvent::InfoChanged { call: self.id });
        Ok(())
    }

    pub async fn set_bearer_mode(&self, mode: BearerMode) -> Result<()> {
        self.set_params(CallParamsUpdate::BearerMode(mode)).await
    }

    pub async fn set_media_mode(&self, mode: MediaMode) -> Result<()> {
        self.set_params(CallParamsUpdate::MediaMode(mode)).await
    }

    pub async fn set_data_rate(&self, rate: u32) -> Result<()> {
        self.set_params(CallParamsUpdate::DataRate(rate)).await
    }

    pub async fn set_dial_params(&self, params: DialParams) -> Result<()> {
        self.set_params(CallParamsUpdate::DialParams(params)).await
    }

    pub async fn set_call_data(&self, data: Bytes) -> Result<()> {
        self.set_params(CallParamsUpdate::CallData(data)).await
    }

    pub async fn set_privilege(&self, privilege: Privilege) -> Result<()> {
        self.set_params(CallParamsUpdate::Privilege(privilege)).await
    }

    pub async fn set_treatment(&self, treatment: CallTreatment) -> Result<()> {
        self.set_params(CallParamsUpdate::Treatment(treatment)).await
    }

    pub async fn set_media_detection(&self, enabled: bool) -> Result<()> {
        self.set_params(CallParamsUpdate::MediaDetection(enabled)).await
    }

    // ===== Operations =====

    async fn begin<T>(&self, kind: OperationKind, params: OperationParams) -> Result<OperationHandle<T>>
    where
        T: TryFrom<OperationOutput, Error = CallControlError>,
    {
        self.control
            .operations()
            .submit(OperationRequest::new(self.id, kind, params))
            .await
    }

    pub async fn begin_accept(&self, user_user_info: Option<Bytes>) -> Result<OperationHandle<()>> {
        self.begin(OperationKind::Accept, OperationParams::UserUserInfo(user_user_info))
            .await
    }

    pub async fn accept(&self, user_user_info: Option<Bytes>) -> Result<()> {
        self.begin_accept(user_user_info).await?.wait().await
    }

    pub async fn begin_answer(&self, user_user_info: Option<Bytes>) -> Result<OperationHandle<()>> {
        self.begin(OperationKind::Answer, OperationParams::UserUserInfo(user_user_info))
            .await
    }

    pub async fn answer(&self, user_user_info: Option<Bytes>) -> Result<()> {
        self.begin_answer(user_user_info).await?.wait().await
    }

    pub async fn begin_dial(&self, address: impl Into<String>, country_code: u32) -> Result<OperationHandle<()>> {
        self.begin(
            OperationKind::Dial,
            OperationParams::Destination {
                address: address.into(),
                country_code,
            },
        )
        .await
    }

    pub async fn dial(&self, address: impl Into<String>, country_code: u32) -> Result<()> {
        self.begin_dial(address, country_code).await?.wait().await
    }

    pub async fn begin_drop(&self, user_user_info: Option<Bytes>) -> Result<OperationHandle<()>> {
        self.begin(OperationKind::Drop, OperationParams::UserUserInfo(user_user_info))
            .await
    }

    pub async fn drop_call(&self, user_user_info: Option<Bytes>) -> Result<()> {
        self.begin_drop(user_user_info).await?.wait().await
    }

    pub async fn begin_hold(&self) -> Result<OperationHandle<()>> {
        self.begin(OperationKind::Hold, OperationParams::None).await
    }

    pub async fn hold(&self) -> Result<()> {
        self.begin_hold().await?.wait().await
    }

    pub async fn begin_unhold(&self) -> Result<OperationHandle<()>> {
        self.begin(OperationKind::Unhold, OperationParams::None).await
    }

    pub async fn unhold(&self) -> Result<()> {
        self.begin_unhold().await?.wait().await
    }

    /// Hold this call and retrieve `held`
    pub async fn begin_swap_hold(&self, held: &Call) -> Result<OperationHandle<()>> {
        self.begin(OperationKind::SwapHold, OperationParams::SwapHold { other: held.id })
            .await
    }

    pub async fn swap_hold(&self, held: &Call) -> Result<()> {
        self.begin_swap_hold(held).await?.wait().await
    }

    pub async fn begin_secure(&self) -> Result<OperationHandle<()>> {
        self.begin(OperationKind::SecureCall, OperationParams::None).await
    }

    /// Protect the call from interruption such as call waiting tones
    pub async fn secure(&self) -> Result<()> {
        self.begin_secure().await?.wait().await
    }

    pub async fn begin_blind_transfer(
        &self,
        address: impl Into<String>,
        country_code: u32,
    ) -> Result<OperationHandle<()>> {
        self.control
            .transfers()
            .blind_transfer(self.id, address, country_code)
            .await
    }

    pub async fn blind_transfer(&self, address: impl Into<String>, country_code: u32) -> Result<()> {
        self.begin_blind_transfer(address, country_code).await?.wait().await
    }

    /// Deflect an offered call to another address
    pub async fn begin_redirect(&self, address: impl Into<String>, country_code: u32) -> Result<OperationHandle<()>> {
        self.begin(
            OperationKind::Redirect,
            OperationParams::Destination {
                address: address.into(),
                country_code,
            },
        )
        .await
    }

    pub async fn redirect(&self, address: impl Into<String>, country_code: u32) -> Result<()> {
        self.begin_redirect(address, country_code).await?.wait().await
    }

    /// Request completion of a busy or unanswered call; yields the completion id
    pub async fn begin_complete_call(
        &self,
        mode: CallCompletionMode,
        message_id: u32,
    ) -> Result<OperationHandle<u32>> {
        self.begin(
            OperationKind::CompleteCall,
            OperationParams::CompleteCall { mode, message_id },
        )
        .await
    }

    pub async fn complete_call(&self, mode: CallCompletionMode, message_id: u32) -> Result<u32> {
        self.begin_complete_call(mode, message_id).await?.wait().await
    }

    /// Park the call; a non-directed park yields the address chosen by the switch
    pub async fn begin_park(&self, target: ParkTarget) -> Result<OperationHandle<Option<String>>> {
        self.begin(OperationKind::Park, OperationParams::Park(target)).await
    }

    pub async fn park(&self, target: ParkTarget) -> Result<Option<String>> {
        self.begin_park(target).await?.wait().await
    }

    pub async fn begin_setup_transfer(&self, params: MakeCallParams) -> Result<OperationHandle<CallId>> {
        self.control.transfers().setup_transfer(self.id, params).await
    }

    /// Returns the consultation call
    pub async fn setup_transfer(&self, params: MakeCallParams) -> Result<Call> {
        let consultation = self.begin_setup_transfer(params).await?.wait().await?;
        Ok(self.sibling(consultation))
    }

    pub async fn begin_complete_transfer(&self, consultation: &Call) -> Result<OperationHandle<()>> {
        self.control
            .transfers()
            .complete_transfer(self.id, consultation.id)
            .await
    }

    pub async fn complete_transfer(&self, consultation: &Call) -> Result<()> {
        self.begin_complete_transfer(consultation).await?.wait().await
    }

    pub async fn begin_complete_transfer_to_conference(&self, consultation: &Call) -> Result<OperationHandle<CallId>> {
        self.control
            .transfers()
            .complete_transfer_to_conference(self.id, consultation.id)
            .await
    }

    /// Returns the new conference call
    pub async fn complete_transfer_to_conference(&self, consultation: &Call) -> Result<Call> {
        let hub = self
            .begin_complete_transfer_to_conference(consultation)
            .await?
            .wait()
            .await?;
        Ok(self.sibling(hub))
    }

    /// Complete a transfer in the given mode; a conference merge yields the conference call
    pub async fn complete_transfer_with(&self, consultation: &Call, mode: TransferMode) -> Result<Option<Call>> {
        match mode {
            TransferMode::Transfer => self.complete_transfer(consultation).await.map(|_| None),
            TransferMode::Conference => self.complete_transfer_to_conference(consultation).await.map(Some),
        }
    }

    pub async fn begin_setup_conference(
        &self,
        party_count: u32,
        params: MakeCallParams,
    ) -> Result<OperationHandle<ConferenceSetup>> {
        self.control
            .conferences()
            .setup_conference(self.id, party_count, params)
            .await
    }

    /// Returns the conference call and the consultation call
    pub async fn setup_conference(&self, party_count: u32, params: MakeCallParams) -> Result<(Call, Call)> {
        let setup = self
            .begin_setup_conference(party_count, params)
            .await?
            .wait()
            .await?;
        Ok((self.sibling(setup.conference), self.sibling(setup.consultation)))
    }

    pub async fn begin_prepare_add_to_conference(&self, params: MakeCallParams) -> Result<OperationHandle<CallId>> {
        self.control.conferences().prepare_add(self.id, params).await
    }

    /// Called on the conference call; returns a new consultation call
    pub async fn prepare_add_to_conference(&self, params: MakeCallParams) -> Result<Call> {
        let consultation = self
            .begin_prepare_add_to_conference(params)
            .await?
            .wait()
            .await?;
        Ok(self.sibling(consultation))
    }

    /// Called on the conference call
    pub async fn begin_add_to_conference(&self, call: &Call) -> Result<OperationHandle<()>> {
        self.control.conferences().add(self.id, call.id).await
    }

    pub async fn add_to_conference(&self, call: &Call) -> Result<()> {
        self.begin_add_to_conference(call).await?.wait().await
    }

    /// Called on a member call
    pub async fn begin_remove_from_conference(&self) -> Result<OperationHandle<()>> {
        self.control.conferences().remove(self.id).await
    }

    pub async fn remove_from_conference(&self) -> Result<()> {
        self.begin_remove_from_conference().await?.wait().await
    }

    /// Other calls of this call's conference
    pub async fn related_conference_calls(&self) -> Result<Vec<Call>> {
        let related = self.control.conferences().related_calls(self.id).await?;
        Ok(related.into_iter().map(|id| self.sibling(id)).collect())
    }

    pub async fn grant_monitor_privilege(&self) -> Result<()> {
        self.control.conferences().grant_monitor_privilege(self.id).await
    }

    // ===== Media =====

    pub async fn begin_gather_digits(&self, params: DigitGatherParams) -> Result<OperationHandle<DigitGatherResult>> {
        self.begin(OperationKind::GatherDigits, OperationParams::GatherDigits(params))
            .await
    }

    pub async fn gather_digits(&self, params: DigitGatherParams) -> Result<DigitGatherResult> {
        self.begin_gather_digits(params).await?.wait().await
    }

    /// Gather parameters built from the engine's configured gather defaults
    pub fn default_gather_params(&self, max_digits: usize) -> DigitGatherParams {
        DigitGatherParams::from_defaults(&self.control.config().gather, max_digits)
    }

    /// Gather up to `max_digits` using the configured timeouts and terminators
    pub async fn begin_gather_digits_with_defaults(
        &self,
        max_digits: usize,
    ) -> Result<OperationHandle<DigitGatherResult>> {
        self.begin_gather_digits(self.default_gather_params(max_digits)).await
    }

    pub async fn cancel_gather_digits(&self) -> Result<CancelOutcome> {
        self.control
            .operations()
            .cancel_kind(self.id, OperationKind::GatherDigits)
            .await
    }

    pub async fn begin_generate_digits(
        &self,
        mode: DigitMode,
        digits: impl Into<String>,
        duration_ms: u32,
    ) -> Result<OperationHandle<bool>> {
        self.begin(
            OperationKind::GenerateDigits,
            OperationParams::GenerateDigits {
                mode,
                digits: digits.into(),
                duration_ms,
            },
        )
        .await
    }

    pub async fn generate_digits(&self, mode: DigitMode, digits: impl Into<String>, duration_ms: u32) -> Result<bool> {
        self.begin_generate_digits(mode, digits, duration_ms)
            .await?
            .wait()
            .await
    }

    pub async fn cancel_generate_digits(&self) -> Result<CancelOutcome> {
        self.control
            .operations()
            .cancel_kind(self.id, OperationKind::GenerateDigits)
            .await
    }

    /// `duration_ms` of zero lets the provider pick
    pub async fn begin_generate_tone(&self, tone: ToneSpec, duration_ms: u32) -> Result<OperationHandle<bool>> {
        self.begin(
            OperationKind::GenerateTone,
            OperationParams::GenerateTone { tone, duration_ms },
        )
        .await
    }

    pub async fn generate_tone(&self, tone: ToneSpec, duration_ms: u32) -> Result<bool> {
        self.begin_generate_tone(tone, duration_ms).await?.wait().await
    }

    pub async fn cancel_generate_tone(&self) -> Result<CancelOutcome> {
        self.control
            .operations()
            .cancel_kind(self.id, OperationKind::GenerateTone)
            .await
    }

    /// Start reporting every digit detected in `modes`
    pub async fn monitor_digits(&self, modes: impl IntoIterator<Item = DigitMode>) -> Result<DigitMonitor> {
        let modes: DigitModes = modes.into_iter().collect();
        if modes.is_empty() {
            return Err(CallControlError::invalid_parameter("no digit modes to monitor"));
        }
        let registry = Arc::clone(self.control.registry());
        let provider = Arc::clone(self.control.provider());

        let subscription = registry.with_record_mut(self.id, |r| {
            ensure_media_state(r.id(), r.state())?;
            let (registration, subscription) = monitor::subscription(
                registry.next_subscription_id(),
                self.id,
                MonitorKind::Digits,
                modes,
                Arc::clone(&registry),
                Arc::clone(&provider),
            );
            r.digit_monitors.push(registration);
            Ok::<_, CallControlError>(subscription)
        })??;
        // on failure the dropped subscription removes its registration
        registry.sync_monitoring(self.id, provider.as_ref()).await?;
        debug!(call = %self.id, subscription = %subscription.id(), "digit monitoring started");
        Ok(subscription)
    }

    /// Start reporting detections of any of `tones`
    pub async fn monitor_tones(&self, tones: Vec<MonitorTone>) -> Result<ToneMonitor> {
        tone::validate_monitor_tones(&tones)?;
        let registry = Arc::clone(self.control.registry());
        let provider = Arc::clone(self.control.provider());

        let subscription = registry.with_record_mut(self.id, |r| {
            ensure_media_state(r.id(), r.state())?;
            let (registration, subscription) = monitor::subscription(
                registry.next_subscription_id(),
                self.id,
                MonitorKind::Tones,
                tones,
                Arc::clone(&registry),
                Arc::clone(&provider),
            );
            r.tone_monitors.push(registration);
            Ok::<_, CallControlError>(subscription)
        })??;
        registry.sync_monitoring(self.id, provider.as_ref()).await?;
        debug!(call = %self.id, subscription = %subscription.id(), "tone monitoring started");
        Ok(subscription)
    }

    /// Cancel every digit monitoring subscription on the call
    pub async fn cancel_digit_monitoring(&self) -> Result<()> {
        self.cancel_monitoring(MonitorKind::Digits).await
    }

    /// Cancel every tone monitoring subscription on the call
    pub async fn cancel_tone_monitoring(&self) -> Result<()> {
        self.cancel_monitoring(MonitorKind::Tones).await
    }

    async fn cancel_monitoring(&self, kind: MonitorKind) -> Result<()> {
        let registry = self.control.registry();
        registry.with_record_mut(self.id, |r| r.close_monitors(Some(kind)))?;
        registry.sync_monitoring(self.id, self.control.provider().as_ref()).await?;
        Ok(())
    }

    // ===== Devices =====

    pub async fn begin_device_specific(&self, payload: Bytes) -> Result<OperationHandle<Bytes>> {
        self.control.devices().device_specific(self.id, payload).await
    }

    pub async fn device_specific(&self, payload: Bytes) -> Result<Bytes> {
        self.begin_device_specific(payload).await?.wait().await
    }

    pub async fn device_id(&self, class: impl Into<DeviceClass>) -> Result<u32> {
        self.control.devices().device_id(self.id, &class.into()).await
    }

    pub async fn wave_in_id(&self) -> Result<u32> {
        self.device_id(DeviceClass::WaveIn).await
    }

    pub async fn wave_out_id(&self) -> Result<u32> {
        self.device_id(DeviceClass::WaveOut).await
    }

    pub async fn midi_in_id(&self) -> Result<u32> {
        self.device_id(DeviceClass::MidiIn).await
    }

    pub async fn midi_out_id(&self) -> Result<u32> {
        self.device_id(DeviceClass::MidiOut).await
    }

    pub async fn comm_device_name(&self) -> Result<String> {
        self.control.devices().comm_device_name(self.id).await
    }

    pub async fn open_comm_stream(&self) -> Result<CommStream> {
        self.control.devices().open_comm_stream(self.id).await
    }

    // ===== Lifetime =====

    /// Release the application's hold on the call.
    ///
    /// The call leaves the registry once it is disconnected and no pending
    /// operation refers to it.
    pub fn deallocate(self) -> Result<()> {
        let registry = self.control.registry();
        registry.with_record_mut(self.id, |r| r.closed = true)?;
        registry.dispose_if_finished(self.id);
        Ok(())
    }
}

fn ensure_media_state(call: CallId, state: CallState) -> Result<()> {
    if MEDIA_STATES.contains(&state) {
        Ok(())
    } else {
        Err(CallControlError::InvalidStateForMonitoring { call_id: call, actual: state })
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call").field("id", &self.id).finish()
    }
}

impl PartialEq for Call {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.control, &other.control)
    }
}

impl Eq for Call {}

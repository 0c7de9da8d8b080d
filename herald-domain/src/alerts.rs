//! Buzz, beep, blink.
//!
//! [`evaluate`] is a pure decision over one record plus the current
//! [`AttentionState`]; the pipeline owns applying the outcome to the device
//! traits and to the ownership fields. At most one record owns the sound
//! channel and one the vibrate channel at any time.

use thiserror::Error;

use crate::record::NotificationRecord;
use crate::types::{LightSpec, ListenerHints, NotificationFlags, NotificationKey, RingerMode, SuppressedEffects, UserId};

/// Fallback pattern used when a record has sound but no vibration and the
/// ringer is in vibrate mode.
pub const FALLBACK_VIBRATION_PATTERN: [u64; 4] = [0, 250, 250, 250];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("device unavailable: {0}")]
    Unavailable(String),
}

/// Sound sink. Calls must return promptly; playback is asynchronous on the
/// device side and there is no perceptual ack.
pub trait SoundPlayer: Send + Sync {
    fn play(&self, uri: &str, looping: bool) -> Result<(), DeviceError>;
    /// The short tone used instead of the full sound during a call.
    fn play_in_call_alert(&self) -> Result<(), DeviceError>;
    fn stop(&self) -> Result<(), DeviceError>;
}

pub trait Vibrator: Send + Sync {
    fn vibrate(&self, pattern: &[u64], repeat: bool) -> Result<(), DeviceError>;
    fn cancel(&self) -> Result<(), DeviceError>;
}

pub trait NotificationLight: Send + Sync {
    fn set(&self, spec: LightSpec) -> Result<(), DeviceError>;
    fn off(&self) -> Result<(), DeviceError>;
}

/// Mutable attention context: effect ownership plus the device/user state the
/// decision consumes. Owned by the pipeline state, not by statics.
#[derive(Debug, Clone, Default)]
pub struct AttentionState {
    pub sound_owner: Option<NotificationKey>,
    pub vibrate_owner: Option<NotificationKey>,
    /// Keys that requested the LED, most recent last; the top owner drives
    /// the light.
    pub light_owners: Vec<NotificationKey>,
    pub in_call: bool,
    pub screen_on: bool,
    pub ringer_mode: RingerMode,
    /// Global kill switch for notification effects.
    pub effects_disabled: bool,
    pub current_user: UserId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SoundCommand {
    pub uri: String,
    pub looping: bool,
    /// Play the in-call tone instead of the record's sound.
    pub in_call: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VibrationCommand {
    pub pattern: Vec<u64>,
    pub repeat: bool,
}

/// What the pipeline should do for one posted record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AttentionOutcome {
    pub sound: Option<SoundCommand>,
    pub vibration: Option<VibrationCommand>,
    /// The record is eligible to own the LED.
    pub show_light: bool,
    /// This key owned the sound channel and its update no longer carries a
    /// valid sound; silence it.
    pub stop_sound: bool,
    pub stop_vibration: bool,
}

impl AttentionOutcome {
    pub fn alerted(&self) -> bool {
        self.sound.is_some() || self.vibration.is_some() || self.show_light
    }
}

/// An update with `ONLY_ALERT_ONCE`, or a grouped record whose group alert
/// policy points at another member, must stay quiet.
fn should_mute(record: &NotificationRecord) -> bool {
    if record.is_update
        && record
            .sbn
            .notification
            .flags
            .contains(NotificationFlags::ONLY_ALERT_ONCE)
    {
        return true;
    }
    if record.sbn.is_group() {
        return record.sbn.notification.suppress_alerting_due_to_grouping();
    }
    false
}

/// Decides sound, vibration, and light for a record that just reached the
/// posted list (or whose interception was just lifted).
pub fn evaluate(
    record: &NotificationRecord,
    state: &AttentionState,
    hints: ListenerHints,
    is_call_record: bool,
) -> AttentionOutcome {
    let key = record.key();
    let mut outcome = AttentionOutcome::default();

    let can_interrupt = record.importance.is_interruptive() && !record.intercepted;
    let effects_disabled = state.effects_disabled
        || hints.suppresses(is_call_record)
        || (state.in_call && !is_call_record);
    let for_current_user =
        record.user() == state.current_user || record.user().is_all();

    let was_beep = state.sound_owner.as_ref() == Some(key);
    let was_buzz = state.vibrate_owner.as_ref() == Some(key);

    let mut has_valid_sound = false;
    let mut has_valid_vibration = false;

    if for_current_user && can_interrupt && !effects_disabled {
        let insistent = record
            .sbn
            .notification
            .flags
            .contains(NotificationFlags::INSISTENT);
        let sound = record.effective_sound();
        has_valid_sound = sound.is_some();

        // Demote sound to vibration when the ringer is in vibrate mode.
        let mut vibration = record.effective_vibration();
        if vibration.is_none() && has_valid_sound && state.ringer_mode == RingerMode::Vibrate {
            vibration = Some(FALLBACK_VIBRATION_PATTERN.to_vec());
        }
        has_valid_vibration = vibration.is_some();

        if !should_mute(record) {
            if let Some(uri) = sound {
                if state.in_call {
                    outcome.sound = Some(SoundCommand {
                        uri,
                        looping: insistent,
                        in_call: true,
                    });
                } else if state.ringer_mode != RingerMode::Vibrate {
                    outcome.sound = Some(SoundCommand {
                        uri,
                        looping: insistent,
                        in_call: false,
                    });
                }
            }
            if !state.in_call && state.ringer_mode != RingerMode::Silent {
                if let Some(pattern) = vibration {
                    outcome.vibration = Some(VibrationCommand {
                        pattern,
                        repeat: insistent,
                    });
                }
            }
        }
    }

    // An update that dropped its active sound or vibration silences the
    // previous effect rather than letting it ring on.
    outcome.stop_sound = was_beep && !has_valid_sound;
    outcome.stop_vibration = was_buzz && !has_valid_vibration;

    // Light: importance threshold, a configured light, and zen not
    // suppressing screen-off effects for this record.
    outcome.show_light = record.importance.is_interruptive()
        && record.effective_light().is_some()
        && !record
            .suppressed_effects
            .contains(SuppressedEffects::SCREEN_OFF);

    outcome
}

//! GATT profile of a tetherband bracelet.
//!
//! Four standard services plus one custom identify service whose UUID is the
//! pairing identifier. Each role uses the first characteristic of its service.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pairing::PairingIdentifier;

/// Bluetooth base UUID `00000000-0000-1000-8000-00805F9B34FB`.
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Expand a 16/32-bit assigned number onto the Bluetooth base UUID.
#[must_use]
pub const fn uuid_from_short(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Immediate Alert service.
pub const IMMEDIATE_ALERT_SERVICE: Uuid = uuid_from_short(0x1802);
/// Link Loss service.
pub const LINK_LOSS_SERVICE: Uuid = uuid_from_short(0x1803);
/// Tx Power service.
pub const TX_POWER_SERVICE: Uuid = uuid_from_short(0x1804);
/// Battery service.
pub const BATTERY_SERVICE: Uuid = uuid_from_short(0x180F);

/// Alert Level characteristic, shared by immediate alert and link loss.
pub const ALERT_LEVEL_CHARACTERISTIC: Uuid = uuid_from_short(0x2A06);
/// Tx Power Level characteristic.
pub const TX_POWER_LEVEL_CHARACTERISTIC: Uuid = uuid_from_short(0x2A07);
/// Battery Level characteristic.
pub const BATTERY_LEVEL_CHARACTERISTIC: Uuid = uuid_from_short(0x2A19);

/// A characteristic addressed by its service and its own UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicId {
    /// Owning service.
    pub service: Uuid,
    /// Characteristic UUID.
    pub characteristic: Uuid,
}

impl CharacteristicId {
    /// Build a characteristic address.
    #[must_use]
    pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

/// What a discovered service is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GattRole {
    /// Alert writes for distance determination.
    ImmediateAlert,
    /// Calibrated transmit power, read once at connect.
    TxPower,
    /// Link loss alert level.
    LinkLoss,
    /// Battery level notifications.
    Battery,
    /// Hardware command writes and capacitive-sense notifications.
    Identify,
}

/// Services to request during discovery.
#[must_use]
pub fn tracked_services(pairing: &PairingIdentifier) -> Vec<Uuid> {
    vec![
        IMMEDIATE_ALERT_SERVICE,
        TX_POWER_SERVICE,
        LINK_LOSS_SERVICE,
        BATTERY_SERVICE,
        pairing.service_uuid(),
    ]
}

/// Classify a discovered service.
#[must_use]
pub fn classify_service(service: &Uuid, pairing: &PairingIdentifier) -> Option<GattRole> {
    match *service {
        s if s == IMMEDIATE_ALERT_SERVICE => Some(GattRole::ImmediateAlert),
        s if s == TX_POWER_SERVICE => Some(GattRole::TxPower),
        s if s == LINK_LOSS_SERVICE => Some(GattRole::LinkLoss),
        s if s == BATTERY_SERVICE => Some(GattRole::Battery),
        s if pairing.matches_service(&s) => Some(GattRole::Identify),
        _ => None,
    }
}

/// Resolved characteristic handles for one connection.
///
/// Cleared on link loss; rebuilt by each characteristic discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CharacteristicHandles {
    /// Hardware command / capacitive sense characteristic.
    pub identify: Option<CharacteristicId>,
    /// Battery level characteristic.
    pub battery: Option<CharacteristicId>,
    /// Tx power level characteristic.
    pub tx_power: Option<CharacteristicId>,
    /// Immediate alert level characteristic.
    pub immediate_alert: Option<CharacteristicId>,
    /// Link loss alert level characteristic.
    pub link_loss: Option<CharacteristicId>,
}

impl CharacteristicHandles {
    /// Record the characteristic chosen for `role` out of a service's list.
    ///
    /// Returns the chosen characteristic, or `None` if the list was empty.
    pub fn assign(
        &mut self,
        role: GattRole,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Option<CharacteristicId> {
        let chosen = match role {
            GattRole::Battery => characteristics
                .iter()
                .find(|c| **c == BATTERY_LEVEL_CHARACTERISTIC)
                .or_else(|| characteristics.first()),
            _ => characteristics.first(),
        }
        .map(|c| CharacteristicId::new(service, *c))?;

        let slot = match role {
            GattRole::ImmediateAlert => &mut self.immediate_alert,
            GattRole::TxPower => &mut self.tx_power,
            GattRole::LinkLoss => &mut self.link_loss,
            GattRole::Battery => &mut self.battery,
            GattRole::Identify => &mut self.identify,
        };
        *slot = Some(chosen);
        Some(chosen)
    }

    /// Which role a characteristic plays, if any.
    #[must_use]
    pub fn role_of(&self, characteristic: &CharacteristicId) -> Option<GattRole> {
        let is = |slot: &Option<CharacteristicId>| slot.as_ref() == Some(characteristic);
        if is(&self.identify) {
            Some(GattRole::Identify)
        } else if is(&self.battery) {
            Some(GattRole::Battery)
        } else if is(&self.tx_power) {
            Some(GattRole::TxPower)
        } else if is(&self.immediate_alert) {
            Some(GattRole::ImmediateAlert)
        } else if is(&self.link_loss) {
            Some(GattRole::LinkLoss)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairing() -> PairingIdentifier {
        PairingIdentifier::new("B0201F39-97BC-A2F5-4621-C9AB58C9BFCA").unwrap()
    }

    #[test]
    fn test_short_uuid_expansion() {
        assert_eq!(
            BATTERY_SERVICE.to_string(),
            "0000180f-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            uuid_from_short(0x2A19).to_string(),
            "00002a19-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_classify_services() {
        let pairing = pairing();
        assert_eq!(
            classify_service(&TX_POWER_SERVICE, &pairing),
            Some(GattRole::TxPower)
        );
        assert_eq!(
            classify_service(&pairing.service_uuid(), &pairing),
            Some(GattRole::Identify)
        );
        assert_eq!(classify_service(&uuid_from_short(0x1800), &pairing), None);
        assert_eq!(tracked_services(&pairing).len(), 5);
    }

    #[test]
    fn test_assign_prefers_battery_level_characteristic() {
        let mut handles = CharacteristicHandles::default();
        let other = uuid_from_short(0x2A1A);
        let chosen = handles
            .assign(
                GattRole::Battery,
                BATTERY_SERVICE,
                &[other, BATTERY_LEVEL_CHARACTERISTIC],
            )
            .unwrap();
        assert_eq!(chosen.characteristic, BATTERY_LEVEL_CHARACTERISTIC);
        assert_eq!(handles.role_of(&chosen), Some(GattRole::Battery));
    }

    #[test]
    fn test_assign_takes_first_characteristic() {
        let mut handles = CharacteristicHandles::default();
        let identify_service = pairing().service_uuid();
        let first = uuid_from_short(0xFFF1);
        handles.assign(
            GattRole::Identify,
            identify_service,
            &[first, uuid_from_short(0xFFF2)],
        );
        assert_eq!(
            handles.identify,
            Some(CharacteristicId::new(identify_service, first))
        );
        assert!(handles.assign(GattRole::LinkLoss, LINK_LOSS_SERVICE, &[]).is_none());
    }
}

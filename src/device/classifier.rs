//! SCSI error classification
//!
//! Each robot or drive family interprets sense data a little differently.
//! A classifier maps sense key / ASC / ASCQ to the recovery action the
//! command runner should take.

use tracing::debug;

/// Recovery action for a failed device command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    WaitShort,
    WaitLong,
    ReinitRetry,
    Ignore,
    DownEquipment,
    IllegalRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SenseData {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl SenseData {
    pub fn new(key: u8, asc: u8, ascq: u8) -> Self {
        Self { key, asc, ascq }
    }

    /// Decode fixed-format sense bytes.
    pub fn from_bytes(sense_data: &[u8]) -> Option<Self> {
        if sense_data.len() < 3 {
            return None;
        }
        let key = sense_data[2] & 0x0F;
        let asc = if sense_data.len() > 12 { sense_data[12] } else { 0 };
        let ascq = if sense_data.len() > 13 { sense_data[13] } else { 0 };
        Some(Self { key, asc, ascq })
    }

    pub fn describe(&self) -> String {
        match (self.key, self.asc, self.ascq) {
            (0x00, _, _) => "No sense".to_string(),
            (0x02, 0x3A, 0x00) => "Medium not present".to_string(),
            (0x02, 0x04, 0x00) => "Not ready".to_string(),
            (0x02, 0x04, 0x01) => "Not ready - becoming ready".to_string(),
            (0x03, _, _) => "Medium error".to_string(),
            (0x04, _, _) => "Hardware error".to_string(),
            (0x05, _, _) => "Illegal request".to_string(),
            (0x06, 0x28, 0x00) => "Unit attention - not ready to ready transition".to_string(),
            (0x06, 0x29, _) => "Unit attention - power on or reset".to_string(),
            (0x0B, _, _) => "Aborted command".to_string(),
            _ => format!(
                "Sense Key: 0x{:02X}, ASC/ASCQ: 0x{:02X}/0x{:02X}",
                self.key, self.asc, self.ascq
            ),
        }
    }
}

pub trait ErrorClassifier: Send + Sync {
    fn name(&self) -> &'static str;
    fn classify(&self, sense: &SenseData) -> RecoveryAction;
}

fn generic_action(sense: &SenseData) -> RecoveryAction {
    match (sense.key, sense.asc, sense.ascq) {
        (0x00, _, _) | (0x01, _, _) => RecoveryAction::Ignore,
        (0x02, 0x04, 0x01) => RecoveryAction::WaitShort,
        (0x02, 0x04, _) => RecoveryAction::WaitLong,
        (0x02, 0x3A, _) => RecoveryAction::ReinitRetry,
        (0x02, _, _) => RecoveryAction::WaitShort,
        (0x03, _, _) | (0x04, _, _) | (0x07, _, _) => RecoveryAction::DownEquipment,
        (0x05, _, _) => RecoveryAction::IllegalRequest,
        (0x06, 0x28, _) => RecoveryAction::WaitShort,
        (0x06, _, _) => RecoveryAction::ReinitRetry,
        (0x0B, _, _) => RecoveryAction::WaitShort,
        _ => RecoveryAction::DownEquipment,
    }
}

/// SCSI-2 defaults, used for unknown vendors.
pub struct GenericClassifier;

impl ErrorClassifier for GenericClassifier {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn classify(&self, sense: &SenseData) -> RecoveryAction {
        generic_action(sense)
    }
}

pub struct IbmClassifier;

impl ErrorClassifier for IbmClassifier {
    fn name(&self) -> &'static str {
        "ibm"
    }

    fn classify(&self, sense: &SenseData) -> RecoveryAction {
        match (sense.key, sense.asc, sense.ascq) {
            // manual intervention required
            (0x02, 0x04, 0x03) => RecoveryAction::DownEquipment,
            // cleaning cartridge installed
            (0x02, 0x30, 0x03) => RecoveryAction::WaitLong,
            _ => generic_action(sense),
        }
    }
}

pub struct StkClassifier;

impl ErrorClassifier for StkClassifier {
    fn name(&self) -> &'static str {
        "stk"
    }

    fn classify(&self, sense: &SenseData) -> RecoveryAction {
        match (sense.key, sense.asc, sense.ascq) {
            // library audit in progress
            (0x02, 0x04, 0x8A) => RecoveryAction::WaitLong,
            (0x06, 0x29, _) => RecoveryAction::ReinitRetry,
            // cartridge access port open
            (0x06, 0x3A, 0x02) => RecoveryAction::WaitShort,
            _ => generic_action(sense),
        }
    }
}

pub struct OpticalClassifier;

impl ErrorClassifier for OpticalClassifier {
    fn name(&self) -> &'static str {
        "optical"
    }

    fn classify(&self, sense: &SenseData) -> RecoveryAction {
        match (sense.key, sense.asc, sense.ascq) {
            (0x02, 0x04, 0x02) => RecoveryAction::ReinitRetry,
            // medium format corrupted
            (0x03, 0x31, _) => RecoveryAction::DownEquipment,
            // write protected medium is not fatal to the drive
            (0x07, 0x27, _) => RecoveryAction::Ignore,
            _ => generic_action(sense),
        }
    }
}

/// Pick a classifier from a vendor identification string.
pub fn classifier_for(vendor: &str) -> Box<dyn ErrorClassifier> {
    let v = vendor.trim().to_ascii_lowercase();
    let classifier: Box<dyn ErrorClassifier> = if v.starts_with("ibm") {
        Box::new(IbmClassifier)
    } else if v.starts_with("stk") || v.starts_with("storagetek") {
        Box::new(StkClassifier)
    } else if v.contains("optical") || v.starts_with("plasmon") {
        Box::new(OpticalClassifier)
    } else {
        Box::new(GenericClassifier)
    };
    debug!("Using {} error classifier for vendor '{}'", classifier.name(), vendor);
    classifier
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sense_from_bytes() {
        let mut bytes = [0u8; 18];
        bytes[2] = 0x72;
        bytes[12] = 0x04;
        bytes[13] = 0x01;
        let sense = SenseData::from_bytes(&bytes).unwrap();
        assert_eq!(sense, SenseData::new(0x02, 0x04, 0x01));
        assert_eq!(sense.describe(), "Not ready - becoming ready");
        assert!(SenseData::from_bytes(&[0, 0]).is_none());
    }

    #[test]
    fn test_generic_actions() {
        let c = GenericClassifier;
        assert_eq!(c.classify(&SenseData::new(0x00, 0, 0)), RecoveryAction::Ignore);
        assert_eq!(c.classify(&SenseData::new(0x02, 0x04, 0x01)), RecoveryAction::WaitShort);
        assert_eq!(c.classify(&SenseData::new(0x04, 0x44, 0)), RecoveryAction::DownEquipment);
        assert_eq!(c.classify(&SenseData::new(0x05, 0x24, 0)), RecoveryAction::IllegalRequest);
        assert_eq!(c.classify(&SenseData::new(0x06, 0x29, 0)), RecoveryAction::ReinitRetry);
    }

    #[test]
    fn test_vendor_overrides() {
        let audit = SenseData::new(0x02, 0x04, 0x8A);
        assert_eq!(classifier_for("STK L700").classify(&audit), RecoveryAction::WaitLong);
        let manual = SenseData::new(0x02, 0x04, 0x03);
        assert_eq!(classifier_for("IBM 3584").classify(&manual), RecoveryAction::DownEquipment);
        assert_eq!(classifier_for("acme").classify(&manual), RecoveryAction::WaitLong);
        assert_eq!(classifier_for("Plasmon G").name(), "optical");
    }
}

use std::fmt;

use super::modbus::{self, RegisterSession};

pub const INFO_ADDRESS: u16 = 9800;
pub const INFO_COUNT: u16 = 27;

/// Identification block reported by the meter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterInfo {
    pub model: String,
    pub firmware: String,
    pub protocol: String,
    pub updated: String,
    pub serial: String,
}

impl MeterInfo {
    pub fn read<S: RegisterSession>(session: &mut S) -> modbus::Result<Self> {
        let words = session.read_holding_registers(INFO_ADDRESS, INFO_COUNT)?;
        MeterInfo::from_registers(&words).ok_or_else(|| {
            modbus::ModbusError::Frame(format!("Identification block has {} registers", words.len()))
        })
    }

    pub fn from_registers(words: &[u16]) -> Option<Self> {
        if words.len() < usize::from(INFO_COUNT) {
            return None;
        }

        let model = words[..9]
            .iter()
            .filter_map(|&w| char::from_u32(u32::from(w)))
            .filter(|c| *c != '\0')
            .collect::<String>()
            .trim()
            .to_string();

        // Firmware 1234 reads as 1.23.4
        let fw = words[20].to_string();
        let firmware = format!(
            "{}.{}.{}",
            fw.get(..1).unwrap_or(""),
            fw.get(1..3.min(fw.len())).unwrap_or(""),
            fw.get(3.min(fw.len())..).unwrap_or("")
        );

        let protocol = format!("{}", f64::from(words[21]) / 10.0);
        let updated = words[22..25]
            .iter()
            .map(|w| w.to_string())
            .collect::<Vec<_>>()
            .join("-");
        let serial = words[25..27].iter().map(|w| w.to_string()).collect();

        Some(MeterInfo {
            model,
            firmware,
            protocol,
            updated,
            serial,
        })
    }
}

impl fmt::Display for MeterInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "Meter model   {}\t\tFirmware V{} (Updated {})",
            self.model, self.firmware, self.updated
        )?;
        write!(f, "Serial number {}\tProtocol V{}", self.serial, self.protocol)
    }
}

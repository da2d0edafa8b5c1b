use crc::{Crc, CRC_16_MODBUS};
use serialport::{DataBits, FlowControl, Parity, StopBits};
use std::io::{self, Read, Write};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SerialConfig;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);
const READ_HOLDING_REGISTERS: u8 = 0x03;
const EXCEPTION_FLAG: u8 = 0x80;

/// Outcome of a failed register read. `Protocol` means the meter answered
/// with a well-formed exception; every other variant is a transport failure.
#[derive(Error, Debug)]
pub enum ModbusError {
    #[error("Cannot open serial port {port}: {reason}")]
    Unavailable { port: String, reason: String },

    #[error("Meter did not answer")]
    NoResponse,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed frame: {0}")]
    Frame(String),

    #[error("Meter returned exception code {code:#04x} for function {function:#04x}")]
    Protocol { function: u8, code: u8 },
}

impl ModbusError {
    pub fn is_protocol(&self) -> bool {
        matches!(self, ModbusError::Protocol { .. })
    }
}

pub type Result<T> = std::result::Result<T, ModbusError>;

/// An open conversation with the meter
pub trait RegisterSession {
    fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>>;

    /// Releases the underlying link. Further reads fail.
    fn close(&mut self);
}

/// A byte stream that can drop whatever the far end sent and nobody read
pub trait SerialLine: Read + Write {
    fn discard_input(&mut self) -> io::Result<()>;
}

impl SerialLine for Box<dyn serialport::SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }
}

/// Something that can open sessions to the meter
pub trait MeterLink {
    type Session: RegisterSession;

    fn connect(&self) -> Result<Self::Session>;
}

/// Modbus RTU over a serial line
pub struct SerialLink {
    port: String,
    baud_rate: u32,
    unit_id: u8,
    timeout: Duration,
    retries: u8,
}

impl SerialLink {
    pub fn new(config: &SerialConfig) -> Self {
        info!(
            "Initializing meter link on {} at {} baud, unit {}",
            config.port, config.baud_rate, config.unit_id
        );
        SerialLink {
            port: config.port.clone(),
            baud_rate: config.baud_rate,
            unit_id: config.unit_id,
            timeout: config.timeout(),
            retries: config.retries,
        }
    }
}

impl MeterLink for SerialLink {
    type Session = RtuSession<Box<dyn serialport::SerialPort>>;

    fn connect(&self) -> Result<Self::Session> {
        let port = serialport::new(&self.port, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.timeout)
            .open()
            .map_err(|e| ModbusError::Unavailable {
                port: self.port.clone(),
                reason: e.to_string(),
            })?;
        info!("Opened serial port {}", self.port);
        Ok(RtuSession::new(port, self.unit_id, self.retries))
    }
}

/// RTU framing over any byte stream
pub struct RtuSession<P> {
    port: Option<P>,
    unit_id: u8,
    retries: u8,
}

impl<P: SerialLine> RtuSession<P> {
    pub fn new(port: P, unit_id: u8, retries: u8) -> Self {
        RtuSession {
            port: Some(port),
            unit_id,
            retries,
        }
    }

    fn port(&mut self) -> Result<&mut P> {
        self.port.as_mut().ok_or_else(|| {
            ModbusError::Io(io::Error::new(io::ErrorKind::NotConnected, "Session closed"))
        })
    }

    fn read_response(&mut self, count: u16) -> Result<Vec<u16>> {
        let unit_id = self.unit_id;
        let port = self.port()?;

        let mut head = [0u8; 3];
        // Only a reply that never started counts as silence
        if let Err(e) = port.read_exact(&mut head[..1]) {
            return Err(match e.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::UnexpectedEof => ModbusError::NoResponse,
                _ => e.into(),
            });
        }
        port.read_exact(&mut head[1..])?;
        if head[0] != unit_id {
            return Err(ModbusError::Frame(format!(
                "Reply from unit {} while talking to unit {}",
                head[0], unit_id
            )));
        }

        if head[1] == READ_HOLDING_REGISTERS | EXCEPTION_FLAG {
            let mut crc = [0u8; 2];
            port.read_exact(&mut crc)?;
            check_crc(&head, crc)?;
            return Err(ModbusError::Protocol {
                function: READ_HOLDING_REGISTERS,
                code: head[2],
            });
        }
        if head[1] != READ_HOLDING_REGISTERS {
            return Err(ModbusError::Frame(format!("Unexpected function code {:#04x}", head[1])));
        }

        let byte_count = usize::from(head[2]);
        if byte_count != usize::from(count) * 2 {
            return Err(ModbusError::Frame(format!(
                "Expected {} data bytes, meter sent {}",
                usize::from(count) * 2,
                byte_count
            )));
        }

        let mut body = vec![0u8; byte_count + 2];
        port.read_exact(&mut body)?;
        let (data, crc) = body.split_at(byte_count);

        let mut frame = head.to_vec();
        frame.extend_from_slice(data);
        check_crc(&frame, [crc[0], crc[1]])?;

        Ok(data
            .chunks_exact(2)
            .map(|word| u16::from_be_bytes([word[0], word[1]]))
            .collect())
    }
}

impl<P: SerialLine> RegisterSession for RtuSession<P> {
    fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        let request = read_request(self.unit_id, address, count);
        let mut attempt = 0;
        loop {
            debug!("Reading {} registers at {}", count, address);
            let port = self.port()?;
            port.write_all(&request)?;
            port.flush()?;

            match self.read_response(count) {
                Err(ModbusError::NoResponse) if attempt < self.retries => {
                    attempt += 1;
                    warn!("No reply for register {}, retrying ({}/{})", address, attempt, self.retries);
                    self.port()?.discard_input()?;
                }
                other => return other,
            }
        }
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!("Closed meter session");
        }
    }
}

fn read_request(unit_id: u8, address: u16, count: u16) -> Vec<u8> {
    let mut frame = vec![unit_id, READ_HOLDING_REGISTERS];
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    let crc = MODBUS_CRC.checksum(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

fn check_crc(frame: &[u8], received: [u8; 2]) -> Result<()> {
    let expected = MODBUS_CRC.checksum(frame);
    let actual = u16::from_le_bytes(received);
    if expected != actual {
        return Err(ModbusError::Frame(format!(
            "CRC mismatch: expected {:#06x}, got {:#06x}",
            expected, actual
        )));
    }
    Ok(())
}

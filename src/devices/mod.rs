pub mod meter;
pub mod modbus;

pub use meter::MeterInfo;
pub use modbus::{MeterLink, ModbusError, RegisterSession, SerialLink};

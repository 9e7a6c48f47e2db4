//! BLE transport: the GATT session and its dedicated I/O thread.

pub mod io_thread;
pub mod session;

pub use io_thread::IoThread;
pub use session::{Device, Session, DEVICE_NAME_PREFIXES, GATEWAY_SERVICE_UUID};

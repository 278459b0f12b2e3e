//! SocketCAN ISO-TP transport
//!
//! Segmentation and flow control are done by the kernel's `can-isotp`
//! module; this side only moves complete UDS messages.

use std::sync::Arc;

use anyhow::Result;
use fbl_core::uds::{service_id, NegativeResponseCode};
use fbl_core::Transport;
use parking_lot::Mutex;
use socketcan::ExtendedId;
use socketcan_isotp::IsoTpSocket;
use tracing::{debug, error};

/// ISO-TP socket shared between the request loop and the core's transport
pub type SharedSocket = Arc<Mutex<IsoTpSocket>>;

/// Open a non-blocking ISO-TP socket with 29-bit addressing.
/// `rx_id` is what the tester sends to, `tx_id` what the bootloader sends from.
pub fn open_socket(interface: &str, rx_id: u32, tx_id: u32) -> Result<SharedSocket> {
    let rx = ExtendedId::new(rx_id)
        .ok_or_else(|| anyhow::anyhow!("Invalid extended CAN ID: 0x{:X}", rx_id))?;
    let tx = ExtendedId::new(tx_id)
        .ok_or_else(|| anyhow::anyhow!("Invalid extended CAN ID: 0x{:X}", tx_id))?;

    let socket = IsoTpSocket::open(interface, rx, tx)
        .map_err(|e| anyhow::anyhow!("Failed to open ISO-TP socket: {}", e))?;
    socket.set_nonblocking(true)?;

    Ok(Arc::new(Mutex::new(socket)))
}

/// Read one complete request, if any has arrived
pub fn try_read(socket: &SharedSocket) -> std::io::Result<Option<Vec<u8>>> {
    let mut guard = socket.lock();
    match guard.read() {
        Ok(data) if !data.is_empty() => Ok(Some(data.to_vec())),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

/// Response side of the core, writing to the shared socket
pub struct IsoTpTransport {
    socket: SharedSocket,
}

impl IsoTpTransport {
    pub fn new(socket: SharedSocket) -> Self {
        Self { socket }
    }

    fn write(&self, frame: &[u8]) {
        debug!(response = %hex::encode(frame), "Sending UDS response");
        if let Err(e) = self.socket.lock().write(frame) {
            error!(?e, "Failed to send response");
        }
    }
}

impl Transport for IsoTpTransport {
    fn send_response(&mut self, response: &[u8]) {
        self.write(response);
    }

    fn send_response_pending(&mut self, sid: u8) {
        self.write(&[
            service_id::NEGATIVE_RESPONSE,
            sid,
            u8::from(NegativeResponseCode::ResponsePending),
        ]);
    }
}

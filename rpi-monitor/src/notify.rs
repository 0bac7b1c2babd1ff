//! systemd readiness/status notifications (`sd_notify` protocol)
//!
//! Sends datagrams to `$NOTIFY_SOCKET` (filesystem path or `@abstract`
//! name). Without the variable every call is a no-op.

use std::os::unix::net::UnixDatagram;
use tracing::debug;

#[derive(Debug, Default)]
pub struct Notifier {
    socket: Option<(UnixDatagram, String)>,
}

impl Notifier {
    pub fn from_env() -> Self {
        let Some(address) = std::env::var("NOTIFY_SOCKET").ok().filter(|a| !a.is_empty()) else {
            return Self::default();
        };
        match UnixDatagram::unbound() {
            Ok(socket) => Self { socket: Some((socket, address)) },
            Err(e) => {
                debug!("sd_notify disabled: {}", e);
                Self::default()
            }
        }
    }

    pub fn ready(&self) {
        self.send("READY=1");
    }

    pub fn status(&self, text: &str) {
        self.send(&format!("STATUS={}", text.replace('\n', " ")));
    }

    pub fn stopping(&self) {
        self.send("STOPPING=1");
    }

    fn send(&self, state: &str) {
        let Some((socket, address)) = &self.socket else {
            return;
        };
        if let Err(e) = send_to(socket, address, state.as_bytes()) {
            debug!("sd_notify({}) failed: {}", state, e);
        }
    }
}

#[cfg(target_os = "linux")]
fn send_to(socket: &UnixDatagram, address: &str, data: &[u8]) -> std::io::Result<usize> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    match address.strip_prefix('@') {
        Some(name) => socket.send_to_addr(data, &SocketAddr::from_abstract_name(name.as_bytes())?),
        None => socket.send_to(data, address),
    }
}

#[cfg(not(target_os = "linux"))]
fn send_to(socket: &UnixDatagram, address: &str, data: &[u8]) -> std::io::Result<usize> {
    socket.send_to(data, address)
}

use serde::{Deserialize, Serialize};

/// Features advertised by the guest agent when a connection is established.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GuestCapabilities {
    #[serde(default)]
    pub send_host_create_message: bool,
    #[serde(default)]
    pub send_host_start_message: bool,
    #[serde(default)]
    pub host_socket_address_update: bool,
    #[serde(default)]
    pub signal_process_supported: bool,
    #[serde(default)]
    pub delete_container_state_supported: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_default_to_false() {
        let caps: GuestCapabilities =
            serde_json::from_str("{\"SignalProcessSupported\":true}").unwrap();
        assert!(caps.signal_process_supported);
        assert!(!caps.host_socket_address_update);
    }
}

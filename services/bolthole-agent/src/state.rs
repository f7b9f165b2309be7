//! Agent state snapshots attached to restart and error reports

use std::collections::HashMap;

/// The structured state map the bastion stores alongside reports
pub fn agent_state(target_id: &str, connection_up: bool) -> HashMap<String, String> {
    HashMap::from([
        ("targetId".to_string(), target_id.to_string()),
        (
            "agentVersion".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        ),
        ("os".to_string(), std::env::consts::OS.to_string()),
        ("arch".to_string(), std::env::consts::ARCH.to_string()),
        (
            "connectionState".to_string(),
            if connection_up {
                "connected".to_string()
            } else {
                "reconnecting".to_string()
            },
        ),
    ])
}

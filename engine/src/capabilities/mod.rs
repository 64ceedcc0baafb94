//! Capability gate
//!
//! Translates a plugin's declared capability set into the concrete set of
//! host calls its instance may invoke. The gate is pure: given the same
//! declaration it always produces the same grant, and the grant is immutable
//! for the lifetime of an instance — changing capabilities requires a reload.
//!
//! Every host call the runtime knows is enumerated in [`HostCall`]. The
//! bridge walks [`HostCall::ALL`] when wiring an instance: granted calls get
//! their real implementation, ungranted calls get a stub that returns a
//! `permission_denied` error code to the guest. Nothing is silently ignored.

use sdk::manifest::{Capabilities, StorageMode};

/// Every host call exposed to guests, granted or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostCall {
    Log,
    SetStatus,
    ReadConfig,
    WriteConfig,
    Subscribe,
    Unsubscribe,
    PublishDelta,
    HttpFetch,
    SerialListPorts,
    RegisterPutHandler,
    RegisterResourceProvider,
}

impl HostCall {
    /// All host calls, in registration order.
    pub const ALL: [HostCall; 11] = [
        HostCall::Log,
        HostCall::SetStatus,
        HostCall::ReadConfig,
        HostCall::WriteConfig,
        HostCall::Subscribe,
        HostCall::Unsubscribe,
        HostCall::PublishDelta,
        HostCall::HttpFetch,
        HostCall::SerialListPorts,
        HostCall::RegisterPutHandler,
        HostCall::RegisterResourceProvider,
    ];

    /// Import name the guest links against.
    pub fn name(self) -> &'static str {
        match self {
            HostCall::Log => "log",
            HostCall::SetStatus => "set_status",
            HostCall::ReadConfig => "read_config",
            HostCall::WriteConfig => "write_config",
            HostCall::Subscribe => "subscribe",
            HostCall::Unsubscribe => "unsubscribe",
            HostCall::PublishDelta => "publish_delta",
            HostCall::HttpFetch => "http_fetch",
            HostCall::SerialListPorts => "serial_list_ports",
            HostCall::RegisterPutHandler => "register_put_handler",
            HostCall::RegisterResourceProvider => "register_resource_provider",
        }
    }

    /// The capability gating this call, or `None` for the always-granted
    /// core calls (logging, status, own-config access).
    pub fn capability(self) -> Option<&'static str> {
        match self {
            HostCall::Log | HostCall::SetStatus | HostCall::ReadConfig | HostCall::WriteConfig => {
                None
            }
            HostCall::Subscribe | HostCall::Unsubscribe => Some("data_read"),
            HostCall::PublishDelta => Some("data_write"),
            HostCall::HttpFetch => Some("network"),
            HostCall::SerialListPorts => Some("serial_ports"),
            HostCall::RegisterPutHandler => Some("put_handlers"),
            HostCall::RegisterResourceProvider => Some("resource_provider"),
        }
    }
}

/// Immutable capability grant attached to a plugin instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityGrant {
    caps: Capabilities,
}

impl CapabilityGrant {
    /// Build the grant for a declared capability set.
    ///
    /// The granted set is identical to the declared set; hosts that want to
    /// deny individual entries do so by editing the declaration before it
    /// reaches the gate.
    pub fn new(caps: Capabilities) -> Self {
        Self { caps }
    }

    /// Whether a host call is in the grant.
    pub fn allows(&self, call: HostCall) -> bool {
        match call {
            // Core calls every instance gets
            HostCall::Log | HostCall::SetStatus | HostCall::ReadConfig | HostCall::WriteConfig => {
                true
            }
            HostCall::Subscribe | HostCall::Unsubscribe => self.caps.data_read,
            HostCall::PublishDelta => self.caps.data_write,
            HostCall::HttpFetch => self.caps.network,
            HostCall::SerialListPorts => self.caps.serial_ports,
            HostCall::RegisterPutHandler => self.caps.put_handlers,
            HostCall::RegisterResourceProvider => self.caps.resource_provider,
        }
    }

    /// Storage mode for instantiation; `VfsOnly` pre-opens the plugin's
    /// `vfs/` directory as the guest's `/`, `None` pre-opens nothing.
    pub fn storage(&self) -> StorageMode {
        self.caps.storage
    }

    /// Whether the façade reads the guest's `http_endpoints` export.
    pub fn http_endpoints(&self) -> bool {
        self.caps.http_endpoints
    }

    /// The declared capability set backing this grant.
    pub fn declared(&self) -> &Capabilities {
        &self.caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_grant() {
        let grant = CapabilityGrant::new(Capabilities::default());
        // Defaults: data_read, data_write, storage=vfs_only, nothing else.
        assert!(grant.allows(HostCall::Subscribe));
        assert!(grant.allows(HostCall::Unsubscribe));
        assert!(grant.allows(HostCall::PublishDelta));
        assert!(!grant.allows(HostCall::HttpFetch));
        assert!(!grant.allows(HostCall::SerialListPorts));
        assert!(!grant.allows(HostCall::RegisterPutHandler));
        assert!(!grant.allows(HostCall::RegisterResourceProvider));
        assert_eq!(grant.storage(), StorageMode::VfsOnly);
    }

    #[test]
    fn test_core_calls_always_granted() {
        let nothing = Capabilities {
            data_read: false,
            data_write: false,
            storage: StorageMode::None,
            network: false,
            serial_ports: false,
            put_handlers: false,
            http_endpoints: false,
            resource_provider: false,
        };
        let grant = CapabilityGrant::new(nothing);
        assert!(grant.allows(HostCall::Log));
        assert!(grant.allows(HostCall::SetStatus));
        assert!(grant.allows(HostCall::ReadConfig));
        assert!(grant.allows(HostCall::WriteConfig));
        assert!(!grant.allows(HostCall::Subscribe));
        assert!(!grant.allows(HostCall::PublishDelta));
    }

    #[test]
    fn test_every_gated_call_names_its_capability() {
        for call in HostCall::ALL {
            let grant = CapabilityGrant::new(Capabilities::default());
            if !grant.allows(call) {
                assert!(
                    call.capability().is_some(),
                    "{} is denied by default yet names no capability",
                    call.name()
                );
            }
        }
    }

    #[test]
    fn test_network_capability_gates_fetch_only() {
        let caps = Capabilities {
            network: true,
            ..Capabilities::default()
        };
        let grant = CapabilityGrant::new(caps);
        assert!(grant.allows(HostCall::HttpFetch));
        assert!(!grant.allows(HostCall::SerialListPorts));
    }
}

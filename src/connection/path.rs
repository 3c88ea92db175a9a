//! Connection paths and electronic keys

use serde::{Deserialize, Serialize};

use super::{ConnectionClass, TransportTrigger};
use crate::config::{AssemblyConfig, IdentityConfig};
use crate::error::{AdapterError, Result};
use crate::io::AssemblyStore;
use crate::status::extended;

/// CIP class code of the Assembly object
pub const ASSEMBLY_CLASS: u16 = 0x04;
/// CIP class code of the Message Router
pub const MESSAGE_ROUTER_CLASS: u16 = 0x02;

/// Where a connection path points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathTarget {
    /// Assembly connection points of an I/O connection
    Assembly {
        config: Option<u32>,
        /// O->T (output) assembly instance
        consumed: u32,
        /// T->O (input) assembly instance
        produced: u32,
    },
    /// Class and instance targeted by an explicit connection
    Object { class_id: u16, instance: u32 },
}

/// Decoded connection path of a Forward_Open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionPath {
    pub electronic_key: Option<ElectronicKey>,
    pub target: PathTarget,
}

impl ConnectionPath {
    pub fn assembly(consumed: u32, produced: u32) -> Self {
        Self {
            electronic_key: None,
            target: PathTarget::Assembly {
                config: None,
                consumed,
                produced,
            },
        }
    }

    pub fn assembly_with_config(config: u32, consumed: u32, produced: u32) -> Self {
        Self {
            electronic_key: None,
            target: PathTarget::Assembly {
                config: Some(config),
                consumed,
                produced,
            },
        }
    }

    pub fn message_router() -> Self {
        Self {
            electronic_key: None,
            target: PathTarget::Object {
                class_id: MESSAGE_ROUTER_CLASS,
                instance: 1,
            },
        }
    }

    pub fn with_key(mut self, key: ElectronicKey) -> Self {
        self.electronic_key = Some(key);
        self
    }

    pub fn consumed_point(&self) -> Option<u32> {
        match self.target {
            PathTarget::Assembly { consumed, .. } => Some(consumed),
            PathTarget::Object { .. } => None,
        }
    }

    pub fn produced_point(&self) -> Option<u32> {
        match self.target {
            PathTarget::Assembly { produced, .. } => Some(produced),
            PathTarget::Object { .. } => None,
        }
    }

    /// Identity of the path for per-path consumer limits; the key is not
    /// part of it.
    pub(crate) fn points(&self) -> PathTarget {
        self.target
    }

    /// Decide the connection class the path and transport ask for.
    ///
    /// Explicit transports must address the Message Router. I/O
    /// transports must address assembly points the store knows; an O->T
    /// heartbeat instance selects input-only or listen-only.
    pub fn classify(
        &self,
        transport: &TransportTrigger,
        assemblies: &AssemblyConfig,
        store: &dyn AssemblyStore,
    ) -> Result<ConnectionClass> {
        match (transport.class, self.target) {
            (3, PathTarget::Object { class_id, instance }) => {
                if class_id == MESSAGE_ROUTER_CLASS && instance == 1 {
                    Ok(ConnectionClass::Explicit)
                } else {
                    Err(AdapterError::InvalidConnectionPath(format!(
                        "explicit connection to class 0x{:02X} instance {}",
                        class_id, instance
                    )))
                }
            }
            (3, PathTarget::Assembly { .. }) => Err(AdapterError::InvalidConnectionPath(
                "explicit connection must target the Message Router".into(),
            )),
            (_, PathTarget::Object { class_id, instance }) => {
                Err(AdapterError::InvalidConnectionPath(format!(
                    "I/O connection to class 0x{:02X} instance {} is not an assembly",
                    class_id, instance
                )))
            }
            (
                _,
                PathTarget::Assembly {
                    config,
                    consumed,
                    produced,
                },
            ) => {
                if let Some(config) = config {
                    if store.size_of(config).is_none() {
                        return Err(AdapterError::InvalidConnectionPath(format!(
                            "configuration assembly {} does not exist",
                            config
                        )));
                    }
                }
                if store.size_of(produced).is_none() {
                    return Err(AdapterError::InvalidConnectionPath(format!(
                        "T->O assembly {} does not exist",
                        produced
                    )));
                }
                if consumed == assemblies.heartbeat_input_only {
                    Ok(ConnectionClass::InputOnly)
                } else if consumed == assemblies.heartbeat_listen_only {
                    Ok(ConnectionClass::ListenOnly)
                } else if store.size_of(consumed).is_some() {
                    Ok(ConnectionClass::ExclusiveOwner)
                } else {
                    Err(AdapterError::InvalidConnectionPath(format!(
                        "O->T assembly {} does not exist",
                        consumed
                    )))
                }
            }
        }
    }
}

impl std::fmt::Display for ConnectionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.target {
            PathTarget::Assembly {
                config,
                consumed,
                produced,
            } => {
                if let Some(config) = config {
                    write!(f, "cfg {} ", config)?;
                }
                write!(f, "O->T {} T->O {}", consumed, produced)
            }
            PathTarget::Object { class_id, instance } => {
                write!(f, "class 0x{:02X} instance {}", class_id, instance)
            }
        }
    }
}

/// Electronic key segment; zero fields match anything
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElectronicKey {
    pub vendor_id: u16,
    pub device_type: u16,
    pub product_code: u16,
    pub major_revision: u8,
    pub minor_revision: u8,
    /// Accept any device that is compatible with the keyed revision
    pub compatibility: bool,
}

impl ElectronicKey {
    /// Key that exactly matches an identity
    pub fn exact(identity: &IdentityConfig) -> Self {
        Self {
            vendor_id: identity.vendor_id,
            device_type: identity.device_type,
            product_code: identity.product_code,
            major_revision: identity.major_revision,
            minor_revision: identity.minor_revision,
            compatibility: false,
        }
    }

    /// Check the key against our identity
    pub fn check(&self, identity: &IdentityConfig) -> Result<()> {
        let mismatch = |extended: u16, reason: String| {
            Err(AdapterError::ElectronicKeyMismatch { reason, extended })
        };

        if (self.vendor_id != 0 && self.vendor_id != identity.vendor_id)
            || (self.product_code != 0 && self.product_code != identity.product_code)
        {
            return mismatch(
                extended::VENDOR_OR_PRODUCT_CODE_MISMATCH,
                format!(
                    "key vendor {}/product {} vs device {}/{}",
                    self.vendor_id, self.product_code, identity.vendor_id, identity.product_code
                ),
            );
        }

        if self.device_type != 0 && self.device_type != identity.device_type {
            return mismatch(
                extended::DEVICE_TYPE_MISMATCH,
                format!(
                    "key device type {} vs device {}",
                    self.device_type, identity.device_type
                ),
            );
        }

        if self.major_revision != 0 {
            let revision_ok = if self.compatibility {
                self.major_revision == identity.major_revision
                    && self.minor_revision <= identity.minor_revision
            } else {
                self.major_revision == identity.major_revision
                    && (self.minor_revision == 0
                        || self.minor_revision == identity.minor_revision)
            };
            if !revision_ok {
                return mismatch(
                    extended::REVISION_MISMATCH,
                    format!(
                        "key revision {}.{} vs device {}.{}",
                        self.major_revision,
                        self.minor_revision,
                        identity.major_revision,
                        identity.minor_revision
                    ),
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryAssemblies;

    fn store() -> MemoryAssemblies {
        let mut store = MemoryAssemblies::new();
        store.insert(100, 32);
        store.insert(150, 32);
        store.insert(151, 0);
        store
    }

    #[test]
    fn test_classify_io_paths() {
        let cfg = AssemblyConfig::default();
        let store = store();
        let class1 = TransportTrigger::cyclic_class1();

        let eo = ConnectionPath::assembly_with_config(151, 150, 100);
        assert_eq!(
            eo.classify(&class1, &cfg, &store).unwrap(),
            ConnectionClass::ExclusiveOwner
        );

        let io = ConnectionPath::assembly(cfg.heartbeat_input_only, 100);
        assert_eq!(
            io.classify(&class1, &cfg, &store).unwrap(),
            ConnectionClass::InputOnly
        );

        let lo = ConnectionPath::assembly(cfg.heartbeat_listen_only, 100);
        assert_eq!(
            lo.classify(&class1, &cfg, &store).unwrap(),
            ConnectionClass::ListenOnly
        );
    }

    #[test]
    fn test_classify_rejects_unknown_assemblies() {
        let cfg = AssemblyConfig::default();
        let store = store();
        let class1 = TransportTrigger::cyclic_class1();

        for path in [
            ConnectionPath::assembly(150, 999),
            ConnectionPath::assembly(998, 100),
            ConnectionPath::assembly_with_config(997, 150, 100),
            ConnectionPath::message_router(),
        ] {
            assert!(matches!(
                path.classify(&class1, &cfg, &store),
                Err(AdapterError::InvalidConnectionPath(_))
            ));
        }
    }

    #[test]
    fn test_classify_explicit() {
        let cfg = AssemblyConfig::default();
        let store = store();
        let class3 = TransportTrigger::explicit_class3();

        assert_eq!(
            ConnectionPath::message_router()
                .classify(&class3, &cfg, &store)
                .unwrap(),
            ConnectionClass::Explicit
        );
        assert!(ConnectionPath::assembly(150, 100)
            .classify(&class3, &cfg, &store)
            .is_err());
    }

    #[test]
    fn test_electronic_key() {
        let identity = IdentityConfig::default();
        assert!(ElectronicKey::exact(&identity).check(&identity).is_ok());

        let wildcard = ElectronicKey {
            vendor_id: 0,
            device_type: 0,
            product_code: 0,
            major_revision: 0,
            minor_revision: 0,
            compatibility: false,
        };
        assert!(wildcard.check(&identity).is_ok());

        let wrong_vendor = ElectronicKey {
            vendor_id: 99,
            ..ElectronicKey::exact(&identity)
        };
        assert!(matches!(
            wrong_vendor.check(&identity),
            Err(AdapterError::ElectronicKeyMismatch {
                extended: extended::VENDOR_OR_PRODUCT_CODE_MISMATCH,
                ..
            })
        ));

        let older_minor = ElectronicKey {
            minor_revision: 1,
            compatibility: true,
            ..ElectronicKey::exact(&identity)
        };
        assert!(older_minor.check(&identity).is_ok());

        let newer_minor = ElectronicKey {
            minor_revision: 3,
            compatibility: true,
            ..ElectronicKey::exact(&identity)
        };
        assert!(matches!(
            newer_minor.check(&identity),
            Err(AdapterError::ElectronicKeyMismatch {
                extended: extended::REVISION_MISMATCH,
                ..
            })
        ));
    }
}

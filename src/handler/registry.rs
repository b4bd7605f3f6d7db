//! Handler registry keyed by protocol number.
//!
//! At most one handler may be registered per protocol, which also pins the
//! role this endpoint plays in it. Handlers can be looked up either by the
//! protocol number of an inbound message or by their concrete type, the way
//! application code finds e.g. the Store customer handler to issue requests.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::ProtocolHandler;
use crate::error::{error_codes, EtpError, Result};

struct Registration {
    handler: Arc<dyn ProtocolHandler>,
    instance: Arc<dyn Any + Send + Sync>,
}

/// Registry of protocol handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    by_protocol: BTreeMap<i32, Registration>,
    by_type: HashMap<TypeId, i32>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for its protocol.
    ///
    /// Fails when the protocol already has a handler, whatever its role.
    pub fn register<H: ProtocolHandler>(&mut self, handler: H) -> Result<Arc<H>> {
        let protocol = handler.protocol();
        if let Some(existing) = self.by_protocol.get(&protocol) {
            return Err(EtpError::Registration(format!(
                "protocol {} already registered with role {}",
                protocol,
                existing.handler.role()
            )));
        }

        let handler = Arc::new(handler);
        let instance: Arc<dyn Any + Send + Sync> = handler.clone();
        self.by_protocol.insert(
            protocol,
            Registration {
                handler: handler.clone(),
                instance,
            },
        );
        self.by_type.insert(TypeId::of::<H>(), protocol);
        Ok(handler)
    }

    /// Handler for `protocol`.
    pub fn get(&self, protocol: i32) -> Option<Arc<dyn ProtocolHandler>> {
        self.by_protocol.get(&protocol).map(|r| r.handler.clone())
    }

    /// Handler for `protocol`, or an UnsupportedProtocol violation.
    pub fn resolve(&self, protocol: i32) -> Result<Arc<dyn ProtocolHandler>> {
        self.get(protocol).ok_or_else(|| {
            EtpError::violation(
                error_codes::UNSUPPORTED_PROTOCOL,
                format!("Protocol not supported: {}", protocol),
            )
        })
    }

    /// Registered handler of concrete type `H`.
    pub fn handler<H: ProtocolHandler>(&self) -> Option<Arc<H>> {
        let protocol = self.by_type.get(&TypeId::of::<H>())?;
        let registration = self.by_protocol.get(protocol)?;
        registration.instance.clone().downcast::<H>().ok()
    }

    pub fn contains(&self, protocol: i32) -> bool {
        self.by_protocol.contains_key(&protocol)
    }

    /// Role this endpoint plays in `protocol`.
    pub fn role_of(&self, protocol: i32) -> Option<&str> {
        self.by_protocol.get(&protocol).map(|r| r.handler.role())
    }

    /// All handlers in protocol order.
    pub fn handlers(&self) -> impl Iterator<Item = &Arc<dyn ProtocolHandler>> + '_ {
        self.by_protocol.values().map(|r| &r.handler)
    }

    pub fn len(&self) -> usize {
        self.by_protocol.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_protocol.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries: Vec<(i32, &str)> = self
            .by_protocol
            .iter()
            .map(|(p, r)| (*p, r.handler.role()))
            .collect();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &entries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{BoxFuture, HandlerBase};
    use crate::protocol::MessageHeader;
    use crate::session::Session;
    use bytes::Bytes;

    #[derive(Debug)]
    struct Dummy {
        base: HandlerBase,
    }

    impl Dummy {
        fn new(protocol: i32, role: &str) -> Self {
            Self {
                base: HandlerBase::new(protocol, role, "other"),
            }
        }
    }

    impl ProtocolHandler for Dummy {
        fn base(&self) -> &HandlerBase {
            &self.base
        }

        fn handle_message<'a>(
            &'a self,
            _session: &'a Session,
            _header: MessageHeader,
            _body: Bytes,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[derive(Debug)]
    struct Other {
        base: HandlerBase,
    }

    impl ProtocolHandler for Other {
        fn base(&self) -> &HandlerBase {
            &self.base
        }

        fn handle_message<'a>(
            &'a self,
            _session: &'a Session,
            _header: MessageHeader,
            _body: Bytes,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = HandlerRegistry::new();
        let registered = registry.register(Dummy::new(4, "customer")).unwrap();

        assert!(registry.contains(4));
        assert_eq!(registry.role_of(4), Some("customer"));
        assert_eq!(registry.get(4).map(|h| h.protocol()), Some(4));

        let typed = registry.handler::<Dummy>().unwrap();
        assert!(Arc::ptr_eq(&typed, &registered));
        assert!(registry.handler::<Other>().is_none());
    }

    #[test]
    fn test_second_role_for_protocol_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register(Dummy::new(4, "customer")).unwrap();

        let err = registry
            .register(Other {
                base: HandlerBase::new(4, "store", "customer"),
            })
            .unwrap_err();
        assert!(matches!(err, EtpError::Registration(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_resolve_unknown_protocol() {
        let registry = HandlerRegistry::new();
        match registry.resolve(99) {
            Err(EtpError::ProtocolViolation { code, .. }) => {
                assert_eq!(code, error_codes::UNSUPPORTED_PROTOCOL)
            }
            _ => panic!("expected violation"),
        }
    }

    #[test]
    fn test_handlers_in_protocol_order() {
        let mut registry = HandlerRegistry::new();
        registry.register(Dummy::new(14, "customer")).unwrap();
        registry
            .register(Other {
                base: HandlerBase::new(0, "client", "server"),
            })
            .unwrap();
        let protocols: Vec<i32> = registry.handlers().map(|h| h.protocol()).collect();
        assert_eq!(protocols, vec![0, 14]);
    }
}

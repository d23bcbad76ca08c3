
use parking_lot::RwLock;

use std::sync::Arc;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Kernel interface index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterfaceId(libc::c_uint);

impl InterfaceId {
    pub const UNSPECIFIED: Self = Self(0);

    pub const fn new(index: libc::c_uint) -> Self {
        Self(index)
    }

    pub fn is_unspecified(&self) -> bool {
        self.0 == 0
    }

    /// Raw index, which may be 0 (unspecified).
    pub fn inner_unchecked(&self) -> libc::c_uint {
        self.0
    }
}

impl std::fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "if#{}", self.0)
    }
}

pub fn index_to_name(index: InterfaceId) -> Result<String, std::io::Error> {
    let ifname_buf = [0u8; libc::IFNAMSIZ];
    let ret = unsafe { libc::if_indextoname(index.inner_unchecked(), ifname_buf.as_ptr() as *mut libc::c_char) };
    if ret.is_null() {
        return Err(std::io::Error::last_os_error());
    }

    let name = unsafe { std::ffi::CStr::from_ptr(ret as *const libc::c_char) };
    Ok(name.to_string_lossy().into_owned())
}

pub fn name_to_index(name: &str) -> Result<InterfaceId, std::io::Error> {
    let index = nix::net::if_::if_nametoindex(name).map_err(std::io::Error::from)?;
    Ok(InterfaceId::new(index))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Interface {
    pub if_id: InterfaceId,
    pub if_name: String,
}

#[derive(Debug)]
pub(crate) struct InterfaceState {
    interfaces: RwLock<HashMap<InterfaceId, Interface>>,
    if_by_name: RwLock<HashMap<String, InterfaceId>>,
    link_local_addrs: RwLock<HashMap<InterfaceId, Vec<std::net::Ipv6Addr>>>,
}

impl InterfaceState {
    pub fn new() -> Self {
        Self {
            interfaces: RwLock::new(HashMap::new()),
            if_by_name: RwLock::new(HashMap::new()),
            link_local_addrs: RwLock::new(HashMap::new()),
        }
    }

    pub fn if_indexes(&self) -> Vec<InterfaceId> {
        self.interfaces.read().keys().copied().collect()
    }
}

/// Keeps the interface list and link-local addresses current by polling
/// rtnetlink in the background.
#[derive(Debug, Clone)]
pub struct InterfaceStateManager {
    state: Arc<InterfaceState>,
    _updater_join: crate::util::DropDetector,
}

impl InterfaceStateManager {
    pub async fn new() -> Result<Self, std::io::Error> {
        let rtnl = crate::rtnl::RtnetlinkConnection::new().await?;
        let state = Arc::new(InterfaceState::new());
        let state_clone = state.clone();
        let (init_sender, init_receiver) = oneshot::channel();
        let join = tokio::spawn(async move {
            let mut link_manager = rtnl.link();
            let addr_manager = rtnl.address();

            let mut init_sender = Some(init_sender);

            loop {
                let interfaces = match link_manager.get_all().await {
                    Ok(interfaces) => interfaces,
                    Err(e) => {
                        log::error!("failed to get interfaces: {}", e);
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        continue;
                    }
                };
                let mut interfaces_map = HashMap::new();
                let mut if_by_name = HashMap::new();
                for interface in interfaces {
                    if_by_name.insert(interface.if_name.clone(), interface.if_id);
                    interfaces_map.insert(interface.if_id, interface);
                }
                *state_clone.interfaces.write() = interfaces_map;
                *state_clone.if_by_name.write() = if_by_name;

                let mut link_local_addrs = HashMap::new();
                for if_id in state_clone.if_indexes() {
                    let addrs = match addr_manager.get_v6(if_id, crate::rtnl::addr::V6AddressRequestScope::LinkLocal).await {
                        Ok(addrs) => addrs,
                        Err(e) => {
                            log::error!("failed to get link-local addresses for interface {}: {}", if_id, e);
                            continue;
                        }
                    };
                    link_local_addrs.insert(if_id, addrs);
                }
                *state_clone.link_local_addrs.write() = link_local_addrs;

                if let Some(sender) = init_sender.take() {
                    let _ = sender.send(());
                }

                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
        });

        let updater_join = crate::util::DropDetector::new(move || {
            join.abort();
        });

        let _ = init_receiver.await;
        Ok(Self { state, _updater_join: updater_join })
    }

    pub fn get_index_by_name(&self, name: &str) -> Option<InterfaceId> {
        self.state.if_by_name.read().get(name).copied()
    }

    pub fn get_link_local_addr(&self, if_id: InterfaceId) -> Option<std::net::Ipv6Addr> {
        self.state.link_local_addrs.read().get(&if_id).and_then(|v| v.first().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_id() {
        assert!(InterfaceId::UNSPECIFIED.is_unspecified());
        let id = InterfaceId::new(3);
        assert!(!id.is_unspecified());
        assert_eq!(id.inner_unchecked(), 3);
        assert_eq!(id.to_string(), "if#3");
    }

    #[test]
    fn test_loopback_name_lookup() {
        let index = name_to_index("lo").unwrap();
        assert_eq!(index_to_name(index).unwrap(), "lo");
        assert!(name_to_index("no-such-interface0").is_err());
    }
}

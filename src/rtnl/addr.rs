
use futures::TryStreamExt;

use crate::interface::InterfaceId;

#[derive(Debug, Clone, Copy)]
pub enum V6AddressRequestScope {
    Global,
    LinkLocal,
}

pub struct AddressManager {
    handle: rtnetlink::AddressHandle,
}

impl AddressManager {
    pub(crate) fn new(handle: &super::RtnetlinkConnection) -> Self {
        Self { handle: handle.handle.address() }
    }

    /// IPv6 addresses of the given scope, on one interface or on all of them.
    pub async fn get_v6(&self, if_id: InterfaceId, scope: V6AddressRequestScope) -> Result<Vec<std::net::Ipv6Addr>, std::io::Error> {
        log::debug!("get_v6: if_id={}, scope={:?}", if_id, scope);
        let mut addrs = Vec::new();
        let mut req = self.handle.get();
        if !if_id.is_unspecified() {
            req = req.set_link_index_filter(if_id.inner_unchecked());
        }
        let response = req.execute();

        futures::pin_mut!(response);
        while let Some(response) = response.try_next().await.map_err(|e| std::io::Error::other(e))? {
            if response.header.family != netlink_packet_route::AddressFamily::Inet6 {
                continue;
            }
            if response.header.scope != match scope {
                V6AddressRequestScope::Global => netlink_packet_route::address::AddressScope::Universe,
                V6AddressRequestScope::LinkLocal => netlink_packet_route::address::AddressScope::Link,
            } {
                continue;
            }
            for addr in response.attributes.iter() {
                if let netlink_packet_route::address::AddressAttribute::Address(std::net::IpAddr::V6(addr)) = addr {
                    log::trace!("found address: {}", addr);
                    addrs.push(*addr);
                }
            }
        }
        Ok(addrs)
    }
}


use futures::TryStreamExt;

use netlink_packet_route::link::LinkAttribute;

use crate::interface::Interface;
use crate::interface::InterfaceId;

pub struct LinkManager {
    handle: rtnetlink::LinkHandle,
}

impl LinkManager {
    pub(crate) fn new(handle: &super::RtnetlinkConnection) -> Self {
        Self { handle: handle.handle.link() }
    }

    /// Every link with an index and a name.
    pub async fn get_all(&mut self) -> Result<Vec<Interface>, std::io::Error> {
        let mut interfaces = Vec::new();
        let response = self.handle.get().execute();
        futures::pin_mut!(response);
        while let Some(response) = response.try_next().await.map_err(std::io::Error::other)? {
            let if_index = response.header.index;
            if if_index == 0 {
                continue;
            }

            let if_name = response.attributes.iter().find_map(|attr| match attr {
                LinkAttribute::IfName(name) => Some(name.clone()),
                _ => None,
            });
            if let Some(if_name) = if_name {
                interfaces.push(Interface { if_id: InterfaceId::new(if_index), if_name });
            }
        }
        log::trace!("found {} links", interfaces.len());
        Ok(interfaces)
    }
}

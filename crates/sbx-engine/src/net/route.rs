//! Default-route discovery through the kernel routing table.

use futures::TryStreamExt;
use netlink_packet_route::link::LinkAttribute;
use netlink_packet_route::route::RouteAttribute;

use sbx_types::{Error, Result};

/// Returns the name of the link carrying the first IPv4 default route.
pub async fn default_outbound_interface() -> Result<String> {
    let (conn, handle, _) = rtnetlink::new_connection()
        .map_err(|e| Error::transport("could not open netlink socket", e))?;
    tokio::spawn(conn);

    let mut routes = handle.route().get(rtnetlink::IpVersion::V4).execute();
    loop {
        let route = routes
            .try_next()
            .await
            .map_err(|e| Error::transport("could not dump routes", e))?;
        let Some(route) = route else { break };
        if route.header.destination_prefix_length != 0 {
            continue;
        }
        let oif = route.attributes.iter().find_map(|attr| match attr {
            RouteAttribute::Oif(index) => Some(*index),
            _ => None,
        });
        if let Some(index) = oif {
            return link_name(&handle, index).await;
        }
    }
    Err(Error::NotFound("no IPv4 default route on this host".into()))
}

async fn link_name(handle: &rtnetlink::Handle, index: u32) -> Result<String> {
    let mut links = handle.link().get().match_index(index).execute();
    let link = links
        .try_next()
        .await
        .map_err(|e| Error::transport(format!("could not query link index {index}"), e))?
        .ok_or_else(|| Error::NotFound(format!("link index {index} does not exist")))?;
    link.attributes
        .iter()
        .find_map(|attr| match attr {
            LinkAttribute::IfName(name) => Some(name.clone()),
            _ => None,
        })
        .ok_or_else(|| Error::transport_msg(format!("link index {index} has no name")))
}

//! TAP device lifecycle. The device itself is created through the
//! `/dev/net/tun` ioctl protocol and made persistent, owned by the current
//! user so the hypervisor can open it without elevation; addressing and link
//! state go over rtnetlink.

use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::AsRawFd;

use futures::TryStreamExt;
use tracing::debug;

use sbx_types::{Error, Result};

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const TUNSETPERSIST: libc::c_ulong = 0x4004_54cb;
const TUNSETOWNER: libc::c_ulong = 0x4004_54cc;
const TUNSETGROUP: libc::c_ulong = 0x4004_54ce;

/// Creates the TAP link if missing, assigns `gateway/24` to it, and brings it
/// up. An existing link is only brought up, so repeated starts are safe.
pub async fn ensure_tap(name: &str, gateway: &str) -> Result<()> {
    let gateway: Ipv4Addr = gateway
        .parse()
        .map_err(|_| Error::NotValid(format!("invalid gateway address {gateway:?}")))?;
    if name.is_empty() || name.len() >= libc::IFNAMSIZ {
        return Err(Error::NotValid(format!(
            "tap name {name:?} must be 1..{} characters",
            libc::IFNAMSIZ - 1
        )));
    }

    let (conn, handle, _) = rtnetlink::new_connection()
        .map_err(|e| Error::transport("could not open netlink socket", e))?;
    tokio::spawn(conn);

    if let Some(index) = link_index(&handle, name).await? {
        debug!(tap = name, "tap already present, bringing up");
        link_up(&handle, index).await?;
        return Ok(());
    }

    create_tap_device(name)?;
    let index = link_index(&handle, name)
        .await?
        .ok_or_else(|| Error::transport_msg(format!("tap {name} vanished after creation")))?;

    match handle
        .address()
        .add(index, IpAddr::V4(gateway), 24)
        .execute()
        .await
    {
        Ok(()) => {}
        // Re-assigning the same address on a leftover link is fine.
        Err(rtnetlink::Error::NetlinkError(ref msg)) if msg.raw_code() == -libc::EEXIST => {}
        Err(e) => return Err(Error::transport(format!("could not address tap {name}"), e)),
    }
    link_up(&handle, index).await
}

/// Removes the TAP link. A missing link is not an error.
pub async fn delete_tap(name: &str) -> Result<()> {
    let (conn, handle, _) = rtnetlink::new_connection()
        .map_err(|e| Error::transport("could not open netlink socket", e))?;
    tokio::spawn(conn);

    let Some(index) = link_index(&handle, name).await? else {
        return Ok(());
    };
    handle
        .link()
        .del(index)
        .execute()
        .await
        .map_err(|e| Error::transport(format!("could not delete tap {name}"), e))
}

async fn link_up(handle: &rtnetlink::Handle, index: u32) -> Result<()> {
    handle
        .link()
        .set(index)
        .up()
        .execute()
        .await
        .map_err(|e| Error::transport("could not bring link up", e))
}

async fn link_index(handle: &rtnetlink::Handle, name: &str) -> Result<Option<u32>> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(Some(link)) => Ok(Some(link.header.index)),
        Ok(None) => Ok(None),
        // The kernel answers a lookup for an unknown name with an error
        // rather than an empty dump.
        Err(rtnetlink::Error::NetlinkError(_)) => Ok(None),
        Err(e) => Err(Error::transport(format!("could not query link {name}"), e)),
    }
}

fn create_tap_device(name: &str) -> Result<()> {
    #[repr(C)]
    struct IfReq {
        name: [u8; libc::IFNAMSIZ],
        flags: libc::c_short,
        _pad: [u8; 22],
    }

    let tun = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/net/tun")
        .map_err(|e| Error::transport("could not open /dev/net/tun", e))?;
    let fd = tun.as_raw_fd();

    let mut req = IfReq {
        name: [0; libc::IFNAMSIZ],
        flags: (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short,
        _pad: [0; 22],
    };
    req.name[..name.len()].copy_from_slice(name.as_bytes());

    // SAFETY: fd is a freshly opened tun control fd and req outlives the call.
    let rc = unsafe { libc::ioctl(fd, TUNSETIFF, &mut req) };
    if rc < 0 {
        return Err(Error::transport(
            format!("TUNSETIFF failed for {name}"),
            std::io::Error::last_os_error(),
        ));
    }
    let uid = nix::unistd::geteuid().as_raw();
    let gid = nix::unistd::getegid().as_raw();
    for (request, arg, what) in [
        (TUNSETPERSIST, 1 as libc::c_ulong, "TUNSETPERSIST"),
        (TUNSETOWNER, uid as libc::c_ulong, "TUNSETOWNER"),
        (TUNSETGROUP, gid as libc::c_ulong, "TUNSETGROUP"),
    ] {
        // SAFETY: plain integer argument ioctls on the same fd.
        let rc = unsafe { libc::ioctl(fd, request, arg) };
        if rc < 0 {
            return Err(Error::transport(
                format!("{what} failed for {name}"),
                std::io::Error::last_os_error(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bad_gateway_literal_is_rejected_before_any_netlink_work() {
        let err = ensure_tap("sbx-0a0b", "not-an-ip").await.unwrap_err();
        assert_eq!(err.kind(), sbx_types::ErrorKind::NotValid);
    }

    #[tokio::test]
    async fn oversized_tap_name_is_rejected() {
        let err = ensure_tap("this-name-is-way-too-long", "10.1.2.1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), sbx_types::ErrorKind::NotValid);
    }
}

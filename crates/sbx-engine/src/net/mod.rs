//! Host network fabric for sandboxes: per-sandbox TAP devices, the `sbx`
//! nftables table, and default-route discovery. All link and address work
//! goes over netlink; packet rules are applied as one transaction per
//! install.

mod nft;
mod route;
mod tap;

pub use nft::{
    cleanup_nat, cleanup_proxy_redirect, install_nat, install_proxy_redirect, NatSpec,
    RedirectSpec,
};
pub use route::default_outbound_interface;
pub use tap::{delete_tap, ensure_tap};

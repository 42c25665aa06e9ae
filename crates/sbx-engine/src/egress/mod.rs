//! Guest egress interception: the transparent TCP proxy, its paired UDP DNS
//! forwarder, the protocol classifier, and the policy matcher. The proxy and
//! forwarder run inside the separately spawned `sbx-egress-proxy` process;
//! the orchestrator only installs the DNAT rules steering traffic at them.

pub mod classify;
pub mod dns;
pub mod policy;
pub mod proxy;

pub use classify::{classify, ClassifyResult, Protocol};
pub use policy::PolicyMatcher;

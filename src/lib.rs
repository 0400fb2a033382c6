//! Rewrites the ConnectionRequestURL that TR-069 CPEs report in their CWMP
//! messages, so an ACS reaches them through a connection request proxy.

pub mod cwmp;
pub mod http;
pub mod tcp_proxy;

//! HTTP front end: connections, the ingress queue, TLS identity and shutdown.

pub mod config;
pub mod connection;
pub mod handlers;
pub mod ingress;
pub mod listener;
pub mod middleware;
pub mod module;
pub mod shutdown;
pub mod tls;

pub use config::{NetworkConfig, TlsConfig, TrustedProxy};
pub use connection::{Connection, ConnectionError, ConnectionId, RequestHead, RpcResponse};
pub use listener::{ingress_channel, AcceptError, ChannelListener, IngressSender, Listener};
pub use module::NetworkModule;
pub use shutdown::{HealthState, InFlightGuard, ShutdownController};
pub use tls::{ClientCertAcceptor, ClientCertificate, ClientTrust, TlsPeer};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;


/// Boundary to the application layer: every message payload extracted from a live
///  connection is handed over through this trait, in the order the carrying packets
///  arrived (which is not necessarily sequence-number order).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, sender: SocketAddr, msg_buf: &[u8]);
}

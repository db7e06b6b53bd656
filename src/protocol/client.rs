use std::net::SocketAddr;

use crate::error::Result;
use crate::net::Network;
use crate::protocol::{Command, Message, MessageState};

/// Open a connection, send `command` and `message`, and return the single reply.
///
/// A remote failure comes back as an `error` message; callers surface it by
/// verifying the reply.
pub async fn request<S: MessageState>(
    network: &dyn Network,
    addr: SocketAddr,
    command: Command,
    message: &Message<S>,
) -> Result<Message> {
    let mut link = network.connect(addr).await?;
    let reply = async {
        link.send_command(command).await?;
        link.send(message).await?;
        link.receive().await
    }
    .await;
    link.close().await;
    reply
}

/// Send a one-way notification and wait for its acknowledgement.
pub async fn notify<S: MessageState>(
    network: &dyn Network,
    addr: SocketAddr,
    command: Command,
    message: &Message<S>,
) -> Result<()> {
    request(network, addr, command, message).await?.verify_ack()
}

pub mod agent;
pub mod client;
pub mod coordinator;
pub mod entity;
pub mod registry;

pub use client::ObexClient;
pub use coordinator::{
    Decision, IncomingRequest, RejectingPrompt, TransferCoordinator, TransferEvent, TransferPrompt,
};
pub use entity::{SessionInfo, Transfer, TransferDirection, TransferStatus};
pub use registry::TransferRegistry;

/// The object path one level above `path`. A transfer's parent is its
/// session.
pub(crate) fn parent_path(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

#[cfg(test)]
mod tests {
    use super::parent_path;

    #[test]
    fn parent_of_a_transfer_is_its_session() {
        assert_eq!(
            parent_path("/org/bluez/obex/client/session0/transfer0"),
            "/org/bluez/obex/client/session0"
        );
        assert_eq!(parent_path("/org"), "/");
        assert_eq!(parent_path("/"), "/");
    }
}

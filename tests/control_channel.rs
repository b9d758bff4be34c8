use autopin::ErrorKind;
use autopin::os::control::{ChannelStatus, ControlChannel};
use autopin_shared::control::{ControlMessage, EventKind, MESSAGE_SIZE};
use nix::sys::socket::{
    AddressFamily, MsgFlags, SockFlag, SockType, UnixAddr, connect, recv, send, socket,
};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::time::Duration;

fn connect_client(path: &Path) -> OwnedFd {
    let fd = socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .unwrap();
    connect(fd.as_raw_fd(), &UnixAddr::new(path).unwrap()).unwrap();
    fd
}

fn client_recv(fd: &OwnedFd) -> ControlMessage {
    let mut buffer = [0u8; MESSAGE_SIZE];
    let read = recv(fd.as_raw_fd(), &mut buffer, MsgFlags::empty()).unwrap();
    ControlMessage::from_bytes(&buffer[..read]).unwrap()
}

fn client_send(fd: &OwnedFd, kind: EventKind, arg: i32, value: f64) {
    let message = ControlMessage::new(kind, arg, value);
    send(fd.as_raw_fd(), &message.to_bytes(), MsgFlags::empty()).unwrap();
}

#[test_log::test(tokio::test)]
async fn test_open_rejects_long_path_without_leaking() {
    let dir = tempfile::tempdir().unwrap();
    let long_path = dir.path().join("s".repeat(120));
    let mut channel = ControlChannel::new();

    let err = channel.open(&long_path).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Comm);
    assert_eq!(err.tag(), "comm_target");
    assert_eq!(channel.status(), ChannelStatus::Unbound);
    assert!(!long_path.exists());

    let path = dir.path().join("autopin.sock");
    channel.open(&path).unwrap();
    assert_eq!(channel.status(), ChannelStatus::Listening);
    assert!(path.exists());

    let err = channel.open(&path).unwrap_err();
    assert_eq!(err.tag(), "already_initialized");
}

#[test_log::test(tokio::test)]
async fn test_send_before_connect() {
    let dir = tempfile::tempdir().unwrap();
    let mut channel = ControlChannel::new();

    let err = channel.send(EventKind::SetInterval, 10, 0.0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Comm);
    assert_eq!(err.tag(), "not_initialized");

    channel.open(&dir.path().join("autopin.sock")).unwrap();
    let err = channel.send(EventKind::SetInterval, 10, 0.0).unwrap_err();
    assert_eq!(err.tag(), "not_initialized");
    assert_eq!(channel.status(), ChannelStatus::Listening);
}

#[test_log::test(tokio::test)]
async fn test_connect_timeout_keeps_listening() {
    let dir = tempfile::tempdir().unwrap();
    let mut channel = ControlChannel::new();

    let err = channel.connect(0).await.unwrap_err();
    assert_eq!(err.tag(), "not_initialized");

    channel.open(&dir.path().join("autopin.sock")).unwrap();
    let err = channel.connect(0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Comm);
    assert_eq!(channel.status(), ChannelStatus::Listening);
}

#[test_log::test(tokio::test)]
async fn test_exchange_messages() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("autopin.sock");
    let mut channel = ControlChannel::new();
    channel.open(&path).unwrap();

    // Queued in the backlog until the channel accepts it
    let client = connect_client(&path);
    channel.connect(1).await.unwrap();
    assert_eq!(channel.status(), ChannelStatus::Connected);
    assert_eq!(client_recv(&client).kind(), Some(EventKind::Ready));

    client_send(&client, EventKind::PhaseChanged, 2, 0.0);
    client_send(&client, EventKind::UserEvent, 5, 1.5);

    let mut received = Vec::new();
    while received.len() < 2 {
        let batch = tokio::time::timeout(Duration::from_secs(5), channel.recv_batch())
            .await
            .unwrap()
            .unwrap();
        received.extend(batch);
    }
    assert_eq!(
        received,
        vec![
            ControlMessage::new(EventKind::PhaseChanged, 2, 0.0),
            ControlMessage::new(EventKind::UserEvent, 5, 1.5),
        ]
    );

    channel.send(EventKind::SetInterval, 250, 0.0).unwrap();
    let message = client_recv(&client);
    assert_eq!(message.kind(), Some(EventKind::SetInterval));
    assert_eq!(message.arg, 250);

    channel.close();
    assert_eq!(channel.status(), ChannelStatus::Unbound);
    assert!(!path.exists());
    channel.close();
}

#[test_log::test(tokio::test)]
async fn test_peer_hangup_stops_receiving() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("autopin.sock");
    let mut channel = ControlChannel::new();
    channel.open(&path).unwrap();

    let client = connect_client(&path);
    channel.connect(1).await.unwrap();
    // Unread data on close would surface as a reset instead of a hang up
    assert_eq!(client_recv(&client).kind(), Some(EventKind::Ready));
    drop(client);

    let batch = tokio::time::timeout(Duration::from_secs(5), channel.recv_batch())
        .await
        .unwrap()
        .unwrap();
    assert!(batch.is_empty());
    assert!(!channel.is_receiving());
    assert_eq!(channel.status(), ChannelStatus::Connected);
}

#[test_log::test(tokio::test)]
async fn test_open_replaces_stale_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("autopin.sock");

    let stale = std::os::unix::net::UnixListener::bind(&path).unwrap();
    drop(stale);
    assert!(path.exists());

    let mut channel = ControlChannel::new();
    channel.open(&path).unwrap();
    assert_eq!(channel.status(), ChannelStatus::Listening);
}

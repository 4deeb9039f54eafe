use rouilleftpd_core::{
    ActiveMode, DataChannelError, DataChannelManager, DataMode, DataTransport, Ipc, IpcMessage,
    ModeKind, PassivePortPool, PortAllocator, Session,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

#[derive(Default)]
struct RecordingAllocator {
    freed: Mutex<Vec<u16>>,
}

impl RecordingAllocator {
    fn freed(&self) -> Vec<u16> {
        self.freed.lock().unwrap().clone()
    }
}

impl PortAllocator for RecordingAllocator {
    fn free_passive_port(&self, port: u16) {
        self.freed.lock().unwrap().push(port);
    }
}

fn setup() -> (DataChannelManager, Arc<RecordingAllocator>) {
    let _ = rouilleftpd_core::core_log::try_init_logger();
    let allocator = Arc::new(RecordingAllocator::default());
    let manager = DataChannelManager::new(LOCALHOST, allocator.clone());
    (manager, allocator)
}

fn free_port() -> u16 {
    let spare = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
    spare.local_addr().unwrap().port()
}

async fn read_exactly(transport: &mut DataTransport, len: usize) -> Vec<u8> {
    let mut data = vec![0; len];
    let mut filled = 0;
    while filled < len {
        let n = transport.read(&mut data[filled..]).await.unwrap();
        assert_ne!(n, 0, "peer closed early");
        filled += n;
    }
    data
}

#[tokio::test]
async fn test_passive_transfer_accounting() {
    let (manager, allocator) = setup();
    let port = free_port();
    let mut session = Session::new(LOCALHOST);
    session.enter_passive(port);

    let mut channel = manager.create(&mut session).await.expect("listener");
    let (transport, client) = tokio::join!(
        channel.establish(&mut session),
        TcpStream::connect((LOCALHOST, port))
    );
    let mut transport = transport.unwrap();
    let mut client = client.unwrap();

    let info = session.data_channel.clone().expect("live channel");
    assert_eq!(info.kind, ModeKind::Passive);
    assert_eq!(info.peer, client.local_addr().unwrap());
    assert!(session.is_transferring());

    client.write_all(b"hello").await.unwrap();
    assert_eq!(read_exactly(&mut transport, 5).await, b"hello");
    transport.write_all(b"bye").await.unwrap();

    let mut reply = [0u8; 3];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"bye");
    assert_eq!(transport.bytes_read(), 5);
    assert_eq!(transport.bytes_written(), 3);

    let bytes = channel.release(&mut session, transport).await;

    assert_eq!(bytes, 8);
    assert_eq!(session.bytes_transferred, 8);
    assert!(session.data_channel.is_none());
    assert_eq!(allocator.freed(), vec![port]);
    assert_eq!(session.mode.passive().unwrap().port, 0);

    // The listener serves one connection only.
    assert!(TcpStream::connect((LOCALHOST, port)).await.is_err());

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_bytes_transferred_accumulates() {
    let (manager, allocator) = setup();
    let mut session = Session::new(LOCALHOST);

    for round in 1..=2u64 {
        let port = free_port();
        session.enter_passive(port);

        let mut channel = manager.create(&mut session).await.unwrap();
        let (transport, client) = tokio::join!(
            channel.establish(&mut session),
            TcpStream::connect((LOCALHOST, port))
        );
        let mut transport = transport.unwrap();
        let mut client = client.unwrap();

        client.write_all(b"0123456789").await.unwrap();
        read_exactly(&mut transport, 10).await;
        channel.release(&mut session, transport).await;

        assert_eq!(session.bytes_transferred, 10 * round);
        assert_eq!(allocator.freed().len() as u64, round);
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_passive_rejects_foreign_address() {
    let (manager, allocator) = setup();
    let port = free_port();
    let mut session = Session::new(LOCALHOST);
    session.enter_passive(port);

    let mut channel = manager.create(&mut session).await.unwrap();

    let intruder = async {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)), 0)).unwrap();
        let mut stream = socket.connect(SocketAddr::new(LOCALHOST, port)).await.unwrap();

        // Dropped by the server: EOF or reset.
        let mut buf = [0u8; 16];
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => {}
            Ok(n) => panic!("intruder received {} bytes", n),
        }

        // The listener is still waiting for the real client.
        TcpStream::connect((LOCALHOST, port)).await.unwrap()
    };

    let (transport, client) = tokio::join!(channel.establish(&mut session), intruder);
    let transport = transport.unwrap();

    assert_eq!(transport.peer_addr(), client.local_addr().unwrap());
    assert_eq!(
        session.data_channel.as_ref().unwrap().peer.ip(),
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    );
    assert!(allocator.freed().is_empty());

    channel.release(&mut session, transport).await;
    assert_eq!(allocator.freed(), vec![port]);
}

#[tokio::test]
async fn test_passive_mismatch_never_assigned() {
    let (manager, allocator) = setup();
    let port = free_port();
    // The control connection came from somewhere else than loopback.
    let mut session = Session::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
    session.enter_passive(port);

    let manager = manager.with_timeout(Duration::from_millis(300));
    let mut channel = manager.create(&mut session).await.unwrap();

    let intruder = async {
        let mut stream = TcpStream::connect((LOCALHOST, port)).await.unwrap();
        let mut buf = [0u8; 1];
        matches!(stream.read(&mut buf).await, Ok(0) | Err(_))
    };

    let (result, dropped) = tokio::join!(channel.establish(&mut session), intruder);

    assert!(dropped);
    assert!(matches!(result, Err(DataChannelError::Timeout(_))));
    assert!(session.data_channel.is_none());
    // Timing out ends the listener lifecycle.
    assert_eq!(allocator.freed(), vec![port]);
    assert_eq!(session.mode.passive().unwrap().port, 0);

    channel.close(&mut session);
    assert_eq!(allocator.freed(), vec![port]);
}

#[tokio::test]
async fn test_establish_twice() {
    let (manager, _) = setup();
    let port = free_port();
    let mut session = Session::new(LOCALHOST);
    session.enter_passive(port);

    let mut channel = manager.create(&mut session).await.unwrap();
    let (transport, _client) = tokio::join!(
        channel.establish(&mut session),
        TcpStream::connect((LOCALHOST, port))
    );
    let transport = transport.unwrap();

    assert!(matches!(
        channel.establish(&mut session).await,
        Err(DataChannelError::AlreadyEstablished)
    ));

    channel.release(&mut session, transport).await;
}

#[tokio::test]
async fn test_dropped_channel_frees_port_once() {
    let (manager, allocator) = setup();
    let port = free_port();
    let mut session = Session::new(LOCALHOST);
    session.enter_passive(port);

    // A handler bailing out with `?` after the connection came in.
    let mut channel = manager.create(&mut session).await.unwrap();
    let (transport, _client) = tokio::join!(
        channel.establish(&mut session),
        TcpStream::connect((LOCALHOST, port))
    );
    drop(transport.unwrap());
    drop(channel);

    assert_eq!(allocator.freed(), vec![port]);
    assert_eq!(session.mode.passive().unwrap().port, 0);

    assert!(manager.create(&mut session).await.is_none());
    assert_eq!(allocator.freed(), vec![port]);
}

#[tokio::test]
async fn test_active_transfer_resets_destination() {
    let (manager, allocator) = setup();
    let client_listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let client_port = client_listener.local_addr().unwrap().port();

    let mut session = Session::new(LOCALHOST);
    session.enter_active(LOCALHOST, client_port);

    let mut channel = manager.create(&mut session).await.expect("socket");
    assert_eq!(channel.kind(), ModeKind::Active);
    assert_eq!(channel.local_port(), None);

    let (transport, accepted) = tokio::join!(channel.establish(&mut session), client_listener.accept());
    let mut transport = transport.unwrap();
    let (mut client, _) = accepted.unwrap();

    assert_eq!(transport.peer_addr(), SocketAddr::new(LOCALHOST, client_port));
    assert_eq!(session.data_channel.as_ref().unwrap().kind, ModeKind::Active);

    let mut file: &[u8] = b"file contents";
    let sent = transport.send_from(&mut file).await.unwrap();
    assert_eq!(sent, 13);

    let bytes = channel.release(&mut session, transport).await;
    assert_eq!(bytes, 13);
    assert_eq!(session.bytes_transferred, 13);
    assert!(session.data_channel.is_none());
    assert_eq!(session.mode, DataMode::Active(ActiveMode::default()));
    assert!(allocator.freed().is_empty());

    let mut received = Vec::new();
    client.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"file contents");
}

#[tokio::test]
async fn test_active_upload() {
    let (manager, _) = setup();
    let client_listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let client_port = client_listener.local_addr().unwrap().port();

    let mut session = Session::new(LOCALHOST);
    session.enter_active(LOCALHOST, client_port);

    let mut channel = manager.create(&mut session).await.unwrap();
    let (transport, accepted) = tokio::join!(channel.establish(&mut session), client_listener.accept());
    let mut transport = transport.unwrap();
    let (mut client, _) = accepted.unwrap();

    client.write_all(b"uploaded bytes").await.unwrap();
    client.shutdown().await.unwrap();

    let mut stored: Vec<u8> = Vec::new();
    let received = transport.receive_into(&mut stored).await.unwrap();
    assert_eq!(received, 14);
    assert_eq!(stored, b"uploaded bytes");

    assert_eq!(channel.release(&mut session, transport).await, 14);
}

#[tokio::test]
async fn test_active_connect_failure() {
    let (manager, _) = setup();
    let mut session = Session::new(LOCALHOST);
    session.enter_active(LOCALHOST, free_port());

    let mut channel = manager.create(&mut session).await.unwrap();
    let result = channel.establish(&mut session).await;

    match result {
        Err(e @ DataChannelError::Connect { .. }) => {
            assert_eq!(e.to_ftp_response(), "425 Can't open data connection.\r\n");
        }
        other => panic!("expected connect failure, got {:?}", other.map(|_| ())),
    }
    assert!(session.data_channel.is_none());
    assert_eq!(session.mode, DataMode::Active(ActiveMode::default()));
    assert_eq!(session.bytes_transferred, 0);
}

#[tokio::test]
async fn test_passive_ports_return_to_pool() {
    let _ = rouilleftpd_core::core_log::try_init_logger();
    let base = free_port();
    let pool = Arc::new(PassivePortPool::new(base, base));
    let (ipc, mut receiver) = Ipc::channel();
    let manager = DataChannelManager::new(LOCALHOST, Arc::new(ipc));

    let port = pool.reserve().unwrap();
    let mut session = Session::new(LOCALHOST);
    session.enter_passive(port);

    let channel = manager.create(&mut session).await.unwrap();
    channel.close(&mut session);

    let message = receiver.recv().await.unwrap();
    assert_eq!(message, IpcMessage::FreePassivePort { port });
    assert!(receiver.try_recv().is_err());

    assert!(pool.free(port));
    assert_eq!(pool.reserve(), Some(port));
}

#[tokio::test]
async fn test_peer_reset_mid_transfer_is_accounted() {
    let (manager, allocator) = setup();
    let port = free_port();
    let mut session = Session::new(LOCALHOST);
    session.enter_passive(port);

    let mut channel = manager.create(&mut session).await.unwrap();
    let (transport, client) = tokio::join!(
        channel.establish(&mut session),
        TcpStream::connect((LOCALHOST, port))
    );
    let mut transport = transport.unwrap();
    let mut client = client.unwrap();

    let payload = vec![0x5a_u8; 16 * 1024 * 1024];
    let reader = async move {
        let mut buf = vec![0u8; 64 * 1024];
        let mut received = 0usize;
        while received < 1024 * 1024 {
            let n = client.read(&mut buf).await.unwrap();
            assert_ne!(n, 0);
            received += n;
        }
        // Closing with unread data makes the kernel answer with a reset.
        drop(client);
        received
    };

    let (result, received) = tokio::join!(transport.write_all(&payload), reader);
    assert!(result.is_err());

    let written = transport.bytes_written();
    assert!(written >= received as u64, "{} < {}", written, received);
    assert!(written < payload.len() as u64);

    let bytes = channel.release(&mut session, transport).await;
    assert_eq!(bytes, written);
    assert_eq!(session.bytes_transferred, written);
    assert!(session.data_channel.is_none());
    assert_eq!(allocator.freed(), vec![port]);

    // The session carries on with the next transfer.
    let next = free_port();
    session.enter_passive(next);
    let channel = manager.create(&mut session).await.expect("next listener");
    channel.close(&mut session);
    assert_eq!(allocator.freed(), vec![port, next]);
}

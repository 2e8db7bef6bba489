use bytes::Bytes;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tftp_upload::{
    AuditLogger, TftpConfig, TftpError, UploadOutcome, UploadServer, bind_rendezvous,
    receive_file,
};
use tftp_upload_core::{
    ErrorCode, ErrorCondition, Opcode, encode_ack, encode_data, encode_error, encode_request,
};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

struct TestClient {
    socket: UdpSocket,
    rendezvous: SocketAddr,
}

impl TestClient {
    async fn new(rendezvous: SocketAddr) -> std::io::Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind("127.0.0.1:0").await?,
            rendezvous,
        })
    }

    async fn write_request(&self, filename: &str, options: &[(&str, &str)]) -> std::io::Result<()> {
        let packet = encode_request(Opcode::Wrq, filename, "octet", options);
        self.socket.send_to(&packet, self.rendezvous).await?;
        Ok(())
    }

    async fn send_raw(&self, packet: &[u8], to: SocketAddr) -> std::io::Result<()> {
        self.socket.send_to(packet, to).await?;
        Ok(())
    }

    async fn send_data(&self, to: SocketAddr, block: u16, payload: &[u8]) -> std::io::Result<()> {
        self.send_raw(&encode_data(block, payload), to).await
    }

    async fn recv(&self) -> Result<(Bytes, SocketAddr), Box<dyn std::error::Error>> {
        recv_on(&self.socket).await
    }
}

async fn recv_on(socket: &UdpSocket) -> Result<(Bytes, SocketAddr), Box<dyn std::error::Error>> {
    let mut buf = vec![0u8; 65536];
    let (len, from) = tokio::time::timeout(RECV_TIMEOUT, socket.recv_from(&mut buf)).await??;
    buf.truncate(len);
    Ok((Bytes::from(buf), from))
}

fn test_config(root: &Path) -> TftpConfig {
    let mut config = TftpConfig {
        root_dir: root.to_path_buf(),
        ..TftpConfig::default()
    };
    config.transfer.retransmit_timeout_ms = 200;
    config
}

fn start_server(
    config: TftpConfig,
) -> Result<(SocketAddr, JoinHandle<tftp_upload::Result<UploadOutcome>>), Box<dyn std::error::Error>>
{
    let socket = bind_rendezvous("127.0.0.1:0".parse()?)?;
    let addr = socket.local_addr()?;
    let server = UploadServer::new(config)?.with_audit(AuditLogger::disabled());
    let handle = tokio::spawn(async move { server.serve_on(socket, None).await });
    Ok((addr, handle))
}

fn error_packet(code: ErrorCode) -> Bytes {
    encode_error(&ErrorCondition::from(code))
}

#[tokio::test]
async fn plain_upload_acks_each_block() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (rendezvous, server) = start_server(test_config(dir.path()))?;
    let client = TestClient::new(rendezvous).await?;

    client.write_request("a.bin", &[]).await?;
    let (ack, transfer) = client.recv().await?;
    assert_eq!(ack, encode_ack(0));
    assert_ne!(transfer.port(), rendezvous.port());

    client.send_data(transfer, 1, &[0xAA; 512]).await?;
    assert_eq!(client.recv().await?.0, encode_ack(1));

    client.send_data(transfer, 2, &[0xBB; 10]).await?;
    assert_eq!(client.recv().await?.0, encode_ack(2));

    let outcome = server.await??;
    assert_eq!(outcome.path, dir.path().join("a.bin"));
    assert_eq!(outcome.bytes, 522);
    assert_eq!(outcome.blocks, 2);

    let contents = std::fs::read(dir.path().join("a.bin"))?;
    assert_eq!(contents.len(), 522);
    assert_eq!(&contents[..512], &[0xAA; 512][..]);
    assert_eq!(&contents[512..], &[0xBB; 10][..]);
    assert!(!dir.path().join("a.bin.upload").exists());
    Ok(())
}

#[tokio::test]
async fn negotiated_options_are_echoed_in_oack() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (rendezvous, server) = start_server(test_config(dir.path()))?;
    let client = TestClient::new(rendezvous).await?;

    client
        .write_request("fw.bin", &[("blksize", "1024"), ("tsize", "5000")])
        .await?;
    let (oack, transfer) = client.recv().await?;
    assert_eq!(&oack[..], b"\x00\x06blksize\x001024\x00tsize\x005000\x00");

    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    for (i, chunk) in payload.chunks(1024).enumerate() {
        let block = (i + 1) as u16;
        client.send_data(transfer, block, chunk).await?;
        assert_eq!(client.recv().await?.0, encode_ack(block));
    }

    let outcome = server.await??;
    assert_eq!(std::fs::read(outcome.path)?, payload);
    Ok(())
}

#[tokio::test]
async fn malformed_request_is_answered_and_server_keeps_listening() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (rendezvous, server) = start_server(test_config(dir.path()))?;
    let client = TestClient::new(rendezvous).await?;

    client
        .send_raw(b"\x00\x02a.bin\x00octet", rendezvous)
        .await?;
    let (reply, from) = client.recv().await?;
    assert_eq!(reply, error_packet(ErrorCode::IllegalOperation));
    assert_eq!(from, rendezvous);

    client.write_request("empty.bin", &[]).await?;
    let (ack, transfer) = client.recv().await?;
    assert_eq!(ack, encode_ack(0));
    client.send_data(transfer, 1, &[]).await?;
    assert_eq!(client.recv().await?.0, encode_ack(1));

    let outcome = server.await??;
    assert_eq!(outcome.bytes, 0);
    assert_eq!(std::fs::read(dir.path().join("empty.bin"))?.len(), 0);
    Ok(())
}

#[tokio::test]
async fn read_request_is_refused() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (rendezvous, server) = start_server(test_config(dir.path()))?;
    let client = TestClient::new(rendezvous).await?;

    let packet = encode_request(Opcode::Rrq, "a.bin", "octet", &[]);
    client.send_raw(&packet, rendezvous).await?;
    assert_eq!(client.recv().await?.0, error_packet(ErrorCode::IllegalOperation));

    server.abort();
    Ok(())
}

#[tokio::test]
async fn existing_file_is_protected_without_overwrite() -> TestResult {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("a.bin"), b"keep me")?;
    let mut config = test_config(dir.path());
    config.write_config.allow_overwrite = false;
    let (rendezvous, server) = start_server(config)?;
    let client = TestClient::new(rendezvous).await?;

    client.write_request("a.bin", &[]).await?;
    assert_eq!(client.recv().await?.0, error_packet(ErrorCode::FileExists));

    client.write_request("../escape.bin", &[]).await?;
    assert_eq!(
        client.recv().await?.0,
        error_packet(ErrorCode::AccessViolation)
    );

    server.abort();
    assert_eq!(std::fs::read(dir.path().join("a.bin"))?, b"keep me");
    Ok(())
}

#[tokio::test]
async fn out_of_sequence_block_aborts_transfer() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (rendezvous, server) = start_server(test_config(dir.path()))?;
    let client = TestClient::new(rendezvous).await?;

    client.write_request("a.bin", &[]).await?;
    let (_, transfer) = client.recv().await?;
    client.send_data(transfer, 1, &[1; 512]).await?;
    client.recv().await?;
    client.send_data(transfer, 2, &[2; 512]).await?;
    client.recv().await?;

    client.send_data(transfer, 5, &[5; 512]).await?;
    assert_eq!(client.recv().await?.0, error_packet(ErrorCode::UnknownTid));

    match server.await? {
        Err(TftpError::Aborted(condition)) => {
            assert_eq!(condition, ErrorCondition::Protocol(ErrorCode::UnknownTid));
        }
        other => return Err(format!("expected abort, got {:?}", other).into()),
    }
    assert!(!dir.path().join("a.bin").exists());
    assert!(!dir.path().join("a.bin.upload").exists());
    Ok(())
}

#[tokio::test]
async fn duplicate_block_gets_the_same_ack_again() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (rendezvous, server) = start_server(test_config(dir.path()))?;
    let client = TestClient::new(rendezvous).await?;

    client.write_request("dup.bin", &[]).await?;
    let (_, transfer) = client.recv().await?;

    client.send_data(transfer, 1, &[7; 512]).await?;
    assert_eq!(client.recv().await?.0, encode_ack(1));
    client.send_data(transfer, 1, &[7; 512]).await?;
    assert_eq!(client.recv().await?.0, encode_ack(1));

    client.send_data(transfer, 2, &[8; 3]).await?;
    assert_eq!(client.recv().await?.0, encode_ack(2));

    let outcome = server.await??;
    assert_eq!(std::fs::read(outcome.path)?.len(), 515);
    Ok(())
}

#[tokio::test]
async fn exact_multiple_needs_empty_final_block() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (rendezvous, server) = start_server(test_config(dir.path()))?;
    let client = TestClient::new(rendezvous).await?;

    client.write_request("exact.bin", &[("blksize", "8")]).await?;
    let (oack, transfer) = client.recv().await?;
    assert_eq!(&oack[..], b"\x00\x06blksize\x008\x00");

    client.send_data(transfer, 1, b"12345678").await?;
    assert_eq!(client.recv().await?.0, encode_ack(1));
    client.send_data(transfer, 2, b"").await?;
    assert_eq!(client.recv().await?.0, encode_ack(2));

    let outcome = server.await??;
    assert_eq!(std::fs::read(outcome.path)?, b"12345678");
    Ok(())
}

#[tokio::test]
async fn foreign_peer_is_rejected_without_disturbing_transfer() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (rendezvous, server) = start_server(test_config(dir.path()))?;
    let client = TestClient::new(rendezvous).await?;
    let intruder = UdpSocket::bind("127.0.0.1:0").await?;

    client.write_request("a.bin", &[]).await?;
    let (_, transfer) = client.recv().await?;

    intruder.send_to(&encode_data(1, b"evil"), transfer).await?;
    let (reply, from) = recv_on(&intruder).await?;
    assert_eq!(reply, error_packet(ErrorCode::UnknownTid));
    assert_eq!(from, transfer);

    client.send_data(transfer, 1, b"good").await?;
    assert_eq!(client.recv().await?.0, encode_ack(1));

    let outcome = server.await??;
    assert_eq!(std::fs::read(outcome.path)?, b"good");
    Ok(())
}

#[tokio::test]
async fn silent_peer_gets_retransmissions_then_times_out() -> TestResult {
    let dir = tempfile::tempdir()?;
    let mut config = test_config(dir.path());
    config.transfer.max_retries = 2;
    let (rendezvous, server) = start_server(config)?;
    let client = TestClient::new(rendezvous).await?;

    client.write_request("slow.bin", &[]).await?;
    for _ in 0..3 {
        assert_eq!(client.recv().await?.0, encode_ack(0));
    }

    match server.await? {
        Err(TftpError::TimedOut { retries }) => assert_eq!(retries, 2),
        other => return Err(format!("expected timeout, got {:?}", other).into()),
    }
    assert!(!dir.path().join("slow.bin.upload").exists());
    Ok(())
}

#[tokio::test]
async fn partial_upload_is_kept_when_configured() -> TestResult {
    let dir = tempfile::tempdir()?;
    let mut config = test_config(dir.path());
    config.transfer.keep_partial_uploads = true;
    let (rendezvous, server) = start_server(config)?;
    let client = TestClient::new(rendezvous).await?;

    client.write_request("part.bin", &[]).await?;
    let (_, transfer) = client.recv().await?;
    client.send_data(transfer, 1, &[3; 512]).await?;
    client.recv().await?;
    client
        .send_raw(&error_packet(ErrorCode::DiskFull), transfer)
        .await?;

    match server.await? {
        Err(TftpError::PeerError { code, .. }) => assert_eq!(code, 3),
        other => return Err(format!("expected peer error, got {:?}", other).into()),
    }
    assert_eq!(std::fs::read(dir.path().join("part.bin.upload"))?.len(), 512);
    assert!(!dir.path().join("part.bin").exists());
    Ok(())
}

#[tokio::test]
async fn lost_final_ack_is_answered_during_hold_open() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (rendezvous, server) = start_server(test_config(dir.path()))?;
    let client = TestClient::new(rendezvous).await?;

    client.write_request("last.bin", &[]).await?;
    let (_, transfer) = client.recv().await?;
    client.send_data(transfer, 1, b"tail").await?;
    assert_eq!(client.recv().await?.0, encode_ack(1));

    // the file is already in place while the server still holds the session open
    assert_eq!(std::fs::read(dir.path().join("last.bin"))?, b"tail");

    client.send_data(transfer, 1, b"tail").await?;
    assert_eq!(client.recv().await?.0, encode_ack(1));

    let outcome = server.await??;
    assert_eq!(outcome.bytes, 4);
    Ok(())
}

#[tokio::test]
async fn idle_server_gives_up() -> TestResult {
    let dir = tempfile::tempdir()?;
    let mut config = test_config(dir.path());
    config.transfer.idle_timeout_secs = 1;
    let (_, server) = start_server(config)?;

    match server.await? {
        Err(TftpError::Idle(secs)) => assert_eq!(secs, 1),
        other => return Err(format!("expected idle timeout, got {:?}", other).into()),
    }
    Ok(())
}

#[tokio::test]
async fn receive_file_stores_upload_under_root() -> TestResult {
    let dir = tempfile::tempdir()?;
    let root = dir.path().join("incoming");
    let port = {
        let probe = std::net::UdpSocket::bind("127.0.0.1:0")?;
        probe.local_addr()?.port()
    };

    let task_root = root.clone();
    let server = tokio::spawn(async move { receive_file(task_root, port, None).await });
    let client = TestClient::new(SocketAddr::from(([127, 0, 0, 1], port))).await?;

    // the server may not be bound yet; repeat the request until it answers
    let mut answer = None;
    for _ in 0..20 {
        client.write_request("boot.img", &[]).await?;
        let mut buf = [0u8; 516];
        if let Ok(Ok((len, from))) = tokio::time::timeout(
            Duration::from_millis(250),
            client.socket.recv_from(&mut buf),
        )
        .await
        {
            answer = Some((Bytes::copy_from_slice(&buf[..len]), from));
            break;
        }
    }
    let (ack, transfer) = answer.ok_or("server never answered")?;
    assert_eq!(ack, encode_ack(0));

    client.send_data(transfer, 1, b"image").await?;
    assert_eq!(client.recv().await?.0, encode_ack(1));

    let path = server.await??;
    assert_eq!(path, root.join("boot.img"));
    assert_eq!(std::fs::read(path)?, b"image");
    Ok(())
}

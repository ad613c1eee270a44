//! Byte-level checks of the relay wire contract, driven through in-memory
//! transports with a hand-rolled relay side.

use parking_lot::Mutex;

use sproxy::crypto::{self, SessionKeys};
use sproxy::session::{FrameSink, FrameSource, SecureSession, SessionError, TransportConnector};
use sproxy::sim::{pipe_pair, psk_of, PipeConnector, SimRelay};

type Transport = (Box<dyn FrameSink>, Box<dyn FrameSource>);

/// Connector that hands out exactly one pre-wired transport.
struct OneShot {
    transport: Mutex<Option<Transport>>,
}

#[async_trait::async_trait]
impl TransportConnector for OneShot {
    async fn connect(&self) -> Result<Transport, SessionError> {
        self.transport
            .lock()
            .take()
            .ok_or_else(|| SessionError::Transport("transport already used".into()))
    }
}

#[tokio::test]
async fn handshake_and_connect_frames_follow_the_contract() {
    let psk = psk_of(0x00);
    let (client, server) = pipe_pair();
    let (mut server_sink, mut server_source) = server;
    let connector = OneShot {
        transport: Mutex::new(Some(client)),
    };

    let client_task =
        tokio::spawn(async move { SecureSession::connect(&connector, &psk_of(0x00)).await });

    // Step 1: client public, 32 random bytes.
    let client_public = server_source.recv_frame().await.unwrap().unwrap();
    assert_eq!(client_public.len(), 32);

    // Step 2: server public.
    let server_public = [0x01u8; 32];
    server_sink.send_frame(server_public.to_vec()).await.unwrap();

    // Both sides derive from salt = client_public ‖ server_public; the relay
    // uses the mirrored split.
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(&client_public);
    salt[32..].copy_from_slice(&server_public);
    let derived = crypto::derive_keys(&psk, &salt).unwrap();
    let keys = SessionKeys {
        send: derived.recv,
        recv: derived.send,
    };

    // Step 3: the client's proof is HMAC(send_key, "auth").
    let auth = server_source.recv_frame().await.unwrap().unwrap();
    assert_eq!(auth, crypto::hmac_tag(&keys.recv, b"auth").to_vec());

    // Step 4: our reply is HMAC(our send key, "ok").
    server_sink
        .send_frame(crypto::hmac_tag(&keys.send, b"ok").to_vec())
        .await
        .unwrap();

    let session = client_task.await.unwrap().unwrap();
    assert!(session.is_connected());

    // CONNECT: u16_be length, then the ASCII target, sealed like any frame.
    let connect_task = {
        let session = session.clone();
        tokio::spawn(async move { session.send_connect("example.com", 443).await })
    };
    let connect_frame = server_source.recv_frame().await.unwrap().unwrap();
    let plaintext = crypto::open(&keys.recv, &connect_frame).unwrap();
    assert_eq!(plaintext[..2], [0x00, 0x0f]);
    assert_eq!(&plaintext[2..], b"example.com:443");

    // One plaintext byte 0x00 means success.
    let verdict = crypto::seal(&keys.send, &[0x00]).unwrap();
    server_sink.send_frame(verdict).await.unwrap();
    connect_task.await.unwrap().unwrap();

    session.close();
}

#[tokio::test]
async fn connect_target_reaches_relay_verbatim() {
    let connector = PipeConnector::new(SimRelay::new(psk_of(0x11)));
    let session = SecureSession::connect(&connector, &psk_of(0x11))
        .await
        .unwrap();
    session.send_connect("example.com", 443).await.unwrap();
    assert_eq!(
        connector.relay().connect_targets(),
        vec!["example.com:443".to_string()]
    );
    session.close();
}

#[tokio::test]
async fn sealed_frame_layout_is_nonce_ciphertext_tag() {
    let key = crypto::random_array::<32>();
    let frame = crypto::seal(&key, b"x").unwrap();
    // 12-byte nonce, one ciphertext byte, 16-byte tag.
    assert_eq!(frame.len(), 12 + 1 + 16);
    // Flipping any nonce bit must break authentication.
    let mut tampered = frame.clone();
    tampered[0] ^= 0x80;
    assert!(crypto::open(&key, &tampered).is_err());
}

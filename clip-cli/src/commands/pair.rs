//! Pairing commands: show a pairing code, or join another device's code.
//!
//! The showing side listens on a TCP port advertised in the code. The
//! joining side connects there and runs the challenge/ack exchange; both ends
//! store the derived session key on success.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clipsync_client::{
    run_initiator, run_responder, ApprovalHandler, AutoApprove, FrameReader, IdentityKeys,
    PairingInitiator, PairingOptions, PairingRequest, PairingResponder, TrustStore, TrustedDevice,
};
use clipsync_core::PairingPayload;
use clipsync_types::{FrameCodec, DEFAULT_MAX_FRAME_LEN};
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::info;

use crate::config::DeviceConfig;
use crate::trust_store::FileTrustStore;

/// How long the joining side waits for the ack. Covers the user's approval.
const ACK_TIMEOUT: Duration = Duration::from_secs(60);

/// Options for `pair --show`.
#[derive(Debug, Clone)]
pub struct ShowOptions {
    /// Address to listen on; also advertised in the code.
    pub addr: String,
    /// Relay address advertised as a hint.
    pub relay: Option<String>,
    /// Code lifetime.
    pub ttl: Duration,
    /// Approve without prompting.
    pub auto_approve: bool,
}

/// Asks on the terminal before accepting a pairing request.
struct PromptApproval;

#[async_trait]
impl ApprovalHandler for PromptApproval {
    async fn approve(&self, request: &PairingRequest) -> bool {
        println!();
        println!("Pairing request:");
        println!("  Device:      {} ({})", request.device_name, request.device_id);
        println!("  Fingerprint: {}", request.fingerprint);
        print!("Accept? [y/N] ");
        let _ = std::io::stdout().flush();

        let answer = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await;
        matches!(answer, Ok(Ok(line)) if matches!(line.trim().to_lowercase().as_str(), "y" | "yes"))
    }
}

/// Run `pair --show`.
pub async fn show(data_dir: &Path, options: ShowOptions) -> Result<()> {
    let device = DeviceConfig::load(data_dir).await?;
    let identity = Arc::new(device.identity()?);
    let store: Arc<dyn TrustStore> = Arc::new(FileTrustStore::open(data_dir).await?);

    let listener = TcpListener::bind(&options.addr)
        .await
        .with_context(|| format!("Failed to listen on {}", options.addr))?;

    let approval: Box<dyn ApprovalHandler> = if options.auto_approve {
        Box::new(AutoApprove)
    } else {
        Box::new(PromptApproval)
    };
    let peer = show_on(listener, &device, identity, store, &options, approval.as_ref()).await?;
    print_paired(&peer);
    Ok(())
}

/// Advertise a pairing code for `listener` and answer the first device to join.
pub async fn show_on(
    listener: TcpListener,
    device: &DeviceConfig,
    identity: Arc<IdentityKeys>,
    store: Arc<dyn TrustStore>,
    options: &ShowOptions,
    approval: &dyn ApprovalHandler,
) -> Result<TrustedDevice> {
    let local = listener.local_addr()?;
    let mut payload = PairingPayload::create_with_ttl(
        device.device_id.clone(),
        device.device_name.clone(),
        identity.agreement_public(),
        identity.signing_public(),
        options.ttl,
    )
    .with_direct_addr(local.to_string());
    if let Some(relay) = &options.relay {
        payload = payload.with_relay_hint(relay.clone());
    }

    println!("Pairing code (valid for {}s):", options.ttl.as_secs());
    println!();
    println!("  {}", payload.to_qr_payload());
    println!();
    println!("  Fingerprint: {}", payload.fingerprint);
    println!();
    println!("On the other device run:");
    println!("  clipsync pair --join <code>");

    let (stream, remote) = tokio::time::timeout(options.ttl, listener.accept())
        .await
        .map_err(|_| anyhow!("No device joined before the pairing code expired"))?
        .context("Failed to accept pairing connection")?;
    info!(remote = %remote, "pairing connection accepted");

    let (read, mut write) = stream.into_split();
    let mut reader = FrameReader::new(read, DEFAULT_MAX_FRAME_LEN);
    let codec = FrameCodec::new(DEFAULT_MAX_FRAME_LEN);
    let mut responder = PairingResponder::new(
        device.device_id.clone(),
        device.device_name.clone(),
        identity,
        store,
        PairingOptions::default(),
    );
    run_responder(&mut responder, approval, &mut reader, &mut write, &codec)
        .await
        .context("Pairing failed")
}

/// Run `pair --join <code>`.
pub async fn join(data_dir: &Path, code: &str) -> Result<()> {
    let device = DeviceConfig::load(data_dir).await?;
    let identity = Arc::new(device.identity()?);
    let store: Arc<dyn TrustStore> = Arc::new(FileTrustStore::open(data_dir).await?);

    let peer = join_with(code, &device, identity, store).await?;
    print_paired(&peer);
    Ok(())
}

/// Decode `code`, connect to its direct address, and pair.
pub async fn join_with(
    code: &str,
    device: &DeviceConfig,
    identity: Arc<IdentityKeys>,
    store: Arc<dyn TrustStore>,
) -> Result<TrustedDevice> {
    let payload = PairingPayload::from_qr_payload(code.trim()).context("Invalid pairing code")?;
    payload.validate().context("Invalid pairing code")?;
    let addr = payload
        .direct_addr
        .clone()
        .context("Pairing code carries no direct address")?;

    println!("Pairing with {} ({})", payload.device_name, payload.device_id);
    println!("  Fingerprint: {}", payload.fingerprint);
    println!("Waiting for the other device to accept...");

    let stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("Failed to connect to {addr}"))?;
    let (read, mut write) = stream.into_split();
    let mut reader = FrameReader::new(read, DEFAULT_MAX_FRAME_LEN);
    let codec = FrameCodec::new(DEFAULT_MAX_FRAME_LEN);
    let mut initiator = PairingInitiator::new(
        device.device_id.clone(),
        device.device_name.clone(),
        identity,
        store,
        PairingOptions::default(),
    );
    run_initiator(&mut initiator, &payload, &mut reader, &mut write, &codec, ACK_TIMEOUT)
        .await
        .context("Pairing failed")
}

fn print_paired(peer: &TrustedDevice) {
    println!();
    println!("Paired successfully!");
    println!();
    println!("  Device:      {} ({})", peer.device_name, peer.device_id);
    println!("  Fingerprint: {}", peer.fingerprint);
    println!();
    println!("Start syncing: clipsync serve --listen 0.0.0.0:7071");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct Side {
        _dir: tempfile::TempDir,
        device: DeviceConfig,
        identity: Arc<IdentityKeys>,
        store: Arc<FileTrustStore>,
    }

    async fn side(name: &str) -> Side {
        let dir = tempdir().unwrap();
        let device = DeviceConfig::new(name);
        device.save(dir.path()).await.unwrap();
        let identity = Arc::new(device.identity().unwrap());
        let store = Arc::new(FileTrustStore::open(dir.path()).await.unwrap());
        Side {
            _dir: dir,
            device,
            identity,
            store,
        }
    }

    fn options() -> ShowOptions {
        ShowOptions {
            addr: "127.0.0.1:0".into(),
            relay: None,
            ttl: Duration::from_secs(30),
            auto_approve: true,
        }
    }

    /// The code `show_on` prints for `addr`, modulo expiry.
    fn code_for(showing: &Side, addr: std::net::SocketAddr) -> String {
        PairingPayload::create(
            showing.device.device_id.clone(),
            showing.device.device_name.clone(),
            showing.identity.agreement_public(),
            showing.identity.signing_public(),
        )
        .with_direct_addr(addr.to_string())
        .to_qr_payload()
    }

    #[tokio::test]
    async fn show_and_join_store_the_same_session_key() {
        let mac = side("Mac").await;
        let phone = side("Phone").await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let code = code_for(&mac, listener.local_addr().unwrap());

        let responder = {
            let device = mac.device.clone();
            let identity = mac.identity.clone();
            let store: Arc<dyn TrustStore> = mac.store.clone();
            tokio::spawn(async move {
                show_on(listener, &device, identity, store, &options(), &AutoApprove).await
            })
        };
        let joined = join_with(&code, &phone.device, phone.identity.clone(), phone.store.clone())
            .await
            .unwrap();
        let shown = responder.await.unwrap().unwrap();

        assert_eq!(joined.device_id, mac.device.device_id);
        assert_eq!(shown.device_id, phone.device.device_id);
        assert_eq!(joined.session_key, shown.session_key);

        let on_mac = mac.store.load(&phone.device.device_id).await.unwrap().unwrap();
        let on_phone = phone.store.load(&mac.device.device_id).await.unwrap().unwrap();
        assert_eq!(on_mac.session_key, on_phone.session_key);
    }

    struct Deny;

    #[async_trait]
    impl ApprovalHandler for Deny {
        async fn approve(&self, _request: &PairingRequest) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn denied_request_stores_nothing() {
        let mac = side("Mac").await;
        let phone = side("Phone").await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let code = code_for(&mac, listener.local_addr().unwrap());

        let responder = {
            let device = mac.device.clone();
            let identity = mac.identity.clone();
            let store: Arc<dyn TrustStore> = mac.store.clone();
            tokio::spawn(async move {
                show_on(listener, &device, identity, store, &options(), &Deny).await
            })
        };
        let (joined, shown) = tokio::join!(
            join_with(&code, &phone.device, phone.identity.clone(), phone.store.clone()),
            responder
        );

        assert!(shown.unwrap().is_err());
        assert!(joined.is_err());
        assert!(mac.store.list().await.unwrap().is_empty());
        assert!(phone.store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn garbage_code_is_rejected() {
        let phone = side("Phone").await;
        let err = join_with("not-a-code", &phone.device, phone.identity.clone(), phone.store.clone())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid pairing code"));
    }

    #[tokio::test]
    async fn code_without_address_is_rejected() {
        let mac = side("Mac").await;
        let phone = side("Phone").await;
        let code = PairingPayload::create(
            mac.device.device_id.clone(),
            "Mac",
            mac.identity.agreement_public(),
            mac.identity.signing_public(),
        )
        .to_qr_payload();

        let err = join_with(&code, &phone.device, phone.identity.clone(), phone.store.clone())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no direct address"));
    }
}

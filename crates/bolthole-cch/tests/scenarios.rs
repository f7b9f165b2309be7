//! End-to-end protocol scenarios driving both engines in-process.
//!
//! The daemon engine's outbox feeds the agent engine directly, playing the
//! role of a perfectly reliable transport except where a test drops or
//! withholds messages on purpose.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use bolthole_cch::testing::{test_cert, StaticCertProvider, TrustingVerifier};
use bolthole_cch::{AgentCch, CchError, DaemonCch, DaemonCchConfig};
use bolthole_crypto::KeyPair;
use bolthole_types::{CchMessage, CchPayload, ErrorMessage, SynAckPayload};

struct Session {
    daemon: Arc<DaemonCch<StaticCertProvider>>,
    agent: AgentCch<TrustingVerifier>,
    outbox: UnboundedReceiver<CchMessage>,
    agent_keys: KeyPair,
    daemon_public_key: String,
}

fn session_with_limit(pipeline_limit: usize) -> Session {
    let (cert, daemon_keys) = test_cert();
    let daemon_public_key = daemon_keys.public_key().as_str().to_string();
    let agent_keys = KeyPair::generate();
    let agent = AgentCch::new(agent_keys.clone(), TrustingVerifier::valid());

    let mut config = DaemonCchConfig::new(daemon_keys, agent.public_key().clone());
    config.pipeline_limit = pipeline_limit;
    let daemon = Arc::new(DaemonCch::new(config, StaticCertProvider::new(cert)));
    let outbox = daemon.take_outbox().expect("outbox taken once");

    Session {
        daemon,
        agent,
        outbox,
        agent_keys,
        daemon_public_key,
    }
}

fn session() -> Session {
    session_with_limit(bolthole_cch::DEFAULT_PIPELINE_LIMIT)
}

impl Session {
    async fn handshake(&mut self) -> CchMessage {
        self.daemon.open("shell/open", Vec::new()).await.unwrap();
        let syn = self.outbox.recv().await.unwrap();
        self.agent.validate(&syn).await.unwrap();
        let synack = self
            .agent
            .build_ack(&syn, "shell/open", Vec::new())
            .unwrap();
        self.daemon.validate(&synack).await.unwrap();
        synack
    }

    /// Validate one Data at the agent and return its deterministic ack
    async fn accept_data(&mut self, data: &CchMessage) -> CchMessage {
        self.agent.validate(data).await.unwrap();
        self.agent
            .build_ack(data, data.payload.action(), Vec::new())
            .unwrap()
    }
}

fn peer_error(h_pointer: &str) -> ErrorMessage {
    ErrorMessage {
        schema_version: "2.1".to_string(),
        error_type: "ChainMismatch".to_string(),
        message: "hash chain mismatch".to_string(),
        h_pointer: h_pointer.to_string(),
    }
}

#[tokio::test]
async fn test_happy_handshake_and_two_data_messages() {
    let mut session = session();
    let synack = session.handshake().await;
    assert!(session.daemon.is_handshake_complete().await);

    session
        .daemon
        .inbox("kube/exec", b"hi".to_vec())
        .await
        .unwrap();
    session
        .daemon
        .inbox("kube/exec", b"there".to_vec())
        .await
        .unwrap();

    let data1 = session.outbox.recv().await.unwrap();
    let data2 = session.outbox.recv().await.unwrap();

    // First Data chains to the SynAck; the second chains to the ack the
    // agent has not produced yet.
    assert_eq!(
        data1.payload.h_pointer().unwrap(),
        synack.hash().unwrap()
    );

    let ack1 = session.accept_data(&data1).await;
    assert_eq!(data2.payload.h_pointer().unwrap(), ack1.hash().unwrap());
    session.daemon.validate(&ack1).await.unwrap();

    let ack2 = session.accept_data(&data2).await;
    session.daemon.validate(&ack2).await.unwrap();

    assert_eq!(session.daemon.pipeline_len().await, 0);
}

#[tokio::test]
async fn test_fifo_order_is_preserved() {
    let mut session = session();
    session.handshake().await;

    let inputs: Vec<Vec<u8>> = (0..5).map(|i| format!("frame-{i}").into_bytes()).collect();
    for input in &inputs {
        session
            .daemon
            .inbox("db/query", input.clone())
            .await
            .unwrap();
    }

    for expected in &inputs {
        let data = session.outbox.recv().await.unwrap();
        let CchPayload::Data(payload) = &data.payload else {
            panic!("expected data message");
        };
        assert_eq!(&payload.action_payload, expected);
        let ack = session.accept_data(&data).await;
        session.daemon.validate(&ack).await.unwrap();
    }
}

#[tokio::test]
async fn test_pipeline_window_blocks_at_capacity() {
    let mut session = session_with_limit(2);
    session.handshake().await;

    session.daemon.inbox("shell/input", b"1".to_vec()).await.unwrap();
    session.daemon.inbox("shell/input", b"2".to_vec()).await.unwrap();
    assert_eq!(session.daemon.pipeline_len().await, 2);

    // Third submission must wait for an ack to free a slot.
    let daemon = session.daemon.clone();
    let blocked = tokio::spawn(async move { daemon.inbox("shell/input", b"3".to_vec()).await });
    tokio::task::yield_now().await;
    assert!(!blocked.is_finished());

    let data1 = session.outbox.recv().await.unwrap();
    let ack1 = session.accept_data(&data1).await;
    session.daemon.validate(&ack1).await.unwrap();

    blocked.await.unwrap().unwrap();
    assert!(session.daemon.pipeline_len().await <= 2);
}

#[tokio::test]
async fn test_inbox_waits_for_handshake() {
    let mut session = session();
    session.daemon.open("shell/open", Vec::new()).await.unwrap();
    let syn = session.outbox.recv().await.unwrap();

    let daemon = session.daemon.clone();
    let gated = tokio::spawn(async move { daemon.inbox("shell/input", b"early".to_vec()).await });
    tokio::task::yield_now().await;
    assert!(!gated.is_finished());

    session.agent.validate(&syn).await.unwrap();
    let synack = session
        .agent
        .build_ack(&syn, "shell/open", Vec::new())
        .unwrap();
    session.daemon.validate(&synack).await.unwrap();

    gated.await.unwrap().unwrap();
    let data = session.outbox.recv().await.unwrap();
    assert_eq!(data.payload.h_pointer().unwrap(), synack.hash().unwrap());
}

#[tokio::test]
async fn test_lost_ack_is_absorbed_by_later_ack() {
    let mut session = session();
    session.handshake().await;

    for payload in [b"one".to_vec(), b"two".to_vec(), b"three".to_vec()] {
        session.daemon.inbox("shell/input", payload).await.unwrap();
    }
    let data1 = session.outbox.recv().await.unwrap();
    let data2 = session.outbox.recv().await.unwrap();
    let data3 = session.outbox.recv().await.unwrap();

    // DataAck for the first message is lost in transit.
    let _lost = session.accept_data(&data1).await;
    let ack2 = session.accept_data(&data2).await;
    session.daemon.validate(&ack2).await.unwrap();

    // The later ack settles the earlier message too.
    assert_eq!(session.daemon.pipeline_len().await, 1);

    let ack3 = session.accept_data(&data3).await;
    session.daemon.validate(&ack3).await.unwrap();
    assert_eq!(session.daemon.pipeline_len().await, 0);
}

#[tokio::test]
async fn test_recovery_resends_only_unacked_messages() {
    let mut session = session();
    session.handshake().await;

    session.daemon.inbox("shell/input", b"first".to_vec()).await.unwrap();
    session.daemon.inbox("shell/input", b"second".to_vec()).await.unwrap();
    let data1 = session.outbox.recv().await.unwrap();
    let data2 = session.outbox.recv().await.unwrap();

    // Data1 completes normally; Data2 fails at the agent.
    let ack1 = session.accept_data(&data1).await;
    session.daemon.validate(&ack1).await.unwrap();

    let error = peer_error(&data2.hash().unwrap());
    assert!(session.daemon.recover(&error).await.unwrap());
    assert!(session.daemon.is_recovering().await);

    // Recovery Syn; the agent answers with the hash of the last Data it
    // acked, which matches the daemon's own record.
    let recovery_syn = session.outbox.recv().await.unwrap();
    assert!(matches!(recovery_syn.payload, CchPayload::Syn(_)));
    session.agent.validate(&recovery_syn).await.unwrap();
    let recovery_synack = session
        .agent
        .build_ack(&recovery_syn, "shell/open", Vec::new())
        .unwrap();
    assert_eq!(
        recovery_synack.payload.nonce().unwrap(),
        data1.hash().unwrap()
    );
    session.daemon.validate(&recovery_synack).await.unwrap();
    assert!(!session.daemon.is_recovering().await);

    // Only Data2 is re-emitted, rebuilt against the new chain head.
    let resent = session.outbox.recv().await.unwrap();
    let CchPayload::Data(payload) = &resent.payload else {
        panic!("expected resent data");
    };
    assert_eq!(payload.action_payload, b"second");
    assert_eq!(
        payload.h_pointer,
        recovery_synack.hash().unwrap()
    );
    assert!(session.outbox.try_recv().is_err());

    // The resent message completes the session.
    let ack = session.accept_data(&resent).await;
    session.daemon.validate(&ack).await.unwrap();
    assert_eq!(session.daemon.pipeline_len().await, 0);
}

#[tokio::test]
async fn test_recovery_with_unknown_nonce_resends_nothing() {
    let mut session = session();
    session.handshake().await;

    session.daemon.inbox("shell/input", b"orphan".to_vec()).await.unwrap();
    let data1 = session.outbox.recv().await.unwrap();

    let error = peer_error(&data1.hash().unwrap());
    assert!(session.daemon.recover(&error).await.unwrap());

    // The agent never validated any Data, so its recovery SynAck carries a
    // random nonce that matches nothing on the daemon.
    let recovery_syn = session.outbox.recv().await.unwrap();
    session.agent.validate(&recovery_syn).await.unwrap();
    let recovery_synack = session
        .agent
        .build_ack(&recovery_syn, "shell/open", Vec::new())
        .unwrap();
    session.daemon.validate(&recovery_synack).await.unwrap();

    assert!(session.outbox.try_recv().is_err());
    assert_eq!(session.daemon.pipeline_len().await, 0);
}

#[tokio::test]
async fn test_recovery_is_bounded() {
    let mut session = session();
    session.handshake().await;

    for attempt in 0..4u32 {
        session
            .daemon
            .inbox("shell/input", format!("attempt-{attempt}").into_bytes())
            .await
            .unwrap();
        let data = session.outbox.recv().await.unwrap();
        let error = peer_error(&data.hash().unwrap());

        if attempt < 3 {
            assert!(session.daemon.recover(&error).await.unwrap());
            let recovery_syn = session.outbox.recv().await.unwrap();
            session.agent.validate(&recovery_syn).await.unwrap();
            let recovery_synack = session
                .agent
                .build_ack(&recovery_syn, "shell/open", Vec::new())
                .unwrap();
            session.daemon.validate(&recovery_synack).await.unwrap();
            // Drain whatever the resend produced before the next round.
            while session.outbox.try_recv().is_ok() {}
        } else {
            assert!(matches!(
                session.daemon.recover(&error).await,
                Err(CchError::RecoveryExhausted(_))
            ));
        }
    }
}

#[tokio::test]
async fn test_recover_ignores_irrelevant_errors() {
    let mut session = session();
    session.handshake().await;

    // Empty hpointer: soft protocol error, nothing to do.
    assert!(!session.daemon.recover(&peer_error("")).await.unwrap());

    // Unknown hpointer: not one of ours.
    assert!(!session
        .daemon
        .recover(&peer_error("not-in-the-pipeline"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_dataack_with_unknown_hpointer_is_rejected() {
    let mut session = session();
    session.handshake().await;

    session.daemon.inbox("shell/input", b"x".to_vec()).await.unwrap();
    let data = session.outbox.recv().await.unwrap();
    let mut ack = session.accept_data(&data).await;

    if let CchPayload::DataAck(payload) = &mut ack.payload {
        payload.h_pointer = "someone-elses-hash".to_string();
    }
    ack.sign(&session.agent_keys).unwrap();

    assert!(matches!(
        session.daemon.validate(&ack).await,
        Err(CchError::UnknownHPointer(_))
    ));
}

#[tokio::test]
async fn test_pre_pipelining_agent_gets_transformed_payloads_and_window_of_one() {
    let mut session = session();
    session.daemon.open("shell/open", Vec::new()).await.unwrap();
    let syn = session.outbox.recv().await.unwrap();

    // Hand-build a SynAck from an agent that still speaks schema 1.5.
    let mut synack = CchMessage::new_unsigned(CchPayload::SynAck(SynAckPayload {
        schema_version: "1.5".to_string(),
        action: "shell/open".to_string(),
        action_response_payload: Vec::new(),
        target_id: session.daemon_public_key.clone(),
        nonce: bolthole_crypto::random_nonce(),
        h_pointer: syn.hash().unwrap(),
    }));
    synack.sign(&session.agent_keys).unwrap();
    session.daemon.validate(&synack).await.unwrap();

    session.daemon.inbox("shell/input", b"hi".to_vec()).await.unwrap();
    let data = session.outbox.recv().await.unwrap();
    let CchPayload::Data(payload) = &data.payload else {
        panic!("expected data message");
    };
    assert_eq!(payload.action_payload, b"\"aGk=\"");
    assert_eq!(payload.schema_version, "1.5");

    // Window is forced to one for pre-pipelining peers.
    let daemon = session.daemon.clone();
    let blocked = tokio::spawn(async move { daemon.inbox("shell/input", b"next".to_vec()).await });
    tokio::task::yield_now().await;
    assert!(!blocked.is_finished());
    session.daemon.shutdown();
    assert!(matches!(
        blocked.await.unwrap(),
        Err(CchError::Shutdown)
    ));
}

#[tokio::test]
async fn test_legacy_synack_signature_fallback() {
    let mut session = session();
    session.daemon.open("shell/open", Vec::new()).await.unwrap();
    let syn = session.outbox.recv().await.unwrap();

    // A legacy agent signs its first SynAck with the key it embeds as the
    // target id instead of its registered identity.
    let legacy_keys = KeyPair::generate();
    let mut synack = CchMessage::new_unsigned(CchPayload::SynAck(SynAckPayload {
        schema_version: "2.0".to_string(),
        action: "shell/open".to_string(),
        action_response_payload: Vec::new(),
        target_id: legacy_keys.public_key().as_str().to_string(),
        nonce: bolthole_crypto::random_nonce(),
        h_pointer: syn.hash().unwrap(),
    }));
    synack.sign(&legacy_keys).unwrap();

    session.daemon.validate(&synack).await.unwrap();
    assert!(session.daemon.is_handshake_complete().await);
}

#[tokio::test]
async fn test_shutdown_unblocks_waiting_inbox() {
    let session = session();
    let daemon = session.daemon.clone();
    let gated = tokio::spawn(async move { daemon.inbox("shell/input", b"never".to_vec()).await });
    tokio::task::yield_now().await;

    session.daemon.shutdown();
    assert!(matches!(gated.await.unwrap(), Err(CchError::Shutdown)));
}

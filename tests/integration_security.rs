// Authentication, authorization, isolation, and resource-policy behavior:
// certificate handling, path traversal, lock contention, rate caps, the
// idle reaper, and frame-integrity enforcement.

use harbor_client::HarborClient;
use harbor_files::hasher::sha256_hex;
use harbor_integration_tests::{
    open_tls, raw_handshake, raw_request, start_env, wait_until, EnvOptions,
};
use harbor_proto::message::{
    EmptyReply, HandshakeRequest, PathRequest, PutChunkReply, PutChunkRequest, PutCommitReply,
    PutStartReply, PutStartRequest, StatReply,
};
use harbor_proto::{read_frame, write_frame, ErrorKind, Request, Status};
use std::time::{Duration, Instant};
use tempfile::TempDir;

#[tokio::test]
async fn unauthorized_client_cannot_open_a_session() {
    let env = start_env(EnvOptions::default()).await;

    // Bob's certificate is valid, but the docs library does not list him.
    let client = HarborClient::new(env.bob.clone());
    let err = client.exists("anything").await.unwrap_err();
    assert_eq!(err.server_kind(), Some(ErrorKind::NotPermitted));

    // No session was created.
    assert_eq!(env.ctx.registry.session_count(), 0);

    env.stop().await;
}

#[tokio::test]
async fn revoked_record_is_rejected_before_a_session_opens() {
    let env = start_env(EnvOptions {
        revoke_alice: true,
        ..EnvOptions::default()
    })
    .await;

    let client = HarborClient::new(env.alice.clone());
    let err = client.ping().await.unwrap_err();
    assert_eq!(err.server_kind(), Some(ErrorKind::Authentication));
    assert_eq!(env.ctx.registry.session_count(), 0);

    env.stop().await;
}

#[tokio::test]
async fn crl_fingerprint_is_rejected() {
    let env = start_env(EnvOptions {
        crl_alice: true,
        ..EnvOptions::default()
    })
    .await;

    let client = HarborClient::new(env.alice.clone());
    let err = client.ping().await.unwrap_err();
    assert_eq!(err.server_kind(), Some(ErrorKind::Authentication));

    env.stop().await;
}

#[tokio::test]
async fn unknown_library_is_rejected() {
    let env = start_env(EnvOptions::default()).await;

    let mut config = env.alice.clone();
    config.transfer.library = "nope".into();
    let client = HarborClient::new(config);
    let err = client.ping().await.unwrap_err();
    assert_eq!(err.server_kind(), Some(ErrorKind::NotFound));

    env.stop().await;
}

#[tokio::test]
async fn protocol_version_mismatch_is_distinct() {
    let env = start_env(EnvOptions::default()).await;

    let mut stream = open_tls(&env.alice).await;
    let reply = harbor_integration_tests::raw_call(
        &mut stream,
        Request::Handshake(HandshakeRequest {
            library_id: "docs".into(),
            protocol_version: 99,
        }),
    )
    .await;
    assert_eq!(reply.status, Status::VersionMismatch);

    env.stop().await;
}

#[tokio::test]
async fn path_traversal_is_rejected_and_nothing_is_written() {
    let env = start_env(EnvOptions::default()).await;

    let mut stream = open_tls(&env.alice).await;
    raw_handshake(&mut stream).await;

    let result: Result<PutStartReply, _> = raw_request(
        &mut stream,
        Request::PutStart(PutStartRequest {
            path: "../evil.txt".into(),
            size: 4,
            digest: sha256_hex(b"evil"),
            mtime: None,
        }),
    )
    .await;
    assert_eq!(result.unwrap_err().kind, ErrorKind::PathTraversal);

    // Nothing appeared beside the library root.
    let outside = env.root.parent().unwrap().join("evil.txt");
    assert!(!outside.exists());
    assert!(!env.root.join("evil.txt").exists());

    // Probing with traversal never leaks not-found.
    for path in ["../secret", "/etc/passwd", "a/../b", "./x", "a\0b"] {
        let result: Result<StatReply, _> = raw_request(
            &mut stream,
            Request::Stat(PathRequest { path: path.into() }),
        )
        .await;
        assert_eq!(
            result.unwrap_err().kind,
            ErrorKind::PathTraversal,
            "{path} must be a traversal error"
        );
    }

    env.stop().await;
}

#[tokio::test]
async fn concurrent_writers_conflict_then_succeed() {
    let env = start_env(EnvOptions::default()).await;

    let content = b"contended bytes";
    let digest = sha256_hex(content);
    let put_start = |path: &str| {
        Request::PutStart(PutStartRequest {
            path: path.into(),
            size: content.len() as u64,
            digest: digest.clone(),
            mtime: None,
        })
    };

    let mut first = open_tls(&env.alice).await;
    raw_handshake(&mut first).await;
    let mut second = open_tls(&env.alice).await;
    raw_handshake(&mut second).await;

    let start: Result<PutStartReply, _> = raw_request(&mut first, put_start("a.bin")).await;
    assert!(start.is_ok());

    // Same path from another session: the distinct, retryable conflict.
    let contended: Result<PutStartReply, _> = raw_request(&mut second, put_start("a.bin")).await;
    assert_eq!(contended.unwrap_err().kind, ErrorKind::Locked);

    // serialize_writes also fences writes to other paths in the library.
    let fenced: Result<PutStartReply, _> = raw_request(&mut second, put_start("b.bin")).await;
    assert_eq!(fenced.unwrap_err().kind, ErrorKind::Locked);

    // Writer finishes; the contender's retry goes through.
    let _: PutChunkReply = raw_request(
        &mut first,
        Request::PutChunk(
            PutChunkRequest {
                path: "a.bin".into(),
                offset: 0,
            },
            content.to_vec(),
        ),
    )
    .await
    .unwrap();
    let _: PutCommitReply = raw_request(
        &mut first,
        Request::PutCommit(PathRequest {
            path: "a.bin".into(),
        }),
    )
    .await
    .unwrap();

    let retried: Result<PutStartReply, _> = raw_request(&mut second, put_start("a.bin")).await;
    assert!(retried.is_ok());

    env.stop().await;
}

#[tokio::test]
async fn idle_sessions_are_reaped_with_their_staging() {
    let env = start_env(EnvOptions {
        idle_timeout_secs: Some(1),
        ..EnvOptions::default()
    })
    .await;

    let mut stream = open_tls(&env.alice).await;
    raw_handshake(&mut stream).await;
    let _: PutStartReply = raw_request(
        &mut stream,
        Request::PutStart(PutStartRequest {
            path: "slow.bin".into(),
            size: 1024,
            digest: "00".repeat(32),
            mtime: None,
        }),
    )
    .await
    .unwrap();
    let _: PutChunkReply = raw_request(
        &mut stream,
        Request::PutChunk(
            PutChunkRequest {
                path: "slow.bin".into(),
                offset: 0,
            },
            vec![0u8; 512],
        ),
    )
    .await
    .unwrap();

    let staging = env.root.join("slow.bin.partial");
    assert!(staging.exists());
    assert_eq!(env.ctx.registry.session_count(), 1);

    // Go idle past the 1s timeout; the reaper runs every second.
    wait_until("idle session reaped", Duration::from_secs(10), || {
        env.ctx.registry.session_count() == 0
    })
    .await;
    wait_until("staging purged", Duration::from_secs(5), || {
        !staging.exists()
    })
    .await;

    // The lock is gone too: a fresh upload starts clean.
    let mut fresh = open_tls(&env.alice).await;
    raw_handshake(&mut fresh).await;
    let start: PutStartReply = raw_request(
        &mut fresh,
        Request::PutStart(PutStartRequest {
            path: "slow.bin".into(),
            size: 4,
            digest: sha256_hex(b"slow"),
            mtime: None,
        }),
    )
    .await
    .unwrap();
    assert_eq!(start.resume_offset, 0);

    env.stop().await;
}

#[tokio::test]
async fn rate_cap_bounds_throughput() {
    let env = start_env(EnvOptions {
        rate_limit: 64 * 1024,
        chunk_size: 32 * 1024,
        ..EnvOptions::default()
    })
    .await;
    let work = TempDir::new().unwrap();

    // 160 KiB against a 64 KiB/s cap: at least one full second of pushback
    // beyond the bucket's initial capacity.
    let content = vec![0xA7u8; 160 * 1024];
    let local = work.path().join("throttled.bin");
    tokio::fs::write(&local, &content).await.unwrap();

    let client = HarborClient::new(env.alice.clone());
    let started = Instant::now();
    client.upload(&local, "throttled.bin").await.unwrap();
    let elapsed = started.elapsed();

    assert!(
        elapsed >= Duration::from_secs(1),
        "160 KiB at 64 KiB/s finished in {elapsed:?}"
    );

    env.stop().await;
}

#[tokio::test]
async fn upload_checksum_mismatch_discards_staging() {
    let env = start_env(EnvOptions::default()).await;

    let mut stream = open_tls(&env.alice).await;
    raw_handshake(&mut stream).await;

    let _: PutStartReply = raw_request(
        &mut stream,
        Request::PutStart(PutStartRequest {
            path: "forged.bin".into(),
            size: 4,
            digest: sha256_hex(b"good"),
            mtime: None,
        }),
    )
    .await
    .unwrap();
    let _: PutChunkReply = raw_request(
        &mut stream,
        Request::PutChunk(
            PutChunkRequest {
                path: "forged.bin".into(),
                offset: 0,
            },
            b"evil".to_vec(),
        ),
    )
    .await
    .unwrap();

    let result: Result<PutCommitReply, _> = raw_request(
        &mut stream,
        Request::PutCommit(PathRequest {
            path: "forged.bin".into(),
        }),
    )
    .await;
    assert_eq!(result.unwrap_err().kind, ErrorKind::ChecksumMismatch);

    // Neither the target nor its staging survive.
    assert!(!env.root.join("forged.bin").exists());
    assert!(!env.root.join("forged.bin.partial").exists());

    // The lock was released with the failed upload.
    let retry: Result<PutStartReply, _> = raw_request(
        &mut stream,
        Request::PutStart(PutStartRequest {
            path: "forged.bin".into(),
            size: 4,
            digest: sha256_hex(b"good"),
            mtime: None,
        }),
    )
    .await;
    assert!(retry.is_ok());

    env.stop().await;
}

#[tokio::test]
async fn corrupted_frame_terminates_the_connection() {
    let env = start_env(EnvOptions::default()).await;

    let mut stream = open_tls(&env.alice).await;
    raw_handshake(&mut stream).await;

    // Flip one payload bit after encoding; the digest no longer matches.
    let mut bytes = Request::Stat(PathRequest { path: "x".into() })
        .into_frame()
        .unwrap()
        .encode();
    let idx = bytes.len() - 1;
    bytes[idx] ^= 0x01;
    tokio::io::AsyncWriteExt::write_all(&mut stream, &bytes)
        .await
        .unwrap();
    tokio::io::AsyncWriteExt::flush(&mut stream).await.unwrap();

    // Best-effort protocol error, then the server hangs up.
    if let Ok(reply) = read_frame(&mut stream).await {
        assert_eq!(reply.status, Status::BadRequest);
    }
    let followup = Request::Ping.into_frame().unwrap();
    let dead = async {
        write_frame(&mut stream, &followup).await?;
        read_frame(&mut stream).await
    };
    assert!(dead.await.is_err(), "connection must be closed");

    wait_until("session torn down", Duration::from_secs(5), || {
        env.ctx.registry.session_count() == 0
    })
    .await;

    env.stop().await;
}

#[tokio::test]
async fn disconnect_is_answered_before_close() {
    let env = start_env(EnvOptions::default()).await;

    let mut stream = open_tls(&env.alice).await;
    raw_handshake(&mut stream).await;
    let reply: Result<EmptyReply, _> = raw_request(&mut stream, Request::Disconnect).await;
    assert!(reply.is_ok());

    wait_until("session removed", Duration::from_secs(5), || {
        env.ctx.registry.session_count() == 0
    })
    .await;

    env.stop().await;
}

use std::sync::Arc;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use eventvault::{
    AccountKeys, Crypto, DefaultCrypto, EncryptedBlob, EncryptedUserSecret, Event, EventPayload,
    EventVault, MemoryStorage, Payload, PublicKey, Storage, SymmetricKey, VaultConfig,
    generate_keypair,
};

// hour-aligned base timestamp
const BASE_MS: i64 = 1_699_999_200_000;
const HOUR_MS: i64 = 3_600_000;
const ACCOUNT: &str = "acct-1";

struct Fixture {
    storage: Arc<MemoryStorage>,
    vault: EventVault,
    account: AccountKeys,
    user_key: SymmetricKey,
}

async fn fixture() -> Result<Fixture> {
    let crypto = DefaultCrypto;
    let storage = Arc::new(MemoryStorage::new());
    let (public, private) = generate_keypair();

    let user_key = crypto.create_symmetric_key();
    let wrapped = crypto.encrypt_asymmetric(&public, user_key.as_bytes())?;
    storage
        .put_encrypted_secret(
            ACCOUNT,
            &EncryptedUserSecret {
                secret_id: "user-1".to_string(),
                value: wrapped,
            },
        )
        .await?;

    let vault = EventVault::new(storage.clone(), Arc::new(crypto), VaultConfig::default());
    let account = AccountKeys::new(ACCOUNT, public, private);
    Ok(Fixture {
        storage,
        vault,
        account,
        user_key,
    })
}

fn payload(ms: i64) -> EventPayload {
    EventPayload {
        event_type: Some("PAGEVIEW".to_string()),
        timestamp: Some(Utc.timestamp_millis_opt(ms).unwrap()),
        session_id: Some("session-1".to_string()),
        href: Some("https://www.example.net/page".to_string()),
        ..Default::default()
    }
}

fn event_id(ms: i64, n: u128) -> String {
    ulid::Ulid::from_parts(ms as u64, n).to_string()
}

fn user_event(user_key: &SymmetricKey, ms: i64, n: u128) -> Event {
    let plaintext = serde_json::to_vec(&payload(ms)).unwrap();
    Event {
        account_id: Some(ACCOUNT.to_string()),
        event_id: event_id(ms, n),
        secret_id: Some("user-1".to_string()),
        payload: Payload::Encrypted(
            DefaultCrypto
                .encrypt_symmetric(user_key, &plaintext)
                .unwrap(),
        ),
    }
}

fn account_event(public: &PublicKey, ms: i64, n: u128) -> Event {
    let plaintext = serde_json::to_vec(&payload(ms)).unwrap();
    Event {
        account_id: Some(ACCOUNT.to_string()),
        event_id: event_id(ms, n),
        secret_id: None,
        payload: Payload::Encrypted(
            DefaultCrypto.encrypt_asymmetric(public, &plaintext).unwrap(),
        ),
    }
}

fn ids(events: &[Event]) -> Vec<String> {
    let mut ids: Vec<String> = events.iter().map(|e| e.event_id.clone()).collect();
    ids.sort();
    ids
}

async fn seed_three_events(fixture: &Fixture) -> Result<Vec<Event>> {
    let public = fixture.account.public_key.clone().unwrap();
    let events = vec![
        user_event(&fixture.user_key, BASE_MS + 1_000, 1),
        account_event(&public, BASE_MS + 2_000, 2),
        user_event(&fixture.user_key, BASE_MS + HOUR_MS + 1_000, 3),
    ];
    for event in &events {
        fixture.storage.put_raw_event(event).await?;
    }
    Ok(events)
}

#[tokio::test]
async fn three_events_across_two_buckets_aggregate_once() -> Result<()> {
    let fixture = fixture().await?;
    let seeded = seed_three_events(&fixture).await?;

    let events = fixture
        .vault
        .get_events(Some(&fixture.account), None, None)
        .await?;
    assert_eq!(events.len(), 3);
    assert_eq!(ids(&events), ids(&seeded));
    for event in &events {
        let Payload::Decrypted(payload) = &event.payload else {
            panic!("expected decrypted payload for {}", event.event_id);
        };
        assert_eq!(payload.event_type.as_deref(), Some("PAGEVIEW"));
        // validation canonicalizes the URL path
        assert_eq!(
            payload.href.as_deref(),
            Some("https://www.example.net/page/")
        );
    }

    fixture.vault.flush().await;
    assert_eq!(fixture.storage.aggregate_puts(), 2);
    let mut buckets = fixture.storage.persisted_buckets(ACCOUNT);
    buckets.sort();
    assert_eq!(buckets, vec![BASE_MS, BASE_MS + HOUR_MS]);
    Ok(())
}

#[tokio::test]
async fn second_read_serves_from_aggregates_without_rewrites() -> Result<()> {
    let fixture = fixture().await?;
    let seeded = seed_three_events(&fixture).await?;

    let first = fixture
        .vault
        .get_events(Some(&fixture.account), None, None)
        .await?;
    fixture.vault.flush().await;
    let puts_after_first = fixture.storage.aggregate_puts();

    // Corrupt the persisted buckets: a cache hit must skip re-decryption,
    // so the second read cannot notice.
    for bucket in fixture.storage.persisted_buckets(ACCOUNT) {
        fixture
            .storage
            .put_aggregate(
                ACCOUNT,
                bucket,
                EncryptedBlob {
                    value: "EVv1:not-a-ciphertext".to_string(),
                    compressed: false,
                },
            )
            .await?;
    }

    let second = fixture
        .vault
        .get_events(Some(&fixture.account), None, None)
        .await?;
    assert_eq!(ids(&second), ids(&seeded));
    assert_eq!(ids(&second), ids(&first));

    fixture.vault.flush().await;
    // nothing was dirty on the second read; only our own corruption writes
    assert_eq!(
        fixture.storage.aggregate_puts(),
        puts_after_first + 2
    );
    Ok(())
}

#[tokio::test]
async fn time_bounds_filter_aggregated_events() -> Result<()> {
    let fixture = fixture().await?;
    seed_three_events(&fixture).await?;

    let lower = Utc.timestamp_millis_opt(BASE_MS).unwrap();
    let upper = Utc.timestamp_millis_opt(BASE_MS + 2_000).unwrap();
    let events = fixture
        .vault
        .get_events(Some(&fixture.account), Some(lower), Some(upper))
        .await?;
    assert_eq!(events.len(), 2);
    assert!(events
        .iter()
        .all(|e| e.event_id < event_id(BASE_MS + HOUR_MS, 0)));
    Ok(())
}

#[tokio::test]
async fn deleted_raw_events_are_purged_from_aggregates() -> Result<()> {
    let fixture = fixture().await?;
    let seeded = seed_three_events(&fixture).await?;

    fixture
        .vault
        .get_events(Some(&fixture.account), None, None)
        .await?;
    fixture.vault.flush().await;

    // upstream deletion: one of two events in the first bucket, and the
    // only event of the second bucket
    fixture
        .storage
        .delete_raw_events(
            Some(ACCOUNT),
            &[seeded[0].event_id.clone(), seeded[2].event_id.clone()],
        )
        .await?;

    let events = fixture
        .vault
        .get_events(Some(&fixture.account), None, None)
        .await?;
    assert_eq!(ids(&events), vec![seeded[1].event_id.clone()]);

    fixture.vault.flush().await;
    assert_eq!(fixture.storage.aggregate_deletes(), 1);
    assert_eq!(fixture.storage.persisted_buckets(ACCOUNT), vec![BASE_MS]);
    Ok(())
}

#[tokio::test]
async fn anonymous_reads_bypass_aggregation_collaborators() -> Result<()> {
    let storage = Arc::new(MemoryStorage::new());
    let vault = EventVault::new(
        storage.clone(),
        Arc::new(DefaultCrypto),
        VaultConfig::default(),
    );

    for (ms, n) in [(BASE_MS + 1_000, 1u128), (BASE_MS + HOUR_MS + 1_000, 2)] {
        storage
            .put_raw_event(&Event {
                account_id: None,
                event_id: event_id(ms, n),
                secret_id: None,
                payload: Payload::Decrypted(payload(ms)),
            })
            .await?;
    }

    let lower = Utc.timestamp_millis_opt(BASE_MS).unwrap();
    let upper = Utc.timestamp_millis_opt(BASE_MS + 2_000).unwrap();
    let events = vault.get_events(None, Some(lower), Some(upper)).await?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_id, event_id(BASE_MS + 1_000, 1));

    assert_eq!(storage.secret_fetches(), 0);
    assert_eq!(storage.aggregate_fetches(), 0);
    assert_eq!(storage.user_secret_fetches(), 0);
    assert_eq!(storage.aggregate_puts(), 0);
    Ok(())
}

#[tokio::test]
async fn events_with_unknown_user_secrets_are_dropped() -> Result<()> {
    let fixture = fixture().await?;
    let public = fixture.account.public_key.clone().unwrap();

    let readable = account_event(&public, BASE_MS + 1_000, 1);
    let mut orphaned = user_event(&fixture.user_key, BASE_MS + 2_000, 2);
    orphaned.secret_id = Some("secret-nobody-has".to_string());
    fixture.storage.put_raw_event(&readable).await?;
    fixture.storage.put_raw_event(&orphaned).await?;

    let events = fixture
        .vault
        .get_events(Some(&fixture.account), None, None)
        .await?;
    assert_eq!(ids(&events), vec![readable.event_id.clone()]);
    Ok(())
}
